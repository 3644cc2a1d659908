//! Scripted engine for runner tests
//!
//! Tokenizes on whitespace, samples from a fixed list of tokens, and records
//! every call in a shared log.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::engine::{
    BatchEntry, ComputeEngine, ContextHandle, ContextParams, EngineError, ModelHandle,
    ModelParams, SamplerChain, TokenId,
};
use super::vision::ImageBitmap;

pub(crate) const BOS: TokenId = 1;
pub(crate) const EOS: TokenId = 2;
const FIRST_WORD_ID: TokenId = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VisionMode {
    /// No image entry points at all
    Unsupported,
    /// Entry points exist, model has no projector
    NoProjector,
    /// Each image takes this many positions
    Projector { positions: u32 },
    /// Image decoding fails
    BrokenImages,
}

#[derive(Debug, Default)]
pub(crate) struct EngineLog {
    pub(crate) model_params: Vec<ModelParams>,
    pub(crate) context_params: Vec<ContextParams>,
    pub(crate) batches: Vec<Vec<BatchEntry>>,
    pub(crate) clears: usize,
    pub(crate) samplers: Vec<SamplerChain>,
    /// `n_past` of each encoded image
    pub(crate) encoded_images: Vec<i32>,
    pub(crate) models_dropped: usize,
    pub(crate) contexts_dropped: usize,
}

pub(crate) struct ScriptedEngine {
    pub(crate) log: Rc<RefCell<EngineLog>>,
    pub(crate) n_ctx_train: u32,
    pub(crate) vision: VisionMode,
    pub(crate) split_kv: bool,
    pub(crate) fail_model_load: bool,
    pub(crate) fail_context: bool,
    /// Tokenizer adds BOS when asked
    pub(crate) tokenizer_bos: bool,
    /// Tokens handed out by `sample`, then EOS forever
    pub(crate) outputs: Vec<TokenId>,
    /// Index of the decode call that fails
    pub(crate) fail_decode_at: Option<usize>,
    /// Set this flag when the given decode call runs
    pub(crate) cancel_on_decode: Option<(usize, Arc<AtomicBool>)>,
    /// Raw bytes for specific tokens instead of `t<id> `
    pub(crate) pieces: HashMap<TokenId, Vec<u8>>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        Self {
            log: Rc::new(RefCell::new(EngineLog::default())),
            n_ctx_train: 8192,
            vision: VisionMode::Unsupported,
            split_kv: true,
            fail_model_load: false,
            fail_context: false,
            tokenizer_bos: true,
            outputs: (10..60).collect(),
            fail_decode_at: None,
            cancel_on_decode: None,
            pieces: HashMap::new(),
        }
    }

    pub(crate) fn log(&self) -> Rc<RefCell<EngineLog>> {
        Rc::clone(&self.log)
    }
}

pub(crate) struct ScriptedModel {
    log: Rc<RefCell<EngineLog>>,
    n_ctx_train: u32,
    tokenizer_bos: bool,
    vocab: RefCell<HashMap<String, TokenId>>,
    pieces: HashMap<TokenId, Vec<u8>>,
}

impl ScriptedModel {
    fn word_id(&self, word: &str) -> TokenId {
        let mut vocab = self.vocab.borrow_mut();
        let next = FIRST_WORD_ID + vocab.len() as TokenId;
        *vocab.entry(word.to_string()).or_insert(next)
    }
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.log.borrow_mut().models_dropped += 1;
    }
}

impl ModelHandle for ScriptedModel {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
        let mut tokens = Vec::new();
        if add_bos && self.tokenizer_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.split_whitespace().map(|w| self.word_id(w)));
        Ok(tokens)
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        match self.pieces.get(&token) {
            Some(bytes) => Ok(bytes.clone()),
            None => Ok(format!("t{token} ").into_bytes()),
        }
    }

    fn bos_token(&self) -> TokenId {
        BOS
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn n_ctx_train(&self) -> u32 {
        self.n_ctx_train
    }
}

pub(crate) struct ScriptedContext {
    log: Rc<RefCell<EngineLog>>,
    n_ctx: u32,
    vision: VisionMode,
    outputs: std::vec::IntoIter<TokenId>,
    decode_calls: usize,
    fail_decode_at: Option<usize>,
    cancel_on_decode: Option<(usize, Arc<AtomicBool>)>,
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.log.borrow_mut().contexts_dropped += 1;
    }
}

impl ContextHandle for ScriptedContext {
    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn clear_memory(&mut self) {
        self.log.borrow_mut().clears += 1;
    }

    fn ensure_logits_output(&mut self) {}

    fn decode(&mut self, batch: &[BatchEntry]) -> Result<(), EngineError> {
        let call = self.decode_calls;
        self.decode_calls += 1;
        if let Some((at, flag)) = &self.cancel_on_decode {
            if *at == call {
                flag.store(true, Ordering::SeqCst);
            }
        }
        if self.fail_decode_at == Some(call) {
            return Err(EngineError::Decode("scripted failure".to_string()));
        }
        self.log.borrow_mut().batches.push(batch.to_vec());
        Ok(())
    }

    fn begin_sampling(&mut self, chain: &SamplerChain) {
        self.log.borrow_mut().samplers.push(*chain);
    }

    fn sample(&mut self) -> Option<TokenId> {
        Some(self.outputs.next().unwrap_or(EOS))
    }

    fn decode_image_file(&mut self, path: &Path) -> Result<ImageBitmap, EngineError> {
        match self.vision {
            VisionMode::Unsupported => Err(EngineError::VisionUnsupported),
            VisionMode::BrokenImages => Err(EngineError::Image(format!(
                "cannot decode {}",
                path.display()
            ))),
            _ => Ok(ImageBitmap::probe_pixel()),
        }
    }

    fn encode_image(&mut self, _image: &ImageBitmap, n_past: i32) -> Result<u32, EngineError> {
        match self.vision {
            VisionMode::Unsupported => Err(EngineError::VisionUnsupported),
            VisionMode::NoProjector => Err(EngineError::NoProjector),
            VisionMode::BrokenImages => Err(EngineError::Image("bad image".to_string())),
            VisionMode::Projector { positions } => {
                self.log.borrow_mut().encoded_images.push(n_past);
                Ok(positions)
            }
        }
    }
}

impl ComputeEngine for ScriptedEngine {
    type Model = ScriptedModel;
    type Context = ScriptedContext;

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<ScriptedModel, EngineError> {
        self.log.borrow_mut().model_params.push(params.clone());
        if self.fail_model_load {
            return Err(EngineError::ModelLoad(format!("cannot open {}", path.display())));
        }
        Ok(ScriptedModel {
            log: Rc::clone(&self.log),
            n_ctx_train: self.n_ctx_train,
            tokenizer_bos: self.tokenizer_bos,
            vocab: RefCell::new(HashMap::new()),
            pieces: self.pieces.clone(),
        })
    }

    fn new_context(
        &self,
        _model: &ScriptedModel,
        params: &ContextParams,
    ) -> Result<ScriptedContext, EngineError> {
        self.log.borrow_mut().context_params.push(params.clone());
        if self.fail_context {
            return Err(EngineError::ContextInit("out of memory".to_string()));
        }
        Ok(ScriptedContext {
            log: Rc::clone(&self.log),
            n_ctx: params.n_ctx,
            vision: self.vision,
            outputs: self.outputs.clone().into_iter(),
            decode_calls: 0,
            fail_decode_at: self.fail_decode_at,
            cancel_on_decode: self.cancel_on_decode.clone(),
        })
    }

    fn has_vision_ops(&self) -> bool {
        self.vision != VisionMode::Unsupported
    }

    fn supports_split_kv_types(&self) -> bool {
        self.split_kv
    }
}

/// Sink that records everything it is told
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub(crate) tokens: Vec<String>,
    pub(crate) done: usize,
    pub(crate) errors: Vec<String>,
}

impl super::streaming::TokenSink for RecordingSink {
    fn on_token(&mut self, text: &str) {
        self.tokens.push(text.to_string());
    }

    fn on_done(&mut self) {
        self.done += 1;
    }

    fn on_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }
}

pub(crate) fn image_paths(n: usize) -> Vec<PathBuf> {
    (0..n).map(|i| PathBuf::from(format!("image-{i}.png"))).collect()
}
