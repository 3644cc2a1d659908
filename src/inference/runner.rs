//! Model runner
//!
//! Owns one loaded model and one execution context. Loading resolves the
//! context size, KV-cache types and flash attention; generation evaluates the
//! prompt in batches and samples token by token until a stop condition.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::backend::{BackendError, BackendManager, BackendRef};
use super::engine::{
    BatchEntry, ComputeEngine, ContextHandle, ContextParams, DevicePlacement, EngineError,
    ModelHandle, ModelParams, SamplerChain, TokenId,
};
use super::kv_cache::{resolve_kv_cache, KvCacheConfig, ResolvedKvCache};
use super::options::{FlashAttention, RuntimeOverrides};
use super::streaming::TokenSink;
use super::vision::{self, VisionError, VisionProbe};
use crate::system::resources;

/// Smallest usable context per parallel sequence
pub const MIN_CONTEXT_PER_SEQUENCE: u32 = 2048;
/// Vision-capable builds never run with less than this (unless trained for less)
pub const VISION_CONTEXT_FLOOR: u32 = 8192;
/// Positions kept free after the prompt
pub const PROMPT_HEADROOM: u32 = 64;
/// Prompt tokens evaluated per decode call
pub const BATCH_SIZE: usize = 512;
/// Used when neither the request nor the model gives a context size
pub const FALLBACK_CONTEXT: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunnerState {
    Unloaded,
    Loading,
    Ready,
    Generating,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub model_path: PathBuf,
    pub projector_path: Option<PathBuf>,
    /// 0 means the trained context
    pub n_ctx: u32,
    /// 0 keeps everything on the CPU
    pub gpu_layers: u32,
    /// 0 means all available cores
    pub n_threads: u32,
    pub n_seq_max: Option<u32>,
    pub kv_cache: KvCacheConfig,
}

impl LoadRequest {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            projector_path: None,
            n_ctx: 0,
            gpu_layers: 0,
            n_threads: 0,
            n_seq_max: None,
            kv_cache: KvCacheConfig::default(),
        }
    }
}

/// What a successful load settled on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedModelInfo {
    pub model_path: PathBuf,
    pub n_ctx: u32,
    pub n_ctx_train: u32,
    pub n_seq_max: u32,
    pub n_threads: i32,
    pub kv_cache: ResolvedKvCache,
    pub flash_attention: FlashAttention,
    pub placement: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Backend unavailable: {0}")]
    Backend(#[from] BackendError),

    #[error("Model load failed: {0}")]
    Model(EngineError),

    #[error("Context creation failed: {0}")]
    Context(EngineError),

    #[error("Context of {per_sequence} tokens per sequence is below the minimum of {minimum}")]
    ContextTooSmall { per_sequence: u32, minimum: u32 },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("No model loaded")]
    NotLoaded,

    #[error("Tokenization failed: {0}")]
    Tokenize(EngineError),

    #[error("Decode failed: {0}")]
    Decode(EngineError),

    #[error("Detokenization failed: {0}")]
    Detokenize(EngineError),

    #[error(transparent)]
    Vision(#[from] VisionError),
}

impl RuntimeError {
    /// The model cannot take images at all, as opposed to a failed image.
    pub fn is_vision_unsupported(&self) -> bool {
        matches!(
            self,
            RuntimeError::Vision(VisionError::NoProjector | VisionError::Unavailable)
        )
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Sampled tokens before stopping, 0 means no limit. Pieces that end
    /// inside a UTF-8 sequence are held back and merged into a later
    /// `on_token`, so the callback count can be lower than this.
    pub max_tokens: u32,
    pub images: Vec<PathBuf>,
    pub sampler: SamplerChain,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            images: Vec::new(),
            sampler: SamplerChain::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    EndOfSequence,
    MaxTokens,
    ContextFull,
    NoCandidate,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    pub prompt_tokens: usize,
    pub truncated_tokens: usize,
    pub image_positions: u32,
    /// Sampled tokens, counted before UTF-8 reassembly
    pub generated_tokens: usize,
    pub stop_reason: StopReason,
}

/// Requests cancellation of the generation in flight. Clone freely.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Context size after clamping to the trained size and applying the vision floor.
pub fn resolve_context_length(requested: u32, trained: u32, vision: bool) -> u32 {
    let mut n_ctx = match (requested, trained) {
        (0, 0) => FALLBACK_CONTEXT,
        (0, trained) => trained,
        (requested, _) => requested,
    };
    if trained > 0 && n_ctx > trained {
        tracing::info!("Requested context {} exceeds trained {}, clamping", n_ctx, trained);
        n_ctx = trained;
    }
    if vision && n_ctx < VISION_CONTEXT_FLOOR {
        let floor = if trained > 0 {
            VISION_CONTEXT_FLOOR.min(trained)
        } else {
            VISION_CONTEXT_FLOOR
        };
        if floor > n_ctx {
            tracing::info!("Raising context {} to {} for image tokens", n_ctx, floor);
            n_ctx = floor;
        }
    }
    n_ctx
}

/// Prompts that already open with a control token carry their own BOS.
pub fn should_add_bos(prompt: &str) -> bool {
    !matches!(prompt.chars().next(), Some('<' | '['))
}

fn default_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

/// Model and context, dropped context first.
struct Loaded<E: ComputeEngine> {
    context: Option<E::Context>,
    model: Option<E::Model>,
    info: LoadedModelInfo,
    _backend: BackendRef,
}

pub struct LlamaRunner<E: ComputeEngine> {
    engine: E,
    backend: Arc<BackendManager>,
    overrides: RuntimeOverrides,
    state: RunnerState,
    loaded: Option<Loaded<E>>,
    cancel: Arc<AtomicBool>,
}

impl<E: ComputeEngine> LlamaRunner<E> {
    /// Runner on the process-wide backend with overrides from the environment.
    pub fn new(engine: E) -> Self {
        Self::with_backend(engine, BackendManager::global(), RuntimeOverrides::from_env())
    }

    pub fn with_backend(
        engine: E,
        backend: Arc<BackendManager>,
        overrides: RuntimeOverrides,
    ) -> Self {
        Self {
            engine,
            backend,
            overrides,
            state: RunnerState::Unloaded,
            loaded: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn loaded_info(&self) -> Option<&LoadedModelInfo> {
        self.loaded.as_ref().map(|l| &l.info)
    }

    pub fn has_vision_ops(&self) -> bool {
        self.engine.has_vision_ops()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    pub fn cancel_current(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Load a model, replacing any model already loaded.
    pub fn load(&mut self, request: LoadRequest) -> Result<LoadedModelInfo, LoadError> {
        self.unload();
        self.state = RunnerState::Loading;
        match self.load_inner(request) {
            Ok(loaded) => {
                let info = loaded.info.clone();
                self.loaded = Some(loaded);
                self.state = RunnerState::Ready;
                Ok(info)
            }
            Err(e) => {
                tracing::error!("Failed to load model: {}", e);
                self.state = RunnerState::Unloaded;
                Err(e)
            }
        }
    }

    fn load_inner(&self, request: LoadRequest) -> Result<Loaded<E>, LoadError> {
        // Released by drop on every early return below.
        let backend = self.backend.acquire()?;

        let placement = DevicePlacement::from_gpu_layers(request.gpu_layers);
        let model_params = ModelParams {
            placement,
            use_mmap: self.overrides.use_mmap,
            projector_path: request.projector_path.clone(),
        };
        tracing::info!("Loading model from {:?} ({:?})", request.model_path, placement);
        let model = self
            .engine
            .load_model(&request.model_path, &model_params)
            .map_err(LoadError::Model)?;

        let n_ctx_train = model.n_ctx_train();
        let n_ctx = resolve_context_length(request.n_ctx, n_ctx_train, self.engine.has_vision_ops());
        let kv_cache = resolve_kv_cache(
            &request.kv_cache,
            &self.overrides,
            self.engine.supports_split_kv_types(),
        );
        let flash_attention = self.overrides.flash_attention;

        let n_seq_max = request.n_seq_max.unwrap_or(1).max(1);
        let per_sequence = n_ctx / n_seq_max;
        if per_sequence < MIN_CONTEXT_PER_SEQUENCE {
            return Err(LoadError::ContextTooSmall {
                per_sequence,
                minimum: MIN_CONTEXT_PER_SEQUENCE,
            });
        }

        let n_threads = match request.n_threads {
            0 => default_threads(),
            n => i32::try_from(n).unwrap_or(i32::MAX),
        };
        let context_params = ContextParams {
            n_ctx,
            n_batch: BATCH_SIZE as u32,
            n_seq_max,
            n_threads,
            type_k: kv_cache.type_k,
            type_v: kv_cache.type_v,
            flash_attention,
            offload_kqv: placement != DevicePlacement::CpuOnly,
        };
        let context = self
            .engine
            .new_context(&model, &context_params)
            .map_err(LoadError::Context)?;

        let info = LoadedModelInfo {
            model_path: request.model_path,
            n_ctx: context.n_ctx(),
            n_ctx_train,
            n_seq_max,
            n_threads,
            kv_cache,
            flash_attention,
            placement: format!("{placement:?}"),
        };
        tracing::info!(
            "Model loaded: ctx={} (trained {}), seq={}, threads={}, kv={}/{}, flash_attn={:?}",
            info.n_ctx,
            info.n_ctx_train,
            info.n_seq_max,
            info.n_threads,
            kv_cache.type_k,
            kv_cache.type_v,
            flash_attention
        );
        let usage = resources::get_resource_usage();
        tracing::info!(
            "Memory after load: process {} MB, system {}/{} MB",
            usage.process_rss_mb,
            usage.ram_used_mb,
            usage.ram_total_mb
        );

        Ok(Loaded {
            context: Some(context),
            model: Some(model),
            info,
            _backend: backend,
        })
    }

    /// Run the vision path once with a tiny synthetic image.
    pub fn probe_vision(&mut self) -> VisionProbe {
        let has_ops = self.engine.has_vision_ops();
        match self.loaded.as_mut().and_then(|l| l.context.as_mut()) {
            Some(ctx) => vision::probe(ctx, has_ops),
            None => VisionProbe::Unavailable,
        }
    }

    /// Generate from `request`, reporting to `sink`. The sink always receives
    /// exactly one of `on_done` or `on_error`.
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationSummary, RuntimeError> {
        self.cancel.store(false, Ordering::Release);
        let has_vision_ops = self.engine.has_vision_ops();

        let outcome = match self.loaded.as_mut() {
            Some(loaded) => {
                self.state = RunnerState::Generating;
                let outcome = run_generation(loaded, request, sink, &self.cancel, has_vision_ops);
                self.state = RunnerState::Ready;
                outcome
            }
            None => Err(RuntimeError::NotLoaded),
        };

        match outcome {
            Ok(summary) => {
                tracing::info!(
                    "Generation finished: {:?} after {} tokens",
                    summary.stop_reason,
                    summary.generated_tokens
                );
                sink.on_done();
                Ok(summary)
            }
            Err(e) => {
                tracing::error!("Generation failed: {}", e);
                sink.on_error(&e.to_string());
                Err(e)
            }
        }
    }

    /// Free the context and model and release the backend. Safe to repeat.
    pub fn unload(&mut self) {
        if let Some(mut loaded) = self.loaded.take() {
            drop(loaded.context.take());
            drop(loaded.model.take());
            tracing::info!("Model unloaded: {:?}", loaded.info.model_path);
        }
        self.state = RunnerState::Unloaded;
    }
}

impl<E: ComputeEngine> Drop for LlamaRunner<E> {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Accumulates token bytes and hands out complete UTF-8 text.
#[derive(Default)]
struct Utf8Pending(Vec<u8>);

impl Utf8Pending {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.0.extend_from_slice(bytes);
        match std::str::from_utf8(&self.0) {
            Ok(text) => {
                let text = text.to_string();
                self.0.clear();
                text
            }
            // Incomplete trailing sequence: keep it for the next token.
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.0[..valid]).into_owned();
                self.0.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.0).into_owned();
                self.0.clear();
                text
            }
        }
    }

    fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.0).into_owned();
        self.0.clear();
        text
    }
}

fn run_generation<E: ComputeEngine>(
    loaded: &mut Loaded<E>,
    request: &GenerationRequest,
    sink: &mut dyn TokenSink,
    cancel: &AtomicBool,
    has_vision_ops: bool,
) -> Result<GenerationSummary, RuntimeError> {
    let (Some(ctx), Some(model)) = (loaded.context.as_mut(), loaded.model.as_ref()) else {
        return Err(RuntimeError::NotLoaded);
    };
    let cancelled = || cancel.load(Ordering::Acquire);

    ctx.clear_memory();
    ctx.ensure_logits_output();
    let n_ctx = ctx.n_ctx();

    let mut image_positions = 0;
    if !request.images.is_empty() {
        if !has_vision_ops {
            return Err(VisionError::Unavailable.into());
        }
        image_positions = vision::prime_images(ctx, &request.images, 0)?;
    }
    let mut n_past = i32::try_from(image_positions).unwrap_or(i32::MAX);

    let mut tokens = model
        .tokenize(&request.prompt, should_add_bos(&request.prompt))
        .map_err(RuntimeError::Tokenize)?;
    let prompt_tokens = tokens.len();
    let budget = n_ctx.saturating_sub(PROMPT_HEADROOM + image_positions) as usize;
    let truncated_tokens = tokens.len().saturating_sub(budget);
    if truncated_tokens > 0 {
        tracing::warn!(
            "Prompt of {} tokens exceeds budget of {}, dropping the oldest {}",
            prompt_tokens,
            budget,
            truncated_tokens
        );
        tokens.drain(..truncated_tokens);
    }

    let mut summary = GenerationSummary {
        prompt_tokens,
        truncated_tokens,
        image_positions,
        generated_tokens: 0,
        stop_reason: StopReason::Cancelled,
    };

    if tokens.is_empty() {
        if cancelled() {
            return Ok(summary);
        }
        let bos = [BatchEntry {
            token: model.bos_token(),
            pos: n_past,
            logits: true,
        }];
        ctx.decode(&bos).map_err(RuntimeError::Decode)?;
        n_past += 1;
    } else {
        for chunk in tokens.chunks(BATCH_SIZE) {
            if cancelled() {
                return Ok(summary);
            }
            let last = chunk.len() - 1;
            let batch: Vec<BatchEntry> = chunk
                .iter()
                .enumerate()
                .map(|(i, &token)| BatchEntry {
                    token,
                    pos: n_past + i as i32,
                    logits: i == last,
                })
                .collect();
            ctx.decode(&batch).map_err(RuntimeError::Decode)?;
            n_past += chunk.len() as i32;
            if cancelled() {
                return Ok(summary);
            }
        }
    }

    ctx.begin_sampling(&request.sampler);
    let mut pending = Utf8Pending::default();
    let stop_reason = loop {
        if cancelled() {
            break StopReason::Cancelled;
        }
        let Some(token) = ctx.sample() else {
            break StopReason::NoCandidate;
        };
        if model.is_end_of_generation(token) {
            break StopReason::EndOfSequence;
        }

        let bytes = model.token_to_bytes(token).map_err(RuntimeError::Detokenize)?;
        let text = pending.push(&bytes);
        if !text.is_empty() {
            sink.on_token(&text);
        }
        summary.generated_tokens += 1;

        if request.max_tokens > 0 && summary.generated_tokens >= request.max_tokens as usize {
            break StopReason::MaxTokens;
        }
        if n_past as u32 >= n_ctx {
            break StopReason::ContextFull;
        }
        feed_back(ctx, token, n_past)?;
        n_past += 1;
    };

    let tail = pending.flush();
    if !tail.is_empty() {
        sink.on_token(&tail);
    }
    summary.stop_reason = stop_reason;
    Ok(summary)
}

fn feed_back<C: ContextHandle>(ctx: &mut C, token: TokenId, pos: i32) -> Result<(), RuntimeError> {
    let entry = [BatchEntry {
        token,
        pos,
        logits: true,
    }];
    ctx.decode(&entry).map_err(RuntimeError::Decode)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::inference::backend::testing::counting_manager;
    use crate::inference::kv_cache::KvCacheType;
    use crate::inference::testing::{
        image_paths, RecordingSink, ScriptedEngine, VisionMode, BOS,
    };
    use crate::inference::streaming::{token_channel, StreamToken};

    fn runner(engine: ScriptedEngine) -> (LlamaRunner<ScriptedEngine>, Arc<BackendManager>) {
        let (manager, _ups, _downs) = counting_manager();
        let runner =
            LlamaRunner::with_backend(engine, Arc::clone(&manager), RuntimeOverrides::default());
        (runner, manager)
    }

    fn request(n_ctx: u32) -> LoadRequest {
        LoadRequest {
            n_ctx,
            ..LoadRequest::new("/models/test.gguf")
        }
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_generate_max_tokens() {
        let engine = ScriptedEngine::new();
        let (mut runner, _manager) = runner(engine);
        runner.load(request(4096)).unwrap();

        // BOS is added by the tokenizer: 9 words + BOS = 10 tokens.
        let mut sink = RecordingSink::default();
        let summary = runner
            .generate(&GenerationRequest::new(words(9), 5), &mut sink)
            .unwrap();

        assert_eq!(summary.prompt_tokens, 10);
        assert_eq!(sink.tokens.len(), 5);
        assert_eq!(sink.done, 1);
        assert!(sink.errors.is_empty());
        assert_eq!(summary.stop_reason, StopReason::MaxTokens);
        assert_eq!(runner.state(), RunnerState::Ready);
    }

    #[test]
    fn test_prompt_batches_are_contiguous() {
        let engine = ScriptedEngine::new();
        let log = engine.log();
        let (mut runner, _manager) = runner(engine);
        runner.load(request(4096)).unwrap();

        let mut sink = RecordingSink::default();
        runner
            .generate(&GenerationRequest::new(words(1199), 2), &mut sink)
            .unwrap();

        let log = log.borrow();
        let prompt_batches: Vec<_> = log.batches.iter().take(3).collect();
        assert_eq!(prompt_batches[0].len(), BATCH_SIZE);
        assert_eq!(prompt_batches[1].len(), BATCH_SIZE);
        assert_eq!(prompt_batches[2].len(), 1200 - 2 * BATCH_SIZE);

        let mut expected = 0;
        for batch in &prompt_batches {
            for (i, entry) in batch.iter().enumerate() {
                assert_eq!(entry.pos, expected);
                assert_eq!(entry.logits, i == batch.len() - 1);
                expected += 1;
            }
        }
        // First feedback token follows the prompt directly.
        assert_eq!(log.batches[3][0].pos, 1200);
        assert_eq!(log.batches.len(), 4);
    }

    #[test]
    fn test_end_of_sequence() {
        let mut engine = ScriptedEngine::new();
        engine.outputs = vec![10, 11];
        let (mut runner, _manager) = runner(engine);
        runner.load(request(4096)).unwrap();

        let mut sink = RecordingSink::default();
        let summary = runner
            .generate(&GenerationRequest::new("hello", 0), &mut sink)
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::EndOfSequence);
        assert_eq!(sink.tokens, vec!["t10 ".to_string(), "t11 ".to_string()]);
        assert_eq!(sink.done, 1);
    }

    #[test]
    fn test_cancel_during_prompt_eval() {
        let (mut runner, _manager) = runner(ScriptedEngine::new());
        runner.engine.cancel_on_decode = Some((0, Arc::clone(&runner.cancel)));
        runner.load(request(4096)).unwrap();

        let mut sink = RecordingSink::default();
        let summary = runner
            .generate(&GenerationRequest::new(words(20), 50), &mut sink)
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert!(sink.tokens.is_empty());
        assert_eq!(sink.done, 1);
        assert!(sink.errors.is_empty());
    }

    #[test]
    fn test_cancel_from_sink() {
        struct CancelAfter {
            handle: CancelHandle,
            after: usize,
            seen: usize,
            done: usize,
            errors: usize,
        }
        impl TokenSink for CancelAfter {
            fn on_token(&mut self, _text: &str) {
                self.seen += 1;
                if self.seen == self.after {
                    self.handle.cancel();
                }
            }
            fn on_done(&mut self) {
                self.done += 1;
            }
            fn on_error(&mut self, _message: &str) {
                self.errors += 1;
            }
        }

        let (mut runner, _manager) = runner(ScriptedEngine::new());
        runner.load(request(4096)).unwrap();
        let mut sink = CancelAfter {
            handle: runner.cancel_handle(),
            after: 3,
            seen: 0,
            done: 0,
            errors: 0,
        };
        let summary = runner
            .generate(&GenerationRequest::new("tell me a story", 0), &mut sink)
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert_eq!(sink.seen, 3);
        assert_eq!((sink.done, sink.errors), (1, 0));
    }

    #[test]
    fn test_stale_cancel_is_reset() {
        let (mut runner, _manager) = runner(ScriptedEngine::new());
        runner.load(request(4096)).unwrap();
        runner.cancel_current();

        let mut sink = RecordingSink::default();
        let summary = runner
            .generate(&GenerationRequest::new("hi", 2), &mut sink)
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::MaxTokens);
        assert_eq!(sink.tokens.len(), 2);
    }

    #[test]
    fn test_decode_failure_reports_error_only() {
        let mut engine = ScriptedEngine::new();
        // Prompt decode succeeds, the first feedback decode fails.
        engine.fail_decode_at = Some(1);
        let (mut runner, _manager) = runner(engine);
        runner.load(request(4096)).unwrap();

        let mut sink = RecordingSink::default();
        let result = runner.generate(&GenerationRequest::new("hello there", 10), &mut sink);
        assert!(matches!(result, Err(RuntimeError::Decode(_))));
        assert_eq!(sink.tokens.len(), 1);
        assert_eq!(sink.done, 0);
        assert_eq!(sink.errors.len(), 1);
        assert_eq!(runner.state(), RunnerState::Ready);
    }

    #[test]
    fn test_generate_without_model() {
        let (mut runner, _manager) = runner(ScriptedEngine::new());
        let mut sink = RecordingSink::default();
        let result = runner.generate(&GenerationRequest::new("hi", 1), &mut sink);
        assert!(matches!(result, Err(RuntimeError::NotLoaded)));
        assert_eq!((sink.done, sink.errors.len()), (0, 1));
    }

    #[test]
    fn test_prompt_truncated_to_tail() {
        let engine = ScriptedEngine::new();
        let log = engine.log();
        let (mut runner, _manager) = runner(engine);
        runner.load(request(2048)).unwrap();

        let mut sink = RecordingSink::default();
        let summary = runner
            .generate(&GenerationRequest::new(words(2999), 1), &mut sink)
            .unwrap();
        assert_eq!(summary.prompt_tokens, 3000);
        assert_eq!(summary.truncated_tokens, 3000 - (2048 - 64));

        let log = log.borrow();
        let evaluated: usize = log.batches.iter().map(|b| b.len()).sum();
        assert_eq!(evaluated, 2048 - 64);
        // BOS was at the head and is gone with the rest of the dropped prefix.
        assert_ne!(log.batches[0][0].token, BOS);
    }

    #[test]
    fn test_empty_prompt_primes_with_bos() {
        let mut engine = ScriptedEngine::new();
        engine.tokenizer_bos = false;
        let log = engine.log();
        let (mut runner, _manager) = runner(engine);
        runner.load(request(4096)).unwrap();

        let mut sink = RecordingSink::default();
        runner
            .generate(&GenerationRequest::new("", 1), &mut sink)
            .unwrap();
        let log = log.borrow();
        assert_eq!(log.batches[0].len(), 1);
        assert_eq!(log.batches[0][0].token, BOS);
        assert!(log.batches[0][0].logits);
        assert_eq!(sink.tokens.len(), 1);
    }

    #[test]
    fn test_should_add_bos() {
        assert!(should_add_bos("Hello"));
        assert!(should_add_bos(""));
        assert!(!should_add_bos("<|im_start|>user"));
        assert!(!should_add_bos("[INST] hi"));
    }

    #[test]
    fn test_context_stops_generation() {
        let mut engine = ScriptedEngine::new();
        engine.outputs = (10..5000).collect();
        engine.n_ctx_train = 2048;
        let (mut runner, _manager) = runner(engine);
        runner.load(request(2048)).unwrap();

        let mut sink = RecordingSink::default();
        let summary = runner
            .generate(&GenerationRequest::new(words(99), 0), &mut sink)
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::ContextFull);
        // 100 prompt positions, then one per fed-back token up to the window.
        assert_eq!(summary.generated_tokens, 2048 - 100 + 1);
    }

    #[test]
    fn test_context_clamped_to_trained() {
        let mut engine = ScriptedEngine::new();
        engine.n_ctx_train = 4096;
        let (mut runner, _manager) = runner(engine);
        let info = runner.load(request(32768)).unwrap();
        assert_eq!(info.n_ctx, 4096);

        let info = runner.load(request(0)).unwrap();
        assert_eq!(info.n_ctx, 4096);
    }

    #[test]
    fn test_resolve_context_length() {
        assert_eq!(resolve_context_length(0, 0, false), FALLBACK_CONTEXT);
        assert_eq!(resolve_context_length(16384, 8192, false), 8192);
        assert_eq!(resolve_context_length(4096, 32768, true), VISION_CONTEXT_FLOOR);
        assert_eq!(resolve_context_length(2048, 4096, true), 4096);
        assert_eq!(resolve_context_length(4096, 0, false), 4096);
    }

    #[test]
    fn test_per_sequence_floor() {
        let engine = ScriptedEngine::new();
        let log = engine.log();
        let (mut runner, manager) = runner(engine);
        let before = manager.refcount();

        let result = runner.load(LoadRequest {
            n_seq_max: Some(4),
            ..request(4096)
        });
        assert!(matches!(
            result,
            Err(LoadError::ContextTooSmall { per_sequence: 1024, minimum: 2048 })
        ));
        assert_eq!(manager.refcount(), before);
        assert_eq!(log.borrow().models_dropped, 1);
        assert!(!runner.is_loaded());
        assert_eq!(runner.state(), RunnerState::Unloaded);
    }

    #[test]
    fn test_failed_loads_release_backend() {
        let mut engine = ScriptedEngine::new();
        engine.fail_context = true;
        let log = engine.log();
        let (mut runner, manager) = runner(engine);
        assert!(matches!(runner.load(request(4096)), Err(LoadError::Context(_))));
        assert_eq!(manager.refcount(), 0);
        assert_eq!(log.borrow().models_dropped, 1);

        let mut engine = ScriptedEngine::new();
        engine.fail_model_load = true;
        let (mut runner, manager) = super::tests::runner(engine);
        assert!(matches!(runner.load(request(4096)), Err(LoadError::Model(_))));
        assert_eq!(manager.refcount(), 0);
    }

    #[test]
    fn test_unload_is_idempotent() {
        let engine = ScriptedEngine::new();
        let log = engine.log();
        let (mut runner, manager) = runner(engine);
        runner.load(request(4096)).unwrap();
        assert_eq!(manager.refcount(), 1);

        runner.unload();
        runner.unload();
        assert_eq!(manager.refcount(), 0);
        assert_eq!(log.borrow().contexts_dropped, 1);
        assert_eq!(log.borrow().models_dropped, 1);

        runner.load(request(4096)).unwrap();
        drop(runner);
        assert_eq!(manager.refcount(), 0);
    }

    #[test]
    fn test_runners_share_backend() {
        let (manager, ups, downs) = counting_manager();
        let mut first = LlamaRunner::with_backend(
            ScriptedEngine::new(),
            Arc::clone(&manager),
            RuntimeOverrides::default(),
        );
        let mut second = LlamaRunner::with_backend(
            ScriptedEngine::new(),
            Arc::clone(&manager),
            RuntimeOverrides::default(),
        );
        first.load(request(4096)).unwrap();
        second.load(request(4096)).unwrap();
        assert_eq!(manager.refcount(), 2);
        drop(first);
        assert_eq!(downs.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(ups.load(Ordering::SeqCst), 1);
        assert_eq!(downs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kv_merge_applied_at_load() {
        let mut engine = ScriptedEngine::new();
        engine.split_kv = false;
        let log = engine.log();
        let (mut runner, _manager) = runner(engine);
        let info = runner
            .load(LoadRequest {
                kv_cache: KvCacheConfig {
                    enabled: true,
                    type_k: KvCacheType::Q4_0,
                    type_v: KvCacheType::Q5_0,
                },
                ..request(4096)
            })
            .unwrap();
        assert!(info.kv_cache.merged_fallback);
        assert_eq!(info.kv_cache.type_k, KvCacheType::Q5_0);
        let params = &log.borrow().context_params[0];
        assert_eq!(params.type_k, KvCacheType::Q5_0);
        assert_eq!(params.type_v, KvCacheType::Q5_0);
    }

    #[test]
    fn test_gpu_layers_select_placement() {
        let engine = ScriptedEngine::new();
        let log = engine.log();
        let (mut runner, _manager) = runner(engine);
        runner.load(request(4096)).unwrap();
        runner
            .load(LoadRequest {
                gpu_layers: 33,
                ..request(4096)
            })
            .unwrap();
        let log = log.borrow();
        assert_eq!(log.model_params[0].placement, DevicePlacement::CpuOnly);
        assert_eq!(
            log.model_params[1].placement,
            DevicePlacement::Offload { gpu_layers: 33 }
        );
    }

    #[test]
    fn test_flash_attention_override_reaches_context() {
        let engine = ScriptedEngine::new();
        let log = engine.log();
        let (manager, _ups, _downs) = counting_manager();
        let overrides = RuntimeOverrides::from_lookup(|key| {
            (key == crate::inference::options::ENV_FLASH_ATTN).then(|| "off".to_string())
        });
        let mut runner = LlamaRunner::with_backend(engine, manager, overrides);
        let info = runner.load(request(4096)).unwrap();

        assert_eq!(info.flash_attention, FlashAttention::Disabled);
        assert_eq!(
            log.borrow().context_params[0].flash_attention,
            FlashAttention::Disabled
        );
    }

    #[test]
    fn test_cpu_only_keeps_kqv_on_cpu() {
        let engine = ScriptedEngine::new();
        let log = engine.log();
        let (mut runner, _manager) = runner(engine);
        runner.load(request(4096)).unwrap();
        runner
            .load(LoadRequest {
                gpu_layers: 99,
                ..request(4096)
            })
            .unwrap();
        let log = log.borrow();
        assert!(!log.context_params[0].offload_kqv);
        assert!(log.context_params[1].offload_kqv);
    }

    #[test]
    fn test_max_tokens_counts_split_characters() {
        // "€" arrives as three single-byte pieces.
        let mut engine = ScriptedEngine::new();
        engine.outputs = vec![10, 11, 12, 13];
        engine.pieces = HashMap::from([
            (10, vec![0xE2]),
            (11, vec![0x82]),
            (12, vec![0xAC]),
        ]);
        let (mut runner, _manager) = runner(engine);
        runner.load(request(4096)).unwrap();

        let mut sink = RecordingSink::default();
        let summary = runner
            .generate(&GenerationRequest::new("price", 3), &mut sink)
            .unwrap();
        assert_eq!(summary.generated_tokens, 3);
        assert_eq!(summary.stop_reason, StopReason::MaxTokens);
        assert_eq!(sink.tokens, vec!["€".to_string()]);

        // Stopping mid-character flushes what was held back.
        runner.load(request(4096)).unwrap();
        let mut sink = RecordingSink::default();
        let summary = runner
            .generate(&GenerationRequest::new("price", 2), &mut sink)
            .unwrap();
        assert_eq!(summary.generated_tokens, 2);
        assert_eq!(sink.tokens, vec!["\u{FFFD}".to_string()]);
        assert_eq!(sink.done, 1);
    }

    #[test]
    fn test_images_offset_prompt_positions() {
        let mut engine = ScriptedEngine::new();
        engine.vision = VisionMode::Projector { positions: 256 };
        let log = engine.log();
        let (mut runner, _manager) = runner(engine);
        let info = runner.load(request(4096)).unwrap();
        assert_eq!(info.n_ctx, VISION_CONTEXT_FLOOR);

        let mut req = GenerationRequest::new("describe this", 1);
        req.images = image_paths(2);
        let mut sink = RecordingSink::default();
        let summary = runner.generate(&req, &mut sink).unwrap();

        assert_eq!(summary.image_positions, 512);
        let log = log.borrow();
        assert_eq!(log.encoded_images, vec![0, 256]);
        assert_eq!(log.batches[0][0].pos, 512);
    }

    #[test]
    fn test_image_without_projector() {
        let mut engine = ScriptedEngine::new();
        engine.vision = VisionMode::NoProjector;
        let log = engine.log();
        let (mut runner, _manager) = runner(engine);
        runner.load(request(8192)).unwrap();

        let mut req = GenerationRequest::new("describe this", 5);
        req.images = image_paths(1);
        let mut sink = RecordingSink::default();
        let err = runner.generate(&req, &mut sink).unwrap_err();
        assert!(err.is_vision_unsupported());
        assert!(log.borrow().batches.is_empty());
        assert_eq!((sink.done, sink.errors.len()), (0, 1));

        let mut engine = ScriptedEngine::new();
        engine.vision = VisionMode::BrokenImages;
        let (mut runner, _manager) = super::tests::runner(engine);
        runner.load(request(8192)).unwrap();
        let err = runner.generate(&req, &mut sink).unwrap_err();
        assert!(matches!(err, RuntimeError::Vision(VisionError::Failed(_))));
        assert!(!err.is_vision_unsupported());
    }

    #[test]
    fn test_images_on_text_only_build() {
        let (mut runner, _manager) = runner(ScriptedEngine::new());
        runner.load(request(4096)).unwrap();
        let mut req = GenerationRequest::new("describe this", 5);
        req.images = image_paths(1);
        let mut sink = RecordingSink::default();
        let err = runner.generate(&req, &mut sink).unwrap_err();
        assert!(matches!(err, RuntimeError::Vision(VisionError::Unavailable)));
    }

    #[test]
    fn test_probe_vision() {
        for (mode, expected) in [
            (VisionMode::Unsupported, VisionProbe::Unavailable),
            (VisionMode::NoProjector, VisionProbe::NoProjector),
            (VisionMode::Projector { positions: 1 }, VisionProbe::Ok),
        ] {
            let mut engine = ScriptedEngine::new();
            engine.vision = mode;
            let log = engine.log();
            let (mut runner, _manager) = runner(engine);
            assert_eq!(runner.probe_vision(), VisionProbe::Unavailable);
            runner.load(request(8192)).unwrap();
            assert_eq!(runner.probe_vision(), expected);
            let clears = log.borrow().clears;
            assert_eq!(clears, usize::from(mode != VisionMode::Unsupported));
        }
    }

    #[test]
    fn test_channel_stream_end_to_end() {
        let (mut runner, _manager) = runner(ScriptedEngine::new());
        runner.load(request(4096)).unwrap();
        let (mut sink, stream) = token_channel();
        runner
            .generate(&GenerationRequest::new("hello", 3), &mut sink)
            .unwrap();
        drop(sink);
        let (text, terminal) = stream.collect_text();
        assert_eq!(text, "t10 t11 t12 ");
        assert_eq!(terminal, Some(StreamToken::Done));
    }

    #[test]
    fn test_utf8_split_across_tokens() {
        let mut pending = Utf8Pending::default();
        let bytes = "é".as_bytes();
        assert_eq!(pending.push(&bytes[..1]), "");
        assert_eq!(pending.push(&bytes[1..]), "é");
        assert_eq!(pending.push(&[0xff, b'a']), "\u{fffd}a");
        assert_eq!(pending.push(&[0xe2, 0x82]), "");
        assert_eq!(pending.flush(), "\u{fffd}");
    }
}
