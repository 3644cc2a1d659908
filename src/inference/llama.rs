//! llama.cpp engine
//!
//! Implements the engine traits over `llama-cpp-2`. Image embedding goes
//! through llama.cpp's multimodal helpers and is only compiled with the
//! `vision` feature.

use std::num::NonZeroU32;
use std::path::Path;
#[cfg(feature = "vision")]
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};

use llama_cpp_2::context::params::{KvCacheType as LlamaKvCacheType, LlamaContextParams};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
#[cfg(feature = "vision")]
use llama_cpp_2::mtmd::{
    mtmd_default_marker, MtmdBitmap, MtmdContext, MtmdContextParams, MtmdInputText,
};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};

use super::backend::{BackendError, BackendHooks};
use super::engine::{
    BatchEntry, ComputeEngine, ContextHandle, ContextParams, DevicePlacement, EngineError,
    ModelHandle, ModelParams, SamplerChain, TokenId,
};
use super::kv_cache::KvCacheType;
use super::options::{FlashAttention, RuntimeOverrides};
use super::runner::{LlamaRunner, LoadError, LoadRequest};
use super::vision::ImageBitmap;

/// Filled while the backend refcount is above zero
static NATIVE_BACKEND: Mutex<Option<Arc<LlamaBackend>>> = Mutex::new(None);

/// Brings llama.cpp up and forwards its logs to `tracing`.
#[derive(Debug, Default)]
pub struct NativeBackendHooks;

impl BackendHooks for NativeBackendHooks {
    fn bring_up(&self) -> Result<(), BackendError> {
        let verbose = RuntimeOverrides::from_env().verbose;
        let backend = LlamaBackend::init().map_err(|e| BackendError::Init(e.to_string()))?;
        send_logs_to_tracing(LogOptions::default().with_logs_enabled(verbose));
        *NATIVE_BACKEND.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(backend));
        Ok(())
    }

    fn tear_down(&self) {
        let backend = NATIVE_BACKEND
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match backend.map(Arc::into_inner) {
            Some(Some(mut backend)) => backend.void_logs(),
            Some(None) => tracing::debug!("llama.cpp backend still borrowed, freed by its last user"),
            None => {}
        }
    }
}

/// The live backend. The lock is only held for the lookup so model loads on
/// different runners do not serialize on it.
fn live_backend(
    on_missing: impl FnOnce(String) -> EngineError,
) -> Result<Arc<LlamaBackend>, EngineError> {
    NATIVE_BACKEND
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(|| on_missing("backend not initialized".to_string()))
}

fn native_kv_type(kind: KvCacheType) -> LlamaKvCacheType {
    match kind {
        KvCacheType::F32 => LlamaKvCacheType::F32,
        KvCacheType::F16 => LlamaKvCacheType::F16,
        KvCacheType::Q8_0 => LlamaKvCacheType::Q8_0,
        KvCacheType::Q5_0 => LlamaKvCacheType::Q5_0,
        KvCacheType::Q5_1 => LlamaKvCacheType::Q5_1,
        KvCacheType::Q4_0 => LlamaKvCacheType::Q4_0,
        KvCacheType::Q4_1 => LlamaKvCacheType::Q4_1,
        KvCacheType::Iq4Nl => LlamaKvCacheType::IQ4_NL,
    }
}

fn native_flash_attention(mode: FlashAttention) -> llama_cpp_sys_2::llama_flash_attn_type {
    match mode {
        FlashAttention::Auto => llama_cpp_sys_2::LLAMA_FLASH_ATTN_TYPE_AUTO,
        FlashAttention::Enabled => llama_cpp_sys_2::LLAMA_FLASH_ATTN_TYPE_ENABLED,
        FlashAttention::Disabled => llama_cpp_sys_2::LLAMA_FLASH_ATTN_TYPE_DISABLED,
    }
}

fn model_params(placement: DevicePlacement) -> Result<LlamaModelParams, EngineError> {
    match placement {
        // An empty device list skips GPU enumeration entirely.
        DevicePlacement::CpuOnly => LlamaModelParams::default()
            .with_n_gpu_layers(0)
            .with_devices(&[])
            .map_err(|e| EngineError::ModelLoad(e.to_string())),
        DevicePlacement::Offload { gpu_layers } => {
            Ok(LlamaModelParams::default().with_n_gpu_layers(gpu_layers))
        }
    }
}

fn build_sampler(chain: &SamplerChain) -> LlamaSampler {
    let pick = match chain.seed {
        Some(seed) => LlamaSampler::dist(seed),
        None => LlamaSampler::greedy(),
    };
    LlamaSampler::chain_simple([
        LlamaSampler::temp(chain.temperature),
        LlamaSampler::top_k(chain.top_k),
        pick,
    ])
}

#[cfg(feature = "vision")]
fn load_projector(
    model: &LlamaModel,
    projector: &Path,
    placement: DevicePlacement,
) -> Option<Rc<MtmdContext>> {
    let Some(path) = projector.to_str() else {
        tracing::warn!("Projector path {} is not UTF-8, ignoring", projector.display());
        return None;
    };
    let params = MtmdContextParams {
        use_gpu: placement != DevicePlacement::CpuOnly,
        ..MtmdContextParams::default()
    };
    match MtmdContext::init_from_file(path, model, &params) {
        Ok(mtmd) => {
            tracing::info!(
                "Loaded projector {} (vision: {})",
                projector.display(),
                mtmd.support_vision()
            );
            Some(Rc::new(mtmd))
        }
        Err(e) => {
            tracing::warn!("Failed to load projector {}: {}", projector.display(), e);
            None
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaEngine;

pub struct NativeModel {
    // Freed before the model it was built against.
    #[cfg(feature = "vision")]
    mtmd: Option<Rc<MtmdContext>>,
    model: Arc<LlamaModel>,
}

pub struct NativeContext {
    // Field order matters: the context must drop before the model it borrows.
    ctx: LlamaContext<'static>,
    batch: LlamaBatch<'static>,
    sampler: Option<LlamaSampler>,
    #[cfg(feature = "vision")]
    mtmd: Option<Rc<MtmdContext>>,
    #[cfg(feature = "vision")]
    n_batch: i32,
    _model: Arc<LlamaModel>,
}

impl ComputeEngine for LlamaEngine {
    type Model = NativeModel;
    type Context = NativeContext;

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<NativeModel, EngineError> {
        if !params.use_mmap {
            tracing::warn!("Disabling mmap is not supported by this engine, ignoring");
        }
        #[cfg(not(feature = "vision"))]
        if let Some(projector) = &params.projector_path {
            tracing::warn!(
                "Projector {} ignored: built without the `vision` feature",
                projector.display()
            );
        }

        let model_params = model_params(params.placement)?;
        let backend = live_backend(EngineError::ModelLoad)?;
        let model = LlamaModel::load_from_file(&backend, path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        #[cfg(feature = "vision")]
        let mtmd = params
            .projector_path
            .as_deref()
            .and_then(|projector| load_projector(&model, projector, params.placement));

        Ok(NativeModel {
            #[cfg(feature = "vision")]
            mtmd,
            model: Arc::new(model),
        })
    }

    fn new_context(
        &self,
        model: &NativeModel,
        params: &ContextParams,
    ) -> Result<NativeContext, EngineError> {
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.n_ctx))
            .with_n_batch(params.n_batch)
            .with_n_seq_max(params.n_seq_max)
            .with_n_threads(params.n_threads)
            .with_n_threads_batch(params.n_threads)
            .with_type_k(native_kv_type(params.type_k))
            .with_type_v(native_kv_type(params.type_v))
            .with_flash_attention_policy(native_flash_attention(params.flash_attention))
            .with_offload_kqv(params.offload_kqv);

        // SAFETY: the Arc clone stored in `NativeContext::_model` keeps the
        // model alive for as long as the context, and is dropped after it.
        let model_ref: &'static LlamaModel = unsafe { &*Arc::as_ptr(&model.model) };
        let backend = live_backend(EngineError::ContextInit)?;
        let ctx = model_ref
            .new_context(&backend, ctx_params)
            .map_err(|e| EngineError::ContextInit(e.to_string()))?;

        Ok(NativeContext {
            ctx,
            batch: LlamaBatch::new(params.n_batch.max(1) as usize, 1),
            sampler: None,
            #[cfg(feature = "vision")]
            mtmd: model.mtmd.clone(),
            #[cfg(feature = "vision")]
            n_batch: i32::try_from(params.n_batch).unwrap_or(i32::MAX),
            _model: Arc::clone(&model.model),
        })
    }

    fn has_vision_ops(&self) -> bool {
        cfg!(feature = "vision")
    }

    fn supports_split_kv_types(&self) -> bool {
        true
    }
}

impl ModelHandle for NativeModel {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| EngineError::Detokenize(e.to_string()))
    }

    fn bos_token(&self) -> TokenId {
        self.model.token_bos().0
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn n_ctx_train(&self) -> u32 {
        self.model.n_ctx_train()
    }
}

#[cfg(feature = "vision")]
impl NativeContext {
    fn projector(&self) -> Result<&MtmdContext, EngineError> {
        match self.mtmd.as_deref() {
            Some(mtmd) if mtmd.support_vision() => Ok(mtmd),
            _ => Err(EngineError::NoProjector),
        }
    }
}

impl ContextHandle for NativeContext {
    fn n_ctx(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn clear_memory(&mut self) {
        self.ctx.clear_kv_cache();
    }

    // Contexts are created with embeddings off, logits are always produced.
    fn ensure_logits_output(&mut self) {}

    fn decode(&mut self, entries: &[BatchEntry]) -> Result<(), EngineError> {
        self.batch.clear();
        for entry in entries {
            self.batch
                .add(LlamaToken::new(entry.token), entry.pos, &[0], entry.logits)
                .map_err(|e| EngineError::Decode(e.to_string()))?;
        }
        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| EngineError::Decode(e.to_string()))
    }

    fn begin_sampling(&mut self, chain: &SamplerChain) {
        self.sampler = Some(build_sampler(chain));
    }

    fn sample(&mut self) -> Option<TokenId> {
        let sampler = self
            .sampler
            .get_or_insert_with(|| build_sampler(&SamplerChain::default()));
        Some(sampler.sample(&self.ctx, -1).0)
    }

    #[cfg(not(feature = "vision"))]
    fn decode_image_file(&mut self, _path: &Path) -> Result<ImageBitmap, EngineError> {
        Err(EngineError::VisionUnsupported)
    }

    #[cfg(not(feature = "vision"))]
    fn encode_image(&mut self, _image: &ImageBitmap, _n_past: i32) -> Result<u32, EngineError> {
        Err(EngineError::VisionUnsupported)
    }

    #[cfg(feature = "vision")]
    fn decode_image_file(&mut self, path: &Path) -> Result<ImageBitmap, EngineError> {
        let mtmd = self.projector()?;
        let name = path
            .to_str()
            .ok_or_else(|| EngineError::Image(format!("{} is not UTF-8", path.display())))?;
        let bitmap = MtmdBitmap::from_file(mtmd, name)
            .map_err(|e| EngineError::Image(format!("{}: {}", path.display(), e)))?;

        // Helpers decode to packed RGB.
        let rgba = bitmap
            .data()
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], 255])
            .collect();
        ImageBitmap::new(bitmap.nx(), bitmap.ny(), rgba)
            .ok_or_else(|| EngineError::Image(format!("{}: unexpected pixel layout", path.display())))
    }

    #[cfg(feature = "vision")]
    fn encode_image(&mut self, image: &ImageBitmap, n_past: i32) -> Result<u32, EngineError> {
        let mtmd = self.projector()?;
        let rgb: Vec<u8> = image
            .rgba()
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();
        let bitmap = MtmdBitmap::from_image_data(image.width(), image.height(), &rgb)
            .map_err(|e| EngineError::Image(e.to_string()))?;

        let marker = MtmdInputText {
            text: mtmd_default_marker().to_string(),
            add_special: false,
            parse_special: true,
        };
        let chunks = mtmd
            .tokenize(marker, &[&bitmap])
            .map_err(|e| EngineError::Image(e.to_string()))?;
        let next = chunks
            .eval_chunks(mtmd, &self.ctx, n_past, 0, self.n_batch, false)
            .map_err(|e| EngineError::Image(e.to_string()))?;
        u32::try_from(next - n_past)
            .map_err(|_| EngineError::Image(format!("image moved position back to {next}")))
    }
}

/// Load a model with llama.cpp on the process-wide backend.
pub fn load_native(request: LoadRequest) -> Result<LlamaRunner<LlamaEngine>, LoadError> {
    let mut runner = LlamaRunner::new(LlamaEngine);
    runner.load(request)?;
    Ok(runner)
}
