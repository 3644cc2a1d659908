//! Compute engine seam
//!
//! The runner drives model loading, prompt evaluation and sampling through
//! these traits. The native llama.cpp adapter lives in `inference::llama`.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::kv_cache::KvCacheType;
use super::options::FlashAttention;
use super::vision::ImageBitmap;

/// Vocabulary index as understood by the engine
pub type TokenId = i32;

/// Where model weights are placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePlacement {
    /// No device enumeration, everything on the CPU
    CpuOnly,
    /// Default device enumeration with this many layers offloaded
    Offload { gpu_layers: u32 },
}

impl DevicePlacement {
    pub fn from_gpu_layers(gpu_layers: u32) -> Self {
        if gpu_layers == 0 {
            DevicePlacement::CpuOnly
        } else {
            DevicePlacement::Offload { gpu_layers }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub placement: DevicePlacement,
    pub use_mmap: bool,
    /// Multimodal projector loaded alongside the model
    pub projector_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_seq_max: u32,
    pub n_threads: i32,
    pub type_k: KvCacheType,
    pub type_v: KvCacheType,
    pub flash_attention: FlashAttention,
    /// Keep the KV cache and attention ops on the offload device
    pub offload_kqv: bool,
}

/// One token of a decode batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: i32,
    /// Request output logits for this position
    pub logits: bool,
}

/// Sampler configuration: temperature, then top-k, then greedy pick (or a
/// seeded random draw when `seed` is set).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerChain {
    pub temperature: f32,
    pub top_k: i32,
    pub seed: Option<u32>,
}

impl Default for SamplerChain {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            seed: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextInit(String),

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Detokenization failed: {0}")]
    Detokenize(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Model has no compatible vision projector")]
    NoProjector,

    #[error("Vision operations are not available in this build")]
    VisionUnsupported,

    #[error("Image processing failed: {0}")]
    Image(String),
}

pub trait ComputeEngine {
    type Model: ModelHandle;
    type Context: ContextHandle;

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, EngineError>;

    fn new_context(
        &self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, EngineError>;

    /// Whether image embedding entry points exist in this build
    fn has_vision_ops(&self) -> bool;

    /// Whether the context accepts different K and V cache types
    fn supports_split_kv_types(&self) -> bool;
}

pub trait ModelHandle {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError>;

    /// Raw bytes of one token. A multi-byte character may be split across tokens.
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;

    fn bos_token(&self) -> TokenId;

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Context length the model was trained with, 0 if unknown
    fn n_ctx_train(&self) -> u32;
}

pub trait ContextHandle {
    fn n_ctx(&self) -> u32;

    /// Drop every cached key/value position.
    fn clear_memory(&mut self);

    /// Make decode produce token logits rather than embeddings.
    fn ensure_logits_output(&mut self);

    fn decode(&mut self, batch: &[BatchEntry]) -> Result<(), EngineError>;

    /// Install the sampler used by subsequent `sample` calls.
    fn begin_sampling(&mut self, chain: &SamplerChain);

    /// Pick the next token from the last logits, `None` when nothing is left.
    fn sample(&mut self) -> Option<TokenId>;

    fn decode_image_file(&mut self, path: &Path) -> Result<ImageBitmap, EngineError>;

    /// Evaluate an image at `n_past`, returning the positions it occupied.
    fn encode_image(&mut self, image: &ImageBitmap, n_past: i32) -> Result<u32, EngineError>;
}
