//! LLM inference runtime
//!
//! Backend lifecycle, context configuration and the generation loop. The
//! compute engine sits behind the traits in `engine`; the llama.cpp adapter is
//! compiled with the `native` feature.

pub mod backend;
pub mod engine;
pub mod kv_cache;
#[cfg(feature = "native")]
pub mod llama;
pub mod options;
pub mod runner;
pub mod streaming;
pub mod vision;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendError, BackendHooks, BackendManager, BackendRef};
pub use engine::{ComputeEngine, ContextHandle, EngineError, ModelHandle, SamplerChain};
pub use kv_cache::{KvCacheConfig, KvCacheType, ResolvedKvCache};
#[cfg(feature = "native")]
pub use llama::{load_native, LlamaEngine};
pub use options::{FlashAttention, RuntimeOverrides};
pub use runner::{
    CancelHandle, GenerationRequest, GenerationSummary, LlamaRunner, LoadError, LoadRequest,
    LoadedModelInfo, RunnerState, RuntimeError, StopReason,
};
pub use streaming::{token_channel, StreamToken, TokenSink, TokenStream};
pub use vision::{VisionError, VisionProbe};
