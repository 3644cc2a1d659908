//! GGUF model introspection
//!
//! Best-effort readers over the GGUF header. Nothing here panics or errors on
//! malformed input: queries return `None`/`false` instead.

pub mod heuristics;
pub mod inspect;
pub mod metadata;
pub mod moe;
pub mod reader;

#[cfg(test)]
pub(crate) mod testing;

pub use heuristics::{
    has_vision_projector, likely_vision, scan_vision_projector, supports_tool_calls,
    PREFIX_SCAN_LIMIT,
};
pub use inspect::{inspect_file, map_file, read_prefix, GgufError};
pub use metadata::{architecture_info, chat_template, context_length, layer_count, ArchitectureInfo};
pub use moe::{moe_info, moe_info_from_bytes, MoeInfo, MoeInfoCache};
pub use reader::{is_gguf, GgufHeader, GgufReader, GGUF_MAGIC};
