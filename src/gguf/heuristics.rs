//! Capability signals
//!
//! Two tiers: fast substring scans over a capped file prefix (weak signals),
//! and a structured walk of keys, string values and tensor names for the
//! vision projector (authoritative).

use once_cell::sync::Lazy;
use regex::bytes::{Regex, RegexBuilder};

use super::metadata::chat_template;
use super::reader::{is_gguf, GgufReader, Value};

/// Heuristic scans never look past this many bytes.
pub const PREFIX_SCAN_LIMIT: usize = 16 * 1024 * 1024;

const TOOL_CALL_MARKERS: &[&str] = &[
    "<tool_call>",
    "</tool_call>",
    "<|tool_call|>",
    "<tool_response>",
    "[TOOL_CALLS]",
    "[AVAILABLE_TOOLS]",
    "<|python_tag|>",
    "<function_call>",
    "<|tool_calls_section_begin|>",
    "<｜tool▁calls▁begin｜>",
    "tool_calls",
];

const VISION_KEYWORDS: &[&str] = &[
    "vision",
    "mmproj",
    "clip.",
    "llava",
    "<image>",
    "<|image_pad|>",
    "<start_of_image>",
    "image_token",
    "pixel_values",
];

/// Key fragments that only appear when a projector is embedded or declared.
const PROJECTOR_KEY_FRAGMENTS: &[&str] = &[
    "projector_type",
    "mmproj",
    "mm_projector",
    "clip.has_vision_encoder",
    "clip.vision.",
];

const PROJECTOR_VALUE_FRAGMENTS: &[&str] = &[
    "mmproj",
    "mm_projector",
    "multi_modal_projector",
    "vision_tower",
];

const PROJECTOR_TENSOR_FRAGMENTS: &[&str] = &[
    "mm_projector",
    "multi_modal_projector",
    "vision_tower",
    "vision_model",
    "image_newline",
    "mmproj",
];

/// Tensor name prefixes used by CLIP towers and projector stacks.
const PROJECTOR_TENSOR_PREFIXES: &[&str] = &["v.", "mm."];

fn literal_set(words: &[&str], case_insensitive: bool) -> Regex {
    let pattern = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    RegexBuilder::new(&pattern)
        .case_insensitive(case_insensitive)
        .build()
        .expect("escaped literals always form a valid pattern")
}

static TOOL_CALL_SCAN: Lazy<Regex> = Lazy::new(|| literal_set(TOOL_CALL_MARKERS, false));
static VISION_SCAN: Lazy<Regex> = Lazy::new(|| literal_set(VISION_KEYWORDS, true));
static PROJECTOR_SCAN: Lazy<Regex> = Lazy::new(|| {
    let mut words = PROJECTOR_KEY_FRAGMENTS.to_vec();
    words.extend_from_slice(PROJECTOR_VALUE_FRAGMENTS);
    words.extend_from_slice(PROJECTOR_TENSOR_FRAGMENTS);
    literal_set(&words, false)
});

fn scan_prefix(buf: &[u8]) -> &[u8] {
    &buf[..buf.len().min(PREFIX_SCAN_LIMIT)]
}

fn template_mentions_tools(template: &str) -> bool {
    template.contains("tools") || template.contains("tool_call") || template.contains("function")
}

/// Whether the model appears to be trained for tool calling.
pub fn supports_tool_calls(buf: &[u8]) -> bool {
    if !is_gguf(buf) {
        return false;
    }
    if TOOL_CALL_SCAN.is_match(scan_prefix(buf)) {
        return true;
    }
    chat_template(buf).is_some_and(|t| template_mentions_tools(&t))
}

/// Weak signal: vision-related vocabulary somewhere in the prefix.
pub fn likely_vision(buf: &[u8]) -> bool {
    is_gguf(buf) && VISION_SCAN.is_match(scan_prefix(buf))
}

fn key_is_projector(key: &str) -> bool {
    PROJECTOR_KEY_FRAGMENTS.iter().any(|f| key.contains(f))
}

fn value_mentions_projector(value: &Value<'_>) -> bool {
    value
        .as_str()
        .is_some_and(|s| PROJECTOR_VALUE_FRAGMENTS.iter().any(|f| s.contains(f)))
}

fn tensor_is_projector(name: &str) -> bool {
    PROJECTOR_TENSOR_PREFIXES.iter().any(|p| name.starts_with(p))
        || PROJECTOR_TENSOR_FRAGMENTS.iter().any(|f| name.contains(f))
}

/// Structured projector check. `None` when the header, KV section or tensor
/// directory could not be walked to the end and nothing was found so far.
pub fn scan_vision_projector(buf: &[u8]) -> Option<bool> {
    let reader = GgufReader::new(buf)?;
    let mut kvs = reader.kvs();
    for entry in kvs.by_ref() {
        if key_is_projector(&entry.key) || value_mentions_projector(&entry.value) {
            return Some(true);
        }
    }

    let mut tensors = kvs.into_tensors()?;
    if tensors.by_ref().any(|t| tensor_is_projector(&t.name)) {
        return Some(true);
    }
    if tensors.failed() {
        return None;
    }
    Some(false)
}

/// Authoritative check for an embedded vision projector. Falls back to a raw
/// prefix scan only when the structured walk of a GGUF file could not complete.
pub fn has_vision_projector(buf: &[u8]) -> bool {
    scan_vision_projector(buf)
        .unwrap_or_else(|| is_gguf(buf) && PROJECTOR_SCAN.is_match(scan_prefix(buf)))
}
