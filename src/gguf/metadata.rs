//! Metadata queries
//!
//! Each query re-walks the KV section from offset 0 and returns the first
//! match it can fully read. Values found before a truncation point are still
//! returned, so a bounded file prefix is usually enough.

use serde::{Deserialize, Serialize};

use super::reader::{GgufReader, KvEntry, Value};

pub const ARCHITECTURE_KEY: &str = "general.architecture";
pub const ARCHITECTURE_LIST_KEY: &str = "general.architectures";
pub const NAME_KEY: &str = "general.name";

/// Last dotted segments that mean "number of transformer blocks".
const LAYER_COUNT_ALIASES: &[&str] = &[
    "block_count",
    "n_layer",
    "n_layers",
    "num_hidden_layers",
    "layer_count",
];

/// Architecture family and optional display name of a model file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureInfo {
    /// Architecture identifier, e.g. "llama" or "qwen2"
    pub architecture: String,
    /// Human readable model name from `general.name`
    pub name: Option<String>,
}

/// Ranks architecture candidates: longer, path-like, hyphenated and versioned
/// identifiers are more specific.
pub fn specificity(candidate: &str) -> usize {
    let slashes = candidate.matches('/').count();
    let hyphens = candidate.matches('-').count();
    let digit_bonus = if candidate.chars().any(|c| c.is_ascii_digit()) {
        5
    } else {
        0
    };
    candidate.len() + slashes * 10 + hyphens * 3 + digit_bonus
}

fn most_specific(candidates: &[String]) -> Option<String> {
    let mut best: Option<&String> = None;
    for candidate in candidates.iter().filter(|c| !c.trim().is_empty()) {
        if best.map_or(true, |b| specificity(candidate) > specificity(b)) {
            best = Some(candidate);
        }
    }
    best.cloned()
}

fn collect_strings(value: &Value<'_>, into: &mut Vec<String>) {
    match value {
        Value::Array(array) => into.extend(array.strings().map(|s| s.into_owned())),
        other => into.extend(other.as_str().map(|s| s.into_owned())),
    }
}

/// Architecture from `general.architecture`, else the most specific entry of
/// `general.architectures`.
pub fn architecture_info(buf: &[u8]) -> Option<ArchitectureInfo> {
    let reader = GgufReader::new(buf)?;
    let mut singular: Option<String> = None;
    let mut candidates = Vec::new();
    let mut name: Option<String> = None;

    for entry in reader.kvs() {
        match entry.key.as_ref() {
            ARCHITECTURE_KEY => match entry.value {
                Value::Str(_) => singular = entry.value.as_str().map(|s| s.into_owned()),
                ref other => collect_strings(other, &mut candidates),
            },
            ARCHITECTURE_LIST_KEY => collect_strings(&entry.value, &mut candidates),
            NAME_KEY => name = entry.value.as_str().map(|s| s.into_owned()),
            _ => {}
        }
    }

    let architecture = singular
        .filter(|s| !s.trim().is_empty())
        .or_else(|| most_specific(&candidates))?;

    Some(ArchitectureInfo {
        architecture,
        name: name.filter(|n| !n.trim().is_empty()),
    })
}

fn key_matches_alias(key: &str, alias: &str) -> bool {
    key == alias || key.rsplit('.').next() == Some(alias)
}

fn find_first<'a, T>(buf: &'a [u8], f: impl FnMut(KvEntry<'a>) -> Option<T>) -> Option<T> {
    GgufReader::new(buf)?.kvs().find_map(f)
}

/// Number of transformer blocks
pub fn layer_count(buf: &[u8]) -> Option<u32> {
    find_first(buf, |entry| {
        if !LAYER_COUNT_ALIASES
            .iter()
            .any(|alias| key_matches_alias(&entry.key, alias))
        {
            return None;
        }
        entry.value.as_u32().filter(|n| *n > 0)
    })
}

/// Trained context length
pub fn context_length(buf: &[u8]) -> Option<u32> {
    find_first(buf, |entry| {
        if !entry.key.contains("context_length") {
            return None;
        }
        entry.value.as_u32().filter(|n| *n > 0)
    })
}

/// Embedded chat template text
pub fn chat_template(buf: &[u8]) -> Option<String> {
    find_first(buf, |entry| {
        if !entry.key.contains("chat_template") {
            return None;
        }
        entry.value.as_str().map(|s| s.into_owned())
    })
}
