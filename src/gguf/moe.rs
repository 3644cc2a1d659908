//! Mixture-of-Experts introspection
//!
//! A fast indexed scan resolves architecture-namespaced keys exactly. When the
//! file has no architecture key or cannot be walked cleanly, a fallback scan
//! re-walks the KV section with looser key matching.

use std::collections::HashMap;
use std::path::Path;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::inspect::map_file;
use super::metadata::ARCHITECTURE_KEY;
use super::reader::{GgufReader, TensorWalker, Value};

/// Router weights exist once per MoE block.
const GATE_TENSOR_SUFFIX: &str = "ffn_gate_inp.weight";

const EXPERT_USED_FRAGMENTS: &[&str] = &["expert_used_count", "active_experts", "experts_per_tok"];
const EXPERT_COUNT_FRAGMENTS: &[&str] = &["expert_count", "num_experts"];
const VOCAB_TOKENS_KEY: &str = "tokenizer.ggml.tokens";

static BLOCK_INDEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:blk|block)\.(\d+)\.").expect("block index pattern is valid")
});

/// Expert-routing characteristics of a model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoeInfo {
    pub is_moe: bool,
    /// Experts per MoE layer; 0 when unknown
    pub expert_count: u32,
    /// Experts routed per token by default
    pub default_used: Option<u32>,
    /// Number of blocks carrying a router
    pub moe_layer_count: Option<u32>,
    pub total_layer_count: Option<u32>,
    pub hidden_size: Option<u32>,
    pub feed_forward_size: Option<u32>,
    pub vocab_size: Option<u32>,
}

#[derive(Debug, Default)]
struct KvSignals {
    expert_count: Option<u32>,
    expert_used: Option<u32>,
    block_count: Option<u32>,
    hidden_size: Option<u32>,
    feed_forward_size: Option<u32>,
    vocab_size: Option<u32>,
}

#[derive(Debug, Default)]
struct TensorSignals {
    max_block: Option<u32>,
    gate_count: u32,
    gate_experts: Option<u32>,
}

impl TensorSignals {
    /// `None` if the directory is truncated or malformed.
    fn collect(mut tensors: TensorWalker<'_>) -> Option<Self> {
        let mut signals = Self::default();
        for tensor in tensors.by_ref() {
            if let Some(index) = block_index(&tensor.name) {
                signals.max_block = Some(signals.max_block.map_or(index, |m| m.max(index)));
            }
            if tensor.name.ends_with(GATE_TENSOR_SUFFIX) {
                signals.gate_count += 1;
                // Router weight is [n_embd, n_expert].
                let experts = tensor.dims.get(1).and_then(|d| u32::try_from(*d).ok());
                signals.gate_experts = max_opt(signals.gate_experts, experts);
            }
        }
        tensors.completed().then_some(signals)
    }
}

fn block_index(name: &str) -> Option<u32> {
    BLOCK_INDEX
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn max_opt(current: Option<u32>, candidate: Option<u32>) -> Option<u32> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn assemble(kv: KvSignals, tensors: TensorSignals) -> MoeInfo {
    let expert_count = kv.expert_count.or(tensors.gate_experts);
    let is_moe = match expert_count {
        Some(n) => n > 1,
        None => tensors.gate_count > 0,
    };
    MoeInfo {
        is_moe,
        expert_count: expert_count.unwrap_or(0),
        default_used: kv.expert_used,
        moe_layer_count: (tensors.gate_count > 0).then_some(tensors.gate_count),
        total_layer_count: kv
            .block_count
            .or_else(|| tensors.max_block.and_then(|m| m.checked_add(1))),
        hidden_size: kv.hidden_size,
        feed_forward_size: kv.feed_forward_size,
        vocab_size: kv.vocab_size,
    }
}

#[derive(Debug)]
enum ScanStatus {
    Complete(MoeInfo),
    MissingArchitecture,
    Malformed,
}

/// One pass over the header into an index, then exact namespaced lookups.
fn indexed_scan(buf: &[u8]) -> ScanStatus {
    let Some(reader) = GgufReader::new(buf) else {
        return ScanStatus::Malformed;
    };

    let mut index: HashMap<String, Value<'_>> = HashMap::new();
    let mut kvs = reader.kvs();
    for entry in kvs.by_ref() {
        index.insert(entry.key.into_owned(), entry.value);
    }
    let Some(tensors) = kvs.into_tensors().and_then(TensorSignals::collect) else {
        return ScanStatus::Malformed;
    };
    let Some(arch) = index.get(ARCHITECTURE_KEY).and_then(|v| v.as_str()) else {
        return ScanStatus::MissingArchitecture;
    };

    let lookup = |suffix: &str| index.get(&format!("{arch}.{suffix}")).and_then(|v| v.max_u32());
    let kv = KvSignals {
        expert_count: lookup("expert_count"),
        expert_used: lookup("expert_used_count"),
        block_count: lookup("block_count"),
        hidden_size: lookup("embedding_length"),
        feed_forward_size: lookup("feed_forward_length"),
        vocab_size: lookup("vocab_size").or_else(|| {
            index
                .get(VOCAB_TOKENS_KEY)
                .and_then(|v| v.as_array())
                .and_then(|a| u32::try_from(a.len()).ok())
        }),
    };
    ScanStatus::Complete(assemble(kv, tensors))
}

fn key_ends_with(key: &str, suffix: &str) -> bool {
    key == suffix || key.strip_suffix(suffix).is_some_and(|rest| rest.ends_with('.'))
}

/// Loose walk used when the indexed scan cannot complete.
fn fallback_scan(buf: &[u8]) -> Option<MoeInfo> {
    let reader = GgufReader::new(buf)?;
    let mut kv = KvSignals::default();
    let mut token_count = None;

    let mut kvs = reader.kvs();
    for entry in kvs.by_ref() {
        let key = entry.key.as_ref();
        if EXPERT_USED_FRAGMENTS.iter().any(|f| key.contains(f)) {
            kv.expert_used = max_opt(kv.expert_used, entry.value.max_u32());
        } else if EXPERT_COUNT_FRAGMENTS.iter().any(|f| key.contains(f)) {
            kv.expert_count = max_opt(kv.expert_count, entry.value.max_u32());
        } else if key_ends_with(key, "block_count") {
            kv.block_count = kv.block_count.or(entry.value.as_u32());
        } else if key_ends_with(key, "embedding_length") {
            kv.hidden_size = kv.hidden_size.or(entry.value.as_u32());
        } else if key_ends_with(key, "feed_forward_length") {
            kv.feed_forward_size = kv.feed_forward_size.or(entry.value.max_u32());
        } else if key_ends_with(key, "vocab_size") {
            kv.vocab_size = kv.vocab_size.or(entry.value.as_u32());
        } else if key == VOCAB_TOKENS_KEY {
            token_count = entry
                .value
                .as_array()
                .and_then(|a| u32::try_from(a.len()).ok());
        }
    }
    kv.vocab_size = kv.vocab_size.or(token_count);

    if kvs.failed() {
        tracing::debug!(offset = kvs.offset(), "MoE fallback scan hit a truncated KV section");
    }
    let tensors = kvs
        .into_tensors()
        .and_then(TensorSignals::collect)
        .unwrap_or_default();
    Some(assemble(kv, tensors))
}

/// MoE characteristics of an in-memory GGUF buffer.
pub fn moe_info_from_bytes(buf: &[u8]) -> Option<MoeInfo> {
    match indexed_scan(buf) {
        ScanStatus::Complete(info) => Some(info),
        status => {
            tracing::debug!(?status, "indexed MoE scan incomplete, falling back to header walk");
            fallback_scan(buf)
        }
    }
}

/// MoE characteristics of a model file. The whole file is memory-mapped so
/// the tensor directory can be walked to the end.
pub fn moe_info(path: &Path) -> Option<MoeInfo> {
    let map = match map_file(path) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!("Failed to map {} for MoE scan: {}", path.display(), e);
            return None;
        }
    };
    moe_info_from_bytes(&map)
}

/// Results keyed by (model id, quantization label)
#[derive(Debug, Default)]
pub struct MoeInfoCache {
    entries: DashMap<(String, String), MoeInfo>,
}

impl MoeInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model_id: &str, quant_label: &str) -> Option<MoeInfo> {
        self.entries
            .get(&(model_id.to_string(), quant_label.to_string()))
            .map(|e| e.value().clone())
    }

    /// Cached info, or scan `path` and remember a successful result.
    pub fn get_or_scan(&self, model_id: &str, quant_label: &str, path: &Path) -> Option<MoeInfo> {
        if let Some(hit) = self.get(model_id, quant_label) {
            return Some(hit);
        }
        let info = moe_info(path)?;
        self.entries
            .insert((model_id.to_string(), quant_label.to_string()), info.clone());
        Some(info)
    }

    pub fn invalidate(&self, model_id: &str, quant_label: &str) {
        self.entries
            .remove(&(model_id.to_string(), quant_label.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
