//! KV-cache element types
//!
//! Resolution order for each side: explicit config, then environment
//! overrides, then F16. Engines that cannot set K and V independently get one
//! merged type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::options::RuntimeOverrides;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KvCacheType {
    #[serde(rename = "f32")]
    F32,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "q8_0")]
    Q8_0,
    #[serde(rename = "q5_0")]
    Q5_0,
    #[serde(rename = "q5_1")]
    Q5_1,
    #[serde(rename = "q4_0")]
    Q4_0,
    #[serde(rename = "q4_1")]
    Q4_1,
    #[serde(rename = "iq4_nl")]
    Iq4Nl,
}

/// Used for both sides when nothing else is configured.
pub const DEFAULT_KV_TYPE: KvCacheType = KvCacheType::F16;

/// Merged type when neither side uses anything in `MERGE_PRIORITY`.
pub const DEFAULT_MERGED_QUANT: KvCacheType = KvCacheType::Q4_0;

const MERGE_PRIORITY: [KvCacheType; 6] = [
    KvCacheType::F32,
    KvCacheType::F16,
    KvCacheType::Q8_0,
    KvCacheType::Q5_1,
    KvCacheType::Q5_0,
    KvCacheType::Iq4Nl,
];

impl KvCacheType {
    pub const ALL: [KvCacheType; 8] = [
        KvCacheType::F32,
        KvCacheType::F16,
        KvCacheType::Q8_0,
        KvCacheType::Q5_0,
        KvCacheType::Q5_1,
        KvCacheType::Q4_0,
        KvCacheType::Q4_1,
        KvCacheType::Iq4Nl,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KvCacheType::F32 => "f32",
            KvCacheType::F16 => "f16",
            KvCacheType::Q8_0 => "q8_0",
            KvCacheType::Q5_0 => "q5_0",
            KvCacheType::Q5_1 => "q5_1",
            KvCacheType::Q4_0 => "q4_0",
            KvCacheType::Q4_1 => "q4_1",
            KvCacheType::Iq4Nl => "iq4_nl",
        }
    }

    /// Case-insensitive name lookup
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for KvCacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown KV cache type: {0}")]
pub struct UnknownKvCacheType(pub String);

impl FromStr for KvCacheType {
    type Err = UnknownKvCacheType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownKvCacheType(s.to_string()))
    }
}

/// Caller-chosen KV-cache types. Ignored unless `enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvCacheConfig {
    pub enabled: bool,
    pub type_k: KvCacheType,
    pub type_v: KvCacheType,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            type_k: DEFAULT_KV_TYPE,
            type_v: DEFAULT_KV_TYPE,
        }
    }
}

/// Types the context is actually created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedKvCache {
    pub type_k: KvCacheType,
    pub type_v: KvCacheType,
    /// Requested K and V differed and were coerced to one type
    pub merged_fallback: bool,
}

/// Pick the single type to use for both sides.
pub fn merge_kv_types(type_k: KvCacheType, type_v: KvCacheType) -> KvCacheType {
    MERGE_PRIORITY
        .into_iter()
        .find(|t| *t == type_k || *t == type_v)
        .unwrap_or(DEFAULT_MERGED_QUANT)
}

pub fn resolve_kv_cache(
    config: &KvCacheConfig,
    overrides: &RuntimeOverrides,
    split_supported: bool,
) -> ResolvedKvCache {
    let (type_k, type_v) = if config.enabled {
        (config.type_k, config.type_v)
    } else {
        (
            overrides.kv_type_k.unwrap_or(DEFAULT_KV_TYPE),
            overrides.kv_type_v.unwrap_or(DEFAULT_KV_TYPE),
        )
    };

    if split_supported || type_k == type_v {
        return ResolvedKvCache {
            type_k,
            type_v,
            merged_fallback: false,
        };
    }

    let merged = merge_kv_types(type_k, type_v);
    tracing::warn!(
        "Engine cannot set K/V cache types separately (k={}, v={}), using {} for both",
        type_k,
        type_v,
        merged
    );
    ResolvedKvCache {
        type_k: merged,
        type_v: merged,
        merged_fallback: true,
    }
}
