//! Environment overrides for the runtime
//!
//! Read once per runner. Unknown values are logged and ignored.

use serde::{Deserialize, Serialize};

use super::kv_cache::KvCacheType;

pub const ENV_FLASH_ATTN: &str = "NOEMA_FLASH_ATTN";
pub const ENV_KV_TYPE_K: &str = "NOEMA_KV_TYPE_K";
pub const ENV_KV_TYPE_V: &str = "NOEMA_KV_TYPE_V";
pub const ENV_USE_MMAP: &str = "NOEMA_USE_MMAP";
pub const ENV_VERBOSE: &str = "NOEMA_VERBOSE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashAttention {
    #[default]
    Auto,
    Enabled,
    Disabled,
}

impl FlashAttention {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(FlashAttention::Auto),
            "on" | "1" | "true" | "enabled" => Some(FlashAttention::Enabled),
            "off" | "0" | "false" | "disabled" => Some(FlashAttention::Disabled),
            _ => None,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOverrides {
    pub flash_attention: FlashAttention,
    pub kv_type_k: Option<KvCacheType>,
    pub kv_type_v: Option<KvCacheType>,
    pub use_mmap: bool,
    /// Forward native engine logs
    pub verbose: bool,
}

impl Default for RuntimeOverrides {
    fn default() -> Self {
        Self {
            flash_attention: FlashAttention::Auto,
            kv_type_k: None,
            kv_type_v: None,
            use_mmap: true,
            verbose: false,
        }
    }
}

impl RuntimeOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut overrides = Self::default();

        if let Some(raw) = lookup(ENV_FLASH_ATTN) {
            match FlashAttention::parse(&raw) {
                Some(mode) => overrides.flash_attention = mode,
                None => tracing::warn!("Ignoring {}={:?}", ENV_FLASH_ATTN, raw),
            }
        }

        let kv_type = |key: &str| {
            let raw = lookup(key)?;
            let parsed = KvCacheType::parse(&raw);
            if parsed.is_none() {
                tracing::warn!("Ignoring {}={:?}", key, raw);
            }
            parsed
        };
        overrides.kv_type_k = kv_type(ENV_KV_TYPE_K);
        overrides.kv_type_v = kv_type(ENV_KV_TYPE_V);

        let flag = |key: &str, default: bool| match lookup(key) {
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                tracing::warn!("Ignoring {}={:?}", key, raw);
                default
            }),
            None => default,
        };
        overrides.use_mmap = flag(ENV_USE_MMAP, true);
        overrides.verbose = flag(ENV_VERBOSE, false);

        overrides
    }
}
