//! Configuration types
//!
//! Runtime settings as persisted by the host application, and their mapping
//! onto a load request.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::engine::SamplerChain;
use crate::inference::kv_cache::KvCacheConfig;
use crate::inference::runner::{LoadRequest, MIN_CONTEXT_PER_SEQUENCE};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Context window size (0 = trained context)
    pub context_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Worker threads (0 = all cores)
    pub threads: u32,
    /// Parallel sequences sharing the context
    pub parallel_sequences: u32,
    pub kv_cache: KvCacheConfig,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Fixed sampling seed; unset means greedy
    pub seed: Option<u32>,
    /// Maximum number of tokens to generate (0 = unlimited)
    pub max_tokens: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            context_size: 8192,
            gpu_layers: 99, // Offload all layers to GPU by default
            threads: 0,
            parallel_sequences: 1,
            kv_cache: KvCacheConfig::default(),
            temperature: 0.7,
            top_k: 40,
            seed: None,
            max_tokens: 4096,
        }
    }
}

impl RuntimeSettings {
    /// Clamp every value into its accepted range.
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        if self.temperature.is_nan() {
            self.temperature = 0.7;
        }
        if self.top_k == 0 {
            self.top_k = 40;
        }
        self.parallel_sequences = self.parallel_sequences.clamp(1, 64);

        if self.context_size != 0 {
            let floor = MIN_CONTEXT_PER_SEQUENCE * self.parallel_sequences;
            if self.context_size < floor {
                tracing::warn!(
                    "Context size {} too small for {} sequences, raising to {}",
                    self.context_size,
                    self.parallel_sequences,
                    floor
                );
                self.context_size = floor;
            }
        }

        // Can't generate more than the context allows
        if self.context_size != 0 && self.max_tokens > self.context_size {
            self.max_tokens = self.context_size / 2;
        }
    }

    pub fn to_load_request(&self, model_path: impl Into<PathBuf>) -> LoadRequest {
        LoadRequest {
            model_path: model_path.into(),
            projector_path: None,
            n_ctx: self.context_size,
            gpu_layers: self.gpu_layers,
            n_threads: self.threads,
            n_seq_max: Some(self.parallel_sequences),
            kv_cache: self.kv_cache,
        }
    }

    pub fn sampler(&self) -> SamplerChain {
        SamplerChain {
            temperature: self.temperature,
            top_k: i32::try_from(self.top_k).unwrap_or(i32::MAX),
            seed: self.seed,
        }
    }
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings(path: &Path) -> RuntimeSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            RuntimeSettings::default()
        }
    }
}

fn load_settings_internal(path: &Path) -> Result<RuntimeSettings, SettingsError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(RuntimeSettings::default());
    }
    let json = fs::read_to_string(path)?;
    let mut settings: RuntimeSettings = serde_json::from_str(&json)?;
    settings.validate();
    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(path: &Path, settings: &RuntimeSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;
    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
