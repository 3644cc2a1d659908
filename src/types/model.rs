//! Model types
//!
//! Summary of a model file as handed to collaborators (pickers, settings
//! screens), including tri-state capability flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::gguf::{self, ArchitectureInfo};

/// Whether a capability was detected. `Unknown` means the file could not be
/// read well enough to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Present,
    Absent,
    Unknown,
}

impl Capability {
    pub fn is_present(self) -> bool {
        self == Capability::Present
    }
}

impl From<bool> for Capability {
    fn from(found: bool) -> Self {
        if found {
            Capability::Present
        } else {
            Capability::Absent
        }
    }
}

/// Capability flags derived from a model file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Tool-call markers in vocab or chat template
    pub tool_calling: Capability,
    /// Weak keyword signal for vision support
    pub vision_hint: Capability,
    /// An embedded vision projector was found
    pub vision_projector: Capability,
}

impl ModelCapabilities {
    pub fn detect(buf: &[u8]) -> Self {
        if gguf::GgufReader::new(buf).is_none() {
            return Self {
                tool_calling: Capability::Unknown,
                vision_hint: Capability::Unknown,
                vision_projector: Capability::Unknown,
            };
        }
        let vision_projector = match gguf::scan_vision_projector(buf) {
            Some(found) => Capability::from(found),
            // Structured walk failed; a raw hit is still trustworthy, a miss is not.
            None if gguf::has_vision_projector(buf) => Capability::Present,
            None => Capability::Unknown,
        };
        Self {
            tool_calling: Capability::from(gguf::supports_tool_calls(buf)),
            vision_hint: Capability::from(gguf::likely_vision(buf)),
            vision_projector,
        }
    }
}

/// Information about a model file on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Path to the GGUF file
    pub path: PathBuf,
    /// File size in bytes
    pub file_size: u64,
    pub architecture: Option<ArchitectureInfo>,
    /// Number of transformer blocks
    pub layer_count: Option<u32>,
    /// Trained context length
    pub context_length: Option<u32>,
    pub chat_template: Option<String>,
    pub capabilities: ModelCapabilities,
}

impl ModelSummary {
    pub fn from_bytes(path: &Path, buf: &[u8]) -> Self {
        Self {
            path: path.to_path_buf(),
            file_size: buf.len() as u64,
            architecture: gguf::architecture_info(buf),
            layer_count: gguf::layer_count(buf),
            context_length: gguf::context_length(buf),
            chat_template: gguf::chat_template(buf),
            capabilities: ModelCapabilities::detect(buf),
        }
    }

    /// Display name, falling back to the file stem.
    pub fn display_name(&self) -> String {
        self.architecture
            .as_ref()
            .and_then(|a| a.name.clone())
            .or_else(|| {
                self.path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::testing::GgufBuilder;

    #[test]
    fn test_unreadable_header_is_unknown() {
        let caps = ModelCapabilities::detect(b"garbage bytes");
        assert_eq!(caps.tool_calling, Capability::Unknown);
        assert_eq!(caps.vision_hint, Capability::Unknown);
        assert_eq!(caps.vision_projector, Capability::Unknown);
    }

    #[test]
    fn test_truncated_directory_is_unknown_projector() {
        let buf = GgufBuilder::new()
            .string("general.architecture", "llama")
            .tensor("blk.0.attn_q.weight", &[64, 64])
            .build();
        let caps = ModelCapabilities::detect(&buf[..buf.len() - 8]);
        assert_eq!(caps.vision_projector, Capability::Unknown);
        assert_eq!(caps.tool_calling, Capability::Absent);
    }

    #[test]
    fn test_summary_from_bytes() {
        let buf = GgufBuilder::new()
            .string("general.architecture", "gemma3")
            .string("general.name", "Gemma 3 4B")
            .u32("gemma3.block_count", 34)
            .string("clip.projector_type", "gemma3")
            .build();
        let summary = ModelSummary::from_bytes(Path::new("/models/gemma-3-4b.gguf"), &buf);
        assert_eq!(summary.display_name(), "Gemma 3 4B");
        assert_eq!(summary.layer_count, Some(34));
        assert!(summary.capabilities.vision_projector.is_present());
    }

    #[test]
    fn test_display_name_falls_back_to_stem() {
        let buf = GgufBuilder::new().string("general.architecture", "llama").build();
        let summary = ModelSummary::from_bytes(Path::new("/models/tiny-q4.gguf"), &buf);
        assert_eq!(summary.display_name(), "tiny-q4");
    }

    #[test]
    fn test_summary_serialization() {
        let buf = GgufBuilder::new().string("general.architecture", "llama").build();
        let summary = ModelSummary::from_bytes(Path::new("m.gguf"), &buf);
        let json = serde_json::to_string(&summary).expect("Failed to serialize");
        assert!(json.contains("\"tool_calling\":\"absent\""));
        let back: ModelSummary = serde_json::from_str(&json).expect("Failed to deserialize");
        assert_eq!(back.capabilities, summary.capabilities);
    }
}
