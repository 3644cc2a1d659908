//! File access for model inspection

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;

use super::reader::is_gguf;
use crate::types::model::ModelSummary;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file: {0}")]
    NotGguf(PathBuf),
}

/// Memory-map a model file read-only.
pub fn map_file(path: &Path) -> Result<Mmap, GgufError> {
    let file = File::open(path)?;
    // SAFETY: the map is read-only and only ever viewed as bytes; every read
    // through it is bounds-checked by the header walker.
    let map = unsafe { Mmap::map(&file)? };
    Ok(map)
}

/// Read at most `limit` leading bytes of a file.
pub fn read_prefix(path: &Path, limit: usize) -> Result<Vec<u8>, GgufError> {
    let file = File::open(path)?;
    let mut buf = Vec::new();
    file.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Read everything a collaborator needs to present a model file.
pub fn inspect_file(path: &Path) -> Result<ModelSummary, GgufError> {
    let map = map_file(path)?;
    if !is_gguf(&map) {
        return Err(GgufError::NotGguf(path.to_path_buf()));
    }
    let summary = ModelSummary::from_bytes(path, &map);
    tracing::debug!(
        "Inspected {}: arch={:?} layers={:?} ctx={:?}",
        path.display(),
        summary.architecture.as_ref().map(|a| a.architecture.as_str()),
        summary.layer_count,
        summary.context_length
    );
    Ok(summary)
}
