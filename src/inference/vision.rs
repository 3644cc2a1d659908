//! Vision priming
//!
//! Images are decoded and evaluated into the context ahead of the prompt.
//! Each image occupies a run of positions; the prompt starts after the last.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::engine::{ContextHandle, EngineError};

/// Outcome of `probe_vision`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionProbe {
    Ok,
    NoProjector,
    Unavailable,
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Model has no compatible vision projector")]
    NoProjector,

    #[error("Vision is not available in this build")]
    Unavailable,

    #[error("Image processing failed: {0}")]
    Failed(String),
}

impl From<EngineError> for VisionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoProjector => VisionError::NoProjector,
            EngineError::VisionUnsupported => VisionError::Unavailable,
            other => VisionError::Failed(other.to_string()),
        }
    }
}

/// Decoded RGBA pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBitmap {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl ImageBitmap {
    /// `None` unless `rgba` holds exactly `width * height * 4` bytes.
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(4)?;
        if width == 0 || height == 0 || rgba.len() != expected {
            return None;
        }
        Some(Self { width, height, rgba })
    }

    /// Single opaque black pixel
    pub fn probe_pixel() -> Self {
        Self {
            width: 1,
            height: 1,
            rgba: vec![0, 0, 0, 255],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }
}

/// Evaluate every image starting at `n_past`. Returns the total number of
/// positions consumed.
pub fn prime_images<C: ContextHandle + ?Sized>(
    ctx: &mut C,
    images: &[PathBuf],
    n_past: i32,
) -> Result<u32, VisionError> {
    let mut consumed: u32 = 0;
    for path in images {
        let bitmap = ctx.decode_image_file(path)?;
        let offset = n_past.saturating_add(i32::try_from(consumed).unwrap_or(i32::MAX));
        let positions = ctx.encode_image(&bitmap, offset)?;
        tracing::debug!(
            "Primed {} ({}x{}) at {} -> {} positions",
            path.display(),
            bitmap.width(),
            bitmap.height(),
            offset,
            positions
        );
        consumed = consumed.saturating_add(positions);
    }
    Ok(consumed)
}

/// Run a one-pixel image through the vision path and report whether it works.
/// Context memory is cleared afterwards whatever the outcome.
pub fn probe<C: ContextHandle + ?Sized>(ctx: &mut C, has_vision_ops: bool) -> VisionProbe {
    if !has_vision_ops {
        return VisionProbe::Unavailable;
    }
    let result = ctx.encode_image(&ImageBitmap::probe_pixel(), 0);
    ctx.clear_memory();
    match result.map_err(VisionError::from) {
        Ok(_) => VisionProbe::Ok,
        Err(VisionError::Unavailable) => VisionProbe::Unavailable,
        Err(VisionError::NoProjector) => VisionProbe::NoProjector,
        Err(VisionError::Failed(reason)) => {
            tracing::debug!("Vision probe failed: {}", reason);
            VisionProbe::NoProjector
        }
    }
}
