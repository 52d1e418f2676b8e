//! Derived conversion rendering: scale the canonical image into one named
//! variant and encode it as WebP.
//!
//! A crop spec means the variant must fill its box exactly — the image is
//! scaled so the box is covered and the overflow around the centre is
//! discarded (`resize_to_fill`). Without crop the variant fits inside the
//! box with its aspect ratio preserved, so the output may be smaller than
//! the spec on one axis.

use image::imageops::FilterType;

use crate::error::UploadError;
use crate::profiles::ConversionSpec;

const WEBP_QUALITY: f32 = 80.0;

/// Renders one conversion from the canonical bytes. Blocking — callers run
/// it under `spawn_blocking`.
pub fn render(canonical: &[u8], spec: &ConversionSpec) -> Result<Vec<u8>, UploadError> {
    let img =
        image::load_from_memory(canonical).map_err(|_| UploadError::NormalizationFailed)?;

    let scaled = if spec.crop {
        img.resize_to_fill(spec.width, spec.height, FilterType::Lanczos3)
    } else {
        img.resize(spec.width, spec.height, FilterType::Lanczos3)
    };

    let rgba = scaled.to_rgba8();
    let encoder = webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height());
    Ok(encoder.encode(WEBP_QUALITY).to_vec())
}
