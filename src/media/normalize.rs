//! Image normalization: re-encode accepted images into a canonical format,
//! dropping everything that is not pixels.
//!
//! Decoding to RGBA and re-encoding from the raw buffer strips EXIF, XMP,
//! and embedded ICC profiles in one move — the encoders only ever see pixel
//! data, so nothing else can survive into the stored artifact. Output format
//! is PNG (lossless) for small images and WebP at quality 80 for larger
//! ones.
//!
//! The `webp` crate's encoder only accepts `ImageRgb8` and `ImageRgba8`, so
//! we unconditionally convert to RGBA before encoding. This is cheap
//! relative to the disk write and avoids "Unimplemented" errors from
//! uncommon colour-space images (e.g. greyscale PNGs).

use std::path::{Path, PathBuf};

use image::DynamicImage;
use uuid::Uuid;

use crate::error::UploadError;
use crate::profiles::FileConstraints;

/// Images at or below this edge length stay lossless.
const LOSSLESS_MAX_EDGE: u32 = 256;

const WEBP_QUALITY: f32 = 80.0;

/// Outcome of a normalization pass: where the canonical bytes landed and
/// what they are.
#[derive(Debug)]
pub struct NormalizedImage {
    pub path: PathBuf,
    pub mime: String,
    pub extension: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

/// Re-encodes the image at `input` into `work_dir`, bounded by the profile
/// constraints. Blocking — callers run it under `spawn_blocking`.
pub fn normalize(
    input: &Path,
    constraints: &FileConstraints,
    work_dir: &Path,
) -> Result<NormalizedImage, UploadError> {
    let img = image::open(input).map_err(|_| UploadError::NormalizationFailed)?;

    // The validator already bounded dimensions from the header; clamp again
    // on the decoded size so the encoder never sees more pixels than the
    // profile permits.
    let max_w = constraints.max_width.unwrap_or(u32::MAX);
    let max_h = constraints.max_height.unwrap_or(u32::MAX);
    let img = if img.width() > max_w || img.height() > max_h {
        img.resize(max_w, max_h, image::imageops::FilterType::Lanczos3)
    } else {
        img
    };

    // RGBA round-trip: pixels only, metadata gone.
    let rgba = img.to_rgba8();
    let (width, height) = (rgba.width(), rgba.height());
    let canonical = DynamicImage::ImageRgba8(rgba);

    let (bytes, mime, extension) = if width <= LOSSLESS_MAX_EDGE && height <= LOSSLESS_MAX_EDGE {
        let mut out = std::io::Cursor::new(Vec::new());
        canonical
            .write_to(&mut out, image::ImageFormat::Png)
            .map_err(|_| UploadError::NormalizationFailed)?;
        (out.into_inner(), "image/png", "png")
    } else {
        let rgba = canonical.to_rgba8();
        let encoder = webp::Encoder::from_rgba(rgba.as_raw(), width, height);
        let data = encoder.encode(WEBP_QUALITY);
        (data.to_vec(), "image/webp", "webp")
    };

    let path = work_dir.join(format!("{}.{extension}", Uuid::new_v4()));
    std::fs::write(&path, &bytes)?;

    Ok(NormalizedImage {
        path,
        mime: mime.to_string(),
        extension: extension.to_string(),
        width,
        height,
        size_bytes: bytes.len() as u64,
    })
}
