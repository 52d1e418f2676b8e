//! File admission control: size, real MIME, extension, magic signature,
//! polyglot guard, suspicious-payload scan, and image dimension checks — in
//! that order, always against the bytes already on disk in quarantine, never
//! against anything the client claimed.

use std::path::Path;

use regex::Regex;

use crate::error::{PipelineResult, UploadError};
use crate::profiles::FileConstraints;

/// How many leading bytes the signature and polyglot checks inspect.
const HEADER_LEN: usize = 512;
/// How much of the file the suspicious-payload regexes see.
const PAYLOAD_SCAN_LEN: usize = 64 * 1024;

/// What validation established about the file. Downstream stages use the
/// sniffed MIME and extension, not the caller-supplied ones.
#[derive(Debug, Clone)]
pub struct Validated {
    pub real_mime: String,
    pub extension: String,
    pub size_bytes: u64,
    pub dimensions: Option<(u32, u32)>,
}

/// Validates the quarantined file at `path` against `constraints`.
///
/// `original_filename` contributes only the extension; `patterns` is the
/// pre-compiled suspicious-payload set (invalid patterns were dropped at
/// startup). `check_dimensions` is set for image-kind profiles.
pub async fn validate(
    path: &Path,
    original_filename: &str,
    constraints: &FileConstraints,
    patterns: &[Regex],
    check_dimensions: bool,
) -> PipelineResult<Validated> {
    // 1. Size.
    let size_bytes = tokio::fs::metadata(path).await?.len();
    if size_bytes > constraints.max_size_bytes {
        return Err(UploadError::Oversize);
    }

    let head = read_prefix(path, PAYLOAD_SCAN_LEN).await?;

    // 2. Real MIME, sniffed from bytes.
    let extension = extension_of(original_filename);
    let real_mime = sniff_mime(&head, &extension);
    if !constraints
        .allowed_mime_types
        .iter()
        .any(|m| m == &real_mime)
    {
        return Err(UploadError::MimeNotAllowed);
    }

    // 3. Extension allowlist (normalized lowercase).
    if !constraints
        .allowed_extensions
        .iter()
        .any(|e| e == &extension)
    {
        return Err(UploadError::ExtensionNotAllowed);
    }

    // 4. Magic signature: at least one allowlisted hex prefix must match the
    //    first 512 bytes. A mismatch is fatal only under strict enforcement;
    //    otherwise it is logged and admission continues on the MIME verdict.
    let header_hex = hex::encode(&head[..head.len().min(HEADER_LEN)]);
    if !constraints.allowed_signatures.is_empty() {
        let matched = constraints
            .allowed_signatures
            .iter()
            .any(|sig| header_hex.starts_with(&sig.hex.to_lowercase()));
        if !matched {
            if constraints.enforce_strict_magic_bytes {
                return Err(UploadError::SignatureMismatch);
            }
            tracing::warn!(mime = %real_mime, "magic signature mismatch (non-strict profile)");
        }
    }

    // 5. Polyglot guard: a PHP open tag alongside a PDF or ZIP marker in the
    //    header is a smuggling attempt, whatever the MIME verdict said.
    if constraints.prevent_polyglot_files {
        let header = &head[..head.len().min(HEADER_LEN)];
        let has_code = find(header, b"<?");
        let has_container = find(header, b"%PDF") || find(header, b"PK\x03\x04");
        if has_code && has_container {
            return Err(UploadError::PolyglotDetected);
        }
    }

    // 6. Suspicious-payload regexes over the first 64 KiB.
    if !patterns.is_empty() {
        let text = String::from_utf8_lossy(&head);
        if patterns.iter().any(|re| re.is_match(&text)) {
            return Err(UploadError::SuspiciousPayload);
        }
    }

    // 7. Image-only dimension checks.
    let dimensions = if check_dimensions {
        Some(check_image_dimensions(path, constraints).await?)
    } else {
        None
    };

    Ok(Validated {
        real_mime,
        extension,
        size_bytes,
        dimensions,
    })
}

/// Lowercased extension of the original filename, empty when absent.
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Sniffs the real MIME type from leading bytes via `infer`, with a
/// plain-text fallback: `infer` has no matcher for text formats, so a
/// UTF-8 header with no binary signature maps to text/csv or text/plain
/// depending on the extension.
fn sniff_mime(head: &[u8], extension: &str) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    let probe = &head[..head.len().min(HEADER_LEN)];
    if std::str::from_utf8(probe).is_ok() {
        return match extension {
            "csv" => "text/csv".to_string(),
            _ => "text/plain".to_string(),
        };
    }
    "application/octet-stream".to_string()
}

/// Decodes only the image header for dimensions — never a full decode of a
/// file that has not passed the ratio check yet.
async fn check_image_dimensions(
    path: &Path,
    constraints: &FileConstraints,
) -> PipelineResult<(u32, u32)> {
    let path = path.to_path_buf();
    let (w, h) = tokio::task::spawn_blocking(move || {
        image::ImageReader::open(&path)
            .map_err(|_| UploadError::DimensionsOutOfBounds)?
            .with_guessed_format()
            .map_err(|_| UploadError::DimensionsOutOfBounds)?
            .into_dimensions()
            .map_err(|_| UploadError::DimensionsOutOfBounds)
    })
    .await
    .map_err(|_| UploadError::DimensionsOutOfBounds)??;

    let min_w = constraints.min_width.unwrap_or(1);
    let min_h = constraints.min_height.unwrap_or(1);
    let max_w = constraints.max_width.unwrap_or(u32::MAX);
    let max_h = constraints.max_height.unwrap_or(u32::MAX);
    if w < min_w || h < min_h || w > max_w || h > max_h {
        return Err(UploadError::DimensionsOutOfBounds);
    }

    if let Some(max_ratio) = constraints.max_pixel_ratio {
        let ratio = (w as f64 * h as f64) / (w.max(h) as f64);
        if ratio > max_ratio {
            return Err(UploadError::SuspiciousRatio);
        }
    }

    Ok((w, h))
}

async fn read_prefix(path: &Path, limit: usize) -> PipelineResult<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn find(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
