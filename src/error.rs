//! Error taxonomy for the upload pipeline.
//!
//! Every fatal kind short-circuits the upload: the quarantine token is
//! rejected, its bytes are deleted, and no partial media record is committed.
//! Callers receive the kind plus a correlation id — never a raw path or
//! filename.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    // ── Validation ───────────────────────────────────────────────────────────
    #[error("unknown upload profile")]
    ProfileNotFound,
    #[error("invalid owner id")]
    InvalidOwnerId,
    #[error("profile requires an owner id")]
    OwnerRequired,
    #[error("file exceeds the profile size limit")]
    Oversize,
    #[error("detected MIME type is not allowed")]
    MimeNotAllowed,
    #[error("file extension is not allowed")]
    ExtensionNotAllowed,
    #[error("file signature does not match any allowed format")]
    SignatureMismatch,
    #[error("polyglot file detected")]
    PolyglotDetected,
    #[error("suspicious payload detected")]
    SuspiciousPayload,
    #[error("image dimensions out of bounds")]
    DimensionsOutOfBounds,
    #[error("suspicious pixel ratio")]
    SuspiciousRatio,
    #[error("too many upload attempts")]
    RateLimited,

    // ── Security ─────────────────────────────────────────────────────────────
    #[error("virus detected by {scanner}")]
    VirusDetected {
        scanner: String,
        signatures: Vec<String>,
    },
    #[error("scanner {scanner} failed")]
    ScanFailed { scanner: String },
    #[error("YARA rule set failed integrity verification")]
    YaraRulesIntegrity,

    // ── Pipeline ─────────────────────────────────────────────────────────────
    #[error("image normalization failed")]
    NormalizationFailed,
    #[error("quarantined bytes failed integrity verification")]
    QuarantineIntegrity,
    #[error("upload exceeded the soft timeout")]
    UploadTimeout,
    #[error("storage write failed")]
    StorageWriteFailed,
    #[error("failed to persist media metadata")]
    AttachFailed,

    // ── Infrastructure carriers ──────────────────────────────────────────────
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Stable snake_case reason code used in the security log and in
    /// structured tracing fields.
    pub fn reason(&self) -> &'static str {
        match self {
            UploadError::ProfileNotFound => "profile_not_found",
            UploadError::InvalidOwnerId => "invalid_owner_id",
            UploadError::OwnerRequired => "owner_required",
            UploadError::Oversize => "oversize",
            UploadError::MimeNotAllowed => "mime_not_allowed",
            UploadError::ExtensionNotAllowed => "extension_not_allowed",
            UploadError::SignatureMismatch => "signature_mismatch",
            UploadError::PolyglotDetected => "polyglot_detected",
            UploadError::SuspiciousPayload => "suspicious_payload",
            UploadError::DimensionsOutOfBounds => "dimensions_out_of_bounds",
            UploadError::SuspiciousRatio => "suspicious_ratio",
            UploadError::RateLimited => "rate_limited",
            UploadError::VirusDetected { .. } => "virus_detected",
            UploadError::ScanFailed { .. } => "scan_failed",
            UploadError::YaraRulesIntegrity => "yara_rules_integrity",
            UploadError::NormalizationFailed => "normalization_failed",
            UploadError::QuarantineIntegrity => "quarantine_integrity",
            UploadError::UploadTimeout => "upload_timeout",
            UploadError::StorageWriteFailed => "storage_write_failed",
            UploadError::AttachFailed => "attach_failed",
            UploadError::Database(_) => "database_error",
            UploadError::Io(_) => "io_error",
        }
    }

    /// True for rejections the security log should record: admission and
    /// scanning failures, as opposed to infrastructure faults.
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            UploadError::Oversize
                | UploadError::MimeNotAllowed
                | UploadError::ExtensionNotAllowed
                | UploadError::SignatureMismatch
                | UploadError::PolyglotDetected
                | UploadError::SuspiciousPayload
                | UploadError::DimensionsOutOfBounds
                | UploadError::SuspiciousRatio
                | UploadError::VirusDetected { .. }
                | UploadError::ScanFailed { .. }
                | UploadError::YaraRulesIntegrity
                | UploadError::QuarantineIntegrity
        )
    }
}

/// Terminal failure of one upload flow: the error kind plus the correlation
/// id the caller can hand to support. This is the only error shape the
/// public `upload`/`replace` entry points return.
#[derive(Debug)]
pub struct UploadFailure {
    pub error: UploadError,
    pub correlation_id: Uuid,
}

impl std::fmt::Display for UploadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (correlation {})", self.error, self.correlation_id)
    }
}

impl std::error::Error for UploadFailure {}

pub type PipelineResult<T> = Result<T, UploadError>;
