use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Read models (database rows) ─────────────────────────────────────────────
//
// Each struct maps 1-to-1 to a database table row. `sqlx::FromRow` is derived
// so sqlx can hydrate them directly from query results without manual mapping.
// JSON-typed columns are stored as TEXT and parsed on demand through the
// typed accessors below.

/// One persisted media artifact. `path` is relative to `disk`'s root;
/// `file_name` is the deterministic download name used in the
/// Content-Disposition header, which need not equal the on-disk basename.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediaRecord {
    pub id: String,
    pub model_type: String,
    pub model_id: String,
    pub collection: String,
    pub disk: String,
    pub path: String,
    pub file_name: String,
    pub mime: String,
    pub size_bytes: i64,
    /// `active`, `superseded`, or `deleted`.
    pub status: String,
    pub custom_properties: String,
    pub generated_conversions: String,
    pub responsive_images: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MediaRecord {
    pub fn properties(&self) -> CustomProperties {
        serde_json::from_str(&self.custom_properties).unwrap_or_default()
    }

    pub fn conversions(&self) -> Vec<String> {
        serde_json::from_str(&self.generated_conversions).unwrap_or_default()
    }
}

/// HTTP headers recorded at attach time and replayed when the artifact is
/// served.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaHeaders {
    pub acl: String,
    pub content_type: String,
    pub content_disposition: String,
}

/// The opaque property bag persisted with every media record. Unknown keys
/// written by other services round-trip through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomProperties {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub upload_uuid: String,
    /// Content checksum of the stored bytes.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub quarantine_id: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub original_filename: String,
    #[serde(default)]
    pub headers: MediaHeaders,
    /// Conversion name → `pending` | `completed` | `failed`.
    #[serde(default)]
    pub conversions: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CustomProperties {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    /// Conversion names that have not yet reported completion or failure.
    pub fn pending_conversions(&self) -> Vec<String> {
        self.conversions
            .iter()
            .filter(|(_, status)| status.as_str() == "pending")
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Scheduler state for one deferred cleanup, keyed by the trigger media.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CleanupEntryRow {
    pub trigger_media_id: String,
    pub artifacts: String,
    pub preserve_media_ids: String,
    pub expected_conversions: String,
    pub pending_conversions: String,
    /// `pending` or `released`.
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One artifact directory scheduled for deletion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub dir: String,
    pub media_id: String,
}

impl CleanupEntryRow {
    pub fn artifacts_by_disk(&self) -> BTreeMap<String, Vec<ArtifactRef>> {
        serde_json::from_str(&self.artifacts).unwrap_or_default()
    }

    pub fn preserve_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.preserve_media_ids).unwrap_or_default()
    }

    pub fn pending(&self) -> Vec<String> {
        serde_json::from_str(&self.pending_conversions).unwrap_or_default()
    }
}

/// Query-side pagination input. Both fields are optional; out-of-range
/// values are clamped rather than rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaginationParams {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl PaginationParams {
    pub fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(20).clamp(1, 100)
    }

    pub fn offset(&self) -> u32 {
        (self.page.unwrap_or(1).max(1) - 1) * self.per_page()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

/// One security-log row: a rejection or scan verdict, keyed by correlation
/// id. Stores a hash of the filename, never the raw filename.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SecurityEvent {
    pub id: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub reason: String,
    pub filename_hash: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}
