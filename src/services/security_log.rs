//! Security event log — records every upload rejection and scan verdict to
//! the `security_events` table for incident response and tuning.
//!
//! Filenames are attacker-controlled, so only a SHA-256 of the name is
//! stored; the raw filename never reaches the log. Callers should
//! fire-and-forget where possible: losing a log entry is bad, but it should
//! never change the outcome of the upload that triggered it.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::SecurityEvent;
use crate::error::PipelineResult;

/// Returns the hex-encoded SHA-256 hash of an original filename.
pub fn hash_filename(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Appends one row to `security_events`.
///
/// * `reason`            — stable reason code (e.g. `polyglot_detected`)
/// * `original_filename` — hashed before storage
/// * `details`           — arbitrary JSON payload (signatures, limits hit)
pub async fn record(
    pool: &SqlitePool,
    tenant_id: &str,
    correlation_id: Uuid,
    reason: &str,
    original_filename: &str,
    details: &serde_json::Value,
) -> PipelineResult<()> {
    sqlx::query(
        "INSERT INTO security_events (id, tenant_id, correlation_id, reason, filename_hash, details) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(tenant_id)
    .bind(correlation_id.to_string())
    .bind(reason)
    .bind(hash_filename(original_filename))
    .bind(details.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent events, newest first.
pub async fn recent(pool: &SqlitePool, limit: i64) -> PipelineResult<Vec<SecurityEvent>> {
    let rows = sqlx::query_as::<_, SecurityEvent>(
        "SELECT id, tenant_id, correlation_id, reason, filename_hash, details, created_at \
         FROM security_events ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
