//! Upload orchestrator: composes admission control, quarantine, scanning,
//! normalization, path assignment, storage, and metadata attach into the
//! end-to-end `upload` and `replace` flows.
//!
//! Ordering is security-critical and strictly sequential per upload:
//! nothing is scanned before the magic-byte validator accepts it, nothing
//! is normalized before it is scanned, and nothing reaches permanent
//! storage before all of the above. Any fatal failure after ingress rejects
//! the quarantine token and deletes its bytes; no partial media record is
//! ever committed. Domain events fire only after the metadata transaction
//! commits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::MediaRecord;
use crate::error::{PipelineResult, UploadError, UploadFailure};
use crate::events::{DomainEvent, EventBus};
use crate::layout::{self, PathSpec};
use crate::owner::{self, OwnerIdMode};
use crate::profiles::{PathCategory, ProcessingMode, ProfileRegistry};
use crate::quarantine::{QuarantineState, QuarantineStore};
use crate::scan::ScanCoordinator;
use crate::services::{attach, cleanup::CleanupScheduler, ratelimit::RateLimiter, security_log};
use crate::storage::Storage;
use crate::tenant::{Actor, TenantContext};
use crate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Stored,
    Attached,
    Quarantined,
    Failed,
    Superseded,
}

/// The caller-visible outcome of a successful upload.
#[derive(Debug, Clone, Serialize)]
pub struct StoredUpload {
    pub id: String,
    pub tenant_id: String,
    pub profile_id: String,
    pub disk: String,
    pub path: String,
    pub mime: String,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub status: UploadStatus,
    pub correlation_id: Uuid,
}

#[derive(Debug)]
pub struct Replacement {
    pub new: StoredUpload,
    /// Id of the media record this upload superseded, when one existed.
    pub previous: Option<String>,
}

#[derive(Debug)]
pub struct UploadRequest<'a> {
    pub profile_id: &'a str,
    pub owner_id: Option<&'a str>,
    pub bytes: &'a [u8],
    pub original_filename: &'a str,
    pub correlation_id: Option<Uuid>,
    /// Caller-supplied custom properties, merged into the media record's
    /// property bag. Reserved keys (tenant, correlation, headers) win over
    /// caller values.
    pub meta: serde_json::Value,
}

pub struct UploadPipeline {
    registry: Arc<ProfileRegistry>,
    quarantine: Arc<QuarantineStore>,
    storage: Arc<dyn Storage>,
    scanners: Arc<ScanCoordinator>,
    events: Arc<dyn EventBus>,
    cleanup: Arc<CleanupScheduler>,
    limiter: Arc<RateLimiter>,
    pool: SqlitePool,
    owner_mode: OwnerIdMode,
    soft_timeout: Duration,
    temporary_url_ttl: Duration,
    patterns: Vec<Regex>,
    work_dir: PathBuf,
}

impl UploadPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ProfileRegistry>,
        quarantine: Arc<QuarantineStore>,
        storage: Arc<dyn Storage>,
        scanners: Arc<ScanCoordinator>,
        events: Arc<dyn EventBus>,
        cleanup: Arc<CleanupScheduler>,
        limiter: Arc<RateLimiter>,
        pool: SqlitePool,
        owner_mode: OwnerIdMode,
        soft_timeout_seconds: u64,
        temporary_url_ttl_seconds: u64,
        patterns: Vec<Regex>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            quarantine,
            storage,
            scanners,
            events,
            cleanup,
            limiter,
            pool,
            owner_mode,
            soft_timeout: Duration::from_secs(soft_timeout_seconds),
            temporary_url_ttl: Duration::from_secs(temporary_url_ttl_seconds),
            patterns,
            work_dir,
        }
    }

    /// Runs one upload end to end and returns the stored artifact.
    pub async fn upload(
        &self,
        tenant: &TenantContext,
        actor: &Actor,
        req: UploadRequest<'_>,
    ) -> Result<StoredUpload, UploadFailure> {
        self.upload_inner(tenant, actor, req)
            .await
            .map(|(stored, _)| stored)
    }

    /// Like `upload`, additionally reporting which record was superseded.
    /// Deletion of the previous artifact is best-effort and deferred through
    /// the cleanup scheduler, with the previous media as the trigger.
    pub async fn replace(
        &self,
        tenant: &TenantContext,
        actor: &Actor,
        req: UploadRequest<'_>,
    ) -> Result<Replacement, UploadFailure> {
        let (new, previous) = self.upload_inner(tenant, actor, req).await?;
        Ok(Replacement {
            new,
            previous: previous.map(|m| m.id),
        })
    }

    /// Deletes a media record outright: marks the row, schedules direct
    /// cleanup of its blob and conversions, and emits the deletion event.
    pub async fn delete_media(&self, media_id: &str) -> PipelineResult<()> {
        let media = attach::get_media(&self.pool, media_id).await?;
        sqlx::query(
            "UPDATE media SET status = 'superseded', \
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
        )
        .bind(media_id)
        .execute(&self.pool)
        .await?;

        let props = media.properties();
        self.cleanup
            .schedule_cleanup(
                &media.id,
                CleanupScheduler::artifacts_for(&media),
                Vec::new(),
                props.conversions.keys().cloned().collect(),
                props.pending_conversions(),
            )
            .await?;

        if media.collection == "avatar" {
            self.events
                .dispatch(DomainEvent::AvatarDeleted {
                    user_id: media.model_id.clone(),
                    media_id: media.id.clone(),
                })
                .await;
        }
        Ok(())
    }

    async fn upload_inner(
        &self,
        tenant: &TenantContext,
        actor: &Actor,
        req: UploadRequest<'_>,
    ) -> Result<(StoredUpload, Option<MediaRecord>), UploadFailure> {
        let correlation_id = req.correlation_id.unwrap_or_else(Uuid::new_v4);

        let result = match tokio::time::timeout(
            self.soft_timeout,
            self.run_pipeline(tenant, actor, &req, correlation_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(UploadError::UploadTimeout),
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                // Reject the token: quarantined bytes of a failed upload are
                // never kept. Safe when ingress never happened — remove
                // tolerates missing files.
                if let Err(e) = self.quarantine.remove(correlation_id).await {
                    tracing::warn!(correlation = %correlation_id, error = %e, "failed to drop quarantined bytes after rejection");
                }

                if error.is_security_rejection() {
                    let details = serde_json::json!({
                        "profile": req.profile_id,
                        "actor": actor.id,
                        "size": req.bytes.len(),
                    });
                    if let Err(e) = security_log::record(
                        &self.pool,
                        &tenant.tenant_id,
                        correlation_id,
                        error.reason(),
                        req.original_filename,
                        &details,
                    )
                    .await
                    {
                        tracing::warn!(correlation = %correlation_id, error = %e, "failed to record security event");
                    }
                }

                tracing::warn!(
                    correlation = %correlation_id,
                    kind = error.reason(),
                    "validation_failed"
                );
                Err(UploadFailure {
                    error,
                    correlation_id,
                })
            }
        }
    }

    async fn run_pipeline(
        &self,
        tenant: &TenantContext,
        actor: &Actor,
        req: &UploadRequest<'_>,
        correlation_id: Uuid,
    ) -> PipelineResult<(StoredUpload, Option<MediaRecord>)> {
        // 1. Profile resolution and owner normalization.
        let profile = self.registry.get(req.profile_id)?;
        let owner_id = match req.owner_id {
            Some(raw) => Some(owner::normalize(self.owner_mode, raw)?),
            None => None,
        };
        if profile.path_category == PathCategory::Avatars && owner_id.is_none() {
            return Err(UploadError::OwnerRequired);
        }

        self.limiter.check(&actor.id)?;

        // 2. Flow opened.
        tracing::info!(
            profile = %profile.id,
            actor = %actor.id,
            correlation = %correlation_id,
            owner = owner_id.as_deref().unwrap_or("-"),
            tenant = %tenant.tenant_id,
            "upload started"
        );

        // 3. Quarantine ingress.
        let token = self
            .quarantine
            .ingest(req.bytes, profile, correlation_id)
            .await?;
        let blob_path = self.quarantine.blob_path(token.id);

        // 4. Admission control against the bytes on disk in quarantine.
        let validated = validate::validate(
            &blob_path,
            req.original_filename,
            &profile.constraints,
            &self.patterns,
            matches!(profile.kind, crate::profiles::ProfileKind::Image),
        )
        .await?;

        // 5. Scanners, in fixed order, after admission.
        self.scanners.scan(&blob_path, profile.scan).await?;
        self.quarantine.mark(&token, QuarantineState::Scanned).await?;

        // 6. Integrity-checked read; for image profiles the working bytes
        //    are then replaced by the normalized re-encode.
        let quarantined = self.quarantine.read(&token).await?;
        let (working, mime, extension) = if profile.processing == ProcessingMode::ImagePipeline
            && profile.requires_image_normalization
        {
            let constraints = profile.constraints.clone();
            let input = blob_path.clone();
            let work_dir = self.work_dir.clone();
            let normalized = tokio::task::spawn_blocking(move || {
                crate::media::normalize::normalize(&input, &constraints, &work_dir)
            })
            .await
            .map_err(|_| UploadError::NormalizationFailed)??;

            let bytes = tokio::fs::read(&normalized.path).await?;
            let _ = tokio::fs::remove_file(&normalized.path).await;
            (bytes, normalized.mime, normalized.extension)
        } else {
            (
                quarantined,
                validated.real_mime.clone(),
                validated.extension.clone(),
            )
        };

        let checksum = format!("{:x}", Sha256::digest(&working));

        // 7. Deterministic target path; atomic write via the storage seam.
        let disk = self.registry.effective_disk(profile).to_string();
        let path = layout::path_for_profile(&PathSpec {
            category: profile.path_category,
            tenant_id: &tenant.tenant_id,
            owner_id: owner_id.as_deref(),
            extension: &extension,
            version: None,
            unique_id: None,
            date: chrono::Utc::now(),
        })?;
        self.storage
            .write(&disk, &path, &working)
            .await
            .map_err(|_| UploadError::StorageWriteFailed)?;

        // 8. Metadata attach, transactional.
        let attached = attach::attach(
            &self.pool,
            attach::AttachRequest {
                profile,
                tenant,
                owner_id: owner_id.as_deref().unwrap_or(""),
                model_type: "user",
                disk: &disk,
                path: &path,
                mime: &mime,
                size_bytes: working.len() as u64,
                checksum: Some(&checksum),
                correlation_id,
                quarantine_id: token.id,
                original_filename: req.original_filename,
                meta: req.meta.clone(),
            },
        )
        .await;

        let attach::AttachOutcome { media, superseded } = match attached {
            Ok(outcome) => outcome,
            Err(e) => {
                // Roll the blob back so a failed attach leaves nothing behind.
                let _ = self.storage.delete_if_exists(&disk, &path).await;
                return Err(e);
            }
        };

        // 9. Accepted: mark the token, then drop its bytes.
        self.quarantine.accept(&token).await?;
        self.quarantine.remove(token.id).await?;

        // Post-commit side effects only from here on.
        let replaced = superseded.is_some();
        let url = self
            .storage
            .temporary_url(&disk, &path, self.temporary_url_ttl)
            .await;
        let event = if media.collection == "avatar" {
            DomainEvent::AvatarUpdated {
                user_id: media.model_id.clone(),
                new_media_id: media.id.clone(),
                old_media_id: superseded.as_ref().map(|m| m.id.clone()),
                version: Some(checksum.clone()),
                collection: media.collection.clone(),
                replaced,
                url,
            }
        } else {
            DomainEvent::MediaUpdated {
                owner_id: media.model_id.clone(),
                new_media_id: media.id.clone(),
                old_media_id: superseded.as_ref().map(|m| m.id.clone()),
                collection: media.collection.clone(),
                replaced,
            }
        };
        self.events.dispatch(event).await;

        // Previous media's artifacts go through the cleanup scheduler with
        // the previous media as the trigger: cleanup awaits the previous
        // media's conversions, never the new one's. Failures are logged and
        // left for the janitor.
        if let Some(prev) = &superseded {
            let props = prev.properties();
            if let Err(e) = self
                .cleanup
                .schedule_cleanup(
                    &prev.id,
                    CleanupScheduler::artifacts_for(prev),
                    vec![media.id.clone()],
                    props.conversions.keys().cloned().collect(),
                    props.pending_conversions(),
                )
                .await
            {
                tracing::warn!(previous = %prev.id, error = %e, "failed to schedule cleanup of superseded media");
            }
        }

        tracing::info!(
            correlation = %correlation_id,
            media = %media.id,
            path = %path,
            "upload stored"
        );

        Ok((
            StoredUpload {
                id: media.id.clone(),
                tenant_id: tenant.tenant_id.clone(),
                profile_id: profile.id.clone(),
                disk,
                path,
                mime,
                size_bytes: working.len() as u64,
                checksum: Some(checksum),
                status: UploadStatus::Stored,
                correlation_id,
            },
            superseded,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&UploadStatus::Stored).unwrap(),
            r#""stored""#
        );
        assert_eq!(
            serde_json::to_string(&UploadStatus::Superseded).unwrap(),
            r#""superseded""#
        );
    }
}
