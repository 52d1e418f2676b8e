//! Post-processing coordination: conversion generation for freshly attached
//! media, coalesced per (tenant, owner).
//!
//! A user may upload three avatars in ten seconds; generating conversions
//! for each would waste workers on artifacts that are already superseded.
//! The coalescer keeps only the latest upload per key and guarantees at most
//! one queued job per key; the job reads the latest state at execution time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::{PipelineResult, UploadError};
use crate::events::{Job, JobBus};
use crate::layout;
use crate::profiles::ProfileRegistry;
use crate::services::{attach, cleanup::CleanupScheduler};
use crate::storage::Storage;

// ─── Coalescer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LatestUpload {
    pub media_id: String,
    pub upload_uuid: String,
    pub version: String,
    pub received_at: Instant,
}

#[derive(Debug)]
struct Slot {
    latest: LatestUpload,
    enqueued: bool,
    touched_at: Instant,
}

/// Keyed by (tenant, owner). `remember_latest` overwrites older values;
/// `enqueue_once` flips the enqueued flag at most once until the job takes
/// the slot. Entries expire after the configured TTL so abandoned keys do
/// not accumulate.
#[derive(Debug)]
pub struct Coalescer {
    ttl: Duration,
    slots: Mutex<HashMap<(String, String), Slot>>,
}

impl Coalescer {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_seconds),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Records `latest` for the key unless a newer value is already present.
    /// Returns the displaced upload when a different media lost the slot.
    pub fn remember_latest(
        &self,
        tenant_id: &str,
        owner_id: &str,
        latest: LatestUpload,
    ) -> Option<LatestUpload> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let key = (tenant_id.to_string(), owner_id.to_string());
        match slots.get_mut(&key) {
            Some(slot) => {
                if slot.latest.received_at > latest.received_at {
                    // set-if-newer: an older write arriving late never wins.
                    return Some(latest);
                }
                let displaced = std::mem::replace(&mut slot.latest, latest);
                slot.touched_at = Instant::now();
                (displaced.media_id != slot.latest.media_id).then_some(displaced)
            }
            None => {
                slots.insert(
                    key,
                    Slot {
                        latest,
                        enqueued: false,
                        touched_at: Instant::now(),
                    },
                );
                None
            }
        }
    }

    /// Idempotent per key: true only when no job is currently queued.
    pub fn enqueue_once(&self, tenant_id: &str, owner_id: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let key = (tenant_id.to_string(), owner_id.to_string());
        match slots.get_mut(&key) {
            Some(slot) if !slot.enqueued => {
                slot.enqueued = true;
                true
            }
            _ => false,
        }
    }

    /// Hands the latest state to the executing job and clears the enqueued
    /// flag, so uploads arriving from here on trigger a fresh job.
    pub fn take_latest(&self, tenant_id: &str, owner_id: &str) -> Option<LatestUpload> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let key = (tenant_id.to_string(), owner_id.to_string());
        let slot = slots.get_mut(&key)?;
        slot.enqueued = false;
        Some(slot.latest.clone())
    }

    /// Drops keys idle for longer than the TTL.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|_, slot| now.duration_since(slot.touched_at) < self.ttl);
    }
}

// ─── Processor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Processing,
    Completed,
    Superseded,
    Failed,
    Unknown,
}

pub struct PostProcessor {
    pool: SqlitePool,
    storage: Arc<dyn Storage>,
    registry: Arc<ProfileRegistry>,
    cleanup: Arc<CleanupScheduler>,
    coalescer: Arc<Coalescer>,
    jobs: Arc<dyn JobBus>,
}

impl PostProcessor {
    pub fn new(
        pool: SqlitePool,
        storage: Arc<dyn Storage>,
        registry: Arc<ProfileRegistry>,
        cleanup: Arc<CleanupScheduler>,
        coalescer: Arc<Coalescer>,
        jobs: Arc<dyn JobBus>,
    ) -> Self {
        Self {
            pool,
            storage,
            registry,
            cleanup,
            coalescer,
            jobs,
        }
    }

    pub fn coalescer(&self) -> &Arc<Coalescer> {
        &self.coalescer
    }

    /// Listener entry point for `AvatarUpdated` and its equivalents.
    ///
    /// Resolves the tenant from the media's property bag (falling back to
    /// `fallback_tenant`), records the upload as the latest for its owner,
    /// and enqueues at most one processing job for the key.
    pub async fn on_media_updated(
        &self,
        media_id: &str,
        fallback_tenant: Option<&str>,
    ) -> PipelineResult<()> {
        let media = attach::get_media(&self.pool, media_id).await?;
        let props = media.properties();

        let tenant_id = if !props.tenant_id.is_empty() {
            props.tenant_id.clone()
        } else if let Some(t) = fallback_tenant {
            t.to_string()
        } else {
            tracing::warn!(media = media_id, "missing_tenant: dropping post-processing request");
            return Ok(());
        };

        let displaced = self.coalescer.remember_latest(
            &tenant_id,
            &media.model_id,
            LatestUpload {
                media_id: media.id.clone(),
                upload_uuid: props.upload_uuid.clone(),
                version: props.version.clone(),
                received_at: Instant::now(),
            },
        );

        // The displaced upload will never be processed; fail its pending
        // conversions so any cleanup entry waiting on them can release.
        if let Some(old) = displaced {
            self.fail_pending_conversions(&old.media_id).await?;
        }

        if self.coalescer.enqueue_once(&tenant_id, &media.model_id) {
            self.jobs
                .dispatch(
                    Job::PostProcess {
                        tenant_id,
                        owner_id: media.model_id.clone(),
                    },
                    None,
                )
                .await;
        }
        Ok(())
    }

    /// Queue-worker entry point: generates conversions for the latest media
    /// of the key, reporting each completion to the cleanup scheduler.
    pub async fn run(&self, tenant_id: &str, owner_id: &str) -> PipelineResult<()> {
        let Some(latest) = self.coalescer.take_latest(tenant_id, owner_id) else {
            return Ok(());
        };

        let media = attach::get_media(&self.pool, &latest.media_id).await?;
        let props = media.properties();
        let profile_id = props
            .extra
            .get("profile_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let profile = self.registry.get(&profile_id)?;

        if profile.conversions.is_empty() {
            return Ok(());
        }

        self.cleanup
            .flag_pending_conversions(&media.id, &profile.conversions)
            .await?;

        let canonical = self.storage.read(&media.disk, &media.path).await?;
        let conversions_dir = layout::conversions_directory(&media.path);

        let mut generated = Vec::new();
        let mut statuses = props.conversions.clone();
        for name in &profile.conversions {
            let Some(spec) = self.registry.conversion_spec(name) else {
                tracing::warn!(conversion = %name, "no dimension spec for conversion; skipping");
                statuses.insert(name.clone(), "failed".into());
                continue;
            };

            let bytes = canonical.clone();
            let spec = *spec;
            let rendered = tokio::task::spawn_blocking(move || {
                crate::media::conversions::render(&bytes, &spec)
            })
            .await
            .map_err(|_| UploadError::NormalizationFailed)?;

            match rendered {
                Ok(out) => {
                    let target = format!("{conversions_dir}/{name}.webp");
                    match self.storage.write(&media.disk, &target, &out).await {
                        Ok(()) => {
                            generated.push(name.clone());
                            statuses.insert(name.clone(), "completed".into());
                        }
                        Err(e) => {
                            tracing::warn!(conversion = %name, error = %e, "conversion write failed");
                            statuses.insert(name.clone(), "failed".into());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(conversion = %name, error = %e, "conversion render failed");
                    statuses.insert(name.clone(), "failed".into());
                }
            }
        }

        let mut updated_props = props;
        updated_props.conversions = statuses;
        sqlx::query(
            "UPDATE media SET custom_properties = ?, generated_conversions = ?, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
        )
        .bind(updated_props.to_json())
        .bind(serde_json::to_string(&generated).unwrap_or_else(|_| "[]".into()))
        .bind(&media.id)
        .execute(&self.pool)
        .await?;

        // Report every settled conversion — completed or failed — so a
        // cleanup entry triggered by this media can drain.
        for name in &profile.conversions {
            self.cleanup.handle_conversion_event(&media.id, name).await?;
        }

        tracing::info!(
            media = %media.id,
            generated = generated.len(),
            "post-processing completed"
        );
        Ok(())
    }

    /// Reports the upload's place in the processing lifecycle by comparing
    /// its uuid against the latest recorded media for the same owner.
    pub async fn status(&self, upload_uuid: &str) -> PipelineResult<ProcessingStatus> {
        let Some(media) = attach::find_by_upload_uuid(&self.pool, upload_uuid).await? else {
            return Ok(ProcessingStatus::Unknown);
        };
        let props = media.properties();

        let latest = attach::latest_active(
            &self.pool,
            &media.model_type,
            &media.model_id,
            &media.collection,
            &props.tenant_id,
        )
        .await?;
        match latest {
            Some(latest) if latest.id == media.id => {}
            _ => return Ok(ProcessingStatus::Superseded),
        }
        if props.conversions.values().any(|s| s == "failed") {
            return Ok(ProcessingStatus::Failed);
        }
        if props.conversions.values().all(|s| s == "completed") {
            return Ok(ProcessingStatus::Completed);
        }
        Ok(ProcessingStatus::Processing)
    }

    /// Marks every still-pending conversion of `media_id` as failed and
    /// notifies the cleanup scheduler for each.
    async fn fail_pending_conversions(&self, media_id: &str) -> PipelineResult<()> {
        let Ok(media) = attach::get_media(&self.pool, media_id).await else {
            return Ok(());
        };
        let mut props = media.properties();
        let pending = props.pending_conversions();
        if pending.is_empty() {
            return Ok(());
        }
        for name in &pending {
            props.conversions.insert(name.clone(), "failed".into());
        }
        sqlx::query(
            "UPDATE media SET custom_properties = ?, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
        )
        .bind(props.to_json())
        .bind(media_id)
        .execute(&self.pool)
        .await?;

        for name in &pending {
            self.cleanup.handle_conversion_event(media_id, name).await?;
        }
        Ok(())
    }
}
