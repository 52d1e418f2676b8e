//! Cleanup scheduler: defers deletion of superseded artifacts until their
//! derived conversions have finished (or a ceiling elapses), so no
//! conversion job ever writes into a directory that was just removed.
//!
//! State lives in the `cleanup_entries` table, keyed by the trigger media —
//! for replacements that is the *previous* media, so cleanup awaits the
//! previous media's conversions, never the new one's. Workers claim entries
//! with a compare-and-set on `state`, which keeps concurrent release
//! attempts from double-deleting.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use crate::db::models::{ArtifactRef, CleanupEntryRow, MediaRecord};
use crate::error::PipelineResult;
use crate::layout;
use crate::storage::Storage;

pub type ArtifactsByDisk = BTreeMap<String, Vec<ArtifactRef>>;

pub struct CleanupScheduler {
    pool: SqlitePool,
    storage: Arc<dyn Storage>,
    max_age_hours: i64,
}

impl CleanupScheduler {
    pub fn new(pool: SqlitePool, storage: Arc<dyn Storage>, max_age_hours: i64) -> Self {
        Self {
            pool,
            storage,
            max_age_hours,
        }
    }

    /// Builds the artifact map for one media record: its base directory on
    /// its disk. Conversions and responsive images live underneath it.
    pub fn artifacts_for(media: &MediaRecord) -> ArtifactsByDisk {
        BTreeMap::from([(
            media.disk.clone(),
            vec![ArtifactRef {
                dir: layout::base_directory(&media.path).to_string(),
                media_id: media.id.clone(),
            }],
        )])
    }

    /// Re-flags the expected conversions of `media_id` as pending, so the
    /// completion set is well-defined before generation starts.
    pub async fn flag_pending_conversions(
        &self,
        media_id: &str,
        expected: &[String],
    ) -> PipelineResult<()> {
        let media = super::attach::get_media(&self.pool, media_id).await?;
        let mut props = media.properties();
        for name in expected {
            props.conversions.insert(name.clone(), "pending".into());
        }
        sqlx::query(
            "UPDATE media SET custom_properties = ?, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
        )
        .bind(props.to_json())
        .bind(media_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stores (or replaces) the cleanup entry for `trigger_media_id`. When
    /// nothing is pending the entry is released immediately.
    pub async fn schedule_cleanup(
        &self,
        trigger_media_id: &str,
        artifacts: ArtifactsByDisk,
        preserve_media_ids: Vec<String>,
        expected_conversions: Vec<String>,
        pending_conversions: Vec<String>,
    ) -> PipelineResult<()> {
        // created_at is bound rather than defaulted so that timestamp
        // comparisons in purge_expired see one consistent text format.
        let now = Utc::now();
        let expires_at = now + Duration::hours(self.max_age_hours);
        sqlx::query(
            "INSERT OR REPLACE INTO cleanup_entries \
             (trigger_media_id, artifacts, preserve_media_ids, expected_conversions, \
              pending_conversions, state, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(trigger_media_id)
        .bind(serde_json::to_string(&artifacts).unwrap_or_else(|_| "{}".into()))
        .bind(serde_json::to_string(&preserve_media_ids).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&expected_conversions).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&pending_conversions).unwrap_or_else(|_| "[]".into()))
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            trigger = trigger_media_id,
            pending = pending_conversions.len(),
            "cleanup scheduled"
        );

        if pending_conversions.is_empty() {
            self.release(trigger_media_id).await?;
        }
        Ok(())
    }

    /// Marks one conversion of the trigger media as no longer pending.
    /// Releases the entry once the pending set drains.
    pub async fn handle_conversion_event(
        &self,
        media_id: &str,
        conversion: &str,
    ) -> PipelineResult<()> {
        // Optimistic compare-and-set on the serialized pending list; a lost
        // race simply retries against the fresh row.
        for _ in 0..8 {
            let Some(entry) = self.entry(media_id).await? else {
                return Ok(());
            };
            if entry.state != "pending" {
                return Ok(());
            }
            let mut pending = entry.pending();
            let before = pending.len();
            pending.retain(|name| name != conversion);
            if pending.len() == before {
                return Ok(());
            }
            let updated = sqlx::query(
                "UPDATE cleanup_entries SET pending_conversions = ? \
                 WHERE trigger_media_id = ? AND pending_conversions = ? AND state = 'pending'",
            )
            .bind(serde_json::to_string(&pending).unwrap_or_else(|_| "[]".into()))
            .bind(media_id)
            .bind(&entry.pending_conversions)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated == 1 {
                if pending.is_empty() {
                    self.release(media_id).await?;
                }
                return Ok(());
            }
        }
        tracing::warn!(trigger = media_id, "conversion event lost CAS race repeatedly");
        Ok(())
    }

    /// Forces release of the entry for `media_id`, pending conversions or
    /// not. Used when the owning media is deleted outright.
    pub async fn flush_expired(&self, media_id: &str) -> PipelineResult<()> {
        self.release(media_id).await
    }

    /// Releases entries older than the ceiling regardless of pending
    /// conversions, in chunks. Recovers from lost conversion events.
    pub async fn purge_expired(
        &self,
        max_age_hours: Option<i64>,
        chunk_size: i64,
    ) -> PipelineResult<u64> {
        let cutoff = Utc::now() - Duration::hours(max_age_hours.unwrap_or(self.max_age_hours));
        let stale: Vec<String> = sqlx::query_scalar(
            "SELECT trigger_media_id FROM cleanup_entries \
             WHERE state = 'pending' AND (created_at <= ? OR expires_at <= ?) \
             ORDER BY created_at LIMIT ?",
        )
        .bind(cutoff)
        .bind(Utc::now())
        .bind(chunk_size)
        .fetch_all(&self.pool)
        .await?;

        let mut released = 0;
        for id in stale {
            self.release(&id).await?;
            released += 1;
        }
        if released > 0 {
            tracing::info!(released, "purged expired cleanup entries");
        }
        Ok(released)
    }

    pub async fn entry(&self, trigger_media_id: &str) -> PipelineResult<Option<CleanupEntryRow>> {
        let row = sqlx::query_as::<_, CleanupEntryRow>(
            "SELECT trigger_media_id, artifacts, preserve_media_ids, expected_conversions, \
                    pending_conversions, state, created_at, expires_at \
             FROM cleanup_entries WHERE trigger_media_id = ?",
        )
        .bind(trigger_media_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Claims and executes one entry. Deletions are best-effort: failures
    /// are logged and the entry stays released — the artifacts will be
    /// unreferenced leftovers for operators, not a retry storm.
    async fn release(&self, trigger_media_id: &str) -> PipelineResult<()> {
        let Some(entry) = self.entry(trigger_media_id).await? else {
            return Ok(());
        };

        // Compare-and-set claim: only one worker wins the transition.
        let claimed = sqlx::query(
            "UPDATE cleanup_entries SET state = 'released' \
             WHERE trigger_media_id = ? AND state = 'pending'",
        )
        .bind(trigger_media_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if claimed == 0 {
            return Ok(());
        }

        // Resolve preserved directories at execution time, not schedule time:
        // the preserved media may have moved or gained conversions since.
        let mut preserved: Vec<(String, String)> = Vec::new();
        for id in entry.preserve_ids() {
            if let Ok(media) = super::attach::get_media(&self.pool, &id).await {
                preserved.push((
                    media.disk.clone(),
                    layout::base_directory(&media.path).to_string(),
                ));
            }
        }

        for (disk, artifacts) in entry.artifacts_by_disk() {
            for artifact in artifacts {
                let shielded = preserved.iter().any(|(p_disk, p_dir)| {
                    p_disk == &disk
                        && (p_dir == &artifact.dir
                            || p_dir.starts_with(&format!("{}/", artifact.dir)))
                });
                if shielded {
                    tracing::warn!(
                        trigger = trigger_media_id,
                        dir = %artifact.dir,
                        "skipping cleanup of preserved media directory"
                    );
                    continue;
                }

                // The base directory contains the blob plus its conversions/
                // and responsive-images/ subtrees; one recursive delete
                // covers all three.
                match self.storage.delete_dir_if_exists(&disk, &artifact.dir).await {
                    Ok(true) => {
                        tracing::info!(trigger = trigger_media_id, dir = %artifact.dir, "cleanup removed artifact directory");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(trigger = trigger_media_id, dir = %artifact.dir, error = %e, "cleanup deletion failed; leaving for janitor");
                    }
                }

                let updated = sqlx::query(
                    "UPDATE media SET status = 'deleted', \
                     updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') \
                     WHERE id = ? AND status = 'superseded'",
                )
                .bind(&artifact.media_id)
                .execute(&self.pool)
                .await;
                if let Err(e) = updated {
                    tracing::warn!(media = %artifact.media_id, error = %e, "failed to mark media deleted");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::storage::LocalStorage;

    async fn fixture() -> (tempfile::TempDir, SqlitePool, CleanupScheduler) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()));
        let scheduler = CleanupScheduler::new(pool.clone(), storage, 48);
        (dir, pool, scheduler)
    }

    async fn seed_media(pool: &SqlitePool, id: &str, path: &str, status: &str) {
        sqlx::query(
            "INSERT INTO media (id, model_type, model_id, collection, disk, path, file_name, \
             mime, size_bytes, status, custom_properties) \
             VALUES (?, 'user', '42', 'avatar', 'media', ?, 'f.png', 'image/png', 1, ?, '{}')",
        )
        .bind(id)
        .bind(path)
        .bind(status)
        .execute(pool)
        .await
        .unwrap();
    }

    fn artifacts(dir: &str, media_id: &str) -> ArtifactsByDisk {
        BTreeMap::from([(
            "media".to_string(),
            vec![ArtifactRef {
                dir: dir.to_string(),
                media_id: media_id.to_string(),
            }],
        )])
    }

    #[tokio::test]
    async fn empty_pending_releases_immediately() {
        let (dir, pool, scheduler) = fixture().await;
        let storage = LocalStorage::new(dir.path());
        storage.write("media", "t/old/v1.png", b"old").await.unwrap();
        seed_media(&pool, "m-old", "t/old/v1.png", "superseded").await;

        scheduler
            .schedule_cleanup("m-old", artifacts("t/old", "m-old"), vec![], vec![], vec![])
            .await
            .unwrap();

        assert!(!storage.exists("media", "t/old/v1.png").await.unwrap());
        let entry = scheduler.entry("m-old").await.unwrap().unwrap();
        assert_eq!(entry.state, "released");
        assert_eq!(
            super::super::attach::get_media(&pool, "m-old")
                .await
                .unwrap()
                .status,
            "deleted"
        );
    }

    #[tokio::test]
    async fn release_waits_for_all_pending_conversions() {
        let (dir, pool, scheduler) = fixture().await;
        let storage = LocalStorage::new(dir.path());
        storage.write("media", "t/old/v1.png", b"old").await.unwrap();
        storage
            .write("media", "t/old/conversions/thumb.webp", b"t")
            .await
            .unwrap();
        seed_media(&pool, "m-old", "t/old/v1.png", "superseded").await;

        scheduler
            .schedule_cleanup(
                "m-old",
                artifacts("t/old", "m-old"),
                vec![],
                vec!["thumb".into(), "medium".into()],
                vec!["thumb".into(), "medium".into()],
            )
            .await
            .unwrap();

        scheduler
            .handle_conversion_event("m-old", "thumb")
            .await
            .unwrap();
        assert!(storage.exists("media", "t/old/v1.png").await.unwrap());

        scheduler
            .handle_conversion_event("m-old", "medium")
            .await
            .unwrap();
        assert!(!storage.exists("media", "t/old/v1.png").await.unwrap());
        assert!(
            !storage
                .exists("media", "t/old/conversions/thumb.webp")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn preserved_media_directory_is_never_deleted() {
        let (dir, pool, scheduler) = fixture().await;
        let storage = LocalStorage::new(dir.path());
        storage.write("media", "t/shared/v1.png", b"keep").await.unwrap();
        seed_media(&pool, "m-old", "t/shared/v1.png", "superseded").await;
        seed_media(&pool, "m-new", "t/shared/v2.png", "active").await;

        scheduler
            .schedule_cleanup(
                "m-old",
                artifacts("t/shared", "m-old"),
                vec!["m-new".into()],
                vec![],
                vec![],
            )
            .await
            .unwrap();

        // The preserved media resolves to the same base directory, so the
        // delete is skipped even though the entry released.
        assert!(storage.exists("media", "t/shared/v1.png").await.unwrap());
        assert_eq!(
            scheduler.entry("m-old").await.unwrap().unwrap().state,
            "released"
        );
    }

    #[tokio::test]
    async fn purge_forces_release_past_ceiling() {
        let (dir, pool, scheduler) = fixture().await;
        let storage = LocalStorage::new(dir.path());
        storage.write("media", "t/stuck/v1.png", b"x").await.unwrap();
        seed_media(&pool, "m-stuck", "t/stuck/v1.png", "superseded").await;

        scheduler
            .schedule_cleanup(
                "m-stuck",
                artifacts("t/stuck", "m-stuck"),
                vec![],
                vec!["thumb".into()],
                vec!["thumb".into()],
            )
            .await
            .unwrap();

        // Nothing to purge yet.
        assert_eq!(scheduler.purge_expired(None, 100).await.unwrap(), 0);
        // A zero ceiling expires everything immediately.
        assert_eq!(scheduler.purge_expired(Some(0), 100).await.unwrap(), 1);
        assert!(!storage.exists("media", "t/stuck/v1.png").await.unwrap());
    }

    #[tokio::test]
    async fn flag_pending_conversions_rewrites_statuses() {
        let (_dir, pool, scheduler) = fixture().await;
        seed_media(&pool, "m1", "t/a/v1.png", "active").await;
        scheduler
            .flag_pending_conversions("m1", &["thumb".into(), "large".into()])
            .await
            .unwrap();
        let media = super::super::attach::get_media(&pool, "m1").await.unwrap();
        assert_eq!(media.properties().pending_conversions(), vec!["large", "thumb"]);
    }
}
