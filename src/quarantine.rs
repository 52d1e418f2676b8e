//! Quarantine store: the isolated disk area holding raw uploads between
//! ingress and acceptance.
//!
//! Each artifact is two files under `quarantine/`: the blob at
//! `{correlation}.bin` and a JSON sidecar at `{correlation}.meta`. The
//! sidecar is created with `create_new`, which doubles as the per-token
//! exclusivity lock: two concurrent ingests of the same correlation id
//! cannot both win. The SHA-256 recorded at ingress is re-verified on every
//! read, so a blob mutated while quarantined is rejected rather than served
//! onward.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{PipelineResult, UploadError};
use crate::profiles::UploadProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineState {
    Pending,
    Scanned,
    Accepted,
    Rejected,
    Expired,
}

/// Handle to one quarantined artifact.
#[derive(Debug, Clone)]
pub struct QuarantineToken {
    pub id: Uuid,
    pub disk: String,
    pub relative_path: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub ttl_hours: i64,
    pub state: QuarantineState,
}

/// Sidecar document written next to every quarantined blob.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    hash: String,
    created_at: DateTime<Utc>,
    ttl_hours: i64,
    state: QuarantineState,
    profile_id: String,
}

#[derive(Debug, Clone)]
pub struct QuarantineStore {
    root: PathBuf,
    disk: String,
}

impl QuarantineStore {
    /// `root` is the quarantine disk's root directory; artifacts live under
    /// `{root}/quarantine/`.
    pub fn new(root: impl Into<PathBuf>, disk: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            disk: disk.into(),
        }
    }

    fn area(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    pub fn blob_path(&self, id: Uuid) -> PathBuf {
        self.area().join(format!("{id}.bin"))
    }

    fn sidecar_path(&self, id: Uuid) -> PathBuf {
        self.area().join(format!("{id}.meta"))
    }

    /// Ingests raw bytes under the given correlation id. Computes the
    /// SHA-256 in the same pass that writes the blob.
    pub async fn ingest(
        &self,
        bytes: &[u8],
        profile: &UploadProfile,
        correlation_id: Uuid,
    ) -> PipelineResult<QuarantineToken> {
        tokio::fs::create_dir_all(self.area()).await?;

        let hash = format!("{:x}", Sha256::digest(bytes));
        let created_at = Utc::now();
        let sidecar = Sidecar {
            hash: hash.clone(),
            created_at,
            ttl_hours: profile.quarantine_ttl_hours,
            state: QuarantineState::Pending,
            profile_id: profile.id.clone(),
        };

        // create_new: a second ingest under the same correlation id fails
        // instead of clobbering an artifact another worker owns.
        let sidecar_path = self.sidecar_path(correlation_id);
        let doc = serde_json::to_vec_pretty(&sidecar).map_err(std::io::Error::other)?;
        let sidecar_file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&sidecar_path)?;
        {
            use std::io::Write;
            let mut f = sidecar_file;
            f.write_all(&doc)?;
        }

        if let Err(e) = tokio::fs::write(self.blob_path(correlation_id), bytes).await {
            let _ = tokio::fs::remove_file(&sidecar_path).await;
            return Err(e.into());
        }

        Ok(QuarantineToken {
            id: correlation_id,
            disk: self.disk.clone(),
            relative_path: format!("quarantine/{correlation_id}.bin"),
            hash,
            created_at,
            ttl_hours: profile.quarantine_ttl_hours,
            state: QuarantineState::Pending,
        })
    }

    /// Reads the quarantined bytes back, verifying integrity against the
    /// hash recorded at ingress.
    pub async fn read(&self, token: &QuarantineToken) -> PipelineResult<Vec<u8>> {
        let bytes = tokio::fs::read(self.blob_path(token.id)).await?;
        let actual = format!("{:x}", Sha256::digest(&bytes));
        if actual != token.hash {
            return Err(UploadError::QuarantineIntegrity);
        }
        Ok(bytes)
    }

    /// Records a state transition in the sidecar. `accept` and `reject`
    /// below are the public transitions; this also backs the `scanned`
    /// marker the orchestrator sets between pipeline stages.
    pub async fn mark(&self, token: &QuarantineToken, state: QuarantineState) -> PipelineResult<()> {
        let path = self.sidecar_path(token.id);
        let raw = tokio::fs::read(&path).await?;
        let mut sidecar: Sidecar =
            serde_json::from_slice(&raw).map_err(|_| UploadError::QuarantineIntegrity)?;
        sidecar.state = state;
        let doc = serde_json::to_vec_pretty(&sidecar).map_err(std::io::Error::other)?;
        tokio::fs::write(&path, doc).await?;
        Ok(())
    }

    /// Idempotent acceptance marker. The blob itself is removed separately
    /// once the accepted bytes have been persisted at their final path.
    pub async fn accept(&self, token: &QuarantineToken) -> PipelineResult<()> {
        self.mark(token, QuarantineState::Accepted).await
    }

    /// Rejection deletes blob and sidecar immediately; rejected bytes are
    /// never kept around.
    pub async fn reject(&self, token: &QuarantineToken) -> PipelineResult<()> {
        self.remove(token.id).await
    }

    /// Removes both files for the given id, tolerating either being gone.
    pub async fn remove(&self, id: Uuid) -> PipelineResult<()> {
        for path in [self.blob_path(id), self.sidecar_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Walks sidecars and removes expired entries (blob + sidecar). Sidecars
    /// that fail to parse fall back to `fallback_ttl_hours` from their mtime.
    pub async fn prune_stale(&self, fallback_ttl_hours: i64) -> PipelineResult<u64> {
        let area = self.area();
        if !area.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let now = Utc::now();
        let mut entries = tokio::fs::read_dir(&area).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }

            let expires_at = match tokio::fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice::<Sidecar>(&raw) {
                    Ok(sidecar) => sidecar.created_at + Duration::hours(sidecar.ttl_hours),
                    Err(_) => {
                        let mtime: DateTime<Utc> = entry
                            .metadata()
                            .await?
                            .modified()
                            .map(DateTime::from)
                            .unwrap_or(now);
                        mtime + Duration::hours(fallback_ttl_hours)
                    }
                },
                Err(_) => continue,
            };

            if expires_at <= now {
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                if let Ok(id) = stem.parse::<Uuid>() {
                    self.remove(id).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "pruned stale quarantine entries");
        }
        Ok(removed)
    }

    /// Removes sidecars whose blob is gone and blobs whose sidecar is gone.
    /// Either can be left behind by a crash between the two writes.
    pub async fn cleanup_orphaned_sidecars(&self) -> PipelineResult<u64> {
        let area = self.area();
        if !area.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&area).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let (sibling, is_meta) = match path.extension().and_then(|e| e.to_str()) {
                Some("meta") => (path.with_extension("bin"), true),
                Some("bin") => (path.with_extension("meta"), false),
                _ => continue,
            };
            if !sibling.exists() {
                tokio::fs::remove_file(&path).await?;
                tracing::warn!(orphan = %path.display(), meta = is_meta, "removed orphaned quarantine file");
                removed += 1;
            }
        }
        Ok(removed)
    }
}
