//! Liveness probes for the pieces the pipeline depends on. Each probe is
//! independent; one failure never aborts the others.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::events::JobBus;
use crate::scan::yara::YaraScanner;
use crate::storage::Storage;

#[derive(Debug, Clone, Serialize)]
pub struct Probe {
    pub ok: bool,
    pub detail: String,
}

impl Probe {
    fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

pub struct HealthCheck {
    quarantine_root: PathBuf,
    storage: Arc<dyn Storage>,
    default_disk: String,
    av_binary: PathBuf,
    yara: Option<Arc<YaraScanner>>,
    jobs: Arc<dyn JobBus>,
}

impl HealthCheck {
    pub fn new(
        quarantine_root: impl Into<PathBuf>,
        storage: Arc<dyn Storage>,
        default_disk: impl Into<String>,
        av_binary: impl Into<PathBuf>,
        yara: Option<Arc<YaraScanner>>,
        jobs: Arc<dyn JobBus>,
    ) -> Self {
        Self {
            quarantine_root: quarantine_root.into(),
            storage,
            default_disk: default_disk.into(),
            av_binary: av_binary.into(),
            yara,
            jobs,
        }
    }

    pub async fn run(&self) -> BTreeMap<String, Probe> {
        let mut probes = BTreeMap::new();
        probes.insert("quarantine_disk".to_string(), self.probe_quarantine().await);
        probes.insert("antivirus_binary".to_string(), self.probe_av_binary().await);
        probes.insert("yara_rules".to_string(), self.probe_yara().await);
        probes.insert("media_disk".to_string(), self.probe_media_disk().await);
        probes.insert("queue".to_string(), self.probe_queue());
        probes
    }

    async fn probe_quarantine(&self) -> Probe {
        let path = self.quarantine_root.join(".healthcheck");
        match tokio::fs::write(&path, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&path).await;
                Probe::ok("write/delete ok")
            }
            Err(e) => Probe::fail(format!("quarantine disk not writable: {e}")),
        }
    }

    async fn probe_av_binary(&self) -> Probe {
        match tokio::fs::metadata(&self.av_binary).await {
            Ok(meta) if meta.is_file() => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if meta.permissions().mode() & 0o111 == 0 {
                        return Probe::fail("antivirus binary is not executable");
                    }
                }
                Probe::ok("binary present and executable")
            }
            Ok(_) => Probe::fail("antivirus path is not a file"),
            Err(e) => Probe::fail(format!("antivirus binary missing: {e}")),
        }
    }

    async fn probe_yara(&self) -> Probe {
        match &self.yara {
            None => Probe::ok("yara not configured"),
            Some(scanner) => match scanner.verify_rules().await {
                Ok(()) => Probe::ok("rule set integrity verified"),
                Err(e) => Probe::fail(format!("rule set integrity failed: {e}")),
            },
        }
    }

    async fn probe_media_disk(&self) -> Probe {
        match self
            .storage
            .write(&self.default_disk, ".healthcheck", b"ok")
            .await
        {
            Ok(()) => {
                let _ = self
                    .storage
                    .delete_if_exists(&self.default_disk, ".healthcheck")
                    .await;
                Probe::ok("write/delete ok")
            }
            Err(e) => Probe::fail(format!("media disk not writable: {e}")),
        }
    }

    fn probe_queue(&self) -> Probe {
        match self.jobs.depth() {
            Some(depth) => Probe::ok(format!("connected, {depth} pending")),
            None => Probe::fail("queue depth unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcessJobBus;
    use crate::storage::LocalStorage;

    #[tokio::test]
    async fn healthy_setup_reports_all_ok_except_av() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("quarantine-root")).unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path().join("disks")));
        let (jobs, _rx) = InProcessJobBus::new();

        let health = HealthCheck::new(
            dir.path().join("quarantine-root"),
            storage,
            "media",
            "/nonexistent/clamdscan",
            None,
            jobs,
        );
        let probes = health.run().await;

        assert!(probes["quarantine_disk"].ok);
        assert!(probes["media_disk"].ok);
        assert!(probes["yara_rules"].ok);
        assert!(probes["queue"].ok);
        // Missing binary fails its probe without affecting the rest.
        assert!(!probes["antivirus_binary"].ok);
        assert_eq!(probes.len(), 5);
    }
}
