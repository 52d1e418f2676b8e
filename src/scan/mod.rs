//! Scan coordination: runs the configured scanners (antivirus, YARA) against
//! a quarantined file with sanitized arguments and per-scanner timeouts.
//!
//! Ordering is fixed: AV first, then YARA, both strictly after the
//! magic-byte validator has accepted the file. An `infected` verdict is
//! always fatal; a scanner `error` is fatal only when the profile's scan
//! mode is `required`.

pub mod clamav;
pub mod yara;

use std::path::Path;

use async_trait::async_trait;

use crate::error::{PipelineResult, UploadError};
use crate::profiles::ScanMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected { signatures: Vec<String> },
    Error { message: String },
}

#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;

    /// Verified before any scan runs; a scanner whose prerequisites fail
    /// (e.g. tampered rule files) is treated per the profile's scan mode.
    async fn preflight(&self) -> PipelineResult<()> {
        Ok(())
    }

    async fn scan(&self, path: &Path) -> ScanVerdict;
}

pub struct ScanCoordinator {
    scanners: Vec<Box<dyn Scanner>>,
}

impl ScanCoordinator {
    pub fn new(scanners: Vec<Box<dyn Scanner>>) -> Self {
        Self { scanners }
    }

    /// Runs every configured scanner in order against `path`.
    pub async fn scan(&self, path: &Path, mode: ScanMode) -> PipelineResult<()> {
        if mode == ScanMode::Disabled {
            return Ok(());
        }

        for scanner in &self.scanners {
            if let Err(e) = scanner.preflight().await {
                if mode == ScanMode::Required {
                    return Err(e);
                }
                tracing::warn!(scanner = scanner.name(), error = %e, "scanner preflight failed; continuing (scan optional)");
                continue;
            }

            match scanner.scan(path).await {
                ScanVerdict::Clean => {}
                ScanVerdict::Infected { signatures } => {
                    return Err(UploadError::VirusDetected {
                        scanner: scanner.name().to_string(),
                        signatures,
                    });
                }
                ScanVerdict::Error { message } => {
                    if mode == ScanMode::Required {
                        tracing::error!(scanner = scanner.name(), %message, "scanner failed on required profile");
                        return Err(UploadError::ScanFailed {
                            scanner: scanner.name().to_string(),
                        });
                    }
                    tracing::warn!(scanner = scanner.name(), %message, "scanner failed; continuing (scan optional)");
                }
            }
        }

        tracing::info!(scanners = self.scanners.len(), "scan_passed");
        Ok(())
    }
}

/// Keeps only allowlisted flags and clamps their numeric values.
///
/// `allowed` maps a flag name (`--timeout`) to an optional maximum for its
/// `=`-joined value. Unknown flags are dropped; non-numeric values on
/// clamped flags are dropped too.
pub fn sanitize_args(args: &[String], allowed: &[(&str, Option<u64>)]) -> Vec<String> {
    let mut out = Vec::new();
    for arg in args {
        let (flag, value) = match arg.split_once('=') {
            Some((f, v)) => (f, Some(v)),
            None => (arg.as_str(), None),
        };
        let Some((_, clamp)) = allowed.iter().find(|(name, _)| *name == flag) else {
            tracing::warn!(%arg, "dropping non-allowlisted scanner flag");
            continue;
        };
        match (value, clamp) {
            (None, _) => out.push(flag.to_string()),
            (Some(v), None) => out.push(format!("{flag}={v}")),
            (Some(v), Some(max)) => match v.parse::<u64>() {
                Ok(n) => out.push(format!("{flag}={}", n.min(*max))),
                Err(_) => {
                    tracing::warn!(%arg, "dropping scanner flag with non-numeric value");
                }
            },
        }
    }
    out
}
