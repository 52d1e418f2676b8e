//! YARA scanner with rule-set integrity verification.
//!
//! The rule manager hashes the rule files (sorted by name, contents chained
//! into one SHA-256) and compares against the expected hash recorded in
//! configuration. A mismatch means the rules were tampered with or only
//! partially deployed; scan-required flows then fail closed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;

use super::{ScanVerdict, Scanner};
use crate::error::{PipelineResult, UploadError};

pub struct YaraScanner {
    binary: PathBuf,
    rules_dir: PathBuf,
    expected_hash: Option<String>,
    timeout: Duration,
}

impl YaraScanner {
    pub fn new(
        binary: impl Into<PathBuf>,
        rules_dir: impl Into<PathBuf>,
        expected_hash: Option<String>,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            binary: binary.into(),
            rules_dir: rules_dir.into(),
            expected_hash,
            timeout: Duration::from_secs(timeout_seconds.min(30)),
        }
    }

    pub fn rules_dir(&self) -> &Path {
        &self.rules_dir
    }

    /// Recomputes the rule-set hash: every `.yar`/`.yara` file under the
    /// rules directory, sorted by file name, contents fed into one SHA-256.
    pub async fn rules_hash(&self) -> PipelineResult<String> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.rules_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("yar") | Some("yara") => files.push(path),
                _ => {}
            }
        }
        files.sort();

        let mut hasher = Sha256::new();
        for path in &files {
            hasher.update(tokio::fs::read(path).await?);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Verifies the rule set against the expected hash. Deployments without
    /// a pinned hash skip verification (the rules still run).
    pub async fn verify_rules(&self) -> PipelineResult<()> {
        let Some(expected) = &self.expected_hash else {
            return Ok(());
        };
        let actual = self
            .rules_hash()
            .await
            .map_err(|_| UploadError::YaraRulesIntegrity)?;
        if &actual != expected {
            tracing::error!(%actual, %expected, "yaraRulesFailed: rule set hash mismatch");
            return Err(UploadError::YaraRulesIntegrity);
        }
        Ok(())
    }

    fn rule_files_sync(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.rules_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yar") | Some("yara")
                )
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl Scanner for YaraScanner {
    fn name(&self) -> &str {
        "yara"
    }

    async fn preflight(&self) -> PipelineResult<()> {
        self.verify_rules().await
    }

    async fn scan(&self, path: &Path) -> ScanVerdict {
        let rules = match self.rule_files_sync() {
            Ok(rules) if !rules.is_empty() => rules,
            Ok(_) => return ScanVerdict::Clean, // no rules deployed
            Err(e) => {
                return ScanVerdict::Error {
                    message: format!("cannot read yara rules: {e}"),
                }
            }
        };

        // `yara rule1 [rule2 …] target` — rule paths come from our own rules
        // directory listing, the target from quarantine; no caller-supplied
        // argv reaches the child.
        let mut cmd = Command::new(&self.binary);
        for rule in &rules {
            cmd.arg(rule);
        }
        cmd.arg(path);
        cmd.kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ScanVerdict::Error {
                    message: format!("failed to spawn yara: {e}"),
                }
            }
            Err(_) => {
                return ScanVerdict::Error {
                    message: format!("yara timed out after {:?}", self.timeout),
                }
            }
        };

        if !output.status.success() {
            return ScanVerdict::Error {
                message: format!(
                    "yara exited with {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            };
        }

        // One `RuleName target` line per match; empty output means clean.
        let matches: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().next().map(|s| s.to_string()))
            .collect();

        if matches.is_empty() {
            ScanVerdict::Clean
        } else {
            ScanVerdict::Infected {
                signatures: matches,
            }
        }
    }
}
