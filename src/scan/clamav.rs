//! ClamAV scanner: shells out to `clamdscan`/`clamscan` with a sanitized
//! argv and a hard timeout.
//!
//! Exit code contract (clamscan manpage): 0 = clean, 1 = infected, anything
//! else = scanner error. Infected signatures are parsed from
//! `path: Signature FOUND` output lines.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{sanitize_args, ScanVerdict, Scanner};

/// Flags the AV invocation may carry, with clamps for numeric values.
/// `--max-filesize` is clamped per call to the scanned file's size.
const ALLOWED_FLAGS: [(&str, Option<u64>); 4] = [
    ("--no-summary", None),
    ("--infected", None),
    ("--timeout", Some(30)),
    ("--max-recursion", Some(32)),
];

pub struct ClamAvScanner {
    binary: PathBuf,
    timeout: Duration,
    extra_args: Vec<String>,
}

impl ClamAvScanner {
    pub fn new(binary: impl Into<PathBuf>, timeout_seconds: u64, extra_args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            // The per-scanner ceiling is 30 s regardless of configuration.
            timeout: Duration::from_secs(timeout_seconds.min(30)),
            extra_args,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn argv(&self, path: &Path, file_size: Option<u64>) -> Vec<String> {
        let mut allowed: Vec<(&str, Option<u64>)> = ALLOWED_FLAGS.to_vec();
        allowed.push(("--max-filesize", file_size));

        let mut args = vec!["--no-summary".to_string(), "--infected".to_string()];
        args.extend(self.extra_args.iter().cloned());
        let mut argv = sanitize_args(&args, &allowed);
        argv.push(path.display().to_string());
        argv
    }
}

#[async_trait]
impl Scanner for ClamAvScanner {
    fn name(&self) -> &str {
        "clamav"
    }

    async fn scan(&self, path: &Path) -> ScanVerdict {
        let file_size = tokio::fs::metadata(path).await.ok().map(|m| m.len());
        let argv = self.argv(path, file_size);

        let child = Command::new(&self.binary)
            .args(&argv)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ScanVerdict::Error {
                    message: format!("failed to spawn antivirus: {e}"),
                }
            }
            Err(_) => {
                return ScanVerdict::Error {
                    message: format!("antivirus timed out after {:?}", self.timeout),
                }
            }
        };

        match output.status.code() {
            Some(0) => ScanVerdict::Clean,
            Some(1) => ScanVerdict::Infected {
                signatures: parse_found_signatures(&String::from_utf8_lossy(&output.stdout)),
            },
            code => ScanVerdict::Error {
                message: format!(
                    "antivirus exited with {:?}: {}",
                    code,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            },
        }
    }
}

/// Parses `path: Signature FOUND` lines into the bare signature names.
fn parse_found_signatures(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_suffix("FOUND")?.trim_end();
            let (_, sig) = rest.rsplit_once(": ")?;
            Some(sig.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_is_allowlisted_and_clamped() {
        let scanner = ClamAvScanner::new(
            "/usr/bin/clamdscan",
            30,
            vec![
                "--timeout=120".into(),
                "--max-recursion=64".into(),
                "--remove".into(), // never allowed: would delete the quarantine blob
                "--max-filesize=999999999".into(),
            ],
        );
        let argv = scanner.argv(Path::new("/q/x.bin"), Some(1024));
        assert_eq!(
            argv,
            vec![
                "--no-summary",
                "--infected",
                "--timeout=30",
                "--max-recursion=32",
                "--max-filesize=1024",
                "/q/x.bin"
            ]
        );
    }

    #[test]
    fn timeout_is_capped_at_thirty_seconds() {
        let scanner = ClamAvScanner::new("/usr/bin/clamdscan", 300, Vec::new());
        assert_eq!(scanner.timeout, Duration::from_secs(30));
    }

    #[test]
    fn found_lines_parse_to_signatures() {
        let stdout = "/q/a.bin: Eicar-Test-Signature FOUND\n\
                      /q/a.bin: Win.Test.EICAR_HDB-1 FOUND\n\
                      ----------- SCAN SUMMARY -----------\n";
        assert_eq!(
            parse_found_signatures(stdout),
            vec!["Eicar-Test-Signature", "Win.Test.EICAR_HDB-1"]
        );
    }

    #[tokio::test]
    async fn missing_binary_reports_error_verdict() {
        let scanner = ClamAvScanner::new("/nonexistent/clamdscan", 5, Vec::new());
        let verdict = scanner.scan(Path::new("/tmp/nothing")).await;
        assert!(matches!(verdict, ScanVerdict::Error { .. }));
    }
}
