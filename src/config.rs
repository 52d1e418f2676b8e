use serde::Deserialize;

/// Service configuration loaded from environment variables via `envy`.
///
/// All fields map directly to environment variable names (uppercased by envy).
/// Provide defaults via `.env` for local development; override via real env
/// vars in production / Docker.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite connection string for the metadata store, e.g.
    /// `sqlite:data/intake.db?mode=rwc`.
    pub database_url: String,

    /// Filesystem root containing one subdirectory per named disk.
    pub storage_root: String,

    /// Disk that receives accepted artifacts when a profile does not name
    /// its own.
    #[serde(default = "default_disk")]
    pub default_disk: String,

    /// Disk holding the quarantine area (`quarantine/{id}.bin` + `.meta`).
    #[serde(default = "default_quarantine_disk")]
    pub quarantine_disk: String,

    /// Path to the JSON profile registry document. When unset the built-in
    /// default document is used.
    #[serde(default)]
    pub profiles_path: Option<String>,

    /// Owner-id normalizer mode: `int`, `uuid`, `ulid`, or `string-any`.
    #[serde(default = "default_owner_id_mode")]
    pub uploads_owner_id_mode: String,

    /// Default TTL for pending quarantine items, in hours.
    #[serde(default = "default_quarantine_ttl")]
    pub quarantine_pending_ttl_hours: i64,

    /// Antivirus binary invoked by the scan coordinator.
    #[serde(default = "default_av_binary")]
    pub scan_av_binary: String,

    /// Per-invocation antivirus timeout, in seconds. Clamped to 30.
    #[serde(default = "default_scan_timeout")]
    pub scan_av_timeout_seconds: u64,

    /// YARA binary used to evaluate the rule set.
    #[serde(default = "default_yara_binary")]
    pub scan_yara_binary: String,

    /// Directory holding the YARA rule files. YARA scanning is skipped when
    /// unset.
    #[serde(default)]
    pub scan_yara_rules_dir: Option<String>,

    /// Expected SHA-256 over the rule set. A mismatch fails scan-required
    /// flows closed.
    #[serde(default)]
    pub scan_yara_expected_hash: Option<String>,

    /// JSON map of conversion name → `{"width": .., "height": .., "crop": ..}`
    /// overriding the built-in conversion dimension table.
    #[serde(default)]
    pub avatar_sizes: Option<String>,

    /// JSON array of regexes applied to the first 64 KiB of every upload.
    /// Invalid patterns are skipped with a warning.
    #[serde(default)]
    pub suspicious_payload_patterns: Option<String>,

    /// Per-actor upload rate limit: attempts allowed per decay window.
    #[serde(default = "default_rate_limit_attempts")]
    pub rate_limit_max_attempts: u32,

    /// Rate limit decay window, in seconds.
    #[serde(default = "default_rate_limit_decay")]
    pub rate_limit_decay_seconds: u64,

    /// Cache max-age for locally served media, in seconds.
    #[serde(default = "default_local_max_age")]
    pub local_max_age_seconds: u64,

    /// TTL applied to temporary URLs minted for signed serving, in seconds.
    #[serde(default = "default_temporary_url_ttl")]
    pub s3_temporary_url_ttl_seconds: u64,

    /// Soft ceiling for one upload flow, in seconds. Exceeding it cancels
    /// the flow and maps to `UploadTimeout`.
    #[serde(default = "default_soft_timeout")]
    pub uploads_soft_timeout_seconds: u64,

    /// Ceiling after which cleanup entries are force-released even with
    /// conversions still pending, in hours.
    #[serde(default = "default_cleanup_max_age")]
    pub cleanup_max_age_hours: i64,

    /// TTL for post-processing coalescer keys, in seconds.
    #[serde(default = "default_coalesce_ttl")]
    pub postprocess_coalesce_ttl_seconds: u64,
}

fn default_disk() -> String {
    "media".into()
}

fn default_quarantine_disk() -> String {
    "quarantine".into()
}

fn default_owner_id_mode() -> String {
    "int".into()
}

fn default_quarantine_ttl() -> i64 {
    24
}

fn default_av_binary() -> String {
    "/usr/bin/clamdscan".into()
}

fn default_scan_timeout() -> u64 {
    30
}

fn default_yara_binary() -> String {
    "/usr/bin/yara".into()
}

fn default_rate_limit_attempts() -> u32 {
    10
}

fn default_rate_limit_decay() -> u64 {
    60
}

fn default_local_max_age() -> u64 {
    3600
}

fn default_temporary_url_ttl() -> u64 {
    300
}

fn default_soft_timeout() -> u64 {
    60
}

fn default_cleanup_max_age() -> i64 {
    48
}

fn default_coalesce_ttl() -> u64 {
    600
}

impl Config {
    /// Load configuration from the current process environment.
    ///
    /// Panics with a clear message if any required variable is missing.
    pub fn from_env() -> Self {
        envy::from_env::<Config>().unwrap_or_else(|err| {
            panic!("configuration error: {err}\nCheck that all required environment variables are set (see .env.example).");
        })
    }

    /// Parsed suspicious-payload patterns. Invalid entries are dropped with
    /// a warning so one bad regex never takes admission control down.
    pub fn payload_patterns(&self) -> Vec<regex::Regex> {
        let raw = match &self.suspicious_payload_patterns {
            Some(json) => match serde_json::from_str::<Vec<String>>(json) {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!("SUSPICIOUS_PAYLOAD_PATTERNS is not a JSON string array: {e}");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        raw.iter()
            .filter_map(|p| match regex::Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, "skipping invalid suspicious-payload regex: {e}");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            database_url: "sqlite::memory:".into(),
            storage_root: "/tmp".into(),
            default_disk: default_disk(),
            quarantine_disk: default_quarantine_disk(),
            profiles_path: None,
            uploads_owner_id_mode: default_owner_id_mode(),
            quarantine_pending_ttl_hours: default_quarantine_ttl(),
            scan_av_binary: default_av_binary(),
            scan_av_timeout_seconds: default_scan_timeout(),
            scan_yara_binary: default_yara_binary(),
            scan_yara_rules_dir: None,
            scan_yara_expected_hash: None,
            avatar_sizes: None,
            suspicious_payload_patterns: None,
            rate_limit_max_attempts: default_rate_limit_attempts(),
            rate_limit_decay_seconds: default_rate_limit_decay(),
            local_max_age_seconds: default_local_max_age(),
            s3_temporary_url_ttl_seconds: default_temporary_url_ttl(),
            uploads_soft_timeout_seconds: default_soft_timeout(),
            cleanup_max_age_hours: default_cleanup_max_age(),
            postprocess_coalesce_ttl_seconds: default_coalesce_ttl(),
        }
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let mut cfg = minimal();
        cfg.suspicious_payload_patterns = Some(r#"["<script", "[unclosed"]"#.into());
        let compiled = cfg.payload_patterns();
        assert_eq!(compiled.len(), 1);
        assert!(compiled[0].is_match("<script>alert(1)</script>"));
    }

    #[test]
    fn missing_patterns_yield_empty_set() {
        assert!(minimal().payload_patterns().is_empty());
    }
}
