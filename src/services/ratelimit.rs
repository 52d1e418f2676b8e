//! Per-actor upload rate limiting: a sliding window of attempt timestamps
//! per actor id, bounded by `RATE_LIMIT_MAX_ATTEMPTS` per
//! `RATE_LIMIT_DECAY_SECONDS`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::UploadError;

#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    decay: Duration,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, decay_seconds: u64) -> Self {
        Self {
            max_attempts,
            decay: Duration::from_secs(decay_seconds),
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records one attempt for `actor_id` and fails when the window is full.
    /// An attempt that is rejected here still counts — retry-hammering does
    /// not reset the window.
    pub fn check(&self, actor_id: &str) -> Result<(), UploadError> {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let window = hits.entry(actor_id.to_string()).or_default();
        window.retain(|t| now.duration_since(*t) < self.decay);
        window.push(now);
        if window.len() as u32 > self.max_attempts {
            return Err(UploadError::RateLimited);
        }
        Ok(())
    }

    /// Drops actors whose whole window has decayed. Called from the
    /// maintenance loop so idle actors do not accumulate.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.retain(|_, window| {
            window.retain(|t| now.duration_since(*t) < self.decay);
            !window.is_empty()
        });
    }
}
