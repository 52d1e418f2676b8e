use std::sync::Arc;
use std::time::Duration;

use crate::quarantine::QuarantineStore;
use crate::services::cleanup::CleanupScheduler;
use crate::services::postprocess::Coalescer;
use crate::services::ratelimit::RateLimiter;

/// How many cleanup entries one purge pass may release.
const PURGE_CHUNK: i64 = 100;

/// Spawns a long-lived tokio task that wakes up every 60 seconds and runs
/// all scheduled maintenance work. Errors are logged but never fatal — a
/// transient disk or DB hiccup should not take the service down.
pub fn spawn_maintenance(
    quarantine: Arc<QuarantineStore>,
    cleanup: Arc<CleanupScheduler>,
    coalescer: Arc<Coalescer>,
    limiter: Arc<RateLimiter>,
    quarantine_ttl_hours: i64,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            run_maintenance(
                &quarantine,
                &cleanup,
                &coalescer,
                &limiter,
                quarantine_ttl_hours,
            )
            .await;
        }
    });
}

/// Runs one maintenance pass. Each step is intentionally independent: a
/// failure in one is logged and the next still runs, and the following
/// invocation (60 s later) retries cleanly.
pub async fn run_maintenance(
    quarantine: &QuarantineStore,
    cleanup: &CleanupScheduler,
    coalescer: &Coalescer,
    limiter: &RateLimiter,
    quarantine_ttl_hours: i64,
) {
    // 1. Expired quarantine entries: blobs whose TTL elapsed without the
    //    pipeline accepting or rejecting them.
    if let Err(e) = quarantine.prune_stale(quarantine_ttl_hours).await {
        tracing::error!("quarantine prune failed: {e}");
    }

    // 2. Half-written quarantine leftovers from crashes.
    if let Err(e) = quarantine.cleanup_orphaned_sidecars().await {
        tracing::error!("orphaned sidecar sweep failed: {e}");
    }

    // 3. Cleanup entries stuck past the ceiling (lost conversion events).
    if let Err(e) = cleanup.purge_expired(None, PURGE_CHUNK).await {
        tracing::error!("cleanup purge failed: {e}");
    }

    // 4. In-memory state hygiene.
    coalescer.sweep();
    limiter.sweep();
}
