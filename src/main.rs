use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use intake::config::Config;
use intake::db;
use intake::events::{DomainEvent, InProcessEventBus, InProcessJobBus, Job};
use intake::profiles::ProfileRegistry;
use intake::quarantine::QuarantineStore;
use intake::scan::yara::YaraScanner;
use intake::services::cleanup::CleanupScheduler;
use intake::services::health::HealthCheck;
use intake::services::postprocess::{Coalescer, PostProcessor};
use intake::services::ratelimit::RateLimiter;
use intake::storage::LocalStorage;
use intake::tasks;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before anything else so variables are available to both the
    // tracing filter and Config::from_env().
    dotenvy::dotenv().ok(); // .ok() — missing file is fine in production

    // Structured tracing. Level controlled via RUST_LOG env var; defaults to
    // "info" if unset.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    // Fail fast on unparseable admission settings instead of surfacing them
    // on the first upload.
    let owner_mode = intake::owner::OwnerIdMode::parse(&config.uploads_owner_id_mode)
        .unwrap_or_else(|| {
            panic!(
                "invalid UPLOADS_OWNER_ID_MODE '{}' (expected int, uuid, ulid, or string-any)",
                config.uploads_owner_id_mode
            )
        });
    info!(mode = ?owner_mode, patterns = config.payload_patterns().len(), "admission configuration loaded");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(|s| s.as_str()) {
        // Scheduled invocations of core maintenance operations.
        Some("prune") => prune(&config, &args[1..]).await,
        Some("cleanup-sidecars") => cleanup_sidecars(&config).await,
        Some(other) => {
            eprintln!("unknown command '{other}' (expected: prune, cleanup-sidecars)");
            ExitCode::FAILURE
        }
        None => serve(config).await,
    }
}

fn quarantine_store(config: &Config) -> QuarantineStore {
    let root = std::path::Path::new(&config.storage_root).join(&config.quarantine_disk);
    QuarantineStore::new(root, config.quarantine_disk.clone())
}

/// `intake prune [--hours=N]` — removes quarantine entries older than their
/// TTL (falling back to N hours, default 24, for unreadable sidecars).
async fn prune(config: &Config, args: &[String]) -> ExitCode {
    let hours = args
        .iter()
        .find_map(|a| a.strip_prefix("--hours="))
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(24);

    match quarantine_store(config).prune_stale(hours).await {
        Ok(removed) => {
            info!(removed, "quarantine prune finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("quarantine prune failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// `intake cleanup-sidecars` — removes quarantine files whose counterpart
/// (blob or sidecar) is missing.
async fn cleanup_sidecars(config: &Config) -> ExitCode {
    match quarantine_store(config).cleanup_orphaned_sidecars().await {
        Ok(removed) => {
            info!(removed, "orphaned sidecar cleanup finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("orphaned sidecar cleanup failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Runs the queue worker, event listener, and maintenance loop until
/// interrupted.
async fn serve(config: Config) -> ExitCode {
    // Ensure the disk roots exist so the pipeline can write immediately.
    let quarantine_root =
        std::path::Path::new(&config.storage_root).join(&config.quarantine_disk);
    for dir in [
        std::path::Path::new(&config.storage_root).join(&config.default_disk),
        quarantine_root.clone(),
    ] {
        std::fs::create_dir_all(&dir).unwrap_or_else(|e| {
            panic!("failed to create storage directory '{}': {e}", dir.display());
        });
    }

    let pool = db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database and run migrations");

    // Profile registry: deployment document when configured, built-in
    // defaults otherwise. Fails fast on an unreadable or invalid document.
    let registry = Arc::new(match &config.profiles_path {
        Some(path) => {
            let doc = std::fs::read_to_string(path)
                .unwrap_or_else(|e| panic!("failed to read profile document '{path}': {e}"));
            ProfileRegistry::from_document(
                &doc,
                config.default_disk.clone(),
                config.avatar_sizes.as_deref(),
            )
            .unwrap_or_else(|e| panic!("invalid profile document '{path}': {e}"))
        }
        None => ProfileRegistry::builtin(config.default_disk.clone(), config.avatar_sizes.as_deref()),
    });

    let storage = Arc::new(LocalStorage::new(&config.storage_root));
    let quarantine = Arc::new(quarantine_store(&config));
    let cleanup = Arc::new(CleanupScheduler::new(
        pool.clone(),
        storage.clone(),
        config.cleanup_max_age_hours,
    ));
    let coalescer = Arc::new(Coalescer::new(config.postprocess_coalesce_ttl_seconds));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max_attempts,
        config.rate_limit_decay_seconds,
    ));

    let yara = config.scan_yara_rules_dir.as_ref().map(|dir| {
        Arc::new(YaraScanner::new(
            config.scan_yara_binary.clone(),
            dir.clone(),
            config.scan_yara_expected_hash.clone(),
            config.scan_av_timeout_seconds,
        ))
    });

    // Verify the YARA rule set once at boot so tampering is visible
    // immediately, not only on the first scan-required upload.
    if let Some(yara) = &yara {
        match yara.verify_rules().await {
            Ok(()) => info!("yara rule set integrity verified"),
            Err(e) => error!("yara rule set integrity check failed at boot: {e}"),
        }
    }

    // The event bus sender is what the embedding application dispatches
    // through; keeping it alive here keeps the listener loop running.
    let (_events, mut event_rx) = InProcessEventBus::new();
    let (jobs, mut job_rx) = InProcessJobBus::new();

    let processor = Arc::new(PostProcessor::new(
        pool.clone(),
        storage.clone(),
        registry.clone(),
        cleanup.clone(),
        coalescer.clone(),
        jobs.clone(),
    ));

    // Event listener: turns post-commit domain events into coalesced
    // processing requests.
    let listener = processor.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let media_id = match &event {
                DomainEvent::AvatarUpdated { new_media_id, .. } => Some(new_media_id.clone()),
                DomainEvent::MediaUpdated { new_media_id, .. } => Some(new_media_id.clone()),
                DomainEvent::AvatarDeleted { .. } => None,
            };
            if let Some(media_id) = media_id {
                if let Err(e) = listener.on_media_updated(&media_id, None).await {
                    error!(media = %media_id, "post-processing listener failed: {e}");
                }
            }
        }
    });

    // Queue worker: exclusively executes post-processing jobs.
    let worker = processor.clone();
    tokio::spawn(async move {
        while let Some(job) = job_rx.recv().await {
            let Job::PostProcess {
                tenant_id,
                owner_id,
            } = job;
            if let Err(e) = worker.run(&tenant_id, &owner_id).await {
                error!(tenant = %tenant_id, owner = %owner_id, "post-processing job failed: {e}");
            }
        }
    });

    tasks::spawn_maintenance(
        quarantine.clone(),
        cleanup.clone(),
        coalescer.clone(),
        limiter.clone(),
        config.quarantine_pending_ttl_hours,
    );

    // One health pass at boot, logged for operators.
    let health = HealthCheck::new(
        quarantine_root,
        storage.clone(),
        config.default_disk.clone(),
        config.scan_av_binary.clone(),
        yara,
        jobs.clone(),
    );
    for (name, probe) in health.run().await {
        if probe.ok {
            info!(probe = %name, detail = %probe.detail, "health ok");
        } else {
            error!(probe = %name, detail = %probe.detail, "health failed");
        }
    }

    info!("intake workers running; press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to wait for shutdown signal: {e}");
        return ExitCode::FAILURE;
    }
    info!("shutting down");
    ExitCode::SUCCESS
}
