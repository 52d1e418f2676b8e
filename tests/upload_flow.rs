//! End-to-end pipeline tests: full uploads against tempdir disks and an
//! in-memory metadata store, with scanners faked at the trait seam.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use intake::db;
use intake::events::{DomainEvent, InProcessEventBus, InProcessJobBus, Job, JobReceiver};
use intake::profiles::ProfileRegistry;
use intake::quarantine::QuarantineStore;
use intake::scan::{ScanCoordinator, ScanVerdict, Scanner};
use intake::services::cleanup::CleanupScheduler;
use intake::services::postprocess::{Coalescer, PostProcessor, ProcessingStatus};
use intake::services::ratelimit::RateLimiter;
use intake::services::security_log;
use intake::services::upload::{UploadPipeline, UploadRequest, UploadStatus};
use intake::storage::{LocalStorage, Storage};
use intake::tenant::{Actor, TenantContext};

/// Substring that makes the fake antivirus report an infection.
const FAKE_AV_MARKER: &[u8] = b"EICAR-FAKE-SIGNATURE";

struct FakeAv;

#[async_trait]
impl Scanner for FakeAv {
    fn name(&self) -> &str {
        "clamav"
    }

    async fn scan(&self, path: &Path) -> ScanVerdict {
        let bytes = tokio::fs::read(path).await.unwrap_or_default();
        if bytes
            .windows(FAKE_AV_MARKER.len())
            .any(|w| w == FAKE_AV_MARKER)
        {
            ScanVerdict::Infected {
                signatures: vec!["Eicar-Test-Signature".into()],
            }
        } else {
            ScanVerdict::Clean
        }
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    pool: sqlx::SqlitePool,
    storage: Arc<LocalStorage>,
    quarantine: Arc<QuarantineStore>,
    pipeline: UploadPipeline,
    processor: Arc<PostProcessor>,
    events_rx: UnboundedReceiver<DomainEvent>,
    jobs_rx: JobReceiver,
}

async fn harness(registry: ProfileRegistry) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    let storage = Arc::new(LocalStorage::new(tmp.path().join("disks")));
    let quarantine = Arc::new(QuarantineStore::new(
        tmp.path().join("disks/quarantine"),
        "quarantine",
    ));
    let registry = Arc::new(registry);
    let cleanup = Arc::new(CleanupScheduler::new(pool.clone(), storage.clone(), 48));
    let limiter = Arc::new(RateLimiter::new(100, 60));
    let coalescer = Arc::new(Coalescer::new(600));
    let (events, events_rx) = InProcessEventBus::new();
    let (jobs, jobs_rx) = InProcessJobBus::new();
    let scanners = Arc::new(ScanCoordinator::new(vec![Box::new(FakeAv)]));

    let work_dir = tmp.path().join("work");
    std::fs::create_dir_all(&work_dir).unwrap();

    let pipeline = UploadPipeline::new(
        registry.clone(),
        quarantine.clone(),
        storage.clone(),
        scanners,
        events.clone(),
        cleanup.clone(),
        limiter,
        pool.clone(),
        intake::owner::OwnerIdMode::Int,
        60,
        300,
        Vec::new(),
        work_dir,
    );

    let processor = Arc::new(PostProcessor::new(
        pool.clone(),
        storage.clone(),
        registry,
        cleanup,
        coalescer,
        jobs,
    ));

    Harness {
        _tmp: tmp,
        pool,
        storage,
        quarantine,
        pipeline,
        processor,
        events_rx,
        jobs_rx,
    }
}

fn png_bytes(w: u32, h: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_fn(w, h, |x, y| {
        image::Rgba([(x % 251) as u8, (y % 241) as u8, 99, 255])
    });
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn jpeg_bytes(w: u32, h: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(w, h, image::Rgb([120, 130, 140]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

fn avatar_request<'a>(bytes: &'a [u8], filename: &'a str) -> UploadRequest<'a> {
    UploadRequest {
        profile_id: "avatar_image",
        owner_id: Some("42"),
        bytes,
        original_filename: filename,
        correlation_id: None,
        meta: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn happy_path_avatar_upload() {
    let mut h = harness(ProfileRegistry::builtin("media", None)).await;
    let tenant = TenantContext::new("7");
    let actor = Actor::new("42");
    let png = png_bytes(120, 120);

    let stored = h
        .pipeline
        .upload(&tenant, &actor, avatar_request(&png, "avatar.png"))
        .await
        .expect("upload should succeed");

    assert_eq!(stored.status, UploadStatus::Stored);
    assert_eq!(stored.mime, "image/png");
    assert!(stored.path.starts_with("tenants/7/users/42/avatars/"));
    let name = stored.path.rsplit('/').next().unwrap();
    assert!(name.starts_with('v') && name.ends_with(".png"));

    // The blob really is at the assigned path with the reported size.
    assert_eq!(
        h.storage.size(&stored.disk, &stored.path).await.unwrap(),
        Some(stored.size_bytes)
    );

    // Quarantine left nothing behind.
    assert!(!h.quarantine.blob_path(stored.correlation_id).exists());

    // Domain event fired after commit, not replaced.
    match h.events_rx.try_recv().unwrap() {
        DomainEvent::AvatarUpdated {
            user_id,
            new_media_id,
            replaced,
            old_media_id,
            ..
        } => {
            assert_eq!(user_id, "42");
            assert_eq!(new_media_id, stored.id);
            assert!(!replaced);
            assert!(old_media_id.is_none());
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn replacement_supersedes_and_cleans_up_previous() {
    let mut h = harness(ProfileRegistry::builtin("media", None)).await;
    let tenant = TenantContext::new("7");
    let actor = Actor::new("42");

    let png = png_bytes(120, 120);
    let first = h
        .pipeline
        .upload(&tenant, &actor, avatar_request(&png, "avatar.png"))
        .await
        .unwrap();
    let _ = h.events_rx.try_recv();

    // Let the first upload's conversions complete before the replacement.
    h.processor.on_media_updated(&first.id, None).await.unwrap();
    assert!(h.jobs_rx.recv().await.is_some());
    h.processor.run("7", "42").await.unwrap();
    let old_base = first.path.rsplit_once('/').unwrap().0.to_string();
    assert!(h
        .storage
        .exists("media", &format!("{old_base}/conversions/thumb.webp"))
        .await
        .unwrap());

    let jpg = jpeg_bytes(200, 200);
    let second = h
        .pipeline
        .replace(&tenant, &actor, avatar_request(&jpg, "avatar.jpg"))
        .await
        .unwrap();
    assert_eq!(second.previous.as_deref(), Some(first.id.as_str()));
    assert_ne!(second.new.id, first.id);

    match h.events_rx.try_recv().unwrap() {
        DomainEvent::AvatarUpdated {
            replaced,
            old_media_id,
            ..
        } => {
            assert!(replaced);
            assert_eq!(old_media_id.as_deref(), Some(first.id.as_str()));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // All conversions of the previous media were complete, so its whole
    // directory tree is gone already; the new artifact is untouched.
    assert!(!h.storage.exists("media", &first.path).await.unwrap());
    assert!(!h
        .storage
        .exists("media", &format!("{old_base}/conversions/thumb.webp"))
        .await
        .unwrap());
    assert!(h
        .storage
        .exists(&second.new.disk, &second.new.path)
        .await
        .unwrap());

    // Exactly one active record for the owner.
    let active: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM media WHERE model_id = '42' AND collection = 'avatar' \
         AND status = 'active'",
    )
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(active, 1);
}

#[tokio::test]
async fn polyglot_pdf_is_rejected_with_security_log() {
    let h = harness(ProfileRegistry::builtin("media", None)).await;
    let tenant = TenantContext::new("7");
    let actor = Actor::new("9");

    let evil = b"%PDF-1.4\n<?php system($_GET[x]);?>".to_vec();
    let failure = h
        .pipeline
        .upload(
            &tenant,
            &actor,
            UploadRequest {
                profile_id: "document_pdf",
                owner_id: Some("9"),
                bytes: &evil,
                original_filename: "evil.pdf",
                correlation_id: None,
                meta: serde_json::Value::Null,
            },
        )
        .await
        .expect_err("polyglot must be rejected");

    assert!(matches!(
        failure.error,
        intake::error::UploadError::PolyglotDetected
    ));

    // Quarantine blob deleted, no metadata row committed.
    assert!(!h.quarantine.blob_path(failure.correlation_id).exists());
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    // Security log has the reason and the filename hash, never the name.
    let events = security_log::recent(&h.pool, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, "polyglot_detected");
    assert_eq!(events[0].filename_hash, security_log::hash_filename("evil.pdf"));
    assert_eq!(events[0].correlation_id, failure.correlation_id.to_string());
}

#[tokio::test]
async fn infected_file_fails_required_scan() {
    let mut h = harness(ProfileRegistry::builtin("media", None)).await;
    let tenant = TenantContext::new("7");
    let actor = Actor::new("9");

    let mut infected = b"%PDF-1.4 body ".to_vec();
    infected.extend_from_slice(FAKE_AV_MARKER);
    let correlation = Uuid::new_v4();

    let failure = h
        .pipeline
        .upload(
            &tenant,
            &actor,
            UploadRequest {
                profile_id: "document_pdf",
                owner_id: Some("9"),
                bytes: &infected,
                original_filename: "report.pdf",
                correlation_id: Some(correlation),
                meta: serde_json::Value::Null,
            },
        )
        .await
        .expect_err("infected upload must fail");

    assert_eq!(failure.correlation_id, correlation);
    match &failure.error {
        intake::error::UploadError::VirusDetected { scanner, signatures } => {
            assert_eq!(scanner, "clamav");
            assert_eq!(signatures, &vec!["Eicar-Test-Signature".to_string()]);
        }
        other => panic!("unexpected error {other:?}"),
    }

    // Token rejected, no event emitted, no metadata.
    assert!(!h.quarantine.blob_path(correlation).exists());
    assert!(h.events_rx.try_recv().is_err());
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn pixel_ratio_bomb_is_rejected() {
    // A profile that admits huge declared dimensions but a tight pixel
    // ratio, so the bomb guard (not the dimension bound) fires.
    let doc = r#"{"profiles": [{
        "id": "wide_image", "kind": "image", "processing": "none", "scan": "disabled",
        "serving": "public", "path_category": "images", "collection": "images",
        "constraints": {
            "max_size_bytes": 10485760,
            "allowed_mime_types": ["image/png"],
            "allowed_extensions": ["png"],
            "max_width": 100000, "max_height": 100000,
            "max_pixel_ratio": 256
        }
    }]}"#;
    let h = harness(ProfileRegistry::from_document(doc, "media", None).unwrap()).await;
    let tenant = TenantContext::new("7");
    let actor = Actor::new("1");

    let bomb = png_bytes(600, 600); // min edge 600 > ratio cap 256
    let failure = h
        .pipeline
        .upload(
            &tenant,
            &actor,
            UploadRequest {
                profile_id: "wide_image",
                owner_id: None,
                bytes: &bomb,
                original_filename: "bomb.png",
                correlation_id: None,
                meta: serde_json::Value::Null,
            },
        )
        .await
        .expect_err("bomb must be rejected");

    assert!(matches!(
        failure.error,
        intake::error::UploadError::SuspiciousRatio
    ));
    assert!(!h.quarantine.blob_path(failure.correlation_id).exists());
}

#[tokio::test]
async fn rapid_uploads_coalesce_to_one_job_for_latest_media() {
    let mut h = harness(ProfileRegistry::builtin("media", None)).await;
    let tenant = TenantContext::new("7");
    let actor = Actor::new("42");
    let png = png_bytes(96, 96);

    let mut uploads = Vec::new();
    for _ in 0..3 {
        let stored = h
            .pipeline
            .upload(&tenant, &actor, avatar_request(&png, "avatar.png"))
            .await
            .unwrap();
        let _ = h.events_rx.try_recv();
        h.processor.on_media_updated(&stored.id, None).await.unwrap();
        uploads.push(stored);
    }

    // Exactly one job queued for the key, observing the third upload.
    let job = h.jobs_rx.recv().await.unwrap();
    assert_eq!(
        job,
        Job::PostProcess {
            tenant_id: "7".into(),
            owner_id: "42".into(),
        }
    );
    assert!(
        tokio::time::timeout(std::time::Duration::from_millis(50), h.jobs_rx.recv())
            .await
            .is_err(),
        "no second job may be queued"
    );

    h.processor.run("7", "42").await.unwrap();

    let latest_uuid = uploads[2].correlation_id.to_string();
    let first_uuid = uploads[0].correlation_id.to_string();
    assert_eq!(
        h.processor.status(&latest_uuid).await.unwrap(),
        ProcessingStatus::Completed
    );
    assert_eq!(
        h.processor.status(&first_uuid).await.unwrap(),
        ProcessingStatus::Superseded
    );

    // The third upload's conversions exist on disk.
    let base = uploads[2].path.rsplit_once('/').unwrap().0;
    for name in ["thumb", "medium", "large"] {
        assert!(h
            .storage
            .exists("media", &format!("{base}/conversions/{name}.webp"))
            .await
            .unwrap());
    }
}

#[tokio::test]
async fn owner_id_is_normalized_per_mode() {
    let h = harness(ProfileRegistry::builtin("media", None)).await;
    let tenant = TenantContext::new("7");
    let actor = Actor::new("42");
    let png = png_bytes(64, 64);

    let failure = h
        .pipeline
        .upload(
            &tenant,
            &actor,
            UploadRequest {
                profile_id: "avatar_image",
                owner_id: Some("42.0"),
                bytes: &png,
                original_filename: "avatar.png",
                correlation_id: None,
                meta: serde_json::Value::Null,
            },
        )
        .await
        .expect_err("float owner id must be rejected in int mode");
    assert!(matches!(
        failure.error,
        intake::error::UploadError::InvalidOwnerId
    ));

    let failure = h
        .pipeline
        .upload(
            &tenant,
            &actor,
            UploadRequest {
                profile_id: "avatar_image",
                owner_id: None,
                bytes: &png,
                original_filename: "avatar.png",
                correlation_id: None,
                meta: serde_json::Value::Null,
            },
        )
        .await
        .expect_err("avatar without owner must be rejected");
    assert!(matches!(
        failure.error,
        intake::error::UploadError::OwnerRequired
    ));
}

#[tokio::test]
async fn status_is_tenant_scoped_for_shared_owner_ids() {
    let mut h = harness(ProfileRegistry::builtin("media", None)).await;
    let actor = Actor::new("42");
    let png = png_bytes(96, 96);

    // Two tenants whose users happen to share owner id "42" and the avatar
    // collection. Neither upload may shadow the other.
    let in_seven = h
        .pipeline
        .upload(&TenantContext::new("7"), &actor, avatar_request(&png, "avatar.png"))
        .await
        .unwrap();
    let _ = h.events_rx.try_recv();
    h.processor.on_media_updated(&in_seven.id, None).await.unwrap();

    let in_eight = h
        .pipeline
        .upload(&TenantContext::new("8"), &actor, avatar_request(&png, "avatar.png"))
        .await
        .unwrap();
    let _ = h.events_rx.try_recv();
    h.processor.on_media_updated(&in_eight.id, None).await.unwrap();

    // Tenant 8's newer upload must not mark tenant 7's as superseded.
    let seven_uuid = in_seven.correlation_id.to_string();
    let eight_uuid = in_eight.correlation_id.to_string();
    assert_eq!(
        h.processor.status(&seven_uuid).await.unwrap(),
        ProcessingStatus::Processing
    );
    assert_eq!(
        h.processor.status(&eight_uuid).await.unwrap(),
        ProcessingStatus::Processing
    );

    // Each (tenant, owner) key got its own job; completing tenant 7's
    // conversions changes only tenant 7's status.
    assert!(h.jobs_rx.recv().await.is_some());
    assert!(h.jobs_rx.recv().await.is_some());
    h.processor.run("7", "42").await.unwrap();
    assert_eq!(
        h.processor.status(&seven_uuid).await.unwrap(),
        ProcessingStatus::Completed
    );
    assert_eq!(
        h.processor.status(&eight_uuid).await.unwrap(),
        ProcessingStatus::Processing
    );
}
