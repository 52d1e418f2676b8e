//! Media attacher: persists an accepted artifact's metadata row inside one
//! transaction, enforcing single-file collections by superseding any
//! pre-existing record for the same owner.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CustomProperties, MediaHeaders, MediaRecord};
use crate::error::{PipelineResult, UploadError};
use crate::profiles::UploadProfile;
use crate::tenant::TenantContext;

const MEDIA_COLS: &str =
    "id, model_type, model_id, collection, disk, path, file_name, mime, size_bytes, status, \
     custom_properties, generated_conversions, responsive_images, created_at, updated_at";

#[derive(Debug)]
pub struct AttachRequest<'a> {
    pub profile: &'a UploadProfile,
    pub tenant: &'a TenantContext,
    /// Normalized owner id; empty for ownerless profiles.
    pub owner_id: &'a str,
    pub model_type: &'a str,
    pub disk: &'a str,
    /// Final relative path of the already-written blob.
    pub path: &'a str,
    pub mime: &'a str,
    pub size_bytes: u64,
    pub checksum: Option<&'a str>,
    pub correlation_id: Uuid,
    pub quarantine_id: Uuid,
    pub original_filename: &'a str,
    /// Caller-supplied custom properties; object entries land in the
    /// record's `extra` bag, anything else is ignored.
    pub meta: serde_json::Value,
}

#[derive(Debug)]
pub struct AttachOutcome {
    pub media: MediaRecord,
    /// The record this attach superseded, when the collection is single-file.
    pub superseded: Option<MediaRecord>,
}

/// Inserts the metadata row (and supersedes the previous one for
/// single-file collections) in a single transaction. Nothing is committed
/// on any error.
pub async fn attach(pool: &SqlitePool, req: AttachRequest<'_>) -> PipelineResult<AttachOutcome> {
    let media_id = Uuid::new_v4().to_string();
    let file_name = deterministic_file_name(
        &req.profile.id,
        req.checksum,
        extension_of_path(req.path),
    );

    let mut props = CustomProperties {
        tenant_id: req.tenant.tenant_id.clone(),
        upload_uuid: req.correlation_id.to_string(),
        version: req.checksum.unwrap_or_default().to_string(),
        quarantine_id: req.quarantine_id.to_string(),
        correlation_id: req.correlation_id.to_string(),
        original_filename: sanitize_filename(req.original_filename),
        headers: MediaHeaders {
            acl: "private".into(),
            content_type: req.mime.to_string(),
            content_disposition: format!(
                "inline; filename=\"{}\"",
                sanitize_filename(req.original_filename)
            ),
        },
        ..Default::default()
    };
    if let Some(meta) = req.meta.as_object() {
        for (key, value) in meta {
            props.extra.insert(key.clone(), value.clone());
        }
    }
    // Reserved keys are written after the caller bag so they always win.
    props.extra.insert(
        "profile_id".into(),
        serde_json::Value::String(req.profile.id.clone()),
    );
    for conversion in &req.profile.conversions {
        props.conversions.insert(conversion.clone(), "pending".into());
    }

    let mut tx = pool.begin().await.map_err(|_| UploadError::AttachFailed)?;

    // Single-file collections keep at most one non-superseded record per
    // owner; the replaced row is marked rather than deleted so the cleanup
    // scheduler can still resolve its blobs.
    let superseded = if req.profile.single_file {
        let previous = sqlx::query_as::<_, MediaRecord>(&format!(
            "SELECT {MEDIA_COLS} FROM media \
             WHERE model_type = ? AND model_id = ? AND collection = ? AND status = 'active' \
               AND json_extract(custom_properties, '$.tenant_id') = ? \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(req.model_type)
        .bind(req.owner_id)
        .bind(&req.profile.collection)
        .bind(&req.tenant.tenant_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|_| UploadError::AttachFailed)?;

        if let Some(prev) = &previous {
            sqlx::query(
                "UPDATE media SET status = 'superseded', \
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
            )
            .bind(&prev.id)
            .execute(&mut *tx)
            .await
            .map_err(|_| UploadError::AttachFailed)?;
        }
        previous
    } else {
        None
    };

    sqlx::query(
        "INSERT INTO media \
         (id, model_type, model_id, collection, disk, path, file_name, mime, size_bytes, \
          status, custom_properties, generated_conversions, responsive_images) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, '[]', '[]')",
    )
    .bind(&media_id)
    .bind(req.model_type)
    .bind(req.owner_id)
    .bind(&req.profile.collection)
    .bind(req.disk)
    .bind(req.path)
    .bind(&file_name)
    .bind(req.mime)
    .bind(req.size_bytes as i64)
    .bind(props.to_json())
    .execute(&mut *tx)
    .await
    .map_err(|_| UploadError::AttachFailed)?;

    tx.commit().await.map_err(|_| UploadError::AttachFailed)?;

    let media = get_media(pool, &media_id).await?;
    Ok(AttachOutcome { media, superseded })
}

/// Fetches a single media record by id.
pub async fn get_media(pool: &SqlitePool, id: &str) -> PipelineResult<MediaRecord> {
    sqlx::query_as::<_, MediaRecord>(&format!("SELECT {MEDIA_COLS} FROM media WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(UploadError::AttachFailed)
}

/// The newest active record for one owner and collection within one tenant.
///
/// Owner ids are not unique across tenants, so the lookup must be tenant-
/// scoped like every other query here — otherwise one tenant's newer upload
/// would shadow another tenant's record for the same owner id.
pub async fn latest_active(
    pool: &SqlitePool,
    model_type: &str,
    model_id: &str,
    collection: &str,
    tenant_id: &str,
) -> PipelineResult<Option<MediaRecord>> {
    let row = sqlx::query_as::<_, MediaRecord>(&format!(
        "SELECT {MEDIA_COLS} FROM media \
         WHERE model_type = ? AND model_id = ? AND collection = ? AND status = 'active' \
           AND json_extract(custom_properties, '$.tenant_id') = ? \
         ORDER BY created_at DESC, id DESC LIMIT 1"
    ))
    .bind(model_type)
    .bind(model_id)
    .bind(collection)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Returns one tenant's media records, newest first, paginated.
///
/// Tenant scoping goes through the property bag rather than a dedicated
/// column, so a record can never be listed under a tenant other than the
/// one recorded at the write.
pub async fn list_media(
    pool: &SqlitePool,
    tenant: &TenantContext,
    params: &crate::db::models::PaginationParams,
) -> PipelineResult<crate::db::models::PaginatedResponse<MediaRecord>> {
    let rows = sqlx::query_as::<_, MediaRecord>(&format!(
        "SELECT {MEDIA_COLS} FROM media \
         WHERE json_extract(custom_properties, '$.tenant_id') = ? AND status != 'deleted' \
         ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
    ))
    .bind(&tenant.tenant_id)
    .bind(params.per_page() as i64)
    .bind(params.offset() as i64)
    .fetch_all(pool)
    .await?;

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM media \
         WHERE json_extract(custom_properties, '$.tenant_id') = ? AND status != 'deleted'",
    )
    .bind(&tenant.tenant_id)
    .fetch_one(pool)
    .await?;

    Ok(crate::db::models::PaginatedResponse {
        data: rows,
        total,
        page: params.page.unwrap_or(1).max(1),
        per_page: params.per_page(),
    })
}

/// Looks a media record up by the upload uuid recorded in its property bag.
pub async fn find_by_upload_uuid(
    pool: &SqlitePool,
    upload_uuid: &str,
) -> PipelineResult<Option<MediaRecord>> {
    let row = sqlx::query_as::<_, MediaRecord>(&format!(
        "SELECT {MEDIA_COLS} FROM media \
         WHERE json_extract(custom_properties, '$.upload_uuid') = ? LIMIT 1"
    ))
    .bind(upload_uuid)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Deterministic download name: `{safe_profile}-{hash}-{rand8}.{ext}`.
///
/// `safe_profile` is the lowercase kebab of the profile id capped at 40
/// chars; `hash` is the pipeline checksum or 32 hex chars of CSPRNG when
/// missing; `ext` is 1–10 lowercase alphanumerics.
fn deterministic_file_name(profile_id: &str, checksum: Option<&str>, ext: &str) -> String {
    let safe_profile: String = profile_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(40)
        .collect();

    let hash = match checksum {
        Some(sum) if !sum.is_empty() => sum.to_string(),
        _ => {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill(&mut bytes);
            hex::encode(bytes)
        }
    };

    let rand8: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();

    let ext: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(10)
        .collect();
    let ext = if ext.is_empty() { "bin".to_string() } else { ext };

    format!("{safe_profile}-{hash}-{rand8}.{ext}")
}

fn extension_of_path(path: &str) -> &str {
    path.rsplit_once('.').map(|(_, e)| e).unwrap_or("")
}

/// Strips path components and characters that would be unsafe in a filename,
/// preserving the original extension. The result is always lowercase for
/// consistent filesystem behaviour on case-sensitive and case-insensitive
/// mounts alike.
pub fn sanitize_filename(name: &str) -> String {
    // Take only the last component — prevents directory traversal if the
    // client sends something like `../../etc/passwd`.
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    base.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
