//! Deterministic tenant-first path layout.
//!
//! Every template starts with `tenants/{tenant_id}/`, and avatar paths embed
//! a per-version uuid segment so a replacement can never share a directory
//! with the artifact it supersedes.

use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

use crate::error::UploadError;
use crate::profiles::PathCategory;

/// Inputs to path generation. `version` and `unique_id` default to the
/// current unix timestamp and a fresh UUID v4 when absent, so callers that
/// care about reproducibility (tests, replays) pin both.
#[derive(Debug, Clone)]
pub struct PathSpec<'a> {
    pub category: PathCategory,
    pub tenant_id: &'a str,
    pub owner_id: Option<&'a str>,
    pub extension: &'a str,
    pub version: Option<i64>,
    pub unique_id: Option<Uuid>,
    pub date: DateTime<Utc>,
}

/// Returns the relative path (within the profile's disk) for one artifact.
///
/// Avatars require an owner id; every other category ignores it.
pub fn path_for_profile(spec: &PathSpec<'_>) -> Result<String, UploadError> {
    let tenant = spec.tenant_id;
    let uid = spec.unique_id.unwrap_or_else(Uuid::new_v4);
    let year = spec.date.year();
    let month = spec.date.month();

    let path = match spec.category {
        PathCategory::Avatars => {
            let owner = spec.owner_id.ok_or(UploadError::OwnerRequired)?;
            let version = spec.version.unwrap_or_else(|| Utc::now().timestamp());
            format!(
                "tenants/{tenant}/users/{owner}/avatars/{uid}/v{version}.{}",
                spec.extension
            )
        }
        PathCategory::Images => format!(
            "tenants/{tenant}/media/images/{year:04}/{month:02}/{uid}.{}",
            spec.extension
        ),
        PathCategory::Documents => {
            format!("tenants/{tenant}/documents/{year:04}/{month:02}/{uid}.pdf")
        }
        PathCategory::Spreadsheets => {
            format!("tenants/{tenant}/spreadsheets/{year:04}/{month:02}/{uid}.xlsx")
        }
        PathCategory::Imports => {
            format!("tenants/{tenant}/imports/{year:04}/{month:02}/{uid}.csv")
        }
        PathCategory::Secrets => format!("tenants/{tenant}/secrets/certificates/{uid}.p12"),
        PathCategory::Other => format!(
            "tenants/{tenant}/uploads/{year:04}/{month:02}/{uid}.{}",
            spec.extension
        ),
    };

    Ok(path)
}

/// Directory holding the artifact — everything up to the final separator.
pub fn base_directory(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Directory that receives the artifact's derived conversions.
pub fn conversions_directory(path: &str) -> String {
    format!("{}/conversions", base_directory(path))
}

/// Directory that receives the artifact's responsive-image variants.
pub fn responsive_directory(path: &str) -> String {
    format!("{}/responsive-images", base_directory(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec(category: PathCategory) -> PathSpec<'static> {
        PathSpec {
            category,
            tenant_id: "7",
            owner_id: Some("42"),
            extension: "png",
            version: Some(1700000000),
            unique_id: Some(Uuid::nil()),
            date: Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn avatar_template_embeds_owner_uuid_and_version() {
        let path = path_for_profile(&spec(PathCategory::Avatars)).unwrap();
        assert_eq!(
            path,
            "tenants/7/users/42/avatars/00000000-0000-0000-0000-000000000000/v1700000000.png"
        );
    }

    #[test]
    fn avatar_without_owner_is_rejected() {
        let mut s = spec(PathCategory::Avatars);
        s.owner_id = None;
        assert!(matches!(
            path_for_profile(&s),
            Err(UploadError::OwnerRequired)
        ));
    }

    #[test]
    fn dated_templates_use_zero_padded_year_month() {
        let path = path_for_profile(&spec(PathCategory::Images)).unwrap();
        assert_eq!(
            path,
            "tenants/7/media/images/2026/03/00000000-0000-0000-0000-000000000000.png"
        );
        let docs = path_for_profile(&spec(PathCategory::Documents)).unwrap();
        assert!(docs.ends_with(".pdf"));
        let imports = path_for_profile(&spec(PathCategory::Imports)).unwrap();
        assert!(imports.starts_with("tenants/7/imports/2026/03/"));
        assert!(imports.ends_with(".csv"));
    }

    #[test]
    fn secrets_are_undated() {
        let path = path_for_profile(&spec(PathCategory::Secrets)).unwrap();
        assert_eq!(
            path,
            "tenants/7/secrets/certificates/00000000-0000-0000-0000-000000000000.p12"
        );
    }

    #[test]
    fn generation_is_pure() {
        let a = path_for_profile(&spec(PathCategory::Avatars)).unwrap();
        let b = path_for_profile(&spec(PathCategory::Avatars)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn directory_helpers() {
        let path = "tenants/7/users/42/avatars/u/v1.png";
        assert_eq!(base_directory(path), "tenants/7/users/42/avatars/u");
        assert_eq!(
            conversions_directory(path),
            "tenants/7/users/42/avatars/u/conversions"
        );
        assert_eq!(
            responsive_directory(path),
            "tenants/7/users/42/avatars/u/responsive-images"
        );
    }
}
