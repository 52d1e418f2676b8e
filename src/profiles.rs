//! Upload profiles: the canonical map from profile id to admission rules,
//! conversions, TTLs, and serving mode.
//!
//! The registry is built once at startup — either from a JSON document on
//! disk or from the built-in default document — and is immutable afterwards.
//! Handlers share it behind an `Arc`.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::UploadError;

// ─── Closed profile vocabulary ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    Image,
    Document,
    Spreadsheet,
    Import,
    Secret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    ImagePipeline,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Required,
    Optional,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServingMode {
    ControllerSigned,
    PrivateSigned,
    Public,
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathCategory {
    Avatars,
    Images,
    Documents,
    Spreadsheets,
    Imports,
    Secrets,
    Other,
}

// ─── Constraints ──────────────────────────────────────────────────────────────

/// One entry of the ordered magic-signature allowlist: a lowercase hex prefix
/// of the file's first bytes plus a human-readable label for logs.
#[derive(Debug, Clone, Deserialize)]
pub struct MagicSignature {
    pub hex: String,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileConstraints {
    pub max_size_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub allowed_signatures: Vec<MagicSignature>,
    #[serde(default)]
    pub enforce_strict_magic_bytes: bool,
    #[serde(default)]
    pub prevent_polyglot_files: bool,
    #[serde(default)]
    pub min_width: Option<u32>,
    #[serde(default)]
    pub min_height: Option<u32>,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub max_height: Option<u32>,
    /// Upper bound on `w*h / max(w,h)` — blocks decompression bombs whose
    /// declared pixel count dwarfs their byte size.
    #[serde(default)]
    pub max_pixel_ratio: Option<f64>,
}

// ─── Profile ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct UploadProfile {
    pub id: String,
    pub kind: ProfileKind,
    pub processing: ProcessingMode,
    pub scan: ScanMode,
    pub serving: ServingMode,
    pub path_category: PathCategory,
    #[serde(default)]
    pub single_file: bool,
    #[serde(default)]
    pub requires_image_normalization: bool,
    #[serde(default)]
    pub conversions: Vec<String>,
    pub constraints: FileConstraints,
    #[serde(default = "default_uses_quarantine")]
    pub uses_quarantine: bool,
    #[serde(default = "default_quarantine_ttl")]
    pub quarantine_ttl_hours: i64,
    #[serde(default = "default_failed_ttl")]
    pub failed_ttl_hours: i64,
    pub collection: String,
    /// Disk override; when absent the registry's default disk applies.
    #[serde(default)]
    pub disk: Option<String>,
}

fn default_uses_quarantine() -> bool {
    true
}

fn default_quarantine_ttl() -> i64 {
    24
}

fn default_failed_ttl() -> i64 {
    6
}

// ─── Conversion dimension table ───────────────────────────────────────────────

/// Output geometry for one named conversion.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConversionSpec {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub crop: bool,
}

/// Built-in dimension table, overridable per deployment via `AVATAR_SIZES`.
fn builtin_conversion_sizes() -> HashMap<String, ConversionSpec> {
    HashMap::from([
        (
            "thumb".to_string(),
            ConversionSpec {
                width: 200,
                height: 200,
                crop: true,
            },
        ),
        (
            "medium".to_string(),
            ConversionSpec {
                width: 800,
                height: 800,
                crop: false,
            },
        ),
        (
            "large".to_string(),
            ConversionSpec {
                width: 1600,
                height: 1600,
                crop: false,
            },
        ),
    ])
}

// ─── Registry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    profiles: Vec<UploadProfile>,
}

/// Process-wide immutable profile map. Mutation after startup is not
/// expressible: the struct has no `&mut` surface.
#[derive(Debug)]
pub struct ProfileRegistry {
    profiles: HashMap<String, UploadProfile>,
    default_disk: String,
    conversion_sizes: HashMap<String, ConversionSpec>,
}

impl ProfileRegistry {
    /// Builds the registry from a JSON document string.
    ///
    /// `size_overrides` is the parsed `AVATAR_SIZES` map; entries replace the
    /// built-in dimension table per conversion name.
    pub fn from_document(
        document: &str,
        default_disk: impl Into<String>,
        size_overrides: Option<&str>,
    ) -> Result<Self, serde_json::Error> {
        let doc: RegistryDocument = serde_json::from_str(document)?;
        let mut conversion_sizes = builtin_conversion_sizes();
        if let Some(raw) = size_overrides {
            let overrides: HashMap<String, ConversionSpec> = serde_json::from_str(raw)?;
            conversion_sizes.extend(overrides);
        }
        Ok(Self {
            profiles: doc
                .profiles
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect(),
            default_disk: default_disk.into(),
            conversion_sizes,
        })
    }

    /// The built-in default document covering the standard six profiles.
    pub fn builtin(default_disk: impl Into<String>, size_overrides: Option<&str>) -> Self {
        Self::from_document(DEFAULT_DOCUMENT, default_disk, size_overrides)
            .expect("built-in profile document is valid")
    }

    pub fn get(&self, id: &str) -> Result<&UploadProfile, UploadError> {
        self.profiles.get(id).ok_or(UploadError::ProfileNotFound)
    }

    /// The disk this profile's artifacts land on: its own, or the configured
    /// default.
    pub fn effective_disk<'a>(&'a self, profile: &'a UploadProfile) -> &'a str {
        profile.disk.as_deref().unwrap_or(&self.default_disk)
    }

    pub fn conversion_spec(&self, name: &str) -> Option<&ConversionSpec> {
        self.conversion_sizes.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UploadProfile> {
        self.profiles.values()
    }
}

/// Default registry document. Deployments that need different admission
/// rules ship their own JSON and point `PROFILES_PATH` at it.
const DEFAULT_DOCUMENT: &str = r#"{
  "profiles": [
    {
      "id": "avatar_image",
      "kind": "image",
      "processing": "image-pipeline",
      "scan": "required",
      "serving": "controller-signed",
      "path_category": "avatars",
      "single_file": true,
      "requires_image_normalization": true,
      "conversions": ["thumb", "medium", "large"],
      "collection": "avatar",
      "constraints": {
        "max_size_bytes": 5242880,
        "allowed_mime_types": ["image/jpeg", "image/png", "image/webp"],
        "allowed_extensions": ["jpg", "jpeg", "png", "webp"],
        "allowed_signatures": [
          {"hex": "ffd8ff", "label": "jpeg"},
          {"hex": "89504e47", "label": "png"},
          {"hex": "52494646", "label": "webp"}
        ],
        "enforce_strict_magic_bytes": true,
        "prevent_polyglot_files": true,
        "min_width": 32,
        "min_height": 32,
        "max_width": 4096,
        "max_height": 4096,
        "max_pixel_ratio": 4096
      }
    },
    {
      "id": "gallery_image",
      "kind": "image",
      "processing": "image-pipeline",
      "scan": "required",
      "serving": "public",
      "path_category": "images",
      "requires_image_normalization": true,
      "conversions": ["thumb", "medium", "large"],
      "collection": "images",
      "constraints": {
        "max_size_bytes": 15728640,
        "allowed_mime_types": ["image/jpeg", "image/png", "image/webp"],
        "allowed_extensions": ["jpg", "jpeg", "png", "webp"],
        "allowed_signatures": [
          {"hex": "ffd8ff", "label": "jpeg"},
          {"hex": "89504e47", "label": "png"},
          {"hex": "52494646", "label": "webp"}
        ],
        "enforce_strict_magic_bytes": true,
        "prevent_polyglot_files": true,
        "min_width": 16,
        "min_height": 16,
        "max_width": 8192,
        "max_height": 8192,
        "max_pixel_ratio": 8192
      }
    },
    {
      "id": "document_pdf",
      "kind": "document",
      "processing": "none",
      "scan": "required",
      "serving": "private-signed",
      "path_category": "documents",
      "collection": "documents",
      "constraints": {
        "max_size_bytes": 26214400,
        "allowed_mime_types": ["application/pdf"],
        "allowed_extensions": ["pdf"],
        "allowed_signatures": [{"hex": "25504446", "label": "pdf"}],
        "enforce_strict_magic_bytes": true,
        "prevent_polyglot_files": true
      }
    },
    {
      "id": "spreadsheet_xlsx",
      "kind": "spreadsheet",
      "processing": "none",
      "scan": "required",
      "serving": "private-signed",
      "path_category": "spreadsheets",
      "collection": "spreadsheets",
      "constraints": {
        "max_size_bytes": 26214400,
        "allowed_mime_types": [
          "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
          "application/zip"
        ],
        "allowed_extensions": ["xlsx"],
        "allowed_signatures": [{"hex": "504b0304", "label": "zip"}],
        "enforce_strict_magic_bytes": true
      }
    },
    {
      "id": "import_csv",
      "kind": "import",
      "processing": "none",
      "scan": "optional",
      "serving": "forbidden",
      "path_category": "imports",
      "collection": "imports",
      "constraints": {
        "max_size_bytes": 52428800,
        "allowed_mime_types": ["text/csv", "text/plain"],
        "allowed_extensions": ["csv"],
        "prevent_polyglot_files": true
      }
    },
    {
      "id": "secret_certificate",
      "kind": "secret",
      "processing": "none",
      "scan": "required",
      "serving": "forbidden",
      "path_category": "secrets",
      "single_file": true,
      "collection": "secrets",
      "quarantine_ttl_hours": 6,
      "constraints": {
        "max_size_bytes": 1048576,
        "allowed_mime_types": ["application/x-pkcs12", "application/octet-stream"],
        "allowed_extensions": ["p12", "pfx"]
      }
    }
  ]
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_document_exposes_standard_profiles() {
        let registry = ProfileRegistry::builtin("media", None);
        for id in [
            "avatar_image",
            "gallery_image",
            "document_pdf",
            "spreadsheet_xlsx",
            "import_csv",
            "secret_certificate",
        ] {
            assert!(registry.get(id).is_ok(), "missing builtin profile {id}");
        }
        assert!(matches!(
            registry.get("nope"),
            Err(UploadError::ProfileNotFound)
        ));
    }

    #[test]
    fn avatar_profile_is_single_file_image_pipeline() {
        let registry = ProfileRegistry::builtin("media", None);
        let avatar = registry.get("avatar_image").unwrap();
        assert!(avatar.single_file);
        assert!(avatar.requires_image_normalization);
        assert_eq!(avatar.processing, ProcessingMode::ImagePipeline);
        assert_eq!(avatar.scan, ScanMode::Required);
        assert_eq!(avatar.conversions, vec!["thumb", "medium", "large"]);
        assert_eq!(registry.effective_disk(avatar), "media");
    }

    #[test]
    fn size_overrides_replace_builtin_dimensions() {
        let registry = ProfileRegistry::builtin(
            "media",
            Some(r#"{"thumb": {"width": 64, "height": 64, "crop": true}}"#),
        );
        let thumb = registry.conversion_spec("thumb").unwrap();
        assert_eq!((thumb.width, thumb.height), (64, 64));
        // Unmentioned names keep their built-in geometry.
        assert_eq!(registry.conversion_spec("large").unwrap().width, 1600);
    }

    #[test]
    fn profile_disk_override_wins() {
        let doc = r#"{"profiles": [{
            "id": "p", "kind": "document", "processing": "none", "scan": "disabled",
            "serving": "forbidden", "path_category": "other", "collection": "c",
            "disk": "vault",
            "constraints": {"max_size_bytes": 1, "allowed_mime_types": [], "allowed_extensions": []}
        }]}"#;
        let registry = ProfileRegistry::from_document(doc, "media", None).unwrap();
        let p = registry.get("p").unwrap();
        assert_eq!(registry.effective_disk(p), "vault");
    }
}
