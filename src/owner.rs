//! Owner-id normalization: validate-and-cast of the caller-supplied owner
//! identifier per the configured identifier kind. Pure — no I/O.

use crate::error::UploadError;

/// Which shape of owner identifier the deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerIdMode {
    Int,
    Uuid,
    Ulid,
    StringAny,
}

impl OwnerIdMode {
    /// Parses the `UPLOADS_OWNER_ID_MODE` configuration value.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "int" => Some(OwnerIdMode::Int),
            "uuid" => Some(OwnerIdMode::Uuid),
            "ulid" => Some(OwnerIdMode::Ulid),
            "string-any" => Some(OwnerIdMode::StringAny),
            _ => None,
        }
    }
}

/// Validates `raw` against `mode` and returns the canonical string form.
///
/// * `Int` — integer-looking strings only; floats (even integer-valued),
///   negatives, and non-numeric strings are rejected.
/// * `Uuid` — canonical 8-4-4-4-12 lowercase hex; anything else is rejected,
///   including uppercase or braced forms.
/// * `Ulid` — 26-character Crockford base32.
/// * `StringAny` — any non-empty trimmed string.
pub fn normalize(mode: OwnerIdMode, raw: &str) -> Result<String, UploadError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UploadError::InvalidOwnerId);
    }

    match mode {
        OwnerIdMode::Int => {
            // Digits only: this rejects floats ("42.0"), exponents ("4e2"),
            // signs, and whitespace in one check. Parsing afterwards bounds
            // the value and strips leading zeros.
            if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
                return Err(UploadError::InvalidOwnerId);
            }
            let value: i64 = trimmed.parse().map_err(|_| UploadError::InvalidOwnerId)?;
            Ok(value.to_string())
        }
        OwnerIdMode::Uuid => {
            let parsed = uuid::Uuid::try_parse(trimmed).map_err(|_| UploadError::InvalidOwnerId)?;
            // Round-trip comparison enforces the canonical lowercase hyphenated
            // form — `try_parse` alone also accepts simple and braced inputs.
            let canonical = parsed.to_string();
            if canonical != trimmed {
                return Err(UploadError::InvalidOwnerId);
            }
            Ok(canonical)
        }
        OwnerIdMode::Ulid => {
            if trimmed.len() != 26 {
                return Err(UploadError::InvalidOwnerId);
            }
            let parsed =
                ulid::Ulid::from_string(trimmed).map_err(|_| UploadError::InvalidOwnerId)?;
            Ok(parsed.to_string())
        }
        OwnerIdMode::StringAny => Ok(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_mode_accepts_integers_only() {
        assert_eq!(normalize(OwnerIdMode::Int, "42").unwrap(), "42");
        assert_eq!(normalize(OwnerIdMode::Int, " 007 ").unwrap(), "7");
        assert!(normalize(OwnerIdMode::Int, "42.0").is_err());
        assert!(normalize(OwnerIdMode::Int, "4e2").is_err());
        assert!(normalize(OwnerIdMode::Int, "-3").is_err());
        assert!(normalize(OwnerIdMode::Int, "abc").is_err());
        assert!(normalize(OwnerIdMode::Int, "").is_err());
    }

    #[test]
    fn uuid_mode_requires_canonical_lowercase() {
        let canonical = "6fa1c2ee-13d8-44e1-9db9-7a0c32a10a11";
        assert_eq!(normalize(OwnerIdMode::Uuid, canonical).unwrap(), canonical);
        // Uppercase, braced, and simple forms all parse but are not canonical.
        assert!(normalize(OwnerIdMode::Uuid, &canonical.to_uppercase()).is_err());
        assert!(normalize(OwnerIdMode::Uuid, "6fa1c2ee13d844e19db97a0c32a10a11").is_err());
        assert!(normalize(OwnerIdMode::Uuid, "not-a-uuid").is_err());
    }

    #[test]
    fn ulid_mode_requires_26_crockford_chars() {
        assert!(normalize(OwnerIdMode::Ulid, "01ARZ3NDEKTSV4RRFFQ69G5FAV").is_ok());
        assert!(normalize(OwnerIdMode::Ulid, "01ARZ3NDEKTSV4RRFFQ69G5FA").is_err());
        assert!(normalize(OwnerIdMode::Ulid, "01ARZ3NDEKTSV4RRFFQ69G5FAU").is_err()); // 'U' excluded
    }

    #[test]
    fn string_any_trims_and_rejects_empty() {
        assert_eq!(normalize(OwnerIdMode::StringAny, " user-1 ").unwrap(), "user-1");
        assert!(normalize(OwnerIdMode::StringAny, "   ").is_err());
    }
}
