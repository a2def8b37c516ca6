//! Identifier normalization.
//!
//! Tenant and entity identifiers are stored as BSON binary subtype 4, while
//! operators write them as hyphenated text in the YAML configuration. This
//! module rewrites the textual form into the binary one, in place, through an
//! arbitrary filter tree.

use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{Binary, Bson, Document};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Returns true if a string should be treated as a textual UUID.
///
/// Any hyphenated string in a filter is an identifier candidate and must
/// parse; non-hyphenated strings are left alone.
#[must_use]
pub fn looks_like_uuid(value: &str) -> bool {
    value.contains('-')
}

/// Parses a textual UUID into its binary subtype 4 representation.
///
/// # Errors
///
/// Returns [`Error::InvalidIdentifier`] if `value` is not a valid UUID.
pub fn uuid_to_binary(value: &str) -> Result<Binary> {
    let id = Uuid::parse_str(value.trim()).map_err(|e| Error::InvalidIdentifier {
        value: value.to_string(),
        reason: e.to_string(),
    })?;

    Ok(Binary {
        subtype: BinarySubtype::Uuid,
        bytes: id.as_bytes().to_vec(),
    })
}

/// Rewrites every UUID-shaped string in `filter` into binary form.
///
/// Binary values are never revisited, so applying this twice is the same as
/// applying it once.
///
/// # Errors
///
/// Returns [`Error::InvalidIdentifier`] on the first hyphenated string that
/// is not a UUID. The filter may be partially rewritten in that case.
pub fn normalize_filter(filter: &mut Document) -> Result<()> {
    for (_, value) in filter.iter_mut() {
        normalize_value(value)?;
    }
    Ok(())
}

/// Rewrites a single node and everything below it.
///
/// # Errors
///
/// Same as [`normalize_filter`].
pub fn normalize_value(value: &mut Bson) -> Result<()> {
    match value {
        Bson::String(text) if looks_like_uuid(text) => {
            let binary = uuid_to_binary(text)?;
            *value = Bson::Binary(binary);
        }
        Bson::Array(items) => {
            for item in items.iter_mut() {
                normalize_value(item)?;
            }
        }
        Bson::Document(nested) => normalize_filter(nested)?,
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    const TENANT: &str = "3f2504e0-4f89-11d3-9a0c-0305e82c3301";

    fn binary(text: &str) -> Bson {
        Bson::Binary(uuid_to_binary(text).unwrap())
    }

    #[test]
    fn test_uuid_to_binary_layout() {
        let bin = uuid_to_binary(TENANT).unwrap();
        assert_eq!(bin.subtype, BinarySubtype::Uuid);
        assert_eq!(bin.bytes.len(), 16);
        assert_eq!(bin.bytes[0], 0x3f);
        assert_eq!(bin.bytes[15], 0x01);
    }

    #[test]
    fn test_uuid_to_binary_rejects_garbage() {
        let err = uuid_to_binary("not-a-uuid").unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier { ref value, .. } if value == "not-a-uuid"));
    }

    #[test]
    fn test_normalize_scalar_and_passthrough() {
        let mut filter = doc! {
            "TenantId": TENANT,
            "Status": "active",
            "Amount": 42,
            "Deleted": false,
        };
        normalize_filter(&mut filter).unwrap();

        assert_eq!(filter.get("TenantId"), Some(&binary(TENANT)));
        assert_eq!(filter.get_str("Status").unwrap(), "active");
        assert_eq!(filter.get_i32("Amount").unwrap(), 42);
        assert!(!filter.get_bool("Deleted").unwrap());
    }

    #[test]
    fn test_normalize_nested_operators_and_arrays() {
        let other = "9b2d7c1e-0a45-4c8e-b8f1-6a7d3e2c1f00";
        let mut filter = doc! {
            "$and": [
                { "TenantId": { "$in": [TENANT, other, "plain"] } },
                { "Owner": { "$eq": other } },
            ]
        };
        normalize_filter(&mut filter).unwrap();

        let expected = doc! {
            "$and": [
                { "TenantId": { "$in": [binary(TENANT), binary(other), "plain"] } },
                { "Owner": { "$eq": binary(other) } },
            ]
        };
        assert_eq!(filter, expected);
    }

    #[test]
    fn test_normalize_hyphenated_non_uuid_fails() {
        let mut filter = doc! { "CreatedAt": "2024-01-01" };
        let err = normalize_filter(&mut filter).unwrap_err();
        assert_eq!(err.code(), "MIRROR-004");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut once = doc! { "TenantId": { "$in": [TENANT] } };
        normalize_filter(&mut once).unwrap();
        let mut twice = once.clone();
        normalize_filter(&mut twice).unwrap();
        assert_eq!(once, twice);
    }
}
