// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical serialization and content hashing of row images.
//!
//! Two row images are considered equal iff their canonical SHA-256 hashes
//! match. Canonicalization:
//!
//! 1. sorts columns lexicographically (the [`RowImage`](crate::event::RowImage)
//!    `BTreeMap` already iterates in that order),
//! 2. serializes with `serde_json` compact form (stable for a given value),
//! 3. excludes the per-table ignore-list (typically the `timestamp_column`,
//!    so a touch-only update does not read as divergence).
//!
//! The same canonical order is used by DML generation, so hashes and
//! statements always agree on column order.

use crate::event::RowImage;
use sha2::{Digest, Sha256};

/// Serialize a row image to canonical bytes, excluding ignored columns.
pub fn canonical_bytes(image: &RowImage, ignore: &[String]) -> Vec<u8> {
    if ignore.is_empty() {
        // BTreeMap serializes keys in sorted order.
        return serde_json::to_vec(image).unwrap_or_default();
    }
    let filtered: RowImage = image
        .iter()
        .filter(|(k, _)| !ignore.iter().any(|ig| ig == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::to_vec(&filtered).unwrap_or_default()
}

/// SHA-256 content hash of a row image as a hex string.
pub fn content_hash(image: &RowImage, ignore: &[String]) -> String {
    let hash = Sha256::digest(canonical_bytes(image, ignore));
    hex::encode(hash)
}

/// Check whether two images carry the same content under the ignore-list.
pub fn images_equal(a: &RowImage, b: &RowImage, ignore: &[String]) -> bool {
    content_hash(a, ignore) == content_hash(b, ignore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(pairs: &[(&str, serde_json::Value)]) -> RowImage {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_hash_is_stable() {
        let a = image(&[("id", json!(1)), ("name", json!("A"))]);
        assert_eq!(content_hash(&a, &[]), content_hash(&a, &[]));
    }

    #[test]
    fn test_hash_independent_of_insertion_order() {
        let mut a = RowImage::new();
        a.insert("name".to_string(), json!("A"));
        a.insert("id".to_string(), json!(1));

        let mut b = RowImage::new();
        b.insert("id".to_string(), json!(1));
        b.insert("name".to_string(), json!("A"));

        assert_eq!(content_hash(&a, &[]), content_hash(&b, &[]));
    }

    #[test]
    fn test_hash_differs_on_value_change() {
        let a = image(&[("id", json!(1)), ("name", json!("A"))]);
        let b = image(&[("id", json!(1)), ("name", json!("B"))]);
        assert_ne!(content_hash(&a, &[]), content_hash(&b, &[]));
        assert!(!images_equal(&a, &b, &[]));
    }

    #[test]
    fn test_ignore_list_excludes_column() {
        let a = image(&[
            ("id", json!(1)),
            ("name", json!("A")),
            ("updated_at", json!("2026-01-01 00:00:00")),
        ]);
        let b = image(&[
            ("id", json!(1)),
            ("name", json!("A")),
            ("updated_at", json!("2026-02-02 00:00:00")),
        ]);

        let ignore = vec!["updated_at".to_string()];
        assert!(images_equal(&a, &b, &ignore));
        assert!(!images_equal(&a, &b, &[]));
    }

    #[test]
    fn test_null_and_absent_differ() {
        // NULL column and missing column are different layouts, not equal.
        let a = image(&[("id", json!(1)), ("name", json!(null))]);
        let b = image(&[("id", json!(1))]);
        assert!(!images_equal(&a, &b, &[]));
    }

    #[test]
    fn test_canonical_bytes_sorted_keys() {
        let a = image(&[("zeta", json!(1)), ("alpha", json!(2))]);
        let bytes = canonical_bytes(&a, &[]);
        let s = String::from_utf8(bytes).unwrap();
        assert!(s.find("alpha").unwrap() < s.find("zeta").unwrap());
    }

    #[test]
    fn test_canonicalization_idempotent() {
        let a = image(&[("id", json!(7)), ("v", json!("x"))]);
        let once = canonical_bytes(&a, &[]);
        let reparsed: RowImage = serde_json::from_slice(&once).unwrap();
        let twice = canonical_bytes(&reparsed, &[]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_image() {
        let empty = RowImage::new();
        // SHA-256 of "{}"
        assert_eq!(content_hash(&empty, &[]).len(), 64);
        assert!(images_equal(&empty, &RowImage::new(), &[]));
    }
}
