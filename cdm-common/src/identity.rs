//! Deterministic identity hashing
//!
//! Surrogate keys are pure functions of natural identifiers: the same
//! namespace and parts give the same key on every run and every machine.

use sha2::{Digest, Sha256};

/// Separator between hashed parts; cannot appear in printable identifiers
const PART_SEPARATOR: u8 = 0x1f;

/// Derive a positive 63-bit surrogate key from a namespaced natural key
///
/// Never returns 0 (reserved for "no concept"/"unknown" sentinels).
pub fn surrogate_key(namespace: &str, parts: &[&str]) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    for part in parts {
        hasher.update([PART_SEPARATOR]);
        hasher.update(part.trim().as_bytes());
    }
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let key = (u64::from_be_bytes(prefix) & i64::MAX as u64) as i64;
    key.max(1)
}

/// Hex SHA-256 of arbitrary content
pub fn content_hash(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_input_same_key() {
        let a = surrogate_key("person", &["MRN-001"]);
        let b = surrogate_key("person", &["MRN-001"]);
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn test_namespace_separates_keys() {
        assert_ne!(
            surrogate_key("person", &["42"]),
            surrogate_key("visit_occurrence", &["42"])
        );
    }

    #[test]
    fn test_part_boundaries_matter() {
        assert_ne!(
            surrogate_key("visit", &["ab", "c"]),
            surrogate_key("visit", &["a", "bc"])
        );
    }

    #[test]
    fn test_surrounding_whitespace_ignored() {
        assert_eq!(
            surrogate_key("person", &[" MRN-7 "]),
            surrogate_key("person", &["MRN-7"])
        );
    }

    #[test]
    fn test_content_hash_is_hex_sha256() {
        let hash = content_hash(b"abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
