//! Cryptographic services: hasher registry, nullifiers, receipts.
//!
//! All hashing behind the vote path goes through the registry selected at
//! startup; nothing in the crate constructs a keyed hasher ad hoc.

pub mod nullifier;
pub mod poseidon;
pub mod receipt;
pub mod registry;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// 32-byte hash value (SHA-256 or Poseidon output).
pub type Hash256 = [u8; 32];

/// SHA-256 convenience wrapper.
pub fn sha256(data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Canonical JSON used for every signing and chaining pre-image: keys
/// sorted lexicographically, no insignificant whitespace.
///
/// Relies on `serde_json`'s default BTreeMap-backed maps, which serialize
/// keys in sorted order. The `preserve_order` feature must never be
/// enabled on this crate's `serde_json` dependency.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        #[derive(Serialize)]
        struct Unordered {
            zulu: u32,
            alpha: u32,
            mike: u32,
        }

        let json = canonical_json(&Unordered {
            zulu: 1,
            alpha: 2,
            mike: 3,
        })
        .unwrap();
        assert_eq!(json, r#"{"alpha":2,"mike":3,"zulu":1}"#);
    }

    #[test]
    fn test_canonical_json_no_whitespace() {
        let value = serde_json::json!({"b": [1, 2], "a": {"y": 1, "x": 2}});
        let json = canonical_json(&value).unwrap();
        assert_eq!(json, r#"{"a":{"x":2,"y":1},"b":[1,2]}"#);
    }
}
