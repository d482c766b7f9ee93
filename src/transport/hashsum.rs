//! Dapp Message Hash Sum
//!
//! The sum is the reverse of the first 8 bytes of SHA-256 over the UTF-8
//! JSON encoding of the message body, read as a big-endian integer and
//! rendered in decimal. The timestamp argument is part of the wire
//! signature but does not enter the digest; replay protection lives with
//! the dapp runtime.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compute the hash sum of a dapp message body.
pub fn hashsum(body: &Value, _timestamp: Option<i64>) -> String {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    decimal_from_digest(&digest)
}

fn decimal_from_digest(digest: &[u8]) -> String {
    let mut reversed = [0u8; 8];
    for (i, byte) in reversed.iter_mut().enumerate() {
        *byte = digest[7 - i];
    }
    u64::from_be_bytes(reversed).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_reversal() {
        let digest: Vec<u8> = (1..=32).collect();
        // First 8 bytes reversed: 08 07 06 05 04 03 02 01
        assert_eq!(decimal_from_digest(&digest), "578437695752307201");
    }

    #[test]
    fn test_hashsum_is_stable() {
        let body = json!({ "type": "chat", "text": "hello" });
        assert_eq!(hashsum(&body, Some(100)), hashsum(&body, Some(100)));
        // The timestamp does not enter the digest.
        assert_eq!(hashsum(&body, Some(100)), hashsum(&body, Some(999)));
    }

    #[test]
    fn test_hashsum_distinguishes_bodies() {
        let a = json!({ "text": "hello" });
        let b = json!({ "text": "hello!" });
        assert_ne!(hashsum(&a, None), hashsum(&b, None));
    }

    #[test]
    fn test_hashsum_is_decimal() {
        let sum = hashsum(&json!({ "k": 1 }), None);
        assert!(!sum.is_empty());
        assert!(sum.bytes().all(|b| b.is_ascii_digit()));
    }
}
