//! Content hashing.

use sha2::{Digest, Sha256};

/// SHA-256 of `data`, lower-case hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compare two hex digests, ignoring case.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
