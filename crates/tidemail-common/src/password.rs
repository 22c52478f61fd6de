//! Credential hashing
//!
//! Account secrets are stored as a deterministic one-way hash so that a login
//! can be checked with a single equality lookup. APOP digests are keyed by the
//! per-session greeting timestamp.

use sha2::{Digest, Sha256};

const SALT: &str = "tidemail";

/// One-way hash of an account secret, as stored in the `user` table
pub fn encode(secret: &str) -> String {
    let inner = format!("{:x}", md5::compute(secret.as_bytes()));
    let mut hasher = Sha256::new();
    hasher.update(inner.as_bytes());
    hasher.update(SALT.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// APOP digest: hex MD5 of the greeting timestamp followed by the stored hash
pub fn apop_digest(timestamp: &str, stored_hash: &str) -> String {
    let mut input = String::with_capacity(timestamp.len() + stored_hash.len());
    input.push_str(timestamp);
    input.push_str(stored_hash);
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Compare two digests without early exit on the first differing byte
pub fn digest_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
