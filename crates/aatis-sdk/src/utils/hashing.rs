//! Hashing Utilities

use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of content and return as hex string
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Map a token to a bucket in `0..buckets` plus a sign, from its SHA-256 digest.
///
/// Used by the feature-hashing embedder; stable across runs and platforms.
pub fn hash_bucket(token: &str, buckets: usize) -> (usize, f32) {
    let digest = Sha256::digest(token.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    let value = u64::from_le_bytes(word);
    let bucket = (value % buckets.max(1) as u64) as usize;
    let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
    (bucket, sign)
}
