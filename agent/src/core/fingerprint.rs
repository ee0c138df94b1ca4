//! Stable fingerprints for the experience cache.
//!
//! A fingerprint covers the normalized request text plus the content
//! hashes of every file the Explore phase selected, so any relevant file
//! change produces a different key.

use std::collections::BTreeMap;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

/// Hash file or string content for fingerprints and patch base hashes.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Lowercase, collapse whitespace, strip trailing punctuation.
///
/// Normalization keeps fingerprints stable across cosmetic differences in
/// how the same request is typed.
pub fn normalize_request(request: &str) -> String {
    request
        .split_whitespace()
        .map(|tok| {
            tok.to_lowercase()
                .trim_end_matches(['.', ',', '!', '?'])
                .to_string()
        })
        .filter(|tok| !tok.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compute the cache key for a request and its selected file hashes.
///
/// File entries are consumed in sorted path order (`BTreeMap`), so the
/// result is independent of selection order.
pub fn fingerprint(request: &str, file_hashes: &BTreeMap<PathBuf, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_request(request).as_bytes());
    for (path, hash) in file_hashes {
        hasher.update(b"\0");
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(b"=");
        hasher.update(hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}
