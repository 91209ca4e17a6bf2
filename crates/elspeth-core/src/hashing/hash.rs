//! Hash helpers — kept behind one module so the algorithm can change
//! without touching the rest of the core.
//!
//! SHA-256 is the contractual algorithm: node IDs, artifact hashes and row
//! content hashes all derive from here so a single implementation change
//! keeps them consistent with each other.

use crate::hashing::to_canonical_json;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hashes a string, returning hex (full SHA-256, 64 characters).
pub fn hash_str(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hashes a JSON value, canonicalizing it first.
pub fn hash_value(v: &Value) -> String {
    let canonical = to_canonical_json(v);
    hash_str(&canonical)
}

/// First 12 hex chars of `hash_value`, used in node IDs.
pub fn hash12(v: &Value) -> String {
    hash_value(v)[..12].to_string()
}

/// Hashes raw bytes (file artifacts are hashed over their on-disk content,
/// not a JSON representation of it).
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
