//! Hashing and JSON canonicalization.
//!
//! Deterministic reproduction depends on canonical serialization:
//! `to_canonical_json` guarantees stable key order for JSON objects, and
//! `hash_str`/`hash_value` turn that into stable identifiers for node ids,
//! artifacts and row content hashes.

pub mod canonical_json;
pub mod hash;

pub use canonical_json::to_canonical_json;
pub use hash::{hash12, hash_bytes, hash_str, hash_value};
