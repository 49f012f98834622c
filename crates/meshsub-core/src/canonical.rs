//! Canonical encoding for meshsub
//!
//! All replicated and transported values use postcard serialization:
//! - No hash maps on the wire (ordered `BTree*` collections only)
//! - Field order is Rust struct field order

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Decode a value from canonical bytes.
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// BLAKE3 digest of a value's canonical bytes.
pub fn canonical_digest<T: Serialize>(value: &T) -> Result<[u8; 32]> {
    let bytes = canonical_bytes(value)?;
    Ok(*blake3::hash(&bytes).as_bytes())
}
