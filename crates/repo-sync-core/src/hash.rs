//! Content hashing compatible with git blob ids.
//!
//! A blob id is `sha1("blob <len>\0" ++ content)` rendered as lowercase hex,
//! which is exactly what the remote store reports for every tree entry. That
//! lets us decide whether a local file differs from the last-known remote
//! version without a network round trip.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("Invalid content hash: expected 40 hex chars, got {0:?}")]
    InvalidFormat(String),
}

/// A git-compatible blob identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute the blob id for `content`.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("blob {}\0", content.len()).as_bytes());
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Accept a hash reported by the remote store.
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidFormat(hex.to_string()));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
