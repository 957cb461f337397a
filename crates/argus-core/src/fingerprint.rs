use std::path::Path;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::ScanError;

/// Content-addressed identifier for submitted content.
///
/// Carries one strong collision-resistant digest (SHA-256, the primary
/// dedupe and lookup key) plus the legacy digests the aggregator's
/// by-fingerprint lookup API also accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub sha256: String,
    pub sha1: String,
    pub md5: String,
}

impl Fingerprint {
    /// Compute all digests of a byte slice. Deterministic, side-effect-free.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self {
            sha256: format!("{:x}", Sha256::digest(bytes)),
            sha1: format!("{:x}", Sha1::digest(bytes)),
            md5: format!("{:x}", Md5::digest(bytes)),
        }
    }

    /// Fingerprint a file's content. Fails only on I/O, never on content shape.
    pub fn of_file(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let bytes = std::fs::read(path)?;
        Ok(Self::of_bytes(&bytes))
    }

    /// First 8 hex chars of the primary digest, for log fields.
    pub fn short(&self) -> &str {
        &self.sha256[..8]
    }
}
