//! Content hashing for asset deduplication
//!
//! **[QDP-AS-010]** Raw assets are identified by the SHA-256 of their exact
//! byte content, hex encoded. Two fetches that return identical bytes hash to
//! the same asset identity regardless of source or fetch time.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 content hash of a raw byte payload, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{:x}", digest)
}
