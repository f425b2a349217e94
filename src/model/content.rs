use serde::{Deserialize, Serialize};

use crate::model::{Id, Timestamp};

/// Root directory (relative to the storage root) for content blobs
pub const CONTENT_ROOT: &str = "content";

/// The three independent digests computed for every blob.
///
/// `sha256` is the dedup key and determines the storage location; the other
/// two are kept for verification and are each globally unique as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashes {
    pub sha256: String,
    pub sha384: String,
    pub sha512: String,
}

impl ContentHashes {
    pub fn compute(bytes: &[u8]) -> Self {
        use sha2::{Digest, Sha256, Sha384, Sha512};

        Self {
            sha256: hex::encode(Sha256::digest(bytes)),
            sha384: hex::encode(Sha384::digest(bytes)),
            sha512: hex::encode(Sha512::digest(bytes)),
        }
    }

    pub fn primary(&self) -> &str {
        &self.sha256
    }
}

/// A deduplicated blob. Immutable once inserted, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentObject {
    pub id: Id,
    pub sha256: String,
    pub sha384: String,
    pub sha512: String,
    pub content_length: i64,
    pub content_type: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ContentObject {
    /// `content/<h[0:2]>/<h[2:4]>/<h>`
    pub fn path_for(hash: &str) -> String {
        format!("{}/{}/{}/{}", CONTENT_ROOT, &hash[0..2], &hash[2..4], hash)
    }

    /// Storage path, derived from the primary hash
    pub fn path(&self) -> String {
        Self::path_for(&self.sha256)
    }

    pub fn hashes(&self) -> ContentHashes {
        ContentHashes {
            sha256: self.sha256.clone(),
            sha384: self.sha384.clone(),
            sha512: self.sha512.clone(),
        }
    }
}

/// Insert request for a blob seen for the first time
#[derive(Debug, Clone)]
pub struct NewContentObject {
    pub hashes: ContentHashes,
    pub content_length: i64,
    pub content_type: String,
    pub created_at: Timestamp,
}

/// Result of inserting a content row. Losing a uniqueness race is not an
/// error: the bytes are already known.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(ContentObject),
    AlreadyExists,
}

/// Whether `hash` looks like a primary (SHA-256, lowercase hex) digest
pub fn is_primary_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
