//! Blob metadata types.

use chrono::{DateTime, Utc};

/// Lightweight metadata about a stored blob (no ciphertext).
///
/// Content type and declared size exist to aid post-decryption
/// handling; they are advisory until decryption verifies the blob.
#[derive(Debug, Clone)]
pub struct BlobMetadata {
    pub vault_id: String,
    pub object_id: String,
    pub content_type: String,
    pub plaintext_len: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Plaintext returned by a successful `get`, with its declared type.
#[derive(Debug)]
pub struct BlobContent {
    pub content_type: String,
    pub plaintext: Vec<u8>,
}
