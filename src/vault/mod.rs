//! Vault module — authenticated-encryption blob storage.
//!
//! This module provides:
//! - `BlobMetadata` (`blob`) — post-decryption handling hints
//! - `VaultBlobStore` (`store`) — put/get/delete of encrypted blobs

pub mod blob;
pub mod store;

pub use blob::BlobMetadata;
pub use store::VaultBlobStore;
