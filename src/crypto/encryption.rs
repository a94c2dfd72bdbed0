//! AES-256-GCM authenticated encryption with split IV and tag.
//!
//! Vault blobs store the IV, ciphertext, and authentication tag as
//! separate columns, so unlike a combined `nonce || ciphertext` blob
//! the pieces are kept apart here and reassembled only for the AEAD
//! call.  `seal` generates a fresh random 12-byte IV on every call;
//! IV uniqueness per key is additionally enforced by a storage-level
//! unique constraint.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};

use crate::errors::{Result, TagVaultError};

/// Size of the AES-256-GCM IV in bytes.
pub const IV_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const AUTH_TAG_LEN: usize = 16;

/// Output of a `seal` call: the three pieces a vault blob stores.
pub struct Sealed {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; AUTH_TAG_LEN],
}

/// Encrypt `plaintext` with a 32-byte `key` under a fresh random IV.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| TagVaultError::EncryptionFailed(format!("invalid key length: {e}")))?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    // The aead crate returns ciphertext with the tag appended; split
    // the trailing 16 bytes back out for separate storage.
    let mut combined = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| TagVaultError::EncryptionFailed(format!("encryption error: {e}")))?;

    let split_at = combined.len() - AUTH_TAG_LEN;
    let tag_bytes = combined.split_off(split_at);

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&nonce);
    let mut auth_tag = [0u8; AUTH_TAG_LEN];
    auth_tag.copy_from_slice(&tag_bytes);

    Ok(Sealed {
        iv,
        ciphertext: combined,
        auth_tag,
    })
}

/// Decrypt and verify a sealed blob.
///
/// Any verification failure — flipped ciphertext bit, flipped tag
/// bit, wrong key — returns `TamperDetected`; partial plaintext is
/// never released.
pub fn open(key: &[u8], iv: &[u8], ciphertext: &[u8], auth_tag: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_LEN || auth_tag.len() != AUTH_TAG_LEN {
        return Err(TagVaultError::TamperDetected);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| TagVaultError::TamperDetected)?;
    let nonce = Nonce::from_slice(iv);

    let mut combined = Vec::with_capacity(ciphertext.len() + AUTH_TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(auth_tag);

    cipher
        .decrypt(nonce, combined.as_slice())
        .map_err(|_| TagVaultError::TamperDetected)
}
