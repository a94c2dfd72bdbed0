//! Data-encryption-key wrapping under a key-encryption key.
//!
//! Wrapped layout (always exactly 60 bytes):
//!
//! ```text
//! [ 12-byte nonce | 32-byte encrypted key | 16-byte auth tag ]
//! ```
//!
//! Unwrap failures carry no detail: wrong KEK and corrupted bytes are
//! indistinguishable to the caller, both are `UnwrapFailed`.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use zeroize::Zeroize;

use crate::crypto::encryption::{AUTH_TAG_LEN, IV_LEN};
use crate::crypto::keys::{DataKey, Kek, KEY_LEN};
use crate::errors::{Result, TagVaultError};

/// Exact width of a wrapped data-encryption key.
pub const WRAPPED_KEY_LEN: usize = IV_LEN + KEY_LEN + AUTH_TAG_LEN;

/// Wrap a data-encryption key under a key-encryption key.
pub fn wrap_data_key(kek: &Kek, dek: &DataKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(kek.as_bytes())
        .map_err(|e| TagVaultError::EncryptionFailed(format!("invalid KEK length: {e}")))?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, dek.as_bytes().as_ref())
        .map_err(|e| TagVaultError::EncryptionFailed(format!("key wrap error: {e}")))?;

    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
    wrapped.extend_from_slice(&nonce);
    wrapped.extend_from_slice(&ciphertext);

    debug_assert_eq!(wrapped.len(), WRAPPED_KEY_LEN);
    Ok(wrapped)
}

/// Unwrap a data-encryption key.
///
/// The returned `DataKey` lives in volatile memory only and zeroes
/// itself on drop; callers must not persist or log it.
pub fn unwrap_data_key(kek: &Kek, wrapped: &[u8]) -> Result<DataKey> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(TagVaultError::UnwrapFailed);
    }

    let (nonce_bytes, ciphertext) = wrapped.split_at(IV_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher =
        Aes256Gcm::new_from_slice(kek.as_bytes()).map_err(|_| TagVaultError::UnwrapFailed)?;

    let mut plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| TagVaultError::UnwrapFailed)?;

    if plaintext.len() != KEY_LEN {
        plaintext.zeroize();
        return Err(TagVaultError::UnwrapFailed);
    }

    let mut key_bytes = [0u8; KEY_LEN];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(DataKey::new(key_bytes))
}
