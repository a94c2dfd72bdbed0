//! Zeroized key types and HKDF-SHA256 sub-key derivation.
//!
//! Key hierarchy:
//! - The PAKE engine releases a **KEK seed** on successful
//!   registration-finish / login-finish.  It is stable per tag and is
//!   never derived from the phrase itself.
//! - The **key-encryption key** (KEK) is HKDF(seed, tag salt).  A new
//!   salt means a new KEK, which is how rotation works.
//! - Each vault has one random **data-encryption key** (DEK), stored
//!   only in wrapped form and unwrapped into volatile memory for the
//!   duration of a single request.

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::errors::{Result, TagVaultError};

/// Length of all symmetric keys in this crate (256 bits).
pub const KEY_LEN: usize = 32;

/// Length of the per-tag salt mixed into KEK derivation.
pub const SALT_LEN: usize = 32;

/// HKDF context string binding derived KEKs to this crate.
const KEK_INFO: &[u8] = b"tagvault:kek:v1";

/// Generate a fresh random salt for KEK derivation.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a key-encryption key from a KEK seed and a tag salt.
///
/// The same (seed, salt) pair always produces the same KEK; rotating
/// the salt yields an unrelated KEK that cannot unwrap old material.
pub fn derive_kek(seed: &KekSeed, salt: &[u8]) -> Result<Kek> {
    let hk = Hkdf::<Sha256>::new(Some(salt), seed.as_bytes());

    let mut okm = [0u8; KEY_LEN];
    hk.expand(KEK_INFO, &mut okm)
        .map_err(|e| TagVaultError::KeyDerivationFailed(format!("HKDF expand failed: {e}")))?;

    Ok(Kek::new(okm))
}

macro_rules! zeroized_key {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name {
            bytes: [u8; KEY_LEN],
        }

        impl $name {
            /// Wrap raw bytes.  The buffer is owned and zeroed on drop.
            pub fn new(bytes: [u8; KEY_LEN]) -> Self {
                Self { bytes }
            }

            /// Generate a fresh random key.
            pub fn generate() -> Self {
                let mut bytes = [0u8; KEY_LEN];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                Self { bytes }
            }

            /// Access the raw key bytes.
            pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

zeroized_key! {
    /// Seed released by the PAKE engine after successful
    /// authentication; input keying material for KEK derivation.
    KekSeed
}

zeroized_key! {
    /// Key-encryption key.  Only ever used to wrap/unwrap DEKs.
    Kek
}

zeroized_key! {
    /// Data-encryption key.  Exists unwrapped only inside a single
    /// request; the wrapped form is what storage sees.
    DataKey
}

impl Clone for KekSeed {
    fn clone(&self) -> Self {
        Self::new(self.bytes)
    }
}
