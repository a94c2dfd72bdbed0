//! Deterministic phrase-identifier derivation.
//!
//! A `TagId` is the only lookup key ever sent to the server for a
//! secret tag.  It is a plain (non-keyed) SHA-256 over a domain
//! prefix and the phrase bytes, so every device derives the same
//! identifier for the same phrase, and the server cannot recover the
//! phrase from it (pre-image resistance).

use std::fmt;

use sha2::{Digest, Sha256};

use crate::errors::{Result, TagVaultError};

/// Width of a tag identifier in bytes (SHA-256 output).
pub const TAG_ID_LEN: usize = 32;

/// Domain-separation prefix hashed in front of the phrase so the
/// identifier can never collide with other SHA-256 uses of the phrase.
const DOMAIN_PREFIX: &[u8] = b"tagvault:phrase-id:v1";

/// A 32-byte deterministic identifier for a secret tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId([u8; TAG_ID_LEN]);

impl TagId {
    /// Derive the identifier for a secret phrase.
    ///
    /// Deterministic: the same phrase always yields the same bytes.
    /// The only rejected input is an empty phrase.
    pub fn derive(phrase: &str) -> Result<Self> {
        if phrase.is_empty() {
            return Err(TagVaultError::InvalidInput(
                "phrase must not be empty".into(),
            ));
        }

        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_PREFIX);
        hasher.update(phrase.as_bytes());

        let mut bytes = [0u8; TAG_ID_LEN];
        bytes.copy_from_slice(&hasher.finalize());
        Ok(Self(bytes))
    }

    /// Build an identifier from raw bytes (e.g. read from storage).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; TAG_ID_LEN] = bytes.try_into().map_err(|_| {
            TagVaultError::InvalidInput(format!(
                "tag identifier must be {TAG_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Parse an identifier from its lowercase hex form.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != TAG_ID_LEN * 2 {
            return Err(TagVaultError::InvalidInput(format!(
                "tag identifier hex must be {} chars, got {}",
                TAG_ID_LEN * 2,
                hex.len()
            )));
        }

        let mut bytes = [0u8; TAG_ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &hex[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| {
                TagVaultError::InvalidInput(format!("invalid hex in tag identifier: {pair:?}"))
            })?;
        }
        Ok(Self(bytes))
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; TAG_ID_LEN] {
        &self.0
    }

    /// Lowercase hex form, used as the vault identifier and for
    /// transport-safe encoding.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(TAG_ID_LEN * 2);
        for b in &self.0 {
            use std::fmt::Write;
            let _ = write!(s, "{b:02x}");
        }
        s
    }
}

impl fmt::Debug for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full identifiers do not belong in debug output.
        write!(f, "TagId({}…)", &self.to_hex()[..8])
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_phrase_same_identifier() {
        let a = TagId::derive("blue horizon").unwrap();
        let b = TagId::derive("blue horizon").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_phrases_distinct_identifiers() {
        let a = TagId::derive("blue horizon").unwrap();
        let b = TagId::derive("blue horizons").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_phrase_rejected() {
        assert!(matches!(
            TagId::derive(""),
            Err(TagVaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn hex_roundtrip() {
        let id = TagId::derive("round trip").unwrap();
        let parsed = TagId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_bytes_enforces_width() {
        assert!(TagId::from_bytes(&[0u8; 16]).is_err());
        assert!(TagId::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn debug_output_is_truncated() {
        let id = TagId::derive("blue horizon").unwrap();
        let dbg = format!("{id:?}");
        assert!(dbg.len() < 20, "debug form must not expose the full id");
    }
}
