//! Cryptographic building blocks.
//!
//! This module provides:
//! - Deterministic phrase-identifier derivation (`identifier`)
//! - Zeroized key types and HKDF sub-key derivation (`keys`)
//! - AES-256-GCM authenticated encryption with split IV/tag (`encryption`)
//! - Data-encryption-key wrapping under a key-encryption key (`wrap`)

pub mod encryption;
pub mod identifier;
pub mod keys;
pub mod wrap;

pub use identifier::TagId;
pub use keys::{derive_kek, DataKey, Kek, KekSeed};
