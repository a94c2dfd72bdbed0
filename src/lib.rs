//! TagVault — zero-knowledge secret-tag authentication and encrypted
//! vault storage.
//!
//! A user binds a memorized secret phrase to a hidden category of
//! content.  The server verifies phrase possession through an OPAQUE
//! handshake without ever seeing the phrase, and stores content only
//! in authenticated-encrypted form, so plaintext never touches disk
//! or logs on the server side.
//!
//! The crate is transport-agnostic: [`service::TagVault`] exposes the
//! request/response surface (`register_start`/`register_finish`,
//! `login_start`/`login_finish`, `vault_put`/`vault_get`) and the
//! surrounding application maps it onto whatever wire protocol it
//! uses.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod pake;
pub mod service;
pub mod store;
pub mod vault;

pub use errors::{Result, TagVaultError};
