//! Persistent store — SQLite-backed tags, wrapped keys, and blobs.
//!
//! One database file holds the three durable entities:
//! `secret_tags`, `wrapped_keys`, and `vault_blobs`.  Foreign keys
//! are enabled so deleting a tag cascades to its keys and blobs, and
//! unique constraints enforce the (owner, label), (vault, object),
//! and (key, iv) invariants at the storage layer.
//!
//! A single `Mutex`-guarded connection serializes writes, which also
//! guarantees per-key IV uniqueness checks see a consistent view.

pub mod keys;
pub mod tags;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::errors::{Result, TagVaultError};

pub use keys::WrappedKeyRecord;
pub use tags::{SecretTagRecord, TagSummary};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS secret_tags (
    identifier  BLOB PRIMARY KEY,
    user_id     TEXT NOT NULL,
    salt        BLOB NOT NULL,
    verifier    BLOB NOT NULL,
    envelope    BLOB NOT NULL,
    label       TEXT NOT NULL,
    color       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE(user_id, label)
);

CREATE TABLE IF NOT EXISTS wrapped_keys (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    tag_identifier  BLOB NOT NULL REFERENCES secret_tags(identifier) ON DELETE CASCADE,
    vault_id        TEXT NOT NULL,
    wrapped         BLOB NOT NULL,
    purpose         TEXT NOT NULL,
    version         INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE(tag_identifier, vault_id, version)
);

CREATE TABLE IF NOT EXISTS vault_blobs (
    vault_id       TEXT NOT NULL,
    object_id      TEXT NOT NULL,
    key_id         INTEGER NOT NULL REFERENCES wrapped_keys(id) ON DELETE CASCADE,
    iv             BLOB NOT NULL,
    ciphertext     BLOB NOT NULL,
    auth_tag       BLOB NOT NULL,
    content_type   TEXT NOT NULL,
    plaintext_len  INTEGER NOT NULL,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    PRIMARY KEY(vault_id, object_id),
    UNIQUE(key_id, iv)
);
";

/// Handle to the tag database.  Cheap to share behind an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`.
    ///
    /// Creates the parent directory if needed and restricts the file
    /// to owner-only permissions on Unix.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(path, perms);
        }

        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the underlying connection.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database lock poisoned")
    }
}

/// Map a rusqlite error, translating constraint violations into the
/// given domain error.
pub(crate) fn map_constraint(e: rusqlite::Error, on_conflict: TagVaultError) -> TagVaultError {
    match &e {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            on_conflict
        }
        _ => TagVaultError::StoreError(e.to_string()),
    }
}
