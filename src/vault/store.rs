//! Encrypted blob storage over the shared database.
//!
//! `put` seals plaintext under a fresh random IV and upserts on
//! (vault, object); `get` decrypts and verifies, failing closed with
//! `TamperDetected` — altered plaintext is never returned, partially
//! or otherwise.  The store holds ciphertext only; the caller brings
//! the unwrapped data-encryption key for the duration of one request.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::crypto::encryption;
use crate::crypto::keys::DataKey;
use crate::errors::{Result, TagVaultError};
use crate::store::Database;

use super::blob::{BlobContent, BlobMetadata};

/// Blob store handle.  Cheap to clone.
#[derive(Clone)]
pub struct VaultBlobStore {
    db: Arc<Database>,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

impl VaultBlobStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Encrypt and store a blob, overwriting any existing
    /// (vault, object) entry.
    ///
    /// `key_id` records which wrapped key version the data key came
    /// from; UNIQUE(key_id, iv) turns an IV collision under the same
    /// key into a hard storage error.
    pub fn put(
        &self,
        vault_id: &str,
        object_id: &str,
        key_id: i64,
        dek: &DataKey,
        plaintext: &[u8],
        content_type: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sealed = encryption::seal(dek.as_bytes(), plaintext)?;

        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO vault_blobs
                 (vault_id, object_id, key_id, iv, ciphertext, auth_tag, content_type, plaintext_len, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(vault_id, object_id) DO UPDATE SET
                 key_id = excluded.key_id,
                 iv = excluded.iv,
                 ciphertext = excluded.ciphertext,
                 auth_tag = excluded.auth_tag,
                 content_type = excluded.content_type,
                 plaintext_len = excluded.plaintext_len,
                 updated_at = excluded.updated_at",
            params![
                vault_id,
                object_id,
                key_id,
                sealed.iv.as_slice(),
                sealed.ciphertext,
                sealed.auth_tag.as_slice(),
                content_type,
                plaintext.len() as i64,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch and decrypt a blob.
    ///
    /// `NotFound` when no such (vault, object) exists;
    /// `TamperDetected` when verification fails — treated as fatal,
    /// never retried here.
    pub fn get(&self, vault_id: &str, object_id: &str, dek: &DataKey) -> Result<BlobContent> {
        let row = {
            let conn = self.db.conn();
            conn.query_row(
                "SELECT iv, ciphertext, auth_tag, content_type, plaintext_len
                 FROM vault_blobs WHERE vault_id = ?1 AND object_id = ?2",
                params![vault_id, object_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?
        };

        let (iv, ciphertext, auth_tag, content_type, declared_len) =
            row.ok_or(TagVaultError::NotFound)?;

        let plaintext = encryption::open(dek.as_bytes(), &iv, &ciphertext, &auth_tag)?;

        // Declared size is advisory; a mismatch after successful
        // decryption means a stale metadata column, not tampering.
        if plaintext.len() as i64 != declared_len {
            tracing::warn!(
                vault = vault_id,
                object = object_id,
                declared = declared_len,
                actual = plaintext.len(),
                "blob length metadata out of sync"
            );
        }

        Ok(BlobContent {
            content_type,
            plaintext,
        })
    }

    /// Remove a blob.  Returns `false` when it did not exist.
    pub fn delete(&self, vault_id: &str, object_id: &str) -> Result<bool> {
        let conn = self.db.conn();
        let n = conn.execute(
            "DELETE FROM vault_blobs WHERE vault_id = ?1 AND object_id = ?2",
            params![vault_id, object_id],
        )?;
        Ok(n > 0)
    }

    /// Metadata for every object in a vault — no ciphertext touched.
    pub fn list_objects(&self, vault_id: &str) -> Result<Vec<BlobMetadata>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT object_id, content_type, plaintext_len, created_at, updated_at
             FROM vault_blobs WHERE vault_id = ?1 ORDER BY object_id",
        )?;

        let rows = stmt.query_map(params![vault_id], |row| {
            Ok(BlobMetadata {
                vault_id: vault_id.to_string(),
                object_id: row.get(0)?,
                content_type: row.get(1)?,
                plaintext_len: row.get::<_, i64>(2)? as u64,
                created_at: parse_ts(&row.get::<_, String>(3)?),
                updated_at: parse_ts(&row.get::<_, String>(4)?),
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
