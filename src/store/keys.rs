//! WrappedKey rows: the only persisted form of data-encryption keys.
//!
//! A rotation never deletes in place — it inserts a new version row,
//! re-points referencing blobs, and only then removes the superseded
//! row.  The unwrapped key itself never touches this module.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::crypto::wrap::WRAPPED_KEY_LEN;
use crate::crypto::TagId;
use crate::errors::{Result, TagVaultError};

use super::Database;

/// Purpose tag for vault data-encryption keys.
pub const PURPOSE_VAULT_DATA: &str = "vault-data";

/// One stored wrapped key version.
#[derive(Debug, Clone)]
pub struct WrappedKeyRecord {
    pub id: i64,
    pub tag_identifier: TagId,
    pub vault_id: String,
    pub wrapped: Vec<u8>,
    pub purpose: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Reject wrapped bytes of the wrong width before they reach disk.
pub(crate) fn check_wrapped_width(wrapped: &[u8]) -> Result<()> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(TagVaultError::InvalidInput(format!(
            "wrapped key must be {WRAPPED_KEY_LEN} bytes, got {}",
            wrapped.len()
        )));
    }
    Ok(())
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

impl Database {
    /// The highest-version wrapped key for (tag, vault) — the one all
    /// new writes and reads go through.
    pub fn current_wrapped_key(
        &self,
        tag: &TagId,
        vault_id: &str,
    ) -> Result<Option<WrappedKeyRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, wrapped, purpose, version, created_at
                 FROM wrapped_keys
                 WHERE tag_identifier = ?1 AND vault_id = ?2
                 ORDER BY version DESC LIMIT 1",
                params![tag.as_bytes().as_slice(), vault_id],
                |row| {
                    Ok(WrappedKeyRecord {
                        id: row.get(0)?,
                        tag_identifier: *tag,
                        vault_id: vault_id.to_string(),
                        wrapped: row.get(1)?,
                        purpose: row.get(2)?,
                        version: row.get(3)?,
                        created_at: parse_ts(&row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Insert the next wrapped key version and update the tag's salt
    /// in the same transaction (the salt is what changes the KEK).
    ///
    /// Returns the new row id.  The superseded row stays until
    /// [`Database::migrate_blob_key_refs`] has re-pointed every blob.
    pub fn rotate_wrapped_key(
        &self,
        tag: &TagId,
        vault_id: &str,
        wrapped: &[u8],
        new_salt: &[u8],
        now: DateTime<Utc>,
    ) -> Result<i64> {
        check_wrapped_width(wrapped)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let next_version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM wrapped_keys
             WHERE tag_identifier = ?1 AND vault_id = ?2",
            params![tag.as_bytes().as_slice(), vault_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO wrapped_keys (tag_identifier, vault_id, wrapped, purpose, version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tag.as_bytes().as_slice(),
                vault_id,
                wrapped,
                PURPOSE_VAULT_DATA,
                next_version,
                now.to_rfc3339(),
            ],
        )?;
        let new_id = tx.last_insert_rowid();

        let updated = tx.execute(
            "UPDATE secret_tags SET salt = ?2, updated_at = ?3 WHERE identifier = ?1",
            params![tag.as_bytes().as_slice(), new_salt, now.to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(TagVaultError::NotFound);
        }

        tx.commit()?;
        Ok(new_id)
    }

    /// Re-point every blob referencing `old_key_id` to `new_key_id`.
    /// Returns the number of migrated blobs.
    pub fn migrate_blob_key_refs(&self, old_key_id: i64, new_key_id: i64) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE vault_blobs SET key_id = ?2 WHERE key_id = ?1",
            params![old_key_id, new_key_id],
        )?;
        Ok(n)
    }

    /// Delete a superseded wrapped key version.  Fails while blobs
    /// still reference it (the blob rows are not cascade-deleted by a
    /// rotation, only by a tag deletion).
    pub fn delete_wrapped_key(&self, key_id: i64) -> Result<()> {
        let conn = self.conn();

        let referencing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vault_blobs WHERE key_id = ?1",
            params![key_id],
            |row| row.get(0),
        )?;
        if referencing > 0 {
            return Err(TagVaultError::StoreError(format!(
                "{referencing} blobs still reference wrapped key {key_id}"
            )));
        }

        conn.execute("DELETE FROM wrapped_keys WHERE id = ?1", params![key_id])?;
        Ok(())
    }
}
