//! SecretTag rows: one per (owner, phrase).
//!
//! The identifier column is the deterministic phrase hash and the
//! only lookup key the server ever receives.  The envelope is opaque
//! engine material; the verifier is checked against it before it is
//! handed back to the engine.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::crypto::TagId;
use crate::errors::{Result, TagVaultError};

use super::{map_constraint, Database};

/// A durable secret tag.
#[derive(Debug, Clone)]
pub struct SecretTagRecord {
    pub identifier: TagId,
    pub user_id: String,
    pub salt: Vec<u8>,
    pub verifier: Vec<u8>,
    pub envelope: Vec<u8>,
    pub label: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Display metadata only — no cryptographic material.  Returned by
/// `list_tags` after the caller has authenticated.
#[derive(Debug, Clone)]
pub struct TagSummary {
    pub identifier: TagId,
    pub label: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

impl Database {
    /// Atomically create a tag and its first wrapped key.
    ///
    /// Registration-finish calls this inside one transaction so a
    /// crash can never leave a tag without a key (or vice versa).
    pub fn create_tag_with_key(
        &self,
        record: &SecretTagRecord,
        vault_id: &str,
        wrapped_key: &[u8],
        purpose: &str,
    ) -> Result<i64> {
        super::keys::check_wrapped_width(wrapped_key)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO secret_tags
                 (identifier, user_id, salt, verifier, envelope, label, color, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.identifier.as_bytes().as_slice(),
                record.user_id,
                record.salt,
                record.verifier,
                record.envelope,
                record.label,
                record.color,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| map_constraint(e, TagVaultError::AlreadyRegistered))?;

        tx.execute(
            "INSERT INTO wrapped_keys (tag_identifier, vault_id, wrapped, purpose, version, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                record.identifier.as_bytes().as_slice(),
                vault_id,
                wrapped_key,
                purpose,
                record.created_at.to_rfc3339(),
            ],
        )?;
        let key_id = tx.last_insert_rowid();

        tx.commit()?;
        Ok(key_id)
    }

    /// Look up a tag by identifier.
    pub fn find_tag(&self, identifier: &TagId) -> Result<Option<SecretTagRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT user_id, salt, verifier, envelope, label, color, created_at, updated_at
                 FROM secret_tags WHERE identifier = ?1",
                params![identifier.as_bytes().as_slice()],
                |row| {
                    Ok(SecretTagRecord {
                        identifier: *identifier,
                        user_id: row.get(0)?,
                        salt: row.get(1)?,
                        verifier: row.get(2)?,
                        envelope: row.get(3)?,
                        label: row.get(4)?,
                        color: row.get(5)?,
                        created_at: parse_ts(&row.get::<_, String>(6)?),
                        updated_at: parse_ts(&row.get::<_, String>(7)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Whether any tag exists for this identifier.
    pub fn tag_exists(&self, identifier: &TagId) -> Result<bool> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM secret_tags WHERE identifier = ?1",
            params![identifier.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Display metadata for every tag a user owns.  Only reachable
    /// after authentication — existence of tags is never revealed to
    /// unauthenticated callers.
    pub fn list_tags(&self, user_id: &str) -> Result<Vec<TagSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT identifier, label, color, created_at, updated_at
             FROM secret_tags WHERE user_id = ?1 ORDER BY label",
        )?;

        let rows = stmt.query_map(params![user_id], |row| {
            let id_bytes: Vec<u8> = row.get(0)?;
            Ok((
                id_bytes,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id_bytes, label, color, created, updated) = row?;
            summaries.push(TagSummary {
                identifier: TagId::from_bytes(&id_bytes)?,
                label,
                color,
                created_at: parse_ts(&created),
                updated_at: parse_ts(&updated),
            });
        }
        Ok(summaries)
    }

    /// Delete a tag.  Cascades to its wrapped keys and blobs.
    /// Returns `false` when no such tag existed.
    pub fn delete_tag(&self, identifier: &TagId) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "DELETE FROM secret_tags WHERE identifier = ?1",
            params![identifier.as_bytes().as_slice()],
        )?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_tag(phrase: &str, user: &str, label: &str) -> SecretTagRecord {
        let now = Utc::now();
        SecretTagRecord {
            identifier: TagId::derive(phrase).unwrap(),
            user_id: user.to_string(),
            salt: vec![1u8; 32],
            verifier: vec![2u8; 32],
            envelope: vec![3u8; 64],
            label: label.to_string(),
            color: "#4a90d9".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn wrapped() -> Vec<u8> {
        vec![0u8; 60]
    }

    #[test]
    fn create_and_find_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let tag = sample_tag("blue horizon", "user-1", "Personal");

        db.create_tag_with_key(&tag, "vault-1", &wrapped(), "vault-data")
            .unwrap();

        let found = db.find_tag(&tag.identifier).unwrap().unwrap();
        assert_eq!(found.label, "Personal");
        assert_eq!(found.envelope, tag.envelope);
        assert!(db.tag_exists(&tag.identifier).unwrap());
    }

    #[test]
    fn duplicate_identifier_is_already_registered() {
        let db = Database::open_in_memory().unwrap();
        let tag = sample_tag("blue horizon", "user-1", "Personal");

        db.create_tag_with_key(&tag, "v", &wrapped(), "vault-data")
            .unwrap();

        let mut dup = sample_tag("blue horizon", "user-1", "Other Label");
        dup.identifier = tag.identifier;
        let err = db
            .create_tag_with_key(&dup, "v", &wrapped(), "vault-data")
            .unwrap_err();
        assert!(matches!(err, TagVaultError::AlreadyRegistered));
    }

    #[test]
    fn owner_label_pairs_are_unique() {
        let db = Database::open_in_memory().unwrap();
        db.create_tag_with_key(
            &sample_tag("phrase one", "user-1", "Personal"),
            "v1",
            &wrapped(),
            "vault-data",
        )
        .unwrap();

        let err = db
            .create_tag_with_key(
                &sample_tag("phrase two", "user-1", "Personal"),
                "v2",
                &wrapped(),
                "vault-data",
            )
            .unwrap_err();
        assert!(matches!(err, TagVaultError::AlreadyRegistered));

        // Same label under a different owner is fine.
        db.create_tag_with_key(
            &sample_tag("phrase three", "user-2", "Personal"),
            "v3",
            &wrapped(),
            "vault-data",
        )
        .unwrap();
    }

    #[test]
    fn list_tags_is_scoped_to_owner() {
        let db = Database::open_in_memory().unwrap();
        db.create_tag_with_key(
            &sample_tag("a", "user-1", "Alpha"),
            "v1",
            &wrapped(),
            "vault-data",
        )
        .unwrap();
        db.create_tag_with_key(
            &sample_tag("b", "user-2", "Beta"),
            "v2",
            &wrapped(),
            "vault-data",
        )
        .unwrap();

        let tags = db.list_tags("user-1").unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].label, "Alpha");
    }

    #[test]
    fn delete_cascades_to_wrapped_keys() {
        let db = Database::open_in_memory().unwrap();
        let tag = sample_tag("cascade", "user-1", "Doomed");
        db.create_tag_with_key(&tag, "v", &wrapped(), "vault-data")
            .unwrap();

        assert!(db.delete_tag(&tag.identifier).unwrap());
        assert!(db
            .current_wrapped_key(&tag.identifier, "v")
            .unwrap()
            .is_none());
        assert!(!db.delete_tag(&tag.identifier).unwrap());
    }

    #[test]
    fn rotation_replaces_the_tag_salt() {
        let db = Database::open_in_memory().unwrap();
        let tag = sample_tag("rotate me", "user-1", "Spins");
        db.create_tag_with_key(&tag, "v", &wrapped(), "vault-data")
            .unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        db.rotate_wrapped_key(&tag.identifier, "v", &wrapped(), &[9u8; 32], later)
            .unwrap();

        let found = db.find_tag(&tag.identifier).unwrap().unwrap();
        assert_eq!(found.salt, vec![9u8; 32]);
        assert!(found.updated_at > found.created_at);
    }
}
