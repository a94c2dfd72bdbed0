//! Security audit log — append-only, privacy-preserving, tamper-evident.
//!
//! Every authentication and vault event lands here, but never in a
//! form that could leak secrets: user and session identifiers are
//! stored as keyed HMAC-SHA256 hashes (the key epoch is recorded so
//! the hashing key can be rotated without invalidating old rows), and
//! payloads must never contain phrases or key material.
//!
//! Tamper evidence comes from a signature chain: each row's signature
//! is `HMAC(sign_key, previous_signature || canonical fields)`, so
//! altering or deleting a row breaks every signature after it.
//!
//! Designed for graceful degradation: audit writes are best-effort.
//! A failed write is escalated through `tracing::error!` (the
//! operational alert channel) but never fails the primary operation.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::Sha256;

use crate::errors::{Result, TagVaultError};

type HmacSha256 = Hmac<Sha256>;

/// Broad grouping of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditCategory {
    Authentication,
    Vault,
    KeyManagement,
}

impl AuditCategory {
    fn as_str(self) -> &'static str {
        match self {
            AuditCategory::Authentication => "authentication",
            AuditCategory::Vault => "vault",
            AuditCategory::KeyManagement => "key-management",
        }
    }
}

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

impl AuditSeverity {
    fn as_str(self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Critical => "critical",
        }
    }
}

/// An event about to be recorded.  Identifiers arrive raw and are
/// hashed before they touch storage.
#[derive(Debug)]
pub struct AuditEvent<'a> {
    pub event_type: &'a str,
    pub category: AuditCategory,
    pub severity: AuditSeverity,
    pub user_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub correlation_id: &'a str,
    pub payload: serde_json::Value,
    pub success: bool,
    pub outcome: &'a str,
}

/// A stored audit entry, as read back from the log.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub category: String,
    pub severity: String,
    pub user_hash: Option<String>,
    pub session_hash: Option<String>,
    pub correlation_id: String,
    pub payload: String,
    pub success: bool,
    pub outcome: String,
    pub key_epoch: u32,
    pub signature: Vec<u8>,
}

/// SQLite-backed audit log.
pub struct AuditLog {
    conn: Mutex<Connection>,
    hash_key: [u8; 32],
    sign_key: [u8; 32],
    key_epoch: u32,
}

impl AuditLog {
    /// Open (or create) the audit database at `path`.
    ///
    /// Returns `None` if the database can't be opened — callers should
    /// treat this as "audit logging unavailable" and continue normally
    /// (the degradation itself is escalated via `tracing`).
    pub fn open(path: &Path, hash_key: [u8; 32], sign_key: [u8; 32], key_epoch: u32) -> Option<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok()?;
        }
        let conn = Connection::open(path).ok()?;

        // Restrictive permissions on the audit database (owner-only).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(path, perms);
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp      TEXT NOT NULL,
                event_type     TEXT NOT NULL,
                category       TEXT NOT NULL,
                severity       TEXT NOT NULL,
                user_hash      TEXT,
                session_hash   TEXT,
                correlation_id TEXT NOT NULL,
                payload        TEXT NOT NULL,
                success        INTEGER NOT NULL,
                outcome        TEXT NOT NULL,
                key_epoch      INTEGER NOT NULL,
                signature      BLOB NOT NULL
            );",
        )
        .ok()?;

        Some(Self {
            conn: Mutex::new(conn),
            hash_key,
            sign_key,
            key_epoch,
        })
    }

    /// Keyed hash of a raw identifier.  One-way without the hash key;
    /// equal inputs still correlate across entries, which is what
    /// incident reconstruction needs.
    fn hash_identifier(&self, raw: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.hash_key).expect("any key length");
        mac.update(raw.as_bytes());
        let bytes = mac.finalize().into_bytes();
        let mut out = String::with_capacity(64);
        for b in bytes {
            use std::fmt::Write;
            let _ = write!(out, "{b:02x}");
        }
        out
    }

    fn canonical_line(
        timestamp: &str,
        event: &AuditEvent<'_>,
        user_hash: Option<&str>,
        session_hash: Option<&str>,
        payload: &str,
        key_epoch: u32,
    ) -> String {
        format!(
            "{timestamp}|{}|{}|{}|{}|{}|{}|{payload}|{}|{}|{key_epoch}",
            event.event_type,
            event.category.as_str(),
            event.severity.as_str(),
            user_hash.unwrap_or("-"),
            session_hash.unwrap_or("-"),
            event.correlation_id,
            u8::from(event.success),
            event.outcome,
        )
    }

    fn sign(&self, prev_signature: &[u8], canonical: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.sign_key).expect("any key length");
        mac.update(prev_signature);
        mac.update(canonical.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Record an event.  Best-effort: failures are escalated to the
    /// operational channel and swallowed — audit logging is never a
    /// transactional partner of the cryptographic operations.
    pub fn record(&self, event: &AuditEvent<'_>) {
        if let Err(e) = self.record_inner(event) {
            tracing::error!(
                event_type = event.event_type,
                correlation = event.correlation_id,
                error = %e,
                "audit write failed; continuing without audit entry"
            );
        }
    }

    fn record_inner(&self, event: &AuditEvent<'_>) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339();
        let user_hash = event.user_id.map(|u| self.hash_identifier(u));
        let session_hash = event.session_id.map(|s| self.hash_identifier(s));
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| TagVaultError::SerializationError(format!("audit payload: {e}")))?;

        let mut conn = self.conn.lock().expect("audit lock poisoned");
        let tx = conn
            .transaction()
            .map_err(|e| TagVaultError::AuditError(format!("begin: {e}")))?;

        // Read-then-append under one transaction keeps the chain linear.
        let prev: Vec<u8> = tx
            .query_row(
                "SELECT signature FROM audit_log ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TagVaultError::AuditError(format!("chain head: {e}")))?
            .unwrap_or_default();

        let canonical = Self::canonical_line(
            &timestamp,
            event,
            user_hash.as_deref(),
            session_hash.as_deref(),
            &payload,
            self.key_epoch,
        );
        let signature = self.sign(&prev, &canonical);

        tx.execute(
            "INSERT INTO audit_log
                 (timestamp, event_type, category, severity, user_hash, session_hash,
                  correlation_id, payload, success, outcome, key_epoch, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                timestamp,
                event.event_type,
                event.category.as_str(),
                event.severity.as_str(),
                user_hash,
                session_hash,
                event.correlation_id,
                payload,
                event.success,
                event.outcome,
                self.key_epoch,
                signature,
            ],
        )
        .map_err(|e| TagVaultError::AuditError(format!("insert: {e}")))?;

        tx.commit()
            .map_err(|e| TagVaultError::AuditError(format!("commit: {e}")))
    }

    /// Walk the whole chain, recomputing every signature.
    ///
    /// Returns the number of verified entries, or the id of the first
    /// entry whose signature does not match.
    pub fn verify_chain(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, event_type, category, severity, user_hash, session_hash,
                        correlation_id, payload, success, outcome, key_epoch, signature
                 FROM audit_log ORDER BY id",
            )
            .map_err(|e| TagVaultError::AuditError(format!("prepare: {e}")))?;

        // Verify over the raw stored columns — the exact bytes that
        // were signed, no parse/re-format round trip.
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, bool>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, u32>(11)?,
                    row.get::<_, Vec<u8>>(12)?,
                ))
            })
            .map_err(|e| TagVaultError::AuditError(format!("query: {e}")))?;

        let mut prev: Vec<u8> = Vec::new();
        let mut verified = 0usize;
        for row in rows {
            let (
                id,
                timestamp,
                event_type,
                category,
                severity,
                user_hash,
                session_hash,
                correlation_id,
                payload,
                success,
                outcome,
                key_epoch,
                signature,
            ) = row.map_err(|e| TagVaultError::AuditError(format!("row: {e}")))?;

            let canonical = format!(
                "{timestamp}|{event_type}|{category}|{severity}|{}|{}|{correlation_id}|{payload}|{}|{outcome}|{key_epoch}",
                user_hash.as_deref().unwrap_or("-"),
                session_hash.as_deref().unwrap_or("-"),
                u8::from(success),
            );

            let expected = self.sign(&prev, &canonical);
            if expected != signature {
                return Err(TagVaultError::AuditError(format!(
                    "signature chain broken at entry {id}"
                )));
            }
            prev = signature;
            verified += 1;
        }
        Ok(verified)
    }

    /// All entries sharing a correlation id, oldest first — the unit
    /// of incident reconstruction.
    pub fn by_correlation(&self, correlation_id: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, event_type, category, severity, user_hash, session_hash,
                        correlation_id, payload, success, outcome, key_epoch, signature
                 FROM audit_log WHERE correlation_id = ?1 ORDER BY id",
            )
            .map_err(|e| TagVaultError::AuditError(format!("prepare: {e}")))?;

        let rows = stmt
            .query_map(params![correlation_id], Self::entry_from_row)
            .map_err(|e| TagVaultError::AuditError(format!("query: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|e| TagVaultError::AuditError(format!("row: {e}")))?);
        }
        Ok(entries)
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, event_type, category, severity, user_hash, session_hash,
                        correlation_id, payload, success, outcome, key_epoch, signature
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| TagVaultError::AuditError(format!("prepare: {e}")))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], Self::entry_from_row)
            .map_err(|e| TagVaultError::AuditError(format!("query: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|e| TagVaultError::AuditError(format!("row: {e}")))?);
        }
        Ok(entries)
    }

    fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
        let ts_str: String = row.get(1)?;
        let timestamp = DateTime::parse_from_rfc3339(&ts_str)
            .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc));

        Ok(AuditEntry {
            id: row.get(0)?,
            timestamp,
            event_type: row.get(2)?,
            category: row.get(3)?,
            severity: row.get(4)?,
            user_hash: row.get(5)?,
            session_hash: row.get(6)?,
            correlation_id: row.get(7)?,
            payload: row.get(8)?,
            success: row.get(9)?,
            outcome: row.get(10)?,
            key_epoch: row.get(11)?,
            signature: row.get(12)?,
        })
    }
}
