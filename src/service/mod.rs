//! The downstream service surface.
//!
//! [`TagVault`] ties the orchestrator, key wrapping, blob store,
//! token table, and audit log into the transport-agnostic
//! request/response pairs the rest of the application consumes.
//! Every operation emits one audit entry; audit failures degrade
//! gracefully and never fail the primary operation.

pub mod token;

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use serde_json::json;
use zeroize::Zeroizing;

use crate::audit::{AuditCategory, AuditEvent, AuditLog, AuditSeverity};
use crate::config::Settings;
use crate::crypto::wrap::{unwrap_data_key, wrap_data_key};
use crate::crypto::{derive_kek, keys, TagId};
use crate::errors::{Result, TagVaultError};
use crate::pake::orchestrator::Orchestrator;
use crate::pake::PakeEngine;
use crate::store::Database;
use crate::vault::blob::BlobContent;
use crate::vault::{BlobMetadata, VaultBlobStore};

use token::TokenStore;

/// Response of `login_start`.
pub struct LoginStartResponse {
    pub session_id: String,
    pub server_message: Vec<u8>,
}

/// Response of `login_finish`: the shared session key plus the
/// bearer token that unlocks the tag's vault.
#[derive(Debug)]
pub struct LoginFinishResponse {
    pub session_key: Zeroizing<Vec<u8>>,
    pub vault_access_token: String,
}

/// Process-held secrets for the audit log: the identifier-hashing
/// key and the chain-signing key, with the epoch recorded per row so
/// either can be rotated.
pub struct AuditKeys {
    pub hash_key: [u8; 32],
    pub sign_key: [u8; 32],
}

/// The secret-tag authentication and vault service.
pub struct TagVault {
    settings: Settings,
    db: Arc<Database>,
    blobs: VaultBlobStore,
    orchestrator: Orchestrator,
    tokens: TokenStore,
    audit: Option<AuditLog>,
}

impl TagVault {
    /// Open the service rooted at `project_dir`, loading settings
    /// from `tagvault.toml` if present.
    pub fn open(
        project_dir: &Path,
        engine: Arc<dyn PakeEngine>,
        audit_keys: AuditKeys,
    ) -> Result<Self> {
        let settings = Settings::load(project_dir)?;
        let db = Arc::new(Database::open(&settings.db_path(project_dir))?);

        let audit = AuditLog::open(
            &settings.audit_db_path(project_dir),
            audit_keys.hash_key,
            audit_keys.sign_key,
            settings.audit_key_epoch,
        );
        if audit.is_none() {
            tracing::error!("audit database unavailable; running without audit trail");
        }

        Ok(Self::assemble(settings, db, engine, audit))
    }

    /// In-memory service for tests: no files, no audit database.
    pub fn in_memory(engine: Arc<dyn PakeEngine>) -> Result<Self> {
        let settings = Settings::default();
        let db = Arc::new(Database::open_in_memory()?);
        Ok(Self::assemble(settings, db, engine, None))
    }

    fn assemble(
        settings: Settings,
        db: Arc<Database>,
        engine: Arc<dyn PakeEngine>,
        audit: Option<AuditLog>,
    ) -> Self {
        let orchestrator = Orchestrator::new(
            Arc::clone(&db),
            engine,
            settings.session_ttl(),
            settings.engine_timeout(),
        );
        let tokens = TokenStore::new(settings.token_ttl());
        let blobs = VaultBlobStore::new(Arc::clone(&db));
        Self {
            settings,
            db,
            blobs,
            orchestrator,
            tokens,
            audit,
        }
    }

    /// The audit log, when available (incident queries, chain checks).
    pub fn audit(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    // ------------------------------------------------------------------
    // Handshake surface
    // ------------------------------------------------------------------

    /// `register-start(identifier, client-message-1, label)`.
    pub fn register_start(
        &self,
        user_id: &str,
        identifier: TagId,
        client_msg: &[u8],
        label: &str,
        color: Option<&str>,
    ) -> Result<Vec<u8>> {
        let corr = new_correlation_id();
        let result = self.orchestrator.register_start(
            user_id,
            identifier,
            client_msg,
            label,
            color,
            Utc::now(),
        );

        self.record(AuditEvent {
            event_type: "register_start",
            category: AuditCategory::Authentication,
            severity: AuditSeverity::Info,
            user_id: Some(user_id),
            session_id: None,
            correlation_id: &corr,
            payload: json!({}),
            success: result.is_ok(),
            outcome: outcome_code(&result),
        });
        result
    }

    /// `register-finish(identifier, client-message-2)`.
    pub fn register_finish(
        &self,
        user_id: &str,
        identifier: TagId,
        client_msg: &[u8],
    ) -> Result<()> {
        let corr = new_correlation_id();
        let result = self
            .orchestrator
            .register_finish(user_id, identifier, client_msg, Utc::now());

        self.record(AuditEvent {
            event_type: "register_finish",
            category: AuditCategory::Authentication,
            severity: AuditSeverity::Info,
            user_id: Some(user_id),
            session_id: None,
            correlation_id: &corr,
            payload: json!({}),
            success: result.is_ok(),
            outcome: outcome_code(&result),
        });
        result.map(|_vault_id| ())
    }

    /// `login-start(identifier, client-message-1)`.
    ///
    /// Succeeds with an engine-shaped response whether or not the
    /// identifier exists.
    pub fn login_start(
        &self,
        user_id: &str,
        identifier: TagId,
        client_msg: &[u8],
    ) -> Result<LoginStartResponse> {
        let corr = new_correlation_id();
        let result = self
            .orchestrator
            .login_start(user_id, identifier, client_msg, Utc::now());

        self.record(AuditEvent {
            event_type: "login_start",
            category: AuditCategory::Authentication,
            severity: AuditSeverity::Info,
            user_id: Some(user_id),
            session_id: result.as_ref().ok().map(|(sid, _)| sid.as_str()),
            correlation_id: &corr,
            payload: json!({}),
            success: result.is_ok(),
            outcome: outcome_code(&result),
        });

        result.map(|(session_id, server_message)| LoginStartResponse {
            session_id,
            server_message,
        })
    }

    /// `login-finish(session-id, client-message-2)`.
    ///
    /// On success mints the vault-access token.  A wrong phrase and a
    /// never-registered phrase return byte-identical failures.
    pub fn login_finish(
        &self,
        user_id: &str,
        session_id: &str,
        client_msg: &[u8],
    ) -> Result<LoginFinishResponse> {
        let corr = new_correlation_id();
        let now = Utc::now();
        let result = self.orchestrator.login_finish(session_id, client_msg, now);

        let severity = if result.is_ok() {
            AuditSeverity::Info
        } else {
            AuditSeverity::Warning
        };
        self.record(AuditEvent {
            event_type: "login_finish",
            category: AuditCategory::Authentication,
            severity,
            user_id: Some(user_id),
            session_id: Some(session_id),
            correlation_id: &corr,
            payload: json!({}),
            success: result.is_ok(),
            outcome: outcome_code(&result),
        });

        let success = result?;
        let vault_id = success.identifier.to_hex();
        let token = self
            .tokens
            .issue(success.identifier, vault_id, success.kek_seed, now);

        Ok(LoginFinishResponse {
            session_key: success.session_key,
            vault_access_token: token,
        })
    }

    // ------------------------------------------------------------------
    // Vault surface
    // ------------------------------------------------------------------

    /// `vault-put(token, vault, object, content-type, plaintext)`.
    pub fn vault_put(
        &self,
        token: &str,
        vault_id: &str,
        object_id: &str,
        content_type: &str,
        plaintext: &[u8],
    ) -> Result<()> {
        let corr = new_correlation_id();
        let result = self.vault_put_inner(token, vault_id, object_id, content_type, plaintext);

        self.record(AuditEvent {
            event_type: "vault_put",
            category: AuditCategory::Vault,
            severity: AuditSeverity::Info,
            user_id: None,
            session_id: None,
            correlation_id: &corr,
            payload: json!({ "object": object_id, "bytes": plaintext.len() }),
            success: result.is_ok(),
            outcome: outcome_code(&result),
        });
        result
    }

    fn vault_put_inner(
        &self,
        token: &str,
        vault_id: &str,
        object_id: &str,
        content_type: &str,
        plaintext: &[u8],
    ) -> Result<()> {
        let now = Utc::now();
        let (key_id, dek) = self.unlock_vault_key(token, vault_id)?;
        self.blobs
            .put(vault_id, object_id, key_id, &dek, plaintext, content_type, now)
        // `dek` drops (and zeroes) here, on every exit path.
    }

    /// `vault-get(token, vault, object)`.
    pub fn vault_get(&self, token: &str, vault_id: &str, object_id: &str) -> Result<BlobContent> {
        let corr = new_correlation_id();
        let result = self.vault_get_inner(token, vault_id, object_id);

        let severity = match &result {
            Err(TagVaultError::TamperDetected) => AuditSeverity::Critical,
            _ => AuditSeverity::Info,
        };
        self.record(AuditEvent {
            event_type: "vault_get",
            category: AuditCategory::Vault,
            severity,
            user_id: None,
            session_id: None,
            correlation_id: &corr,
            payload: json!({ "object": object_id }),
            success: result.is_ok(),
            outcome: outcome_code(&result),
        });
        result
    }

    fn vault_get_inner(&self, token: &str, vault_id: &str, object_id: &str) -> Result<BlobContent> {
        let (_key_id, dek) = self.unlock_vault_key(token, vault_id)?;
        self.blobs.get(vault_id, object_id, &dek)
    }

    /// Delete one blob.  Returns `false` when it did not exist.
    pub fn vault_delete(&self, token: &str, vault_id: &str, object_id: &str) -> Result<bool> {
        let corr = new_correlation_id();
        let result = self
            .resolve_grant(token, vault_id)
            .and_then(|_| self.blobs.delete(vault_id, object_id));

        self.record(AuditEvent {
            event_type: "vault_delete",
            category: AuditCategory::Vault,
            severity: AuditSeverity::Info,
            user_id: None,
            session_id: None,
            correlation_id: &corr,
            payload: json!({ "object": object_id }),
            success: result.is_ok(),
            outcome: outcome_code(&result),
        });
        result
    }

    /// Metadata of every object in the vault; no decryption involved.
    pub fn vault_list(&self, token: &str, vault_id: &str) -> Result<Vec<BlobMetadata>> {
        self.resolve_grant(token, vault_id)?;
        self.blobs.list_objects(vault_id)
    }

    /// Display metadata for a user's tags.  Only exposed to callers
    /// the host application has already authenticated; existence of
    /// tags is never revealed through the handshake surface.
    pub fn list_tags(&self, user_id: &str) -> Result<Vec<crate::store::TagSummary>> {
        self.db.list_tags(user_id)
    }

    /// Delete the authenticated tag with everything in its vault,
    /// and revoke every outstanding token for it.
    pub fn delete_tag(&self, token: &str) -> Result<()> {
        let corr = new_correlation_id();
        let now = Utc::now();
        let result = (|| {
            let grant = self.tokens.resolve(token, now)?;
            self.db.delete_tag(&grant.identifier)?;
            self.tokens.revoke_for_tag(&grant.identifier);
            Ok(())
        })();

        self.record(AuditEvent {
            event_type: "tag_delete",
            category: AuditCategory::Vault,
            severity: AuditSeverity::Critical,
            user_id: None,
            session_id: None,
            correlation_id: &corr,
            payload: json!({}),
            success: result.is_ok(),
            outcome: outcome_code(&result),
        });
        result
    }

    // ------------------------------------------------------------------
    // Key rotation
    // ------------------------------------------------------------------

    /// Rotate the authenticated tag's key-encryption key.
    ///
    /// Unwraps the DEK under the old KEK, wraps it under a KEK
    /// derived from a fresh salt, writes the new wrapped-key version,
    /// re-points the blobs, and only then drops the superseded
    /// version.  The old KEK can no longer unwrap anything afterward.
    pub fn rotate_key(&self, token: &str) -> Result<()> {
        let corr = new_correlation_id();
        let result = self.rotate_key_inner(token);

        self.record(AuditEvent {
            event_type: "key_rotate",
            category: AuditCategory::KeyManagement,
            severity: AuditSeverity::Info,
            user_id: None,
            session_id: None,
            correlation_id: &corr,
            payload: json!({}),
            success: result.is_ok(),
            outcome: outcome_code(&result),
        });
        result
    }

    fn rotate_key_inner(&self, token: &str) -> Result<()> {
        let now = Utc::now();
        let grant = self.tokens.resolve(token, now)?;
        let vault_id = grant.vault_id.clone();

        let tag = self
            .db
            .find_tag(&grant.identifier)?
            .ok_or(TagVaultError::NotFound)?;
        let old_key = self
            .db
            .current_wrapped_key(&grant.identifier, &vault_id)?
            .ok_or(TagVaultError::NotFound)?;

        let old_kek = derive_kek(&grant.kek_seed, &tag.salt)?;
        let dek = unwrap_data_key(&old_kek, &old_key.wrapped)?;

        let new_salt = keys::generate_salt();
        let new_kek = derive_kek(&grant.kek_seed, &new_salt)?;
        let new_wrapped = wrap_data_key(&new_kek, &dek)?;

        let new_id =
            self.db
                .rotate_wrapped_key(&grant.identifier, &vault_id, &new_wrapped, &new_salt, now)?;

        // Blob migration runs off the critical path of the rewrap
        // itself; the superseded version is kept until it finishes.
        let migrated = self.db.migrate_blob_key_refs(old_key.id, new_id)?;
        self.db.delete_wrapped_key(old_key.id)?;

        tracing::info!(
            vault = %vault_id,
            migrated,
            old_version = old_key.version,
            "wrapped key rotated"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// One sweep over expired sessions and tokens.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let sessions = self.orchestrator.sweep_expired(now);
        let tokens = self.tokens.sweep_expired(now);
        if sessions + tokens > 0 {
            tracing::debug!(sessions, tokens, "expiry sweep");
        }
        sessions + tokens
    }

    /// Start the background expiry sweeper on the configured cadence.
    ///
    /// The returned handle stops the thread when dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let service = Arc::clone(self);
        let interval = self.settings.sweep_interval();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let join = thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    service.sweep_expired();
                }
            }
        });

        SweeperHandle {
            stop_tx,
            join: Some(join),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Resolve a token and check it targets `vault_id`.
    fn resolve_grant(&self, token: &str, vault_id: &str) -> Result<token::GrantView> {
        let grant = self.tokens.resolve(token, Utc::now())?;
        if grant.vault_id != vault_id {
            return Err(TagVaultError::AccessDenied);
        }
        Ok(grant)
    }

    /// Resolve the grant and unwrap the vault's current DEK.
    ///
    /// The key exists only for the duration of the calling request
    /// and zeroes itself when dropped.
    fn unlock_vault_key(
        &self,
        token: &str,
        vault_id: &str,
    ) -> Result<(i64, crate::crypto::DataKey)> {
        let grant = self.resolve_grant(token, vault_id)?;

        let tag = self
            .db
            .find_tag(&grant.identifier)?
            .ok_or(TagVaultError::NotFound)?;
        let key = self
            .db
            .current_wrapped_key(&grant.identifier, vault_id)?
            .ok_or(TagVaultError::NotFound)?;

        let kek = derive_kek(&grant.kek_seed, &tag.salt)?;
        let dek = unwrap_data_key(&kek, &key.wrapped)?;
        Ok((key.id, dek))
    }

    /// Best-effort audit write.
    fn record(&self, event: AuditEvent<'_>) {
        if let Some(audit) = &self.audit {
            audit.record(&event);
        }
    }
}

/// Handle to the background sweeper thread.
pub struct SweeperHandle {
    stop_tx: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Fresh correlation id for one request (8 random bytes, hex).
fn new_correlation_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut s = String::with_capacity(16);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Stable outcome codes for the audit trail.  This is where
/// internally distinct causes stay distinguishable even though the
/// caller sees a collapsed error.
fn outcome_code<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(TagVaultError::AlreadyRegistered) => "already_registered",
        Err(TagVaultError::SessionNotFound) => "session_not_found",
        Err(TagVaultError::SessionExpired) => "session_expired",
        Err(TagVaultError::EngineRejected) => "engine_rejected",
        Err(TagVaultError::AuthenticationFailed) => "auth_failed",
        Err(TagVaultError::Timeout) => "engine_timeout",
        Err(TagVaultError::UnwrapFailed) => "unwrap_failed",
        Err(TagVaultError::TamperDetected) => "tamper_detected",
        Err(TagVaultError::NotFound) => "not_found",
        Err(TagVaultError::AccessDenied) => "access_denied",
        Err(TagVaultError::InvalidInput(_)) => "invalid_input",
        Err(_) => "internal_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pake::opaque::{client, OpaqueEngine};

    fn service() -> TagVault {
        TagVault::in_memory(Arc::new(OpaqueEngine::generate())).unwrap()
    }

    /// Register "blue horizon" and log in, returning (token, vault id).
    fn open_vault(svc: &TagVault) -> (String, String) {
        let mut rng = rand::rngs::OsRng;
        let phrase = "blue horizon";
        let id = TagId::derive(phrase).unwrap();

        let (msg1, state) = client::registration_start(phrase, &mut rng).unwrap();
        let server_msg = svc
            .register_start("user-1", id, &msg1, "Personal", None)
            .unwrap();
        let msg2 = client::registration_finish(phrase, &server_msg, &state, &mut rng).unwrap();
        svc.register_finish("user-1", id, &msg2).unwrap();

        let (msg1, state) = client::login_start(phrase, &mut rng).unwrap();
        let start = svc.login_start("user-1", id, &msg1).unwrap();
        let (msg2, _key) = client::login_finish(phrase, &start.server_message, &state).unwrap();
        let resp = svc.login_finish("user-1", &start.session_id, &msg2).unwrap();
        (resp.vault_access_token, id.to_hex())
    }

    #[test]
    fn rotation_retires_the_old_kek() {
        let svc = service();
        let (token, vault) = open_vault(&svc);
        svc.vault_put(&token, &vault, "obj", "text/plain", b"payload")
            .unwrap();

        // Capture the pre-rotation KEK from the grant seed and the
        // current tag salt.
        let grant = svc.tokens.resolve(&token, Utc::now()).unwrap();
        let old_salt = svc.db.find_tag(&grant.identifier).unwrap().unwrap().salt;
        let old_kek = derive_kek(&grant.kek_seed, &old_salt).unwrap();

        svc.rotate_key(&token).unwrap();

        // The post-rotation wrapped row must not open under the old
        // KEK, while the KEK from the new salt must.
        let tag = svc.db.find_tag(&grant.identifier).unwrap().unwrap();
        assert_ne!(tag.salt, old_salt);
        let current = svc
            .db
            .current_wrapped_key(&grant.identifier, &vault)
            .unwrap()
            .unwrap();

        let err = unwrap_data_key(&old_kek, &current.wrapped).unwrap_err();
        assert!(matches!(err, TagVaultError::UnwrapFailed));

        let new_kek = derive_kek(&grant.kek_seed, &tag.salt).unwrap();
        assert!(unwrap_data_key(&new_kek, &current.wrapped).is_ok());

        // And the blob still decrypts through the normal path.
        let blob = svc.vault_get(&token, &vault, "obj").unwrap();
        assert_eq!(blob.plaintext, b"payload");
    }

    #[test]
    fn correlation_ids_are_hex_and_unique() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn outcome_codes_distinguish_collapsed_errors() {
        // Callers see the same failure for these; the audit trail
        // must not.
        assert_eq!(
            outcome_code::<()>(&Err(TagVaultError::AuthenticationFailed)),
            "auth_failed"
        );
        assert_eq!(outcome_code::<()>(&Err(TagVaultError::Timeout)), "engine_timeout");
        assert_eq!(outcome_code(&Ok(())), "ok");
    }

    #[test]
    fn vault_access_requires_a_valid_token() {
        let svc = service();
        let err = svc
            .vault_put("not-a-token", "vault", "obj", "text/plain", b"data")
            .unwrap_err();
        assert!(matches!(err, TagVaultError::AccessDenied));
    }

    #[test]
    fn sweeper_handle_stops_cleanly() {
        let svc = Arc::new(service());
        let handle = svc.spawn_sweeper();
        handle.stop();
    }
}
