//! Handshake orchestration against the persistent tag store.
//!
//! The orchestrator owns the session store and drives the engine
//! through both two-phase flows.  Two properties shape the code:
//!
//! - **Timeout safety**: every engine round-trip happens *before* any
//!   session mutation, so a `Timeout` leaves the world exactly as it
//!   was and the caller can retry with the same session.
//! - **Enumeration resistance**: `login_start` behaves identically
//!   whether or not the identifier exists, and `login_finish` reports
//!   the same `AuthenticationFailed` for a wrong phrase and for a
//!   login that was started against a fake record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypto::keys::{self, KekSeed};
use crate::crypto::wrap::wrap_data_key;
use crate::crypto::{derive_kek, DataKey, TagId};
use crate::errors::{Result, TagVaultError};
use crate::store::keys::PURPOSE_VAULT_DATA;
use crate::store::{Database, SecretTagRecord};

use super::opaque::ENVELOPE_LEN;
use super::session::{SessionPhase, SessionStore};
use super::{call_engine, PakeEngine};

/// Default display color for tags registered without one.
const DEFAULT_COLOR: &str = "#6b7280";

/// What a successful login releases to the service layer.
#[derive(Debug)]
pub struct LoginSuccess {
    pub identifier: TagId,
    pub session_key: Zeroizing<Vec<u8>>,
    pub kek_seed: KekSeed,
}

pub struct Orchestrator {
    db: Arc<Database>,
    engine: Arc<dyn PakeEngine>,
    sessions: SessionStore,
    engine_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        engine: Arc<dyn PakeEngine>,
        session_ttl: Duration,
        engine_timeout: Duration,
    ) -> Self {
        Self {
            db,
            engine,
            sessions: SessionStore::new(session_ttl),
            engine_timeout,
        }
    }

    /// Phase 1 of registration.
    ///
    /// The label lives in the session until registration-finish: no
    /// durable tag row exists yet, so the session is the only place
    /// it can wait.
    pub fn register_start(
        &self,
        user_id: &str,
        identifier: TagId,
        client_msg: &[u8],
        label: &str,
        color: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        if label.is_empty() {
            return Err(TagVaultError::InvalidInput("label must not be empty".into()));
        }
        if self.db.tag_exists(&identifier)? {
            return Err(TagVaultError::AlreadyRegistered);
        }

        let engine = Arc::clone(&self.engine);
        let msg = client_msg.to_vec();
        let server_msg = call_engine(self.engine_timeout, move || {
            engine.registration_init(&identifier, &msg)
        })?;

        self.sessions.insert_registration(
            user_id,
            identifier,
            label.to_string(),
            color.map(str::to_string),
            now,
        );
        Ok(server_msg)
    }

    /// Phase 2 of registration: on success, atomically creates the
    /// tag and its first wrapped key, and deletes the session.
    pub fn register_finish(
        &self,
        user_id: &str,
        identifier: TagId,
        client_msg: &[u8],
        now: DateTime<Utc>,
    ) -> Result<String> {
        // Require a live session before any engine work.
        self.sessions.peek_registration(user_id, identifier, now)?;

        let engine = Arc::clone(&self.engine);
        let msg = client_msg.to_vec();
        let result = call_engine(self.engine_timeout, move || {
            engine.registration_finish(&identifier, &msg)
        });

        // On timeout the session stays; any other outcome consumes it.
        if matches!(result, Err(TagVaultError::Timeout)) {
            return Err(TagVaultError::Timeout);
        }
        let session = self.sessions.consume_registration(user_id, identifier, now)?;
        let record = result?;

        // Fresh DEK, wrapped under a KEK derived from the released
        // seed and a new random salt.  Tag + key land in one
        // transaction.
        let salt = keys::generate_salt();
        let kek = derive_kek(&record.kek_seed, &salt)?;
        let dek = DataKey::generate();
        let wrapped = wrap_data_key(&kek, &dek)?;

        let vault_id = identifier.to_hex();
        let tag = SecretTagRecord {
            identifier,
            user_id: user_id.to_string(),
            salt: salt.to_vec(),
            verifier: record.verifier,
            envelope: record.envelope,
            label: session.label.unwrap_or_else(|| "Untitled".to_string()),
            color: session.color.unwrap_or_else(|| DEFAULT_COLOR.to_string()),
            created_at: now,
            updated_at: now,
        };
        self.db
            .create_tag_with_key(&tag, &vault_id, &wrapped, PURPOSE_VAULT_DATA)?;

        Ok(vault_id)
    }

    /// Phase 1 of login.  Always answers with a well-formed server
    /// message; an unknown identifier takes the engine's fake-record
    /// path and is indistinguishable from the genuine one.
    pub fn login_start(
        &self,
        user_id: &str,
        identifier: TagId,
        client_msg: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(String, Vec<u8>)> {
        let envelope = match self.db.find_tag(&identifier)? {
            Some(tag) => {
                // The verifier guards the envelope on its way back to
                // the engine.
                let digest = <sha2::Sha256 as sha2::Digest>::digest(&tag.envelope);
                if digest.ct_eq(tag.verifier.as_slice()).unwrap_u8() != 1 {
                    return Err(TagVaultError::StoreError(
                        "stored envelope fails verifier check".into(),
                    ));
                }
                Some(tag.envelope)
            }
            None => {
                // Mirror the digest-and-compare over a same-length
                // dummy so the absent path does the same work before
                // the engine call.  The engine itself runs identical
                // group operations either way (fake-credential path).
                let dummy = [0u8; ENVELOPE_LEN];
                let digest = <sha2::Sha256 as sha2::Digest>::digest(dummy.as_slice());
                let _ = digest.ct_eq([0u8; 32].as_slice()).unwrap_u8();
                None
            }
        };

        let engine = Arc::clone(&self.engine);
        let msg = client_msg.to_vec();
        let start = call_engine(self.engine_timeout, move || {
            engine.login_init(&identifier, envelope.as_deref(), &msg)
        })?;

        let session_id = self.sessions.insert_login(user_id, identifier, start.state, now);
        Ok((session_id, start.message))
    }

    /// Phase 2 of login.
    ///
    /// The session is consumed whatever the engine says — except on
    /// `Timeout`, which leaves it untouched for a retry.  Concurrent
    /// finishes race at the consume: exactly one wins, the rest see
    /// `SessionNotFound`.
    pub fn login_finish(
        &self,
        session_id: &str,
        client_msg: &[u8],
        now: DateTime<Utc>,
    ) -> Result<LoginSuccess> {
        let (identifier, state) = self.sessions.peek_login(session_id, now)?;

        let engine = Arc::clone(&self.engine);
        let msg = client_msg.to_vec();
        let result = call_engine(self.engine_timeout, move || {
            engine.login_finish(&identifier, &state, &msg)
        });

        if matches!(result, Err(TagVaultError::Timeout)) {
            return Err(TagVaultError::Timeout);
        }
        self.sessions.consume(session_id, SessionPhase::LoginStarted, now)?;

        // Wrong phrase, fake record, malformed message: one outcome.
        let outcome = result.map_err(|_| TagVaultError::AuthenticationFailed)?;

        // A fake-record login can never reach here (the engine fails
        // it), but the tag could have been deleted mid-handshake.
        if !self.db.tag_exists(&identifier)? {
            return Err(TagVaultError::AuthenticationFailed);
        }

        Ok(LoginSuccess {
            identifier,
            session_key: outcome.session_key,
            kek_seed: outcome.kek_seed,
        })
    }

    /// Purge expired sessions; same atomic primitive as live
    /// consumption, so the sweep never races a finish.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        self.sessions.sweep_expired(now)
    }

    /// Live session count (metrics and tests).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
