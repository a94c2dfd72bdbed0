//! In-memory store for in-flight handshake sessions.
//!
//! Sessions never touch disk: the only durable artifact of a
//! handshake is the SecretTag written at registration-finish.  A
//! session is created at an `-init` call, consumed (removed, not
//! marked) at the matching `-finish`, and purged by the background
//! sweep once its TTL passes.  Consumption is an atomic
//! remove-under-lock, so two concurrent finishes for the same
//! session-id have exactly one winner.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::crypto::TagId;
use crate::errors::{Result, TagVaultError};

/// Which phase of the handshake a session belongs to.  Sessions never
/// move between phases and never transition backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    RegistrationStarted,
    LoginStarted,
}

/// One in-flight handshake.
///
/// `state` is opaque engine material — meaningless outside the PAKE
/// engine and never inspected here.  `label`/`color` are carried only
/// for registration sessions: there is no durable tag row yet, so the
/// session is the only place the pending display metadata can live.
#[derive(Debug, Clone)]
pub struct OpaqueSession {
    pub id: String,
    pub user_id: String,
    pub identifier: TagId,
    pub phase: SessionPhase,
    pub state: Vec<u8>,
    pub label: Option<String>,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl OpaqueSession {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

struct Inner {
    by_id: HashMap<String, OpaqueSession>,
    /// (user, identifier) → session-id for pending registrations, so
    /// registration-finish can find its session without a session-id.
    registrations: HashMap<(String, TagId), String>,
}

/// Thread-safe session store with atomic consume-and-delete.
pub struct SessionStore {
    ttl: chrono::Duration,
    inner: Mutex<Inner>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24)),
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                registrations: HashMap::new(),
            }),
        }
    }

    /// Generate a fresh high-entropy session id (32 random bytes,
    /// base64url).
    fn new_session_id() -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Create a registration session, replacing any previous pending
    /// registration for the same (user, identifier).
    pub fn insert_registration(
        &self,
        user_id: &str,
        identifier: TagId,
        label: String,
        color: Option<String>,
        now: DateTime<Utc>,
    ) -> String {
        let id = Self::new_session_id();
        let session = OpaqueSession {
            id: id.clone(),
            user_id: user_id.to_string(),
            identifier,
            phase: SessionPhase::RegistrationStarted,
            state: Vec::new(),
            label: Some(label),
            color,
            created_at: now,
            expires_at: now + self.ttl,
            last_activity: now,
        };

        let mut inner = self.inner.lock().expect("session store poisoned");
        let key = (user_id.to_string(), identifier);
        if let Some(old_id) = inner.registrations.insert(key, id.clone()) {
            inner.by_id.remove(&old_id);
        }
        inner.by_id.insert(id.clone(), session);
        id
    }

    /// Create a login session.  Concurrent logins for the same
    /// identifier each get their own independent session.
    pub fn insert_login(
        &self,
        user_id: &str,
        identifier: TagId,
        state: Vec<u8>,
        now: DateTime<Utc>,
    ) -> String {
        let id = Self::new_session_id();
        let session = OpaqueSession {
            id: id.clone(),
            user_id: user_id.to_string(),
            identifier,
            phase: SessionPhase::LoginStarted,
            state,
            label: None,
            color: None,
            created_at: now,
            expires_at: now + self.ttl,
            last_activity: now,
        };

        let mut inner = self.inner.lock().expect("session store poisoned");
        inner.by_id.insert(id.clone(), session);
        id
    }

    /// Read a login session's engine state without consuming it.
    ///
    /// Used before the engine call so that a `Timeout` leaves the
    /// session untouched and the same session-id safe to retry.
    pub fn peek_login(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(TagId, Vec<u8>)> {
        let mut inner = self.inner.lock().expect("session store poisoned");

        let expired = match inner.by_id.get_mut(session_id) {
            Some(s) if s.phase != SessionPhase::LoginStarted => {
                return Err(TagVaultError::SessionNotFound)
            }
            Some(s) if s.is_expired(now) => true,
            Some(s) => {
                s.last_activity = now;
                return Ok((s.identifier, s.state.clone()));
            }
            None => return Err(TagVaultError::SessionNotFound),
        };

        if expired {
            inner.by_id.remove(session_id);
        }
        Err(TagVaultError::SessionExpired)
    }

    /// Check that a pending registration session exists for
    /// (user, identifier) without consuming it.
    ///
    /// Called before the engine round-trip so that a `Timeout` leaves
    /// the session in place for a retry.
    pub fn peek_registration(
        &self,
        user_id: &str,
        identifier: TagId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("session store poisoned");

        let key = (user_id.to_string(), identifier);
        let session_id = match inner.registrations.get(&key) {
            Some(id) => id.clone(),
            None => return Err(TagVaultError::SessionNotFound),
        };

        let expired = match inner.by_id.get_mut(&session_id) {
            Some(s) if s.is_expired(now) => true,
            Some(s) => {
                s.last_activity = now;
                return Ok(());
            }
            None => {
                inner.registrations.remove(&key);
                return Err(TagVaultError::SessionNotFound);
            }
        };

        if expired {
            inner.by_id.remove(&session_id);
            inner.registrations.remove(&key);
        }
        Err(TagVaultError::SessionExpired)
    }

    /// Atomically consume a session by id.
    ///
    /// Exactly one concurrent caller wins; everyone else sees
    /// `SessionNotFound`.  An expired session is removed and reported
    /// as `SessionExpired`.
    pub fn consume(
        &self,
        session_id: &str,
        phase: SessionPhase,
        now: DateTime<Utc>,
    ) -> Result<OpaqueSession> {
        let mut inner = self.inner.lock().expect("session store poisoned");

        match inner.by_id.get(session_id) {
            Some(s) if s.phase != phase => return Err(TagVaultError::SessionNotFound),
            Some(_) => {}
            None => return Err(TagVaultError::SessionNotFound),
        }

        let session = inner
            .by_id
            .remove(session_id)
            .ok_or(TagVaultError::SessionNotFound)?;
        // The registrations index only maps registration sessions.
        // Consuming a login session must not unhook a pending
        // registration for the same (user, identifier).
        if session.phase == SessionPhase::RegistrationStarted {
            let reg_key = (session.user_id.clone(), session.identifier);
            inner.registrations.remove(&reg_key);
        }

        if session.is_expired(now) {
            return Err(TagVaultError::SessionExpired);
        }
        Ok(session)
    }

    /// Atomically consume the pending registration session for
    /// (user, identifier).
    pub fn consume_registration(
        &self,
        user_id: &str,
        identifier: TagId,
        now: DateTime<Utc>,
    ) -> Result<OpaqueSession> {
        let session_id = {
            let inner = self.inner.lock().expect("session store poisoned");
            inner
                .registrations
                .get(&(user_id.to_string(), identifier))
                .cloned()
                .ok_or(TagVaultError::SessionNotFound)?
        };
        self.consume(&session_id, SessionPhase::RegistrationStarted, now)
    }

    /// Remove every expired session.  Returns how many were purged.
    ///
    /// Runs under the same lock as live consumption, so a sweep never
    /// races a legitimate finish into a double-consume.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().expect("session store poisoned");

        let expired: Vec<String> = inner
            .by_id
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            if let Some(s) = inner.by_id.remove(id) {
                if s.phase == SessionPhase::RegistrationStarted {
                    inner.registrations.remove(&(s.user_id, s.identifier));
                }
            }
        }
        expired.len()
    }

    /// Number of live sessions (for metrics and tests).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("session store poisoned").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
