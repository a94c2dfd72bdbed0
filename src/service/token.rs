//! Vault-access tokens.
//!
//! A successful login-finish mints a short-lived bearer token mapping
//! to a grant: the tag identifier, its vault, and the KEK seed the
//! engine released.  Holding the seed (not a derived KEK, and never a
//! DEK) means every vault request re-derives the KEK against the
//! tag's *current* salt and unwraps the DEK fresh — rotation takes
//! effect immediately and data keys are never cached across requests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::crypto::keys::KekSeed;
use crate::crypto::TagId;
use crate::errors::{Result, TagVaultError};

struct Grant {
    identifier: TagId,
    vault_id: String,
    kek_seed: KekSeed,
    expires_at: DateTime<Utc>,
}

/// What a resolved token authorizes for the current request.
#[derive(Debug)]
pub struct GrantView {
    pub identifier: TagId,
    pub vault_id: String,
    pub kek_seed: KekSeed,
}

/// In-memory token table with constant-time token matching.
pub struct TokenStore {
    ttl: chrono::Duration,
    inner: Mutex<HashMap<String, Grant>>,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(15)),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh token for a completed login.
    pub fn issue(
        &self,
        identifier: TagId,
        vault_id: String,
        kek_seed: KekSeed,
        now: DateTime<Utc>,
    ) -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let grant = Grant {
            identifier,
            vault_id,
            kek_seed,
            expires_at: now + self.ttl,
        };
        self.inner
            .lock()
            .expect("token store poisoned")
            .insert(token.clone(), grant);
        token
    }

    /// Resolve a presented token.
    ///
    /// The scan compares every stored token in constant time rather
    /// than hitting the map by key, so lookup timing does not depend
    /// on how much of a forged token matches.
    pub fn resolve(&self, token: &str, now: DateTime<Utc>) -> Result<GrantView> {
        let mut inner = self.inner.lock().expect("token store poisoned");

        let mut matched: Option<String> = None;
        for stored in inner.keys() {
            if stored.as_bytes().ct_eq(token.as_bytes()).unwrap_u8() == 1 {
                matched = Some(stored.clone());
            }
        }

        let key = matched.ok_or(TagVaultError::AccessDenied)?;
        let grant = inner.get(&key).ok_or(TagVaultError::AccessDenied)?;

        if now >= grant.expires_at {
            inner.remove(&key);
            return Err(TagVaultError::AccessDenied);
        }

        Ok(GrantView {
            identifier: grant.identifier,
            vault_id: grant.vault_id.clone(),
            kek_seed: grant.kek_seed.clone(),
        })
    }

    /// Drop a single token (logout).
    pub fn revoke(&self, token: &str) {
        self.inner.lock().expect("token store poisoned").remove(token);
    }

    /// Drop every token for a tag (tag deletion).
    pub fn revoke_for_tag(&self, identifier: &TagId) {
        self.inner
            .lock()
            .expect("token store poisoned")
            .retain(|_, grant| grant.identifier != *identifier);
    }

    /// Remove expired tokens; returns how many were purged.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().expect("token store poisoned");
        let before = inner.len();
        inner.retain(|_, grant| now < grant.expires_at);
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("token store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
