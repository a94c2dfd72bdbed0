//! PAKE engine boundary and handshake orchestration.
//!
//! The engine is a black box behind [`PakeEngine`]: four operations
//! over opaque byte messages whose contents this crate never
//! inspects.  [`opaque`] implements it with the audited `opaque-ke`
//! crate; [`session`] holds in-flight handshake state; and
//! [`orchestrator`] drives the two-phase registration and login flows
//! against the persistent tag store.

pub mod opaque;
pub mod orchestrator;
pub mod session;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::crypto::{KekSeed, TagId};
use crate::errors::{Result, TagVaultError};

/// Output of a successful registration-finish.
pub struct RegistrationRecord {
    /// Opaque engine envelope, persisted verbatim and never parsed.
    pub envelope: Vec<u8>,
    /// Server-side verifier value for the stored envelope.
    pub verifier: Vec<u8>,
    /// Stable per-tag seed for key-encryption-key derivation,
    /// released only by successful PAKE completion.
    pub kek_seed: KekSeed,
}

/// Output of a login-init: the server message plus the state the
/// engine needs back at login-finish.
pub struct LoginStart {
    pub message: Vec<u8>,
    pub state: Vec<u8>,
}

/// Output of a successful login-finish.
#[derive(Debug)]
pub struct LoginOutcome {
    /// Shared session key; matches the key the client derived.
    pub session_key: Zeroizing<Vec<u8>>,
    /// Same stable seed released at registration time.
    pub kek_seed: KekSeed,
}

/// The black-box PAKE engine: four operations mirroring the protocol
/// phases.  Implementations must be safe to call from any thread.
pub trait PakeEngine: Send + Sync {
    /// Process a client registration request, returning server-message-1.
    fn registration_init(&self, identifier: &TagId, client_msg: &[u8]) -> Result<Vec<u8>>;

    /// Validate the client's registration upload and produce the
    /// durable record.  Fails with `EngineRejected` on a bad upload.
    fn registration_finish(&self, identifier: &TagId, client_msg: &[u8])
        -> Result<RegistrationRecord>;

    /// Process a client credential request.
    ///
    /// When `envelope` is `None` (unknown identifier) the engine MUST
    /// still return a well-formed message indistinguishable in shape
    /// from the genuine case, so tag existence is never leaked.
    fn login_init(
        &self,
        identifier: &TagId,
        envelope: Option<&[u8]>,
        client_msg: &[u8],
    ) -> Result<LoginStart>;

    /// Validate the client's credential finalization against the
    /// stored login state.  Fails with `AuthenticationFailed` on a
    /// wrong phrase or a fake (absent-tag) login state.
    fn login_finish(
        &self,
        identifier: &TagId,
        state: &[u8],
        client_msg: &[u8],
    ) -> Result<LoginOutcome>;
}

/// Run an engine call with a bounded timeout.
///
/// The engine is a potentially slow external collaborator (process
/// or network boundary in real deployments), so the call runs on its
/// own thread and is abandoned after `timeout`.  Callers must not
/// mutate session state before the call returns: a `Timeout` leaves
/// the session untouched and the same session-id safe to retry.
pub fn call_engine<T, F>(timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        // Receiver may be gone if we already timed out; that's fine.
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(TagVaultError::Timeout),
    }
}
