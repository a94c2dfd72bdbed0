//! Integration tests for the registration and login handshakes.

use std::sync::Arc;

use rand::rngs::OsRng;
use tagvault::crypto::TagId;
use tagvault::pake::opaque::{client, OpaqueEngine};
use tagvault::service::{LoginFinishResponse, TagVault};
use tagvault::TagVaultError;

/// Helper: a fresh in-memory service with its own engine keys.
fn service() -> TagVault {
    TagVault::in_memory(Arc::new(OpaqueEngine::generate())).expect("in-memory service")
}

/// Helper: run the full two-phase registration for `phrase`.
fn register(svc: &TagVault, user: &str, phrase: &str, label: &str) {
    let mut rng = OsRng;
    let id = TagId::derive(phrase).unwrap();

    let (msg1, state) = client::registration_start(phrase, &mut rng).unwrap();
    let server_msg = svc.register_start(user, id, &msg1, label, None).unwrap();
    let msg2 = client::registration_finish(phrase, &server_msg, &state, &mut rng).unwrap();
    svc.register_finish(user, id, &msg2).unwrap();
}

/// Helper: run the full two-phase login for `phrase`.
fn login(svc: &TagVault, user: &str, phrase: &str) -> Result<LoginFinishResponse, TagVaultError> {
    let mut rng = OsRng;
    let id = TagId::derive(phrase).unwrap();

    let (msg1, state) = client::login_start(phrase, &mut rng).unwrap();
    let start = svc.login_start(user, id, &msg1)?;
    let (msg2, _client_key) = client::login_finish(phrase, &start.server_message, &state)?;
    svc.login_finish(user, &start.session_id, &msg2)
}

// ---------------------------------------------------------------------------
// Register then log in
// ---------------------------------------------------------------------------

#[test]
fn register_then_login_releases_session_key_and_token() {
    let svc = service();
    register(&svc, "user-1", "blue horizon", "Personal");

    let resp = login(&svc, "user-1", "blue horizon").expect("login succeeds");
    assert!(!resp.session_key.is_empty());
    assert!(!resp.vault_access_token.is_empty());
}

// ---------------------------------------------------------------------------
// Duplicate registration
// ---------------------------------------------------------------------------

#[test]
fn registering_the_same_phrase_twice_fails() {
    let svc = service();
    register(&svc, "user-1", "blue horizon", "Personal");

    let mut rng = OsRng;
    let id = TagId::derive("blue horizon").unwrap();
    let (msg1, _state) = client::registration_start("blue horizon", &mut rng).unwrap();

    let err = svc
        .register_start("user-1", id, &msg1, "Again", None)
        .unwrap_err();
    assert!(matches!(err, TagVaultError::AlreadyRegistered));
}

// ---------------------------------------------------------------------------
// Enumeration resistance
// ---------------------------------------------------------------------------

#[test]
fn wrong_phrase_and_unknown_phrase_are_indistinguishable() {
    let svc = service();
    register(&svc, "user-1", "blue horizon", "Personal");

    // Both a wrong phrase against the registered tag and a phrase no
    // one ever registered must fail with the same observable error.
    let wrong = login(&svc, "user-1", "red horizon").unwrap_err();
    let unknown = login(&svc, "user-1", "never seen before").unwrap_err();
    assert_eq!(wrong.to_string(), unknown.to_string());
}

#[test]
fn login_start_answers_for_unknown_identifiers() {
    let svc = service();
    register(&svc, "user-1", "blue horizon", "Personal");

    let mut rng = OsRng;
    let (msg1, _state) = client::login_start("phantom phrase", &mut rng).unwrap();
    let id = TagId::derive("phantom phrase").unwrap();

    // Phase 1 must succeed and produce a well-formed server message
    // even though no such tag exists.
    let start = svc.login_start("user-1", id, &msg1).expect("fake path answers");
    assert!(!start.server_message.is_empty());
    assert!(!start.session_id.is_empty());
}

// ---------------------------------------------------------------------------
// Sessions are single-use
// ---------------------------------------------------------------------------

#[test]
fn finished_session_cannot_be_replayed() {
    let svc = service();
    register(&svc, "user-1", "blue horizon", "Personal");

    let mut rng = OsRng;
    let id = TagId::derive("blue horizon").unwrap();
    let (msg1, state) = client::login_start("blue horizon", &mut rng).unwrap();
    let start = svc.login_start("user-1", id, &msg1).unwrap();
    let (msg2, _key) = client::login_finish("blue horizon", &start.server_message, &state).unwrap();

    svc.login_finish("user-1", &start.session_id, &msg2).unwrap();
    let err = svc
        .login_finish("user-1", &start.session_id, &msg2)
        .unwrap_err();
    assert!(matches!(err, TagVaultError::SessionNotFound));
}

// ---------------------------------------------------------------------------
// Unknown session id
// ---------------------------------------------------------------------------

#[test]
fn login_finish_with_unknown_session_fails() {
    let svc = service();
    let err = svc
        .login_finish("user-1", "no-such-session", b"payload")
        .unwrap_err();
    assert!(matches!(err, TagVaultError::SessionNotFound));
}

// ---------------------------------------------------------------------------
// Identifier derivation
// ---------------------------------------------------------------------------

#[test]
fn same_phrase_derives_same_identifier_across_calls() {
    let a = TagId::derive("blue horizon").unwrap();
    let b = TagId::derive("blue horizon").unwrap();
    assert_eq!(a, b);

    // Distinct phrases land on distinct identifiers.
    let c = TagId::derive("blue horizons").unwrap();
    assert_ne!(a, c);
}

// ---------------------------------------------------------------------------
// Per-user tag listing
// ---------------------------------------------------------------------------

#[test]
fn list_tags_shows_only_the_callers_tags() {
    let svc = service();
    register(&svc, "alice", "blue horizon", "Personal");
    register(&svc, "alice", "green meadow", "Work");
    register(&svc, "bob", "red canyon", "Private");

    let alice = svc.list_tags("alice").unwrap();
    assert_eq!(alice.len(), 2);
    assert_eq!(alice[0].label, "Personal");
    assert_eq!(alice[1].label, "Work");

    let bob = svc.list_tags("bob").unwrap();
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].label, "Private");
}
