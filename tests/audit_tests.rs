//! Integration tests for the on-disk service: database files,
//! audit trail, and chain verification across real operations.

use std::sync::Arc;

use rand::rngs::OsRng;
use tagvault::crypto::TagId;
use tagvault::pake::opaque::{client, OpaqueEngine};
use tagvault::service::{AuditKeys, TagVault};
use tempfile::TempDir;

/// Helper: a service rooted in a fresh temp dir, with audit enabled.
fn disk_service() -> (TempDir, TagVault) {
    let dir = TempDir::new().expect("create temp dir");
    let svc = TagVault::open(
        dir.path(),
        Arc::new(OpaqueEngine::generate()),
        AuditKeys {
            hash_key: [7u8; 32],
            sign_key: [9u8; 32],
        },
    )
    .expect("open service");
    (dir, svc)
}

fn register(svc: &TagVault, user: &str, phrase: &str, label: &str) {
    let mut rng = OsRng;
    let id = TagId::derive(phrase).unwrap();

    let (msg1, state) = client::registration_start(phrase, &mut rng).unwrap();
    let server_msg = svc.register_start(user, id, &msg1, label, None).unwrap();
    let msg2 = client::registration_finish(phrase, &server_msg, &state, &mut rng).unwrap();
    svc.register_finish(user, id, &msg2).unwrap();
}

fn login_token(svc: &TagVault, user: &str, phrase: &str) -> (String, String) {
    let mut rng = OsRng;
    let id = TagId::derive(phrase).unwrap();

    let (msg1, state) = client::login_start(phrase, &mut rng).unwrap();
    let start = svc.login_start(user, id, &msg1).unwrap();
    let (msg2, _key) = client::login_finish(phrase, &start.server_message, &state).unwrap();
    let resp = svc.login_finish(user, &start.session_id, &msg2).unwrap();
    (resp.vault_access_token, id.to_hex())
}

// ---------------------------------------------------------------------------
// Database files land under the configured data dir
// ---------------------------------------------------------------------------

#[test]
fn open_creates_data_and_audit_databases() {
    let (dir, svc) = disk_service();
    assert!(svc.audit().is_some());

    let data_dir = dir.path().join(".tagvault");
    assert!(data_dir.join("tagvault.db").exists());
    assert!(data_dir.join("audit.db").exists());
}

// ---------------------------------------------------------------------------
// Every operation leaves an audit entry
// ---------------------------------------------------------------------------

#[test]
fn operations_append_to_the_audit_trail() {
    let (_dir, svc) = disk_service();
    register(&svc, "alice", "blue horizon", "Personal");
    let (token, vault) = login_token(&svc, "alice", "blue horizon");
    svc.vault_put(&token, &vault, "note", "text/plain", b"hello")
        .unwrap();
    svc.vault_get(&token, &vault, "note").unwrap();

    let audit = svc.audit().unwrap();
    let entries = audit.recent(100).unwrap();

    // register_start, register_finish, login_start, login_finish,
    // vault_put, vault_get.
    assert_eq!(entries.len(), 6);
    assert!(entries.iter().all(|e| e.success));
    assert!(entries.iter().all(|e| e.outcome == "ok"));

    let types: Vec<&str> = entries.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"register_finish"));
    assert!(types.contains(&"vault_put"));
}

// ---------------------------------------------------------------------------
// Identity never appears in the clear
// ---------------------------------------------------------------------------

#[test]
fn audit_rows_carry_keyed_hashes_not_raw_ids() {
    let (_dir, svc) = disk_service();
    register(&svc, "alice", "blue horizon", "Personal");

    let entries = svc.audit().unwrap().recent(10).unwrap();
    for entry in &entries {
        if let Some(hash) = &entry.user_hash {
            assert_ne!(hash, "alice");
            // HMAC-SHA256 as hex.
            assert_eq!(hash.len(), 64);
            assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}

// ---------------------------------------------------------------------------
// Failures are recorded with distinguishing outcome codes
// ---------------------------------------------------------------------------

#[test]
fn failed_login_is_recorded_as_auth_failed() {
    let (_dir, svc) = disk_service();
    register(&svc, "alice", "blue horizon", "Personal");

    let mut rng = OsRng;
    let id = TagId::derive("blue horizon").unwrap();
    let (msg1, _state) = client::login_start("blue horizon", &mut rng).unwrap();
    let start = svc.login_start("alice", id, &msg1).unwrap();

    // Garbage finalization payload: the engine rejects it.
    let _ = svc.login_finish("alice", &start.session_id, b"garbage");

    let entries = svc.audit().unwrap().recent(1).unwrap();
    assert_eq!(entries[0].event_type, "login_finish");
    assert!(!entries[0].success);
    assert_eq!(entries[0].outcome, "auth_failed");
}

// ---------------------------------------------------------------------------
// The signature chain verifies end to end
// ---------------------------------------------------------------------------

#[test]
fn signature_chain_verifies_after_mixed_operations() {
    let (_dir, svc) = disk_service();
    register(&svc, "alice", "blue horizon", "Personal");
    let (token, vault) = login_token(&svc, "alice", "blue horizon");
    svc.vault_put(&token, &vault, "a", "text/plain", b"1").unwrap();
    svc.rotate_key(&token).unwrap();
    svc.vault_get(&token, &vault, "a").unwrap();
    let _ = svc.vault_get(&token, &vault, "missing");

    let audit = svc.audit().unwrap();
    let verified = audit.verify_chain().unwrap();
    assert_eq!(verified, audit.recent(100).unwrap().len());
}
