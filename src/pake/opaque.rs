//! OPAQUE-backed implementation of the [`PakeEngine`] boundary.
//!
//! Uses the `opaque-ke` crate (NCC Group audited, 2021) with
//! Ristretto255 and TripleDH.  The server never sees the phrase: it
//! only handles the OPRF exchange and the stored registration
//! envelope.
//!
//! Existence hiding: `login_init` always runs the same
//! `ServerLogin::start` call.  When no envelope exists the engine
//! passes `None`, which makes `opaque-ke` produce a fake credential
//! response of genuine shape.  The RNG for the call is seeded from
//! `HMAC(existence_secret, identifier || client_msg)`, so repeated
//! probes of the same absent identifier get a stable, deterministic
//! response instead of fresh randomness that could be fingerprinted.

use hmac::{Hmac, Mac};
use opaque_ke::{
    CredentialFinalization, CredentialRequest, RegistrationRequest, RegistrationUpload,
    ServerLogin, ServerLoginStartParameters, ServerRegistration, ServerSetup,
};
use rand::rngs::OsRng;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::crypto::keys::{KekSeed, KEY_LEN};
use crate::crypto::TagId;
use crate::errors::{Result, TagVaultError};

use super::{LoginOutcome, LoginStart, PakeEngine, RegistrationRecord};

type HmacSha256 = Hmac<Sha256>;

/// Concrete OPAQUE cipher suite: Ristretto255 OPRF + key exchange,
/// TripleDH AKE.  The key-stretching function is `Identity` — tag
/// phrases go through the OPRF, and the stored envelope is already
/// useless without the server's OPRF key.
pub struct Suite;

impl opaque_ke::CipherSuite for Suite {
    type OprfCs = opaque_ke::Ristretto255;
    type KeGroup = opaque_ke::Ristretto255;
    type KeyExchange = opaque_ke::key_exchange::tripledh::TripleDh;
    type Ksf = opaque_ke::ksf::Identity;
}

/// Serialized length of a registration envelope under [`Suite`]
/// (client public key 32 + masking key 64 + envelope 96).  Callers
/// that mirror per-envelope work on the absent-identifier path size
/// their dummy input with this.
pub const ENVELOPE_LEN: usize = 192;

/// The production PAKE engine.
///
/// Holds the server's long-term OPAQUE setup (OPRF key material) and
/// two process-held secrets:
///
/// - `wrap_secret` — releases the per-tag KEK seed, but only on
///   successful registration-finish / login-finish.
/// - `existence_secret` — seeds the deterministic RNG used for
///   existence-hiding login responses.
///
/// Loss of the setup or the wrap secret makes every stored envelope
/// and wrapped key unusable, so both must persist across restarts.
pub struct OpaqueEngine {
    setup: ServerSetup<Suite>,
    wrap_secret: [u8; KEY_LEN],
    existence_secret: [u8; KEY_LEN],
}

impl OpaqueEngine {
    /// Generate a brand-new engine with random setup and secrets.
    pub fn generate() -> Self {
        use rand::RngCore;

        let mut rng = OsRng;
        let setup = ServerSetup::<Suite>::new(&mut rng);

        let mut wrap_secret = [0u8; KEY_LEN];
        rng.fill_bytes(&mut wrap_secret);
        let mut existence_secret = [0u8; KEY_LEN];
        rng.fill_bytes(&mut existence_secret);

        Self {
            setup,
            wrap_secret,
            existence_secret,
        }
    }

    /// Rebuild an engine from persisted parts.
    pub fn from_parts(
        setup_bytes: &[u8],
        wrap_secret: [u8; KEY_LEN],
        existence_secret: [u8; KEY_LEN],
    ) -> Result<Self> {
        let setup = ServerSetup::<Suite>::deserialize(setup_bytes)
            .map_err(|_| TagVaultError::InvalidInput("bad engine setup bytes".into()))?;
        Ok(Self {
            setup,
            wrap_secret,
            existence_secret,
        })
    }

    /// Serialize the long-term setup for persistence.
    pub fn setup_bytes(&self) -> Vec<u8> {
        self.setup.serialize().to_vec()
    }

    /// Stable per-tag KEK seed: `HMAC(wrap_secret, identifier)`.
    ///
    /// Only called from the success paths of registration-finish and
    /// login-finish — possession of the phrase is what releases it.
    fn kek_seed(&self, identifier: &TagId) -> KekSeed {
        let mut mac =
            HmacSha256::new_from_slice(&self.wrap_secret).expect("HMAC accepts any key length");
        mac.update(identifier.as_bytes());

        let mut seed = [0u8; KEY_LEN];
        seed.copy_from_slice(&mac.finalize().into_bytes());
        KekSeed::new(seed)
    }

    /// Deterministic RNG for a login-init call, bound to the
    /// identifier and the exact client message.
    fn login_rng(&self, identifier: &TagId, client_msg: &[u8]) -> ChaCha20Rng {
        let mut mac = HmacSha256::new_from_slice(&self.existence_secret)
            .expect("HMAC accepts any key length");
        mac.update(identifier.as_bytes());
        mac.update(client_msg);

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&mac.finalize().into_bytes());
        ChaCha20Rng::from_seed(seed)
    }
}

impl PakeEngine for OpaqueEngine {
    fn registration_init(&self, identifier: &TagId, client_msg: &[u8]) -> Result<Vec<u8>> {
        let request = RegistrationRequest::<Suite>::deserialize(client_msg)
            .map_err(|_| TagVaultError::EngineRejected)?;

        let response = ServerRegistration::<Suite>::start(&self.setup, request, identifier.as_bytes())
            .map_err(|_| TagVaultError::EngineRejected)?;

        Ok(response.message.serialize().to_vec())
    }

    fn registration_finish(
        &self,
        identifier: &TagId,
        client_msg: &[u8],
    ) -> Result<RegistrationRecord> {
        let upload = RegistrationUpload::<Suite>::deserialize(client_msg)
            .map_err(|_| TagVaultError::EngineRejected)?;

        let record = ServerRegistration::<Suite>::finish(upload);
        let envelope = record.serialize().to_vec();

        // The verifier is a digest of the envelope, checked before the
        // envelope is handed back to the engine on later logins.
        let verifier = Sha256::digest(&envelope).to_vec();

        Ok(RegistrationRecord {
            envelope,
            verifier,
            kek_seed: self.kek_seed(identifier),
        })
    }

    fn login_init(
        &self,
        identifier: &TagId,
        envelope: Option<&[u8]>,
        client_msg: &[u8],
    ) -> Result<LoginStart> {
        let request = CredentialRequest::<Suite>::deserialize(client_msg)
            .map_err(|_| TagVaultError::EngineRejected)?;

        // Both branches run the exact same call below; `None` makes
        // opaque-ke fabricate a fake credential response internally.
        let record = match envelope {
            Some(bytes) => Some(
                ServerRegistration::<Suite>::deserialize(bytes)
                    .map_err(|_| TagVaultError::EngineRejected)?,
            ),
            None => None,
        };

        let mut rng = self.login_rng(identifier, client_msg);
        let start = ServerLogin::<Suite>::start(
            &mut rng,
            &self.setup,
            record,
            request,
            identifier.as_bytes(),
            ServerLoginStartParameters::default(),
        )
        .map_err(|_| TagVaultError::EngineRejected)?;

        Ok(LoginStart {
            message: start.message.serialize().to_vec(),
            state: start.state.serialize().to_vec(),
        })
    }

    fn login_finish(
        &self,
        identifier: &TagId,
        state: &[u8],
        client_msg: &[u8],
    ) -> Result<LoginOutcome> {
        let finalization = CredentialFinalization::<Suite>::deserialize(client_msg)
            .map_err(|_| TagVaultError::AuthenticationFailed)?;
        let login = ServerLogin::<Suite>::deserialize(state)
            .map_err(|_| TagVaultError::AuthenticationFailed)?;

        let finish = login
            .finish(finalization)
            .map_err(|_| TagVaultError::AuthenticationFailed)?;

        Ok(LoginOutcome {
            session_key: Zeroizing::new(finish.session_key.to_vec()),
            kek_seed: self.kek_seed(identifier),
        })
    }
}

/// Client half of the handshake.
///
/// The subsystem itself is server-side; these helpers exist so
/// callers (and the integration tests) can drive the protocol end to
/// end without re-deriving the cipher suite.
pub mod client {
    use opaque_ke::{
        ClientLogin, ClientLoginFinishParameters, ClientRegistration,
        ClientRegistrationFinishParameters, CredentialResponse, RegistrationResponse,
    };
    use rand::{CryptoRng, RngCore};
    use zeroize::Zeroizing;

    use crate::errors::{Result, TagVaultError};

    use super::Suite;

    /// Start registration: returns (client-message-1, client state).
    pub fn registration_start<R: RngCore + CryptoRng>(
        phrase: &str,
        rng: &mut R,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let start = ClientRegistration::<Suite>::start(rng, phrase.as_bytes())
            .map_err(|_| TagVaultError::EngineRejected)?;
        Ok((
            start.message.serialize().to_vec(),
            start.state.serialize().to_vec(),
        ))
    }

    /// Finish registration: returns client-message-2 (the upload).
    pub fn registration_finish<R: RngCore + CryptoRng>(
        phrase: &str,
        server_msg: &[u8],
        client_state: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        let response = RegistrationResponse::<Suite>::deserialize(server_msg)
            .map_err(|_| TagVaultError::EngineRejected)?;
        let state = ClientRegistration::<Suite>::deserialize(client_state)
            .map_err(|_| TagVaultError::EngineRejected)?;

        let finish = state
            .finish(
                rng,
                phrase.as_bytes(),
                response,
                ClientRegistrationFinishParameters::default(),
            )
            .map_err(|_| TagVaultError::EngineRejected)?;

        Ok(finish.message.serialize().to_vec())
    }

    /// Start login: returns (client-message-1, client state).
    pub fn login_start<R: RngCore + CryptoRng>(
        phrase: &str,
        rng: &mut R,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let start = ClientLogin::<Suite>::start(rng, phrase.as_bytes())
            .map_err(|_| TagVaultError::EngineRejected)?;
        Ok((
            start.message.serialize().to_vec(),
            start.state.serialize().to_vec(),
        ))
    }

    /// Finish login: returns (client-message-2, session key).
    ///
    /// Fails with `AuthenticationFailed` when the server response was
    /// built from a different phrase (or from a fake record).
    pub fn login_finish(
        phrase: &str,
        server_msg: &[u8],
        client_state: &[u8],
    ) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        let response = CredentialResponse::<Suite>::deserialize(server_msg)
            .map_err(|_| TagVaultError::AuthenticationFailed)?;
        let state = ClientLogin::<Suite>::deserialize(client_state)
            .map_err(|_| TagVaultError::AuthenticationFailed)?;

        let finish = state
            .finish(
                phrase.as_bytes(),
                response,
                ClientLoginFinishParameters::default(),
            )
            .map_err(|_| TagVaultError::AuthenticationFailed)?;

        Ok((
            finish.message.serialize().to_vec(),
            Zeroizing::new(finish.session_key.to_vec()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pake::PakeEngine;

    fn tag_id(phrase: &str) -> TagId {
        TagId::derive(phrase).unwrap()
    }

    /// Drive a full registration against the engine, returning the
    /// stored record.
    fn register(engine: &OpaqueEngine, phrase: &str) -> RegistrationRecord {
        let mut rng = OsRng;
        let id = tag_id(phrase);

        let (msg1, state) = client::registration_start(phrase, &mut rng).unwrap();
        let server_msg = engine.registration_init(&id, &msg1).unwrap();
        let msg2 = client::registration_finish(phrase, &server_msg, &state, &mut rng).unwrap();
        engine.registration_finish(&id, &msg2).unwrap()
    }

    #[test]
    fn full_handshake_yields_matching_session_keys() {
        let engine = OpaqueEngine::generate();
        let phrase = "blue horizon";
        let id = tag_id(phrase);
        let record = register(&engine, phrase);

        let mut rng = OsRng;
        let (msg1, client_state) = client::login_start(phrase, &mut rng).unwrap();
        let start = engine
            .login_init(&id, Some(&record.envelope), &msg1)
            .unwrap();
        let (msg2, client_key) = client::login_finish(phrase, &start.message, &client_state).unwrap();
        let outcome = engine.login_finish(&id, &start.state, &msg2).unwrap();

        assert_eq!(*outcome.session_key, *client_key);
    }

    #[test]
    fn wrong_phrase_fails_at_client_and_server() {
        let engine = OpaqueEngine::generate();
        let id = tag_id("blue horizon");
        let record = register(&engine, "blue horizon");

        let mut rng = OsRng;
        let (msg1, client_state) = client::login_start("wrong phrase", &mut rng).unwrap();
        let start = engine
            .login_init(&id, Some(&record.envelope), &msg1)
            .unwrap();

        // The client cannot finalize against a mismatched response.
        assert!(client::login_finish("wrong phrase", &start.message, &client_state).is_err());
    }

    #[test]
    fn absent_envelope_still_returns_engine_shaped_message() {
        let engine = OpaqueEngine::generate();
        let id = tag_id("never registered");

        let mut rng = OsRng;
        let (msg1, _state) = client::login_start("never registered", &mut rng).unwrap();

        let real_record = register(&engine, "some other phrase");
        let real_id = tag_id("some other phrase");
        let (real_msg1, _s) = client::login_start("some other phrase", &mut rng).unwrap();

        let fake = engine.login_init(&id, None, &msg1).unwrap();
        let real = engine
            .login_init(&real_id, Some(&real_record.envelope), &real_msg1)
            .unwrap();

        assert_eq!(fake.message.len(), real.message.len());
    }

    #[test]
    fn absent_identifier_response_is_deterministic() {
        let engine = OpaqueEngine::generate();
        let id = tag_id("phantom");

        let mut rng = OsRng;
        let (msg1, _state) = client::login_start("phantom", &mut rng).unwrap();

        let a = engine.login_init(&id, None, &msg1).unwrap();
        let b = engine.login_init(&id, None, &msg1).unwrap();
        assert_eq!(a.message, b.message, "same probe, same fake response");
    }

    #[test]
    fn login_against_fake_record_fails_authentication() {
        let engine = OpaqueEngine::generate();
        let id = tag_id("phantom");

        let mut rng = OsRng;
        let (msg1, client_state) = client::login_start("phantom", &mut rng).unwrap();
        let start = engine.login_init(&id, None, &msg1).unwrap();

        // Client-side finalization fails, and even a forged
        // finalization would fail on the server.
        assert!(client::login_finish("phantom", &start.message, &client_state).is_err());
        let err = engine.login_finish(&id, &start.state, b"garbage").unwrap_err();
        assert!(matches!(err, TagVaultError::AuthenticationFailed));
    }

    #[test]
    fn envelope_length_matches_the_suite() {
        let engine = OpaqueEngine::generate();
        let record = register(&engine, "sized phrase");
        assert_eq!(record.envelope.len(), ENVELOPE_LEN);
    }

    #[test]
    fn kek_seed_is_stable_across_logins() {
        let engine = OpaqueEngine::generate();
        let id = tag_id("stable seed");
        let record = register(&engine, "stable seed");

        assert_eq!(
            record.kek_seed.as_bytes(),
            engine.kek_seed(&id).as_bytes(),
            "registration and login must release the same seed"
        );
    }

    #[test]
    fn engine_roundtrips_through_persistence() {
        let engine = OpaqueEngine::generate();
        let rebuilt = OpaqueEngine::from_parts(
            &engine.setup_bytes(),
            engine.wrap_secret,
            engine.existence_secret,
        )
        .unwrap();

        let phrase = "persisted engine";
        let id = tag_id(phrase);
        let record = register(&engine, phrase);

        // A login started against the rebuilt engine still works.
        let mut rng = OsRng;
        let (msg1, client_state) = client::login_start(phrase, &mut rng).unwrap();
        let start = rebuilt
            .login_init(&id, Some(&record.envelope), &msg1)
            .unwrap();
        let (msg2, _key) = client::login_finish(phrase, &start.message, &client_state).unwrap();
        assert!(rebuilt.login_finish(&id, &start.state, &msg2).is_ok());
    }
}
