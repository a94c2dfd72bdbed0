use thiserror::Error;

/// All errors that can occur in TagVault.
///
/// Authentication-adjacent failures are deliberately coarse: a login
/// against a never-registered identifier and a login with the wrong
/// phrase both surface as `AuthenticationFailed`, and `UnwrapFailed`
/// never says whether the key was wrong or the data corrupt.  The
/// audit trail records the internal cause; the caller does not see it.
#[derive(Debug, Error)]
pub enum TagVaultError {
    // --- Registration / login ---
    #[error("A tag with this identifier is already registered")]
    AlreadyRegistered,

    #[error("No matching session found")]
    SessionNotFound,

    #[error("Session has expired")]
    SessionExpired,

    #[error("The authentication engine rejected the message")]
    EngineRejected,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("The authentication engine did not respond in time")]
    Timeout,

    // --- Key wrapping ---
    #[error("Key unwrap failed")]
    UnwrapFailed,

    // --- Vault ---
    #[error("Blob verification failed — content may be tampered")]
    TamperDetected,

    #[error("Not found")]
    NotFound,

    #[error("Access token is invalid or expired")]
    AccessDenied,

    // --- Crypto plumbing ---
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // --- Infrastructure ---
    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Config file error: {0}")]
    ConfigError(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for TagVaultError {
    fn from(e: rusqlite::Error) -> Self {
        TagVaultError::StoreError(e.to_string())
    }
}

/// Convenience type alias for TagVault results.
pub type Result<T> = std::result::Result<T, TagVaultError>;
