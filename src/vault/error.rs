//! Vault error types.

/// Errors from encrypting or decrypting a connection config.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Wrong master password, or the blob was tampered with.
    #[error("Authentication failed: wrong master password or tampered config")]
    Authentication,

    /// The blob is not a well-formed encrypted config.
    #[error("Malformed encrypted config: {0}")]
    Format(String),

    #[error("Key derivation failed: {0}")]
    Kdf(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<argon2::Error> for VaultError {
    fn from(err: argon2::Error) -> Self {
        VaultError::Kdf(err.to_string())
    }
}
