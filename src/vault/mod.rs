//! Encrypted connection configuration.
//!
//! The connection config is sealed with a key derived from a master password:
//! - Argon2id derives a 256-bit key from the password and a random salt
//! - ChaCha20-Poly1305 encrypts the JSON-encoded config
//!
//! The KDF cost parameters travel inside the blob, so raising the defaults
//! later keeps older blobs readable. The blob header (version, parameters,
//! salt) is bound to the ciphertext as associated data.
//!
//! The master password is never stored.

mod error;

pub use error::VaultError;

use std::fmt;
use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Blob format version written by this build.
pub const CURRENT_VERSION: u8 = 1;

pub const KEY_SIZE: usize = 32;
pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;

/// Plaintext connection parameters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub user: String,
    pub password: String,
    pub database: String,
    pub host: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    /// Iterations.
    pub t_cost: u32,
    /// Lanes.
    pub p_cost: u32,
}

impl KdfParams {
    /// Version 1 defaults (19 MiB, 2 passes, 1 lane).
    pub const V1: KdfParams = KdfParams {
        m_cost: 19_456,
        t_cost: 2,
        p_cost: 1,
    };

    /// Upper bounds accepted from a stored blob: 1 GiB of memory, 16 passes,
    /// 16 lanes. Argon2 itself requires at least 8 KiB per lane.
    pub const MAX_M_COST: u32 = 1024 * 1024;
    pub const MAX_T_COST: u32 = 16;
    pub const MAX_P_COST: u32 = 16;

    /// Reject parameters outside the range a version-1 blob may carry.
    pub fn check(&self) -> Result<(), VaultError> {
        let in_range = (1..=Self::MAX_P_COST).contains(&self.p_cost)
            && (1..=Self::MAX_T_COST).contains(&self.t_cost)
            && (8 * self.p_cost..=Self::MAX_M_COST).contains(&self.m_cost);
        if !in_range {
            return Err(VaultError::Format(format!(
                "KDF parameters out of range: m_cost={} t_cost={} p_cost={}",
                self.m_cost, self.t_cost, self.p_cost
            )));
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::V1
    }
}

/// Key material derived from the master password. Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    pub fn derive(password: &str, salt: &[u8], params: &KdfParams) -> Result<Self, VaultError> {
        if password.is_empty() {
            return Err(VaultError::Kdf("master password must not be empty".into()));
        }
        let argon_params = Params::new(params.m_cost, params.t_cost, params.p_cost, Some(KEY_SIZE))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
        let mut key = [0u8; KEY_SIZE];
        argon.hash_password_into(password.as_bytes(), salt, &mut key)?;
        Ok(Self(key))
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, VaultError> {
        ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| VaultError::Encryption)
    }
}

/// Versioned encrypted connection config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedConfig {
    pub version: u8,
    pub kdf: KdfParams,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedConfig {
    /// Associated data binding the header to the ciphertext.
    fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(1 + 12 + self.salt.len());
        aad.push(self.version);
        aad.extend_from_slice(&self.kdf.m_cost.to_le_bytes());
        aad.extend_from_slice(&self.kdf.t_cost.to_le_bytes());
        aad.extend_from_slice(&self.kdf.p_cost.to_le_bytes());
        aad.extend_from_slice(&self.salt);
        aad
    }

    fn check_shape(&self) -> Result<(), VaultError> {
        if self.version == 0 || self.version > CURRENT_VERSION {
            return Err(VaultError::Format(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.salt.len() != SALT_SIZE {
            return Err(VaultError::Format(format!(
                "salt must be {SALT_SIZE} bytes, got {}",
                self.salt.len()
            )));
        }
        if self.nonce.len() != NONCE_SIZE {
            return Err(VaultError::Format(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                self.nonce.len()
            )));
        }
        self.kdf.check()
    }

    /// Portable string form (base64 of the JSON envelope).
    pub fn to_token(&self) -> Result<String, VaultError> {
        let json = serde_json::to_vec(self).map_err(|e| VaultError::Format(e.to_string()))?;
        Ok(STANDARD.encode(json))
    }

    pub fn from_token(token: &str) -> Result<Self, VaultError> {
        let json = STANDARD
            .decode(token.trim())
            .map_err(|e| VaultError::Format(format!("invalid base64: {e}")))?;
        serde_json::from_slice(&json).map_err(|e| VaultError::Format(e.to_string()))
    }

    /// Write the token form to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), VaultError> {
        std::fs::write(path, self.to_token()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let token = std::fs::read_to_string(path)?;
        Self::from_token(&token)
    }
}

/// Encrypt with the current default KDF parameters.
pub fn encrypt(config: &ConnectionConfig, password: &str) -> Result<EncryptedConfig, VaultError> {
    encrypt_with_params(config, password, KdfParams::default())
}

/// Encrypt with explicit KDF parameters.
pub fn encrypt_with_params(
    config: &ConnectionConfig,
    password: &str,
    kdf: KdfParams,
) -> Result<EncryptedConfig, VaultError> {
    kdf.check()?;
    let mut rng = rand::rng();
    let mut salt = vec![0u8; SALT_SIZE];
    rng.fill_bytes(&mut salt);
    let mut nonce = vec![0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    let key = DerivedKey::derive(password, &salt, &kdf)?;
    let mut sealed = EncryptedConfig {
        version: CURRENT_VERSION,
        kdf,
        salt,
        nonce,
        ciphertext: Vec::new(),
    };

    let mut plaintext =
        serde_json::to_vec(config).map_err(|e| VaultError::Format(e.to_string()))?;
    let aad = sealed.aad();
    let result = key.cipher()?.encrypt(
        Nonce::from_slice(&sealed.nonce),
        Payload {
            msg: &plaintext,
            aad: &aad,
        },
    );
    plaintext.zeroize();

    sealed.ciphertext = result.map_err(|_| VaultError::Encryption)?;
    Ok(sealed)
}

/// Decrypt a blob. A wrong password yields [`VaultError::Authentication`].
pub fn decrypt(sealed: &EncryptedConfig, password: &str) -> Result<ConnectionConfig, VaultError> {
    sealed.check_shape()?;
    let key = DerivedKey::derive(password, &sealed.salt, &sealed.kdf)?;
    let aad = sealed.aad();
    let mut plaintext = key
        .cipher()?
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| VaultError::Authentication)?;

    let parsed = serde_json::from_slice(&plaintext)
        .map_err(|e| VaultError::Format(format!("decrypted payload is not a config: {e}")));
    plaintext.zeroize();
    parsed
}

/// Re-encrypt under a new master password with fresh salt and nonce.
pub fn rotate(
    sealed: &EncryptedConfig,
    old_password: &str,
    new_password: &str,
) -> Result<EncryptedConfig, VaultError> {
    let config = decrypt(sealed, old_password)?;
    let kdf = if sealed.version < CURRENT_VERSION {
        KdfParams::default()
    } else {
        sealed.kdf
    };
    encrypt_with_params(&config, new_password, kdf)
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
