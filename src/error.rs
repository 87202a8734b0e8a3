//! Crate-wide error type.

use std::time::Duration;

use crate::codec::CodecError;
use crate::vault::VaultError;

/// Result type for historian operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Errors raised by the storage engine and the administrative manager.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Bad identifier, bad configuration shape or bad request. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("History storage is not initialized")]
    NotInitialized,

    #[error("Connection pool is closed")]
    PoolClosed,

    /// No connection became free within the acquire timeout.
    #[error("Connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Node is not historized: {0}")]
    UnknownNode(String),

    #[error("Storage error: {0}")]
    Storage(#[source] sqlx::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    /// A migration step failed; the schema stays at the previous version.
    #[error("Migration {version} ({description}) failed: {source}")]
    Migration {
        version: i64,
        description: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for HistoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            // The waited duration is filled in by the pool, which knows its timeout.
            sqlx::Error::PoolTimedOut => HistoryError::PoolExhausted {
                waited: Duration::ZERO,
            },
            sqlx::Error::PoolClosed => HistoryError::PoolClosed,
            other => HistoryError::Storage(other),
        }
    }
}

impl HistoryError {
    /// Connection-level failures that a fresh connection may cure.
    pub fn is_transient(&self) -> bool {
        match self {
            HistoryError::Storage(err) => is_transient_sqlx(err),
            _ => false,
        }
    }

    /// SQLSTATE of a database error, if any.
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            HistoryError::Storage(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
            _ => None,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| {
                // 08xxx connection exceptions, 57P01..57P03 server shutdown/restart
                code.starts_with("08") || matches!(&*code, "57P01" | "57P02" | "57P03")
            })
            .unwrap_or(false),
        _ => false,
    }
}
