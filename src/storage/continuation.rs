//! Pagination cursors.
//!
//! A continuation records the ordering key of the last row returned:
//! timestamp, table and insertion sequence. Rows are totally ordered by
//! `(timestamp, table, sequence)`, so resuming strictly after that key
//! neither skips nor repeats a row, also across event tables.
//!
//! Tokens are URL-safe base64 of a small JSON document. They carry no
//! process-local state and stay valid across restarts.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};

/// Read order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Oldest first.
    Forward,
    /// Newest first.
    Backward,
}

/// Resume point of a paginated read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    #[serde(rename = "d")]
    pub direction: Direction,
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "tb")]
    pub table: String,
    #[serde(rename = "s")]
    pub sequence: i64,
}

impl Continuation {
    pub fn new(
        direction: Direction,
        timestamp: DateTime<Utc>,
        table: impl Into<String>,
        sequence: i64,
    ) -> Self {
        Self {
            direction,
            timestamp,
            table: table.into(),
            sequence,
        }
    }

    /// Opaque token handed to callers.
    pub fn encode(&self) -> String {
        // Serializing plain strings, integers and timestamps cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let json = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| HistoryError::Validation("malformed continuation token".into()))?;
        serde_json::from_slice(&json)
            .map_err(|_| HistoryError::Validation("malformed continuation token".into()))
    }
}
