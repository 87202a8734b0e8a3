//! Identifier sanitization.
//!
//! Every table, column and index name derived from an external identifier
//! goes through this module; raw node ids, event type names and field names
//! never reach DDL or DML text.
//!
//! A storage identifier is `<kind prefix><readable part>_<hash suffix>`:
//! - readable part: lowercased, `[a-z0-9_]` only, truncated to fit
//! - hash suffix: hex SHA-256 of the kind and raw identifier
//!
//! The suffix keeps distinct raw identifiers apart even when their readable
//! parts collide (`"Temp.A"` vs `"temp_a"`) or get truncated. When two raw
//! identifiers still collide, [`IdentifierAllocator`] retries with a longer
//! suffix.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::error::{HistoryError, Result};

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Suffix lengths (hex chars) tried in order when breaking collisions.
const SUFFIX_LENGTHS: [usize; 3] = [12, 20, 32];

/// What an identifier names; each kind has its own namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    /// Value table of a historized node.
    Node,
    /// Table of an event type.
    EventType,
    /// Column of an event field.
    Field,
    /// Index on a history table.
    Index,
}

impl IdentifierKind {
    fn prefix(self) -> &'static str {
        match self {
            IdentifierKind::Node => "n_",
            IdentifierKind::EventType => "e_",
            IdentifierKind::Field => "f_",
            IdentifierKind::Index => "ix_",
        }
    }
}

/// Sanitize a node identifier into a value table name.
pub fn sanitize(raw: &str) -> Result<String> {
    sanitize_as(IdentifierKind::Node, raw)
}

/// Sanitize a raw identifier of the given kind.
pub fn sanitize_as(kind: IdentifierKind, raw: &str) -> Result<String> {
    candidate(kind, raw, 0)
}

/// Derived identifier for an index on `table`.
pub fn index_name(table: &str, purpose: &str) -> Result<String> {
    sanitize_as(IdentifierKind::Index, &format!("{table}.{purpose}"))
}

/// The `round`-th candidate name for `raw`; later rounds use longer suffixes.
fn candidate(kind: IdentifierKind, raw: &str, round: usize) -> Result<String> {
    if raw.trim().is_empty() {
        return Err(HistoryError::Validation(
            "identifier must not be empty".to_string(),
        ));
    }
    let suffix_len = *SUFFIX_LENGTHS.get(round).ok_or_else(|| {
        HistoryError::Validation(format!("unresolvable identifier collision for {raw:?}"))
    })?;

    let prefix = kind.prefix();
    let digest = Sha256::new()
        .chain_update(prefix.as_bytes())
        .chain_update([0u8])
        .chain_update(raw.as_bytes())
        .finalize();
    let hash = hex::encode(digest);

    let budget = MAX_IDENTIFIER_LEN - prefix.len() - 1 - suffix_len;
    let mut readable = readable_part(raw);
    readable.truncate(budget);
    let readable = readable.trim_end_matches('_');

    if readable.is_empty() {
        Ok(format!("{prefix}{}", &hash[..suffix_len]))
    } else {
        Ok(format!("{prefix}{readable}_{}", &hash[..suffix_len]))
    }
}

/// Lowercase ASCII alphanumerics, everything else folded into single `_`.
fn readable_part(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    out
}

/// Assigns storage identifiers, guaranteeing distinct raw identifiers get
/// distinct names within one allocator.
#[derive(Debug)]
pub struct IdentifierAllocator {
    kind: IdentifierKind,
    by_raw: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl IdentifierAllocator {
    pub fn new(kind: IdentifierKind) -> Self {
        Self {
            kind,
            by_raw: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Name already assigned to `raw`, if any.
    pub fn get(&self, raw: &str) -> Option<&str> {
        self.by_raw.get(raw).map(String::as_str)
    }

    /// Return the name for `raw`, allocating one if needed.
    pub fn assign(&mut self, raw: &str) -> Result<String> {
        if let Some(name) = self.by_raw.get(raw) {
            return Ok(name.clone());
        }
        let name = self.next_candidate(raw, 0)?;
        self.insert(raw, &name);
        Ok(name)
    }

    /// First candidate at or after `round` not held by another identifier.
    pub fn next_candidate(&self, raw: &str, round: usize) -> Result<String> {
        let mut round = round;
        loop {
            let name = candidate(self.kind, raw, round)?;
            match self.by_name.get(&name) {
                Some(owner) if owner != raw => round += 1,
                _ => return Ok(name),
            }
        }
    }

    /// Record an assignment made elsewhere (persisted metadata).
    pub fn reserve(&mut self, raw: &str, name: &str) -> Result<()> {
        if let Some(owner) = self.by_name.get(name) {
            if owner != raw {
                return Err(HistoryError::Validation(format!(
                    "identifier {name} already assigned to {owner:?}"
                )));
            }
        }
        self.insert(raw, name);
        Ok(())
    }

    /// Drop an assignment (table removed).
    pub fn release(&mut self, raw: &str) {
        if let Some(name) = self.by_raw.remove(raw) {
            self.by_name.remove(&name);
        }
    }

    fn insert(&mut self, raw: &str, name: &str) {
        self.by_raw.insert(raw.to_string(), name.to_string());
        self.by_name.insert(name.to_string(), raw.to_string());
    }
}

/// Quote an identifier for statements that cannot take bind parameters.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal for statements that cannot take bind parameters.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
