//! pghistorian - OPC UA history storage on PostgreSQL
//!
//! Persists node values and events into per-node and per-event-type tables,
//! serves paginated time-range reads, trims history by age and count, and
//! ships an administrative manager for bootstrap, migrations, backups and the
//! encrypted connection config.

pub mod admin;
pub mod codec;
pub mod config;
pub mod error;
pub mod history;
pub mod interfaces;
pub mod storage;
pub mod utils;
pub mod vault;

pub use codec::{Variant, VariantType};
pub use config::{ConnectionSettings, HistorianOptions};
pub use error::{HistoryError, Result};
pub use history::PgHistorian;
pub use interfaces::{ConnectionInfo, HistoryStorage};
pub use storage::{
    Continuation, Direction, HistorizedNode, HistoryPage, ReadRequest, RetentionPolicy,
    StoredEvent, StoredValue, ValueRecord,
};
