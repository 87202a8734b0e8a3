//! PostgreSQL history storage.
//!
//! Layering, leaves first:
//! - [`sanitize`]: external identifiers to safe table and column names
//! - [`pool`]: bounded connection pool with scoped acquisition
//! - [`schema`]: sea-query identifiers and DDL builders
//! - [`registry`]: lazy, race-safe table creation and name assignment
//! - [`writer`], [`reader`], [`retention`]: the data paths

pub mod continuation;
pub mod pool;
pub mod reader;
pub mod registry;
pub mod retention;
pub mod sanitize;
pub mod schema;
pub mod writer;

pub use continuation::{Continuation, Direction};
pub use pool::{ConnectionPool, PoolSettings, PoolStatus};
pub use reader::{HistoryPage, HistoryReader, ReadBounds, ReadRequest, StoredEvent, StoredValue};
pub use registry::{EventTypeDescriptor, HistorizedNode, SchemaRegistry};
pub use retention::{RetentionEnforcer, RetentionOutcome, RetentionPolicy};
pub use sanitize::{sanitize, IdentifierAllocator, IdentifierKind};
pub use writer::{HistoryWriter, ValueRecord};
