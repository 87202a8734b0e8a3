//! Abstract interfaces for historian components.
//!
//! These traits define the contracts for:
//! - History storage (producer-facing value and event persistence)

pub mod history_storage;

pub use history_storage::{ConnectionInfo, HistoryStorage};
