//! Shared history integration tests.
//!
//! Scenario functions run against an initialized [`PgHistorian`]. Every
//! scenario uses its own node ids and event types so they can share one
//! database.
//!
//! [`PgHistorian`]: pghistorian::PgHistorian

pub mod event_tests;
pub mod lifecycle_tests;
pub mod value_tests;
