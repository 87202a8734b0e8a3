//! Shared helpers used by the engine, the admin manager and the binary.

pub mod bootstrap;
pub mod retry;
