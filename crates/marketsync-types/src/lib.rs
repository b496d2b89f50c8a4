//! Shared marketsync data model.
//!
//! Pure types used by the state backends, the engine, and the CLI. Nothing
//! in here performs I/O.

pub mod drift;
pub mod error;
pub mod record;
pub mod state;
