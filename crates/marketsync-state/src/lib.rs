//! Durable state for marketsync runs.
//!
//! Provides the storage contracts ([`CheckpointStore`], [`RecordStore`],
//! [`WatermarkStore`], [`RejectStore`]) and a [`SqliteStateBackend`] that
//! implements all of them over one database file.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod schema;
pub mod sqlite;

pub use backend::{
    CheckpointStore, RecordStore, RejectStore, RejectedRecord, StateBackend, UpsertSummary,
    WatermarkStore,
};
pub use error::StateError;
pub use sqlite::SqliteStateBackend;
