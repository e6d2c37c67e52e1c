//! Concrete store backends
//!
//! The protocol lives behind [`crate::store::EngineStore`]; this module holds
//! backends that persist it. Currently SQLite, which is enough for a fleet of
//! worker processes on one host or a shared network mount.

pub mod sqlite;

pub use sqlite::SqliteStore;
