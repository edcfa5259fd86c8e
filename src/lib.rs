//! mapwatch: ingestion pipeline for a dynmap game server's live map state.
//!
//! Each cycle fetches the world JSON (online players) and the marker JSON
//! (Lands city markers) with bounded retries, normalizes them into player /
//! city / country records, derives country aggregates from the city set,
//! upserts everything into SQLite, and flags players last seen 41–42 days
//! ago for the configured notifier.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod fetch;
pub mod inactivity;
pub mod model;
pub mod notify;
pub mod parse;
pub mod scheduler;
pub mod store;
pub mod tracing;

pub use config::Config;
pub use error::{FetchError, ParseError, StorageError};
pub use scheduler::{CycleReport, Spider};
pub use store::Store;
