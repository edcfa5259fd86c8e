//! Error taxonomy for the ingestion pipeline.
//!
//! Nothing here is fatal to the process: the scheduler converts all of these
//! into `CycleReport` entries. `FetchError` / `ParseError` abandon one
//! endpoint's branch of a cycle; storage failures are isolated per record.

use thiserror::Error;

/// Terminal fetch failure after exhausting retries.
///
/// The underlying cause is flattened to a string: by the time retries are
/// exhausted we only report it, never match on it.
#[derive(Debug, Error)]
#[error("fetch of {endpoint} failed after {attempts} attempts: {cause}")]
pub struct FetchError {
    pub endpoint: String,
    pub attempts: u32,
    pub cause: String,
}

/// The raw payload decoded as JSON but does not have the expected top-level
/// shape. Distinct from per-record validation skips, which are counted and
/// dropped silently.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("players payload has no `players` array")]
    MissingPlayers,
    #[error("marker payload has no `sets` object")]
    MissingSets,
    #[error("marker payload has no `{0}` marker set")]
    MissingMarkerSet(&'static str),
}

#[derive(Debug, Error)]
#[error("storage error: {0}")]
pub struct StorageError(#[from] pub sqlx::Error);
