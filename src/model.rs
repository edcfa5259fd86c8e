//! Entity records produced by the parser/aggregator and persisted by the store.
//!
//! These are per-cycle snapshots: the fetch payloads carry only "current"
//! state, so every record is stamped with the observation time at upsert.

use serde::{Deserialize, Serialize};

/// One online player as reported by the dynmap world endpoint.
///
/// `account` is the stable identity; everything else is overwritten on every
/// sighting. Absence from a fetch never deletes the row: it is what the
/// inactivity detector keys off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub account: String,
    pub name: String,
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub health: f64,
    pub armor: i64,
}

/// One city marker from the Lands marker set, with its HTML description
/// already flattened into fields.
///
/// `country`, `country_level` and `country_capital` are the values *declared*
/// in the marker description. Country rows themselves are never fetched; they
/// are derived from the full city set each cycle (see [`crate::aggregate`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityRecord {
    pub name: String,
    pub label: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub level: String,
    pub owner: String,
    pub balance: String,
    pub blocks: i64,
    /// Resident accounts in marker order, deduplicated.
    pub residents: Vec<String>,
    /// Declared country name; empty means the city belongs to no country.
    pub country: String,
    pub country_level: String,
    pub country_capital: String,
}

/// Derived country aggregate for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryRecord {
    pub name: String,
    pub level: String,
    /// Capital under the fixed policy: highest-level member city, ties broken
    /// by lexicographically smallest name.
    pub capital: String,
    /// Sorted member city names.
    pub territories: Vec<String>,
    pub territory_count: i64,
    pub player_count: i64,
    pub total_blocks: i64,
}

impl CityRecord {
    /// Field-level validation gate applied before a record enters a batch.
    /// Strict per field, permissive per record: callers drop failures
    /// individually and keep going.
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
            && !self.label.trim().is_empty()
            && self.x.is_finite()
            && self.y.is_finite()
            && self.z.is_finite()
            && self.blocks >= 0
    }
}

impl PlayerRecord {
    pub fn is_valid(&self) -> bool {
        !self.account.trim().is_empty()
            && !self.name.trim().is_empty()
            && !self.world.trim().is_empty()
            && self.x.is_finite()
            && self.y.is_finite()
            && self.z.is_finite()
            && self.health >= 0.0
            && self.health.is_finite()
            && self.armor >= 0
    }
}
