//! Flags players whose last observation falls inside the 41–42 day window.
//!
//! A window, not a threshold: once a player crosses 41 days they are only
//! eligible for flagging until day 42, so the job (which runs far more often
//! than once a day) does not re-report the same player for weeks. Boundaries
//! are inclusive on both ends: exactly 41 or 42 elapsed days is in, 40 or 43
//! is out.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StorageError;
use crate::store::{CityRow, CountryRow, Store, StoredPlayer};

pub const WINDOW_MIN_DAYS: i64 = 41;
pub const WINDOW_MAX_DAYS: i64 = 42;

const DAY_SECS: i64 = 24 * 60 * 60;

/// A flagged player, enriched with its resolved city and country for the
/// notification collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct InactivePlayer {
    pub player: StoredPlayer,
    pub days_inactive: f64,
    pub city: Option<CityRow>,
    pub country: Option<CountryRow>,
}

/// Scans the player store and returns everyone inside the window, ordered by
/// account. Reads the store for enrichment but performs no other I/O; handing
/// the list to a notifier is the scheduler's job.
pub async fn find_inactive(
    store: &Store,
    now: DateTime<Utc>,
    min_days: i64,
    max_days: i64,
) -> Result<Vec<InactivePlayer>, StorageError> {
    let newest = now.timestamp() - min_days * DAY_SECS;
    let oldest = now.timestamp() - max_days * DAY_SECS;
    let players = store.players_observed_between(oldest, newest).await?;

    let mut flagged = Vec::with_capacity(players.len());
    for player in players {
        let city = store.city_of_resident(&player.account).await?;
        let country = match city.as_ref().filter(|c| !c.country.is_empty()) {
            Some(c) => store.country_by_name(&c.country).await?,
            None => None,
        };
        let days_inactive = (now.timestamp() - player.update_time) as f64 / DAY_SECS as f64;
        flagged.push(InactivePlayer {
            player,
            days_inactive,
            city,
            country,
        });
    }
    Ok(flagged)
}
