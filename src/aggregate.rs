//! Country derivation: a pure read-model over the current city set.
//!
//! Countries are never fetched. Each cycle they are recomputed from scratch
//! by grouping cities on their declared country field, then merged into the
//! store, so the aggregate invariants (`territory_count == |territories|`,
//! `total_blocks == Σ member blocks`, `player_count == |distinct residents|`)
//! hold exactly after every cycle.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{CityRecord, CountryRecord};

/// Groups cities by declared country and computes per-country aggregates.
///
/// Deterministic: output depends only on the set of input cities, never on
/// their order. Cities with an empty country field belong to no country.
///
/// Capital policy (fixed, since the source data does not disambiguate): the
/// member city with the highest parsed level wins, ties broken by
/// lexicographically smallest city name. The country's level is whatever the
/// capital's marker declared for it.
pub fn aggregate_countries(cities: &[CityRecord]) -> Vec<CountryRecord> {
    let mut groups: BTreeMap<&str, Vec<&CityRecord>> = BTreeMap::new();
    for city in cities {
        let country = city.country.trim();
        if !country.is_empty() {
            groups.entry(country).or_default().push(city);
        }
    }

    groups
        .into_iter()
        .map(|(name, members)| {
            let capital = members
                .iter()
                .copied()
                .reduce(|best, c| {
                    match level_rank(&c.level).cmp(&level_rank(&best.level)) {
                        std::cmp::Ordering::Greater => c,
                        std::cmp::Ordering::Less => best,
                        std::cmp::Ordering::Equal if c.name < best.name => c,
                        std::cmp::Ordering::Equal => best,
                    }
                })
                .expect("group is never empty");

            let territories: BTreeSet<&str> = members.iter().map(|c| c.name.as_str()).collect();
            let residents: BTreeSet<&str> = members
                .iter()
                .flat_map(|c| c.residents.iter().map(String::as_str))
                .collect();

            CountryRecord {
                name: name.to_string(),
                level: capital.country_level.clone(),
                capital: capital.name.clone(),
                territory_count: territories.len() as i64,
                territories: territories.into_iter().map(str::to_string).collect(),
                player_count: residents.len() as i64,
                total_blocks: members.iter().map(|c| c.blocks).sum(),
            }
        })
        .collect()
}

/// City levels are strings on the wire ("3", "Lv.5", ...); rank by the first
/// integer run so the capital policy is total. Unparsable levels rank lowest.
fn level_rank(level: &str) -> i64 {
    let digits: String = level
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(-1)
}
