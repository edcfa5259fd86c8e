//! Converts raw endpoint payloads into candidate entity records.
//!
//! Two shapes come in: the dynmap world JSON (`players` array with nested
//! position/vital fields) and the marker JSON, where city state lives inside
//! an HTML `desc` fragment per marker. The HTML is small and rigid, so it is
//! handled with a tag stripper plus a few regexes rather than a DOM parser.
//!
//! Validation is permissive-per-record, strict-per-field: a bad record is
//! dropped and counted, never aborts the batch. Only a payload without the
//! expected top-level shape is a [`ParseError`].

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::ParseError;
use crate::model::{CityRecord, PlayerRecord};

/// Marker set id of the Lands plugin on the dynmap.
pub const LANDS_SET: &str = "me.angeschossen.lands";

/// Sentinel marker the server uses for the world spawn. Never persisted.
pub const SPAWN_CITY: &str = "出生点";

// Marker descriptions are server-rendered Chinese labels; these prefixes are
// the wire format, not display strings.
const LABEL_LEVEL: &str = "等级:";
const LABEL_BALANCE: &str = "余额:";
const LABEL_BLOCKS: &str = "区块:";
const LABEL_RESIDENTS: &str = "玩家(";
const LABEL_CAPITAL: &str = "首都:";
const MARKER_COUNTRY: &str = "这片领土属于国家";

#[derive(Debug)]
pub struct Parsed<T> {
    pub records: Vec<T>,
    /// Records dropped by per-field validation (counted, not raised).
    pub skipped: usize,
}

// Manual impl: the record types themselves have no meaningful default.
impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            skipped: 0,
        }
    }
}

pub fn parse_players(raw: &Value) -> Result<Parsed<PlayerRecord>, ParseError> {
    let players = raw
        .get("players")
        .and_then(Value::as_array)
        .ok_or(ParseError::MissingPlayers)?;

    let mut out = Parsed::default();
    for entry in players {
        let record = PlayerRecord {
            account: str_field(entry, "account"),
            name: str_field(entry, "name"),
            world: str_field(entry, "world"),
            x: num_field(entry, "x"),
            y: num_field(entry, "y"),
            z: num_field(entry, "z"),
            health: entry.get("health").and_then(Value::as_f64).unwrap_or(0.0),
            armor: entry.get("armor").and_then(Value::as_i64).unwrap_or(0),
        };
        if record.is_valid() {
            out.records.push(record);
        } else {
            debug!(account = %record.account, "dropping invalid player record");
            out.skipped += 1;
        }
    }
    Ok(out)
}

pub fn parse_cities(raw: &Value) -> Result<Parsed<CityRecord>, ParseError> {
    let sets = raw
        .get("sets")
        .and_then(Value::as_object)
        .ok_or(ParseError::MissingSets)?;
    let lands = sets
        .get(LANDS_SET)
        .ok_or(ParseError::MissingMarkerSet(LANDS_SET))?;

    // Cities appear under both `areas` and `markers` depending on render
    // mode; merge them, markers winning on id clash, and walk in id order so
    // output never depends on payload ordering.
    let mut merged: BTreeMap<&str, &Value> = BTreeMap::new();
    for key in ["areas", "markers"] {
        if let Some(obj) = lands.get(key).and_then(Value::as_object) {
            for (id, marker) in obj {
                merged.insert(id.as_str(), marker);
            }
        }
    }

    let mut out = Parsed::default();
    for (id, marker) in merged {
        let (Some(label), Some(desc)) = (
            marker.get("label").and_then(Value::as_str),
            marker.get("desc").and_then(Value::as_str),
        ) else {
            out.skipped += 1;
            continue;
        };

        let parsed = CityDesc::parse(desc);
        if parsed.name == SPAWN_CITY {
            debug!(marker = %id, "skipping spawn marker");
            continue;
        }

        let mut residents = parsed.residents;
        dedup_preserving_order(&mut residents);
        // Markers omit the owner line for some cities; the first resident is
        // the owner by Lands convention.
        let owner = if parsed.owner.is_empty() {
            residents.first().cloned().unwrap_or_default()
        } else {
            parsed.owner
        };

        let record = CityRecord {
            name: parsed.name,
            label: label.to_string(),
            x: coord(marker.get("x")),
            y: marker
                .get("y")
                .or_else(|| marker.get("ytop"))
                .and_then(Value::as_f64)
                .unwrap_or(64.0),
            z: coord(marker.get("z")),
            level: parsed.level,
            owner,
            balance: parsed.balance,
            blocks: parsed.blocks,
            residents,
            country: parsed.country,
            country_level: parsed.country_level,
            country_capital: parsed.country_capital,
        };
        if record.is_valid() {
            out.records.push(record);
        } else {
            debug!(marker = %id, city = %record.name, "dropping invalid city record");
            out.skipped += 1;
        }
    }
    Ok(out)
}

/// Fields flattened out of one marker's HTML description.
#[derive(Debug, Default)]
struct CityDesc {
    name: String,
    level: String,
    balance: String,
    blocks: i64,
    residents: Vec<String>,
    owner: String,
    country: String,
    country_level: String,
    country_capital: String,
}

impl CityDesc {
    fn parse(html: &str) -> Self {
        let mut desc = CityDesc::default();

        if let Some(caps) = city_name_re().captures(html) {
            desc.name = caps[1].trim().to_string();
        }
        if let Some(caps) = owner_re().captures(&strip_tags(html)) {
            desc.owner = caps[1].trim().to_string();
        }

        // Everything after the country marker describes the country, not the
        // city; the same `等级:` label appears in both halves.
        let (city_half, country_half) = match html.find(MARKER_COUNTRY) {
            Some(idx) => (&html[..idx], Some(&html[idx..])),
            None => (html, None),
        };

        for item in list_items(city_half) {
            if let Some(v) = item.strip_prefix(LABEL_LEVEL) {
                desc.level = v.trim().to_string();
            } else if let Some(v) = item.strip_prefix(LABEL_BALANCE) {
                desc.balance = v.trim().to_string();
            } else if let Some(v) = item.strip_prefix(LABEL_BLOCKS) {
                desc.blocks = v.trim().parse().unwrap_or(0);
            } else if item.starts_with(LABEL_RESIDENTS) {
                desc.residents = name_list(&item);
            }
        }

        if let Some(country_html) = country_half {
            if let Some(caps) = country_re().captures(country_html) {
                desc.country = caps[1].trim().to_string();
            }
            for item in list_items(country_html) {
                if let Some(v) = item.strip_prefix(LABEL_LEVEL) {
                    desc.country_level = v.trim().to_string();
                } else if let Some(v) = item.strip_prefix(LABEL_CAPITAL) {
                    desc.country_capital = v.trim().to_string();
                }
            }
        }

        desc
    }
}

fn city_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)font-size:200%[^>]*>\s*([^<]+?)\s*<").unwrap())
}

fn owner_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"所有者:\s*([^.．]+)").unwrap())
}

fn country_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!("{MARKER_COUNTRY}([^:]+):")).unwrap())
}

fn li_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<li[^>]*>(.*?)</li>").unwrap())
}

/// Stripped text of every `<li>` in the fragment, in document order.
fn list_items(html: &str) -> Vec<String> {
    li_re()
        .captures_iter(html)
        .map(|caps| strip_tags(&caps[1]))
        .collect()
}

/// `玩家(2): alice, bob` / `领土(2): a, b` style lists.
fn name_list(item: &str) -> Vec<String> {
    let Some((_, tail)) = item.split_once("):") else {
        return Vec::new();
    };
    tail.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drops tags and collapses whitespace runs to single spaces.
fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    let mut prev_space = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => {
                if c.is_whitespace() {
                    if !prev_space && !out.is_empty() {
                        out.push(' ');
                        prev_space = true;
                    }
                } else {
                    out.push(c);
                    prev_space = false;
                }
            }
            _ => {}
        }
    }
    out.trim_end().to_string()
}

/// dynmap area markers carry coordinates as arrays of corner points; point
/// markers carry plain numbers. Take the first corner either way.
fn coord(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::Array(arr)) => arr.first().and_then(Value::as_f64).unwrap_or(0.0),
        Some(other) => other.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

fn str_field(entry: &Value, key: &str) -> String {
    entry
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn num_field(entry: &Value, key: &str) -> f64 {
    entry.get(key).and_then(Value::as_f64).unwrap_or(f64::NAN)
}

fn dedup_preserving_order(names: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    names.retain(|n| seen.insert(n.clone()));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn city_desc(
        name: &str,
        level: &str,
        blocks: i64,
        residents: &[&str],
        country: Option<(&str, &str, &str)>,
    ) -> String {
        let mut html = format!(
            "<div class=\"infowindow\">\
             <span style=\"font-size:200%;\">{name}</span><br>\
             所有者: {owner}.\
             <ul>\
             <li>等级: {level}</li>\
             <li>余额: 1000.0</li>\
             <li>区块: {blocks}</li>\
             <li>玩家({n}): {players}</li>\
             </ul>",
            owner = residents.first().unwrap_or(&""),
            n = residents.len(),
            players = residents.join(", "),
        );
        if let Some((cname, clevel, ccapital)) = country {
            html.push_str(&format!(
                "<strong>这片领土属于国家{cname}:</strong>\
                 <ul>\
                 <li>等级: {clevel}</li>\
                 <li>首都: {ccapital}</li>\
                 <li>领土(1): {name}</li>\
                 </ul>"
            ));
        }
        html.push_str("</div>");
        html
    }

    pub(crate) fn marker_payload(markers: Vec<(&str, Value)>) -> Value {
        let mut obj = serde_json::Map::new();
        for (id, marker) in markers {
            obj.insert(id.to_string(), marker);
        }
        let mut lands = serde_json::Map::new();
        lands.insert("areas".to_string(), json!({}));
        lands.insert("markers".to_string(), Value::Object(obj));
        let mut sets = serde_json::Map::new();
        sets.insert(LANDS_SET.to_string(), Value::Object(lands));
        json!({ "sets": Value::Object(sets) })
    }

    pub(crate) fn city_marker(name: &str, desc: String) -> Value {
        json!({ "label": name, "x": [100.0, 120.0], "y": 64, "z": [-40.0, -10.0], "desc": desc })
    }

    #[test]
    fn parses_players_and_drops_invalid_ones() {
        let raw = json!({
            "players": [
                { "account": "alice", "name": "Alice", "world": "world",
                  "x": 10.5, "y": 64.0, "z": -3.0, "health": 20.0, "armor": 15 },
                { "account": "ghost", "name": "Ghost", "world": "",
                  "x": 0.0, "y": 0.0, "z": 0.0 },
                { "account": "bob", "name": "Bob", "world": "world",
                  "x": 1.0, "y": 70.0, "z": 2.0 }
            ]
        });
        let parsed = parse_players(&raw).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.records[0].account, "alice");
        assert_eq!(parsed.records[0].armor, 15);
        // missing vitals default to zero
        assert_eq!(parsed.records[1].health, 0.0);
    }

    #[test]
    fn missing_players_array_is_a_parse_error() {
        assert!(matches!(
            parse_players(&json!({"currentcount": 0})),
            Err(ParseError::MissingPlayers)
        ));
    }

    #[test]
    fn parses_city_with_country_fields() {
        let desc = city_desc("风港", "3", 86, &["alice", "bob"], Some(("晨曦", "2", "风港")));
        let raw = marker_payload(vec![("lands_1", city_marker("风港", desc))]);
        let parsed = parse_cities(&raw).unwrap();
        assert_eq!(parsed.records.len(), 1);
        let city = &parsed.records[0];
        assert_eq!(city.name, "风港");
        assert_eq!(city.level, "3");
        assert_eq!(city.owner, "alice");
        assert_eq!(city.blocks, 86);
        assert_eq!(city.residents, vec!["alice", "bob"]);
        assert_eq!(city.country, "晨曦");
        assert_eq!(city.country_level, "2");
        assert_eq!(city.country_capital, "风港");
        assert_eq!(city.x, 100.0);
        assert_eq!(city.z, -40.0);
    }

    #[test]
    fn city_without_country_has_empty_country() {
        let desc = city_desc("孤城", "1", 12, &["carol"], None);
        let raw = marker_payload(vec![("lands_2", city_marker("孤城", desc))]);
        let parsed = parse_cities(&raw).unwrap();
        assert_eq!(parsed.records[0].country, "");
        assert_eq!(parsed.records[0].country_level, "");
    }

    #[test]
    fn spawn_marker_is_filtered_unconditionally() {
        let desc = city_desc(SPAWN_CITY, "0", 0, &[], None);
        let raw = marker_payload(vec![("spawn", city_marker("spawn", desc))]);
        let parsed = parse_cities(&raw).unwrap();
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.skipped, 0);
    }

    #[test]
    fn one_bad_record_does_not_abort_the_batch() {
        let mut markers = Vec::new();
        for (i, name) in ["一城", "二城", "三城", "四城"].iter().enumerate() {
            let desc = city_desc(name, "1", 10 + i as i64, &["p"], None);
            markers.push((*name, city_marker(name, desc)));
        }
        // negative block count fails field validation
        let bad = city_desc("破城", "1", -5, &["q"], None);
        markers.push(("破城", city_marker("破城", bad)));

        let raw = marker_payload(markers);
        let parsed = parse_cities(&raw).unwrap();
        assert_eq!(parsed.records.len(), 4);
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn missing_owner_falls_back_to_first_resident() {
        let desc = "<div><span style=\"font-size:200%;\">雾镇</span>\
                    <ul><li>等级: 2</li><li>区块: 30</li>\
                    <li>玩家(2): dave, dave</li></ul></div>";
        let raw = marker_payload(vec![("lands_3", city_marker("雾镇", desc.to_string()))]);
        let parsed = parse_cities(&raw).unwrap();
        let city = &parsed.records[0];
        assert_eq!(city.owner, "dave");
        // resident list is deduplicated
        assert_eq!(city.residents, vec!["dave"]);
    }

    #[test]
    fn payload_without_sets_is_a_parse_error() {
        assert!(matches!(
            parse_cities(&json!({"timestamp": 1})),
            Err(ParseError::MissingSets)
        ));
    }

    #[test]
    fn parse_state_defaults_to_empty_for_any_record_type() {
        let players: Parsed<PlayerRecord> = Parsed::default();
        assert!(players.records.is_empty());
        assert_eq!(players.skipped, 0);
        let cities: Parsed<CityRecord> = Parsed::default();
        assert!(cities.records.is_empty());
    }

    #[test]
    fn strip_tags_collapses_whitespace() {
        assert_eq!(strip_tags("<b>等级:</b>  3\n"), "等级: 3");
    }
}
