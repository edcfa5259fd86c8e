//! Drives the pipeline: fetch → parse → aggregate → upsert → detect.
//!
//! Every taxonomy error (fetch, parse, storage, notify) is converted into a
//! `CycleReport` entry; nothing propagates past this boundary. A failed
//! endpoint abandons only its own branch: players and cities are independent
//! until aggregation, which strictly requires the completed city list.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::aggregate::aggregate_countries;
use crate::config::Config;
use crate::fetch::{Fetcher, HttpSource, ReqwestSource};
use crate::inactivity::{find_inactive, WINDOW_MAX_DAYS, WINDOW_MIN_DAYS};
use crate::model::CityRecord;
use crate::notify::Notifier;
use crate::parse::{parse_cities, parse_players};
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageCounts {
    pub parsed: usize,
    pub skipped: usize,
    pub upserted: usize,
    pub failed: usize,
}

/// Per-cycle observability for the calling layer. A cycle with zero
/// successful upserts is still just a report, never an error.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub players: StageCounts,
    pub cities: StageCounts,
    /// `parsed` here is the number of derived country aggregates.
    pub countries: StageCounts,
    pub inactive_flagged: usize,
    pub errors: Vec<String>,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            players: StageCounts::default(),
            cities: StageCounts::default(),
            countries: StageCounts::default(),
            inactive_flagged: 0,
            errors: Vec::new(),
        }
    }

    pub fn clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Spider<S> {
    config: Config,
    fetcher: Fetcher<S>,
    store: Store,
    notifier: Box<dyn Notifier>,
}

impl Spider<ReqwestSource> {
    pub fn new(config: Config, store: Store, notifier: Box<dyn Notifier>) -> anyhow::Result<Self> {
        let source = ReqwestSource::new(config.timeout())?;
        Ok(Self::with_source(config, source, store, notifier))
    }
}

impl<S: HttpSource> Spider<S> {
    pub fn with_source(
        config: Config,
        source: S,
        store: Store,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let fetcher = Fetcher::new(source, config.retry_count, config.retry_delay());
        Self {
            config,
            fetcher,
            store,
            notifier,
        }
    }

    /// One full cycle. Both endpoints are fetched concurrently, then merged
    /// in a fixed order so repeated runs over identical payloads are
    /// deterministic.
    pub async fn run_once(&self) -> CycleReport {
        let observed_at = Utc::now();
        let mut report = CycleReport::new(observed_at);

        let (players_raw, markers_raw) = tokio::join!(
            self.fetcher.fetch(&self.config.players_url),
            self.fetcher.fetch(&self.config.markers_url),
        );

        match players_raw {
            Ok(raw) => match parse_players(&raw) {
                Ok(parsed) => {
                    report.players.parsed = parsed.records.len();
                    report.players.skipped = parsed.skipped;
                    match self.store.upsert_players(&parsed.records, observed_at).await {
                        Ok(out) => {
                            report.players.upserted = out.upserted;
                            report.players.failed = out.failed;
                        }
                        Err(err) => report.errors.push(format!("player batch: {err}")),
                    }
                }
                Err(err) => report.errors.push(err.to_string()),
            },
            Err(err) => report.errors.push(err.to_string()),
        }

        let mut city_records: Option<Vec<CityRecord>> = None;
        match markers_raw {
            Ok(raw) => match parse_cities(&raw) {
                Ok(parsed) => {
                    report.cities.parsed = parsed.records.len();
                    report.cities.skipped = parsed.skipped;
                    match self.store.upsert_cities(&parsed.records, observed_at).await {
                        Ok(out) => {
                            report.cities.upserted = out.upserted;
                            report.cities.failed = out.failed;
                        }
                        Err(err) => report.errors.push(format!("city batch: {err}")),
                    }
                    city_records = Some(parsed.records);
                }
                Err(err) => report.errors.push(err.to_string()),
            },
            Err(err) => report.errors.push(err.to_string()),
        }

        // Countries exist only as an aggregate over the complete city list;
        // with the city branch abandoned there is nothing to derive and any
        // stale country rows simply age in place.
        if let Some(cities) = &city_records {
            let countries = aggregate_countries(cities);
            report.countries.parsed = countries.len();
            match self.store.upsert_countries(&countries, observed_at).await {
                Ok(out) => {
                    report.countries.upserted = out.upserted;
                    report.countries.failed = out.failed;
                }
                Err(err) => report.errors.push(format!("country batch: {err}")),
            }
        }

        match find_inactive(&self.store, observed_at, WINDOW_MIN_DAYS, WINDOW_MAX_DAYS).await {
            Ok(flagged) => {
                report.inactive_flagged = flagged.len();
                if !flagged.is_empty() {
                    if let Err(err) = self.notifier.notify(&flagged).await {
                        report.errors.push(format!("notify: {err}"));
                    }
                }
            }
            Err(err) => report.errors.push(format!("inactivity scan: {err}")),
        }

        info!(
            players = report.players.upserted,
            cities = report.cities.upserted,
            countries = report.countries.upserted,
            skipped = report.players.skipped + report.cities.skipped,
            inactive = report.inactive_flagged,
            errors = report.errors.len(),
            "cycle complete"
        );
        report
    }

    /// Runs cycles until `shutdown` flips to true (or its sender is
    /// dropped). The interval is measured from cycle completion, so cycles
    /// never overlap, and an in-flight cycle always finishes before the stop
    /// signal is honored.
    pub async fn run_continuous(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval();
        info!(
            interval_minutes = self.config.interval_minutes,
            "starting continuous run"
        );
        loop {
            let report = self.run_once().await;
            for err in &report.errors {
                error!(error = %err, "cycle error");
            }

            if *shutdown.borrow() {
                info!("stop signal received; shutting down");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("stop signal received; shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlayerRecord;
    use crate::notify::NoopNotifier;
    use crate::parse::tests::{city_desc, city_marker, marker_payload};
    use crate::parse::SPAWN_CITY;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned payloads by URL; unknown URLs fail like a dead server.
    struct ScriptedSource {
        payloads: HashMap<String, Value>,
    }

    #[async_trait]
    impl HttpSource for ScriptedSource {
        async fn get_json(&self, url: &str) -> anyhow::Result<Value> {
            self.payloads
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("simulated unreachable endpoint"))
        }
    }

    struct RecordingNotifier {
        seen: std::sync::Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, inactive: &[crate::inactivity::InactivePlayer]) -> anyhow::Result<()> {
            let mut seen = self.seen.lock().unwrap();
            seen.extend(inactive.iter().map(|p| p.player.account.clone()));
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            players_url: "http://test/players".to_string(),
            markers_url: "http://test/markers".to_string(),
            db_path: ":memory:".to_string(),
            timeout_secs: 1,
            retry_count: 1,
            retry_delay_secs: 0,
            interval_minutes: 1,
        }
    }

    fn players_payload() -> Value {
        json!({
            "players": [
                { "account": "alice", "name": "Alice", "world": "world",
                  "x": 1.0, "y": 64.0, "z": 2.0, "health": 20.0, "armor": 10 },
                { "account": "bob", "name": "Bob", "world": "world",
                  "x": 3.0, "y": 64.0, "z": 4.0, "health": 18.0, "armor": 5 }
            ]
        })
    }

    fn markers() -> Value {
        let harbor = city_desc("harbor", "3", 86, &["alice", "bob"], Some(("dawn", "2", "harbor")));
        let mist = city_desc("mist", "1", 30, &["bob", "carol"], Some(("dawn", "2", "harbor")));
        let spawn = city_desc(SPAWN_CITY, "0", 0, &[], None);
        marker_payload(vec![
            ("lands_1", city_marker("harbor", harbor)),
            ("lands_2", city_marker("mist", mist)),
            ("spawn", city_marker("spawn", spawn)),
        ])
    }

    async fn spider_with(
        payloads: Vec<(&str, Value)>,
        notifier: Box<dyn Notifier>,
    ) -> Spider<ScriptedSource> {
        let source = ScriptedSource {
            payloads: payloads
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };
        let store = Store::connect_memory().await.unwrap();
        Spider::with_source(test_config(), source, store, notifier)
    }

    #[tokio::test]
    async fn full_cycle_persists_all_three_entities() {
        let spider = spider_with(
            vec![
                ("http://test/players", players_payload()),
                ("http://test/markers", markers()),
            ],
            Box::new(NoopNotifier),
        )
        .await;

        let report = spider.run_once().await;
        assert!(report.clean(), "unexpected errors: {:?}", report.errors);
        assert_eq!(report.players.upserted, 2);
        assert_eq!(report.cities.upserted, 2);
        assert_eq!(report.countries.upserted, 1);

        // derived country invariants hold after persistence
        let dawn = spider.store.country_by_name("dawn").await.unwrap().unwrap();
        assert_eq!(dawn.total_blocks, 86 + 30);
        assert_eq!(dawn.player_count, 3); // alice, bob, carol
        assert_eq!(dawn.territory_count, 2);
        assert_eq!(dawn.territories, vec!["harbor", "mist"]);
        assert_eq!(dawn.capital, "harbor");

        // the spawn sentinel never lands anywhere
        assert!(spider.store.city_by_name(SPAWN_CITY).await.unwrap().is_none());
        assert!(!dawn.territories.iter().any(|t| t == SPAWN_CITY));
    }

    #[tokio::test]
    async fn failed_endpoint_abandons_only_its_own_branch() {
        // markers endpoint is down; players must still be processed
        let spider = spider_with(
            vec![("http://test/players", players_payload())],
            Box::new(NoopNotifier),
        )
        .await;

        let report = spider.run_once().await;
        assert_eq!(report.players.upserted, 2);
        assert_eq!(report.cities.upserted, 0);
        assert_eq!(report.countries.parsed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("http://test/markers"));
    }

    #[tokio::test]
    async fn malformed_marker_payload_is_a_reported_parse_error() {
        let spider = spider_with(
            vec![
                ("http://test/players", players_payload()),
                ("http://test/markers", json!({"timestamp": 1})),
            ],
            Box::new(NoopNotifier),
        )
        .await;

        let report = spider.run_once().await;
        assert_eq!(report.players.upserted, 2);
        assert_eq!(report.cities.parsed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("sets"));
    }

    #[tokio::test]
    async fn empty_player_list_is_a_successful_empty_cycle() {
        let spider = spider_with(
            vec![
                ("http://test/players", json!({"players": []})),
                ("http://test/markers", markers()),
            ],
            Box::new(NoopNotifier),
        )
        .await;

        let report = spider.run_once().await;
        assert!(report.clean());
        assert_eq!(report.players.parsed, 0);
        assert_eq!(report.cities.upserted, 2);
    }

    #[tokio::test]
    async fn inactive_players_reach_the_notifier() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let notifier = Box::new(RecordingNotifier { seen: seen.clone() });
        let spider = spider_with(
            vec![
                ("http://test/players", json!({"players": []})),
                ("http://test/markers", markers()),
            ],
            notifier,
        )
        .await;

        // seed a player last seen 41.5 days ago
        let stale = PlayerRecord {
            account: "sleeper".to_string(),
            name: "Sleeper".to_string(),
            world: "world".to_string(),
            x: 0.0,
            y: 64.0,
            z: 0.0,
            health: 20.0,
            armor: 0,
        };
        let last_seen = Utc::now() - chrono::Duration::hours(41 * 24 + 12);
        spider
            .store
            .upsert_players(&[stale], last_seen)
            .await
            .unwrap();

        let report = spider.run_once().await;
        assert!(report.clean(), "unexpected errors: {:?}", report.errors);
        assert_eq!(report.inactive_flagged, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["sleeper".to_string()]);
    }

    #[tokio::test]
    async fn continuous_run_honors_the_stop_signal() {
        let spider = spider_with(
            vec![
                ("http://test/players", json!({"players": []})),
                ("http://test/markers", markers()),
            ],
            Box::new(NoopNotifier),
        )
        .await;

        let (tx, rx) = watch::channel(true);
        // signal already set: exactly one cycle runs, then the loop exits
        tokio::time::timeout(std::time::Duration::from_secs(5), spider.run_continuous(rx))
            .await
            .expect("run_continuous did not stop");
        drop(tx);
    }
}
