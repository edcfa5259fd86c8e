//! Validated runtime configuration.
//!
//! The library never reads environment variables or files itself; the binary
//! assembles a `Config` (clap + dotenv) and hands it over already validated.

use std::time::Duration;

use anyhow::{bail, Result};

pub const DEFAULT_PLAYERS_URL: &str = "https://map.simmc.cn/standalone/dynmap_world.json";
pub const DEFAULT_MARKERS_URL: &str = "https://map.simmc.cn/tiles/_markers_/marker_world.json";

#[derive(Debug, Clone)]
pub struct Config {
    /// dynmap world endpoint (online players).
    pub players_url: String,
    /// dynmap marker endpoint (Lands city markers).
    pub markers_url: String,
    pub db_path: String,
    /// Per-request timeout, seconds. Must be positive.
    pub timeout_secs: u64,
    /// Extra attempts after the first. Must be positive.
    pub retry_count: u32,
    /// Sleep between attempts, seconds. Zero is allowed.
    pub retry_delay_secs: u64,
    /// Continuous-mode pause, measured from cycle completion.
    pub interval_minutes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            players_url: DEFAULT_PLAYERS_URL.to_string(),
            markers_url: DEFAULT_MARKERS_URL.to_string(),
            db_path: "mapwatch.db".to_string(),
            timeout_secs: 30,
            retry_count: 3,
            retry_delay_secs: 5,
            interval_minutes: 30,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.players_url.trim().is_empty() || self.markers_url.trim().is_empty() {
            bail!("endpoint URLs must be non-empty");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be positive");
        }
        if self.retry_count == 0 {
            bail!("retry_count must be positive");
        }
        if self.interval_minutes == 0 {
            bail!("interval_minutes must be positive");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}
