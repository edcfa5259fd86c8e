//! Durable state: SQLite via sqlx, single writer.
//!
//! The store is the only component that mutates persisted entities. Upserts
//! are keyed (account / city name / country name) and run record-by-record
//! inside one transaction per batch: a failing record is counted and the
//! rest still commit; only a catastrophic begin/commit failure rolls the
//! batch back. Entities absent from a batch are left untouched: absence is
//! signal for the inactivity detector, not a deletion.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::StorageError;
use crate::model::{CityRecord, CountryRecord, PlayerRecord};

const FIRST_RUN_KEY: &str = "first_run_timestamp";

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Per-batch result: how many records landed, how many were isolated as
/// failures. A non-zero `failed` never aborts the cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub upserted: usize,
    pub failed: usize,
}

/// A persisted player row, i.e. a [`PlayerRecord`] plus its observation time.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StoredPlayer {
    pub account: String,
    pub name: String,
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub health: f64,
    pub armor: i64,
    pub update_time: i64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CityRow {
    pub name: String,
    pub level: String,
    pub owner: String,
    pub balance: String,
    pub blocks: i64,
    pub residents: Vec<String>,
    pub country: String,
    pub update_time: i64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CountryRow {
    pub name: String,
    pub level: String,
    pub capital: String,
    pub territories: Vec<String>,
    pub territory_count: i64,
    pub player_count: i64,
    pub total_blocks: i64,
    pub update_time: i64,
}

impl Store {
    pub async fn connect(path: &str) -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect_with(opts).await
    }

    /// In-memory database; used by tests and ad-hoc dry runs.
    pub async fn connect_memory() -> Result<Self, StorageError> {
        Self::connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?).await
    }

    async fn connect_with(opts: SqliteConnectOptions) -> Result<Self, StorageError> {
        // Single writer by contract; one connection also keeps an in-memory
        // database alive across calls.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        store.ensure_first_run(Utc::now()).await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS players (
                account     TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                world       TEXT NOT NULL,
                x           REAL NOT NULL,
                y           REAL NOT NULL,
                z           REAL NOT NULL,
                health      REAL NOT NULL CHECK (health >= 0),
                armor       INTEGER NOT NULL CHECK (armor >= 0),
                update_time INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cities (
                name        TEXT PRIMARY KEY,
                label       TEXT NOT NULL,
                x           REAL NOT NULL,
                y           REAL NOT NULL,
                z           REAL NOT NULL,
                level       TEXT NOT NULL,
                owner       TEXT NOT NULL,
                balance     TEXT NOT NULL,
                blocks      INTEGER NOT NULL CHECK (blocks >= 0),
                residents   TEXT NOT NULL, -- JSON array of accounts
                country     TEXT NOT NULL,
                update_time INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS countries (
                name            TEXT PRIMARY KEY,
                level           TEXT NOT NULL,
                capital         TEXT NOT NULL,
                territories     TEXT NOT NULL, -- JSON array of city names
                territory_count INTEGER NOT NULL CHECK (territory_count >= 0),
                player_count    INTEGER NOT NULL CHECK (player_count >= 0),
                total_blocks    INTEGER NOT NULL CHECK (total_blocks >= 0),
                update_time     INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_config (
                key          TEXT PRIMARY KEY,
                value        TEXT NOT NULL,
                created_time INTEGER NOT NULL,
                updated_time INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records when this database first saw a cycle. Insert-once: subsequent
    /// connects leave the original value alone.
    async fn ensure_first_run(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO system_config (key, value, created_time, updated_time)
             VALUES (?, ?, ?, ?)",
        )
        .bind(FIRST_RUN_KEY)
        .bind(now.timestamp().to_string())
        .bind(now.timestamp())
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() > 0 {
            info!(timestamp = now.timestamp(), "recorded first run");
        }
        Ok(())
    }

    pub async fn first_run_timestamp(&self) -> Result<Option<i64>, StorageError> {
        let row = sqlx::query("SELECT value FROM system_config WHERE key = ?")
            .bind(FIRST_RUN_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<String, _>("value").parse().ok()))
    }

    pub async fn upsert_players(
        &self,
        records: &[PlayerRecord],
        observed_at: DateTime<Utc>,
    ) -> Result<BatchOutcome, StorageError> {
        let ts = observed_at.timestamp();
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();
        for rec in records {
            let res = sqlx::query(
                r#"
                INSERT INTO players (account, name, world, x, y, z, health, armor, update_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(account) DO UPDATE SET
                    name = excluded.name,
                    world = excluded.world,
                    x = excluded.x,
                    y = excluded.y,
                    z = excluded.z,
                    health = excluded.health,
                    armor = excluded.armor,
                    update_time = excluded.update_time
                "#,
            )
            .bind(&rec.account)
            .bind(&rec.name)
            .bind(&rec.world)
            .bind(rec.x)
            .bind(rec.y)
            .bind(rec.z)
            .bind(rec.health)
            .bind(rec.armor)
            .bind(ts)
            .execute(&mut *tx)
            .await;
            match res {
                Ok(_) => outcome.upserted += 1,
                Err(err) => {
                    warn!(account = %rec.account, error = %err, "player upsert failed");
                    outcome.failed += 1;
                }
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn upsert_cities(
        &self,
        records: &[CityRecord],
        observed_at: DateTime<Utc>,
    ) -> Result<BatchOutcome, StorageError> {
        let ts = observed_at.timestamp();
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();
        for rec in records {
            let residents =
                serde_json::to_string(&rec.residents).unwrap_or_else(|_| "[]".to_string());
            let res = sqlx::query(
                r#"
                INSERT INTO cities
                    (name, label, x, y, z, level, owner, balance, blocks, residents, country, update_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    label = excluded.label,
                    x = excluded.x,
                    y = excluded.y,
                    z = excluded.z,
                    level = excluded.level,
                    owner = excluded.owner,
                    balance = excluded.balance,
                    blocks = excluded.blocks,
                    residents = excluded.residents,
                    country = excluded.country,
                    update_time = excluded.update_time
                "#,
            )
            .bind(&rec.name)
            .bind(&rec.label)
            .bind(rec.x)
            .bind(rec.y)
            .bind(rec.z)
            .bind(&rec.level)
            .bind(&rec.owner)
            .bind(&rec.balance)
            .bind(rec.blocks)
            .bind(residents)
            .bind(&rec.country)
            .bind(ts)
            .execute(&mut *tx)
            .await;
            match res {
                Ok(_) => outcome.upserted += 1,
                Err(err) => {
                    warn!(city = %rec.name, error = %err, "city upsert failed");
                    outcome.failed += 1;
                }
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn upsert_countries(
        &self,
        records: &[CountryRecord],
        observed_at: DateTime<Utc>,
    ) -> Result<BatchOutcome, StorageError> {
        let ts = observed_at.timestamp();
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();
        for rec in records {
            let territories =
                serde_json::to_string(&rec.territories).unwrap_or_else(|_| "[]".to_string());
            let res = sqlx::query(
                r#"
                INSERT INTO countries
                    (name, level, capital, territories, territory_count, player_count, total_blocks, update_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    level = excluded.level,
                    capital = excluded.capital,
                    territories = excluded.territories,
                    territory_count = excluded.territory_count,
                    player_count = excluded.player_count,
                    total_blocks = excluded.total_blocks,
                    update_time = excluded.update_time
                "#,
            )
            .bind(&rec.name)
            .bind(&rec.level)
            .bind(&rec.capital)
            .bind(territories)
            .bind(rec.territory_count)
            .bind(rec.player_count)
            .bind(rec.total_blocks)
            .bind(ts)
            .execute(&mut *tx)
            .await;
            match res {
                Ok(_) => outcome.upserted += 1,
                Err(err) => {
                    warn!(country = %rec.name, error = %err, "country upsert failed");
                    outcome.failed += 1;
                }
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    /// Players whose observation time falls in `[oldest, newest]` inclusive,
    /// ordered by account for deterministic reporting.
    pub async fn players_observed_between(
        &self,
        oldest: i64,
        newest: i64,
    ) -> Result<Vec<StoredPlayer>, StorageError> {
        let rows = sqlx::query(
            "SELECT account, name, world, x, y, z, health, armor, update_time
             FROM players
             WHERE update_time >= ? AND update_time <= ?
             ORDER BY account",
        )
        .bind(oldest)
        .bind(newest)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(player_from_row).collect())
    }

    /// The city this account currently resides in, if any.
    ///
    /// Residents are stored as a JSON array, so a LIKE on the quoted account
    /// prunes candidates and the decoded list is checked for an exact match
    /// (`"bob"` must not match `bobby`). `%` and `_` in the account stay in
    /// the pattern as wildcards: they can only over-match, and the exact
    /// check below rejects false candidates.
    pub async fn city_of_resident(&self, account: &str) -> Result<Option<CityRow>, StorageError> {
        let pattern = format!("%\"{}\"%", account.replace('"', ""));
        let rows = sqlx::query(
            "SELECT name, level, owner, balance, blocks, residents, country, update_time
             FROM cities WHERE residents LIKE ? ORDER BY name",
        )
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let city = city_from_row(row);
            if city.residents.iter().any(|r| r == account) {
                return Ok(Some(city));
            }
        }
        Ok(None)
    }

    pub async fn country_by_name(&self, name: &str) -> Result<Option<CountryRow>, StorageError> {
        let row = sqlx::query(
            "SELECT name, level, capital, territories, territory_count, player_count,
                    total_blocks, update_time
             FROM countries WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(country_from_row))
    }

    pub async fn city_by_name(&self, name: &str) -> Result<Option<CityRow>, StorageError> {
        let row = sqlx::query(
            "SELECT name, level, owner, balance, blocks, residents, country, update_time
             FROM cities WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(city_from_row))
    }

    /// Maintenance: drop player rows not observed since `cutoff`. Not part of
    /// the regular cycle; exposed for the operator.
    pub async fn purge_players_before(&self, cutoff: i64) -> Result<u64, StorageError> {
        let res = sqlx::query("DELETE FROM players WHERE update_time < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

fn player_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredPlayer {
    StoredPlayer {
        account: row.get("account"),
        name: row.get("name"),
        world: row.get("world"),
        x: row.get("x"),
        y: row.get("y"),
        z: row.get("z"),
        health: row.get("health"),
        armor: row.get("armor"),
        update_time: row.get("update_time"),
    }
}

fn city_from_row(row: &sqlx::sqlite::SqliteRow) -> CityRow {
    let residents: String = row.get("residents");
    CityRow {
        name: row.get("name"),
        level: row.get("level"),
        owner: row.get("owner"),
        balance: row.get("balance"),
        blocks: row.get("blocks"),
        residents: serde_json::from_str(&residents).unwrap_or_default(),
        country: row.get("country"),
        update_time: row.get("update_time"),
    }
}

fn country_from_row(row: &sqlx::sqlite::SqliteRow) -> CountryRow {
    let territories: String = row.get("territories");
    CountryRow {
        name: row.get("name"),
        level: row.get("level"),
        capital: row.get("capital"),
        territories: serde_json::from_str(&territories).unwrap_or_default(),
        territory_count: row.get("territory_count"),
        player_count: row.get("player_count"),
        total_blocks: row.get("total_blocks"),
        update_time: row.get("update_time"),
    }
}
