use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use mapwatch::notify::LogNotifier;
use mapwatch::{Config, Spider, Store};

#[derive(Parser)]
#[command(name = "mapwatch", about = "dynmap map-state collector", version)]
struct Cli {
    /// SQLite database file
    #[arg(long, default_value = "mapwatch.db")]
    db: String,

    /// dynmap world endpoint (online players)
    #[arg(long)]
    players_url: Option<String>,

    /// dynmap marker endpoint (city markers)
    #[arg(long)]
    markers_url: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Retries after the first failed attempt
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Seconds to sleep between attempts
    #[arg(long, default_value_t = 5)]
    retry_delay: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single fetch/store cycle and exit
    RunOnce,
    /// Poll continuously until interrupted
    Run {
        /// Minutes between cycle completions
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    mapwatch::tracing::init_tracing("mapwatch=info")?;

    let cli = Cli::parse();
    let defaults = Config::default();
    let mut config = Config {
        players_url: cli.players_url.unwrap_or(defaults.players_url),
        markers_url: cli.markers_url.unwrap_or(defaults.markers_url),
        db_path: cli.db,
        timeout_secs: cli.timeout,
        retry_count: cli.retries,
        retry_delay_secs: cli.retry_delay,
        interval_minutes: defaults.interval_minutes,
    };
    if let Command::Run { interval } = &cli.command {
        config.interval_minutes = *interval;
    }
    config.validate()?;

    let store = Store::connect(&config.db_path).await?;
    let spider = Spider::new(config.clone(), store, Box::new(LogNotifier))?;

    match cli.command {
        Command::RunOnce => {
            let report = spider.run_once().await;
            info!(
                players = report.players.upserted,
                cities = report.cities.upserted,
                countries = report.countries.upserted,
                inactive = report.inactive_flagged,
                errors = ?report.errors,
                "single cycle finished"
            );
        }
        Command::Run { .. } => {
            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; finishing current cycle");
                    let _ = stop_tx.send(true);
                }
            });
            spider.run_continuous(stop_rx).await;
        }
    }
    Ok(())
}
