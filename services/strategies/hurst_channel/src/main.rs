//! Hurst Channel Strategy Main Entry Point
//!
//! Runs the supervisor against the paper broker and in-memory persistence.
//! Candle history is read from a JSON file and live ticks from stdin, one JSON
//! object per line.

use anyhow::{Context, Result};
use clap::Parser;
use config::{LogFormat, SupervisorConfig};
use hurst_channel::{InMemoryMarketData, InMemoryPersistence, InstanceDeps, PaperBroker, Supervisor};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strategy_shared::{init_strategy_logging, LogEmoji, LogOutput};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use types::{Candle, CandleInterval, SystemClock, Tick};

#[derive(Parser, Debug)]
#[command(name = "hurst_channel", about = "Hurst channel mean-reversion supervisor")]
struct Args {
    /// Supervisor configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON file with closed candle history per symbol and interval
    #[arg(long)]
    history: Option<PathBuf>,

    /// Paper balance per quote currency
    #[arg(long, default_value = "10000")]
    paper_balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct HistorySeries {
    symbol: String,
    interval: CandleInterval,
    candles: Vec<Candle>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = SupervisorConfig::load(args.config.as_deref())
        .context("Failed to load supervisor configuration")?;

    let output = match config.logging.format {
        LogFormat::Pretty => LogOutput::Pretty,
        LogFormat::Json => LogOutput::Json,
    };
    init_strategy_logging(&config.logging.level, output)?;
    info!("{} Starting Hurst channel supervisor", LogEmoji::START);

    let market_data = Arc::new(InMemoryMarketData::new());
    if let Some(path) = &args.history {
        load_history(&market_data, path)?;
    }

    let mut broker = PaperBroker::new();
    for instance in &config.instances {
        broker = broker.with_balance(&instance.quote_currency, args.paper_balance);
    }
    let broker = Arc::new(broker);

    let supervisor = Supervisor::new(InstanceDeps {
        market_data: market_data.clone(),
        broker: broker.clone(),
        persistence: Arc::new(InMemoryPersistence::new()),
        clock: Arc::new(SystemClock),
        dispatcher: config.dispatcher.clone(),
    });

    for instance in config.instances {
        let symbol = instance.symbol.clone();
        match supervisor.create(instance).await {
            Ok(id) => {
                if let Err(e) = supervisor.start(id).await {
                    error!(%symbol, error = %e, "Instance failed to start");
                }
            }
            Err(e) => error!(%symbol, error = %e, "Instance could not be created"),
        }
    }

    info!("Supervisor running. Reading ticks from stdin; press Ctrl+C to stop.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<Tick>(&line) {
                    Ok(tick) => {
                        broker.set_price(&tick.symbol, tick.price);
                        market_data.publish(tick).await;
                    }
                    Err(e) => warn!(error = %e, "Skipping malformed tick"),
                },
                None => {
                    info!("Tick stream ended");
                    break;
                }
            },
        }
    }

    for snapshot in supervisor.list() {
        info!(
            "{} {} {}: {} position={} realized={}",
            LogEmoji::CHART,
            snapshot.instance_id,
            snapshot.symbol,
            snapshot.status.as_str(),
            snapshot.position_status.as_str(),
            snapshot.ledger.realized_profit
        );
    }
    supervisor.shutdown().await;
    info!("{} Supervisor stopped", LogEmoji::STOP);
    Ok(())
}

fn load_history(market_data: &InMemoryMarketData, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file {}", path.display()))?;
    let series: Vec<HistorySeries> =
        serde_json::from_str(&raw).context("Failed to parse history file")?;
    for s in series {
        info!(symbol = %s.symbol, interval = %s.interval, count = s.candles.len(), "Loaded history");
        market_data.insert_candles(&s.symbol, s.interval, s.candles);
    }
    Ok(())
}
