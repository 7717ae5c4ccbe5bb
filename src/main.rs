//! Trade engine server - headless signal-to-order pipeline
//!
//! Runs the dispatcher and its background monitors until interrupted.
//! Signals arrive through the library API (or the message-bus consumer
//! deployed alongside); this binary only hosts the engine and keeps the
//! Prometheus text endpoint renderable via logs.
//!
//! # Usage
//! ```sh
//! MODE=mock cargo run
//! MODE=live BINANCE_API_KEY=... BINANCE_API_SECRET=... cargo run
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

use tradeengine::application::engine::TradingEngine;
use tradeengine::config::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "tradeengine", about = "Futures trading engine core")]
struct Cli {
    /// Override SYMBOLS (comma-separated)
    #[arg(long)]
    symbols: Option<String>,

    /// Force simulation mode regardless of SIMULATION_ENABLED
    #[arg(long)]
    simulate: bool,

    /// Print resolved metrics on shutdown
    #[arg(long)]
    dump_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    let cli = Cli::parse();

    info!("Trade engine {} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = EngineConfig::from_env()?;
    if let Some(symbols) = cli.symbols {
        config.symbols = symbols.split(',').map(|s| s.trim().to_string()).collect();
    }
    if cli.simulate {
        config.simulate = true;
    }
    info!(
        "Configuration loaded: mode={:?}, symbols={:?}, simulate={}",
        config.mode, config.symbols, config.simulate
    );

    let mut engine = TradingEngine::build(config).await?;
    info!("Engine running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    engine.shutdown().await;

    if cli.dump_metrics {
        println!("{}", engine.metrics.render());
    }

    Ok(())
}
