use anyhow::Context;
use clap::{Parser, Subcommand};
use shortbot::control::{Components, ControlLoop};
use shortbot::exchange::{BinanceClient, ExchangeGateway};
use shortbot::remote::{
    log_channel, spawn_log_worker, LogRecord, OfflineControl, PostgresControl, RemoteControl,
};
use shortbot::settings::{Credentials, Settings};
use shortbot::signals::{GrokAdvisor, PumpScanner, SentimentAdvisor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shortbot", about = "Martingale pump-short bot for Binance USDT-M futures")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until Ctrl+C
    Run {
        /// Settings file layered over config/default.toml
        #[arg(long)]
        config: Option<PathBuf>,
        /// Begin trading immediately instead of waiting for a START command
        #[arg(long)]
        start: bool,
    },
    /// Recover positions from the exchange, print the snapshot and exit
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Command::Run { config, .. } | Command::Status { config } => config.clone(),
    };
    let mut settings = Settings::load(config_path.as_deref()).context("loading settings")?;

    let log_rx = setup_logging(&settings);

    match cli.command {
        Command::Run { start, .. } => {
            if start {
                settings.control.auto_start = true;
            }
            run(settings, log_rx).await
        }
        Command::Status { .. } => status(settings).await,
    }
}

/// fmt output plus, when enabled, the remote log layer. Returns the queue the
/// shipping worker drains once the remote channel is up.
fn setup_logging(settings: &Settings) -> Option<mpsc::Receiver<LogRecord>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.filter));

    if settings.logging.ship_remote {
        let (layer, rx) = log_channel(settings.logging.remote_queue_capacity);
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(layer)
            .init();
        Some(rx)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
        None
    }
}

async fn connect_remote(settings: &Settings, credentials: &Credentials) -> Arc<dyn RemoteControl> {
    let Some(database_url) = credentials.database_url.as_deref() else {
        tracing::warn!("⚠️ DATABASE_URL not set, running without the dashboard channel");
        return Arc::new(OfflineControl);
    };

    let config = serde_json::to_value(&settings.strategy).unwrap_or_default();
    match PostgresControl::connect(database_url, config).await {
        Ok(control) => Arc::new(control),
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing without the dashboard channel",
                e
            );
            Arc::new(OfflineControl)
        }
    }
}

fn build_components(
    settings: &Settings,
    credentials: &Credentials,
    remote: Arc<dyn RemoteControl>,
) -> anyhow::Result<Components> {
    let gateway: Arc<dyn ExchangeGateway> = Arc::new(
        BinanceClient::new(
            &settings.exchange,
            credentials.api_key.clone(),
            credentials.api_secret.clone(),
        )
        .context("building exchange client")?,
    );

    let signals = Arc::new(PumpScanner::new(
        gateway.clone(),
        settings.exchange.quote_asset.clone(),
        settings.scanner.clone(),
    ));

    let advisor: Option<Arc<dyn SentimentAdvisor>> = match &credentials.grok_api_key {
        Some(key) => Some(Arc::new(
            GrokAdvisor::new(key.clone()).context("building sentiment advisor")?,
        )),
        None => {
            tracing::info!("GROK_API_KEY not set, sentiment check disabled");
            None
        }
    };

    Ok(Components {
        gateway,
        signals,
        advisor,
        remote,
    })
}

async fn run(settings: Settings, log_rx: Option<mpsc::Receiver<LogRecord>>) -> anyhow::Result<()> {
    tracing::info!("🚀 shortbot starting");

    let credentials = Credentials::from_env().context("reading credentials")?;
    let remote = connect_remote(&settings, &credentials).await;
    if let Some(rx) = log_rx {
        spawn_log_worker(rx, remote.clone());
    }

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Exchange: {}", settings.exchange.rest_url());
    tracing::info!("  Ladder: {:?} (total ${:.2})", settings.strategy.ladder, settings.strategy.ladder_total());
    tracing::info!("  Leverage: {}x", settings.strategy.leverage);
    tracing::info!("  Max positions: {}", settings.risk.max_positions);
    tracing::info!("  Min pump: {}%", settings.strategy.min_pump_percent);

    let components = build_components(&settings, &credentials, remote)?;
    let (mut control_loop, handle) = ControlLoop::new(&settings, components);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received");
            handle.shutdown();
        }
    });

    control_loop.startup().await.context("startup failed")?;
    control_loop.run().await?;
    Ok(())
}

async fn status(settings: Settings) -> anyhow::Result<()> {
    let credentials = Credentials::from_env().context("reading credentials")?;
    let components = build_components(&settings, &credentials, Arc::new(OfflineControl))?;
    let (mut control_loop, _handle) = ControlLoop::new(&settings, components);

    control_loop.startup().await.context("startup failed")?;

    let snapshot = control_loop.snapshots().latest();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
