use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tradepilot::adapters::{JsonlSignalSource, PriceRecordingSource, StaticPriceFeed, WebhookAlertSink};
use tradepilot::config::{AppConfig, LoggingConfig};
use tradepilot::coordination::{install_signal_handlers, GracefulShutdown, ShutdownConfig};
use tradepilot::domain::PositionStatus;
use tradepilot::exchange::{broker_kind, build_broker_client};
use tradepilot::persistence::{JsonFileStore, LedgerStore};
use tradepilot::strategy::{ExecutionEngine, PositionLedger, Retention};
use tradepilot::supervisor::AlertManager;

#[derive(Parser)]
#[command(name = "tradepilot")]
#[command(version)]
#[command(about = "Signal-to-position execution engine for equity and option trades", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", env = "TRADEPILOT_CONFIG_DIR")]
    config_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the execution loop until Ctrl+C
    Run {
        /// JSON-lines file the signal provider appends to
        #[arg(short, long, default_value = "data/signals.jsonl")]
        signals: PathBuf,
        /// Route orders to the live REST broker
        #[arg(long)]
        live: bool,
    },
    /// Load and validate configuration, then print a summary
    CheckConfig,
    /// Print positions from the persisted ledger
    Positions {
        /// Only positions in this state (e.g. OPEN, FAILED)
        #[arg(short, long, value_parser = parse_status)]
        status: Option<PositionStatus>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { signals, live } => {
            let mut config = load_config(&cli.config_dir)?;
            if live {
                config.account.paper_trading = false;
            }
            validate(&config)?;
            init_logging(&config.logging);
            run(config, signals).await
        }
        Commands::CheckConfig => {
            init_logging_simple();
            let config = load_config(&cli.config_dir)?;
            validate(&config)?;
            print_summary(&config);
            Ok(())
        }
        Commands::Positions { status } => {
            init_logging_simple();
            let config = load_config(&cli.config_dir)?;
            show_positions(&config, status).await
        }
    }
}

fn parse_status(raw: &str) -> Result<PositionStatus, String> {
    PositionStatus::try_from(raw)
}

fn load_config(dir: &Path) -> anyhow::Result<AppConfig> {
    AppConfig::load_from(dir)
        .with_context(|| format!("failed to load configuration from {}", dir.display()))
}

fn validate(config: &AppConfig) -> anyhow::Result<()> {
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("  - {}", error);
        }
        bail!("configuration has {} problem(s)", errors.len());
    }
    Ok(())
}

async fn run(config: AppConfig, signals: PathBuf) -> anyhow::Result<()> {
    info!(
        "Starting tradepilot ({} broker, balance ${}, {} symbols on watchlist)",
        broker_kind(&config),
        config.account.balance,
        config.watchlist.len()
    );

    let store: Arc<dyn LedgerStore> = Arc::new(
        JsonFileStore::open(&config.persistence.data_dir)
            .await
            .context("failed to open ledger store")?,
    );

    let mut alerts = AlertManager::new(config.alerts.clone()).with_store(Arc::clone(&store));
    if let Some(url) = &config.alerts.webhook_url {
        alerts = alerts.with_sink(WebhookAlertSink::new(url.clone()));
    }
    let alerts = Arc::new(alerts);

    let quotes = Arc::new(StaticPriceFeed::new());
    let broker = build_broker_client(&config, Arc::clone(&quotes))?;
    let ledger = Arc::new(
        PositionLedger::new(config.account.balance)
            .with_store(store)
            .with_retention(Retention::from_config(&config)),
    );

    let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig {
        order_drain_timeout_secs: config.schedule.shutdown_drain_timeout_secs,
        ..ShutdownConfig::default()
    }));
    install_signal_handlers(Arc::clone(&shutdown));

    let source = PriceRecordingSource::new(JsonlSignalSource::new(&signals), Arc::clone(&quotes));
    info!("Reading signals from {}", signals.display());

    let engine = Arc::new(ExecutionEngine::new(config, ledger, broker, quotes, alerts));
    if let Err(e) = engine.run(source, shutdown).await {
        warn!("Execution engine stopped with error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn print_summary(config: &AppConfig) {
    println!("Configuration OK");
    println!("  broker:              {}", broker_kind(config));
    println!("  balance:             ${}", config.account.balance);
    println!(
        "  daily risk budget:   ${} ({}%)",
        config.risk.daily_budget(config.account.balance),
        config.risk.max_portfolio_risk_percent
    );
    println!("  max open positions:  {}", config.risk.max_open_positions);
    println!("  max position size:   ${}", config.risk.max_position_size);
    println!(
        "  exits:               TP {}% / SL {}% / trail {}% / hold {}m",
        config.exit.take_profit_percent,
        config.exit.stop_loss_percent,
        config.exit.trailing_stop_percent,
        config.exit.max_hold_time_minutes
    );
    println!(
        "  orders:              {} {}, timeout {}ms, {} retries",
        config.execution.order_type,
        config.execution.time_in_force,
        config.execution.order_timeout_ms,
        config.execution.max_retries
    );
    println!("  watchlist:           {}", config.watchlist.join(", "));
}

async fn show_positions(config: &AppConfig, status: Option<PositionStatus>) -> anyhow::Result<()> {
    let store = JsonFileStore::open(&config.persistence.data_dir).await?;
    let Some(snapshot) = store.load_snapshot().await? else {
        println!("No ledger at {}", store.snapshot_path().display());
        return Ok(());
    };

    println!(
        "Ledger v{} saved {} | balance ${} | open {} | risk used today ${}",
        snapshot.version,
        snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC"),
        snapshot.risk.account_balance,
        snapshot.risk.open_position_count,
        snapshot.risk.risk_used_today
    );
    println!(
        "{:<36}  {:<28}  {:<12}  {:>6}  {:>10}  {:>10}  {:>10}  {:>12}",
        "ID", "INSTRUMENT", "STATUS", "QTY", "ENTRY", "EXIT", "PNL", "PNL $"
    );

    for position in snapshot
        .positions
        .iter()
        .filter(|p| status.map_or(true, |s| p.status == s))
    {
        let dash = || "-".to_string();
        println!(
            "{:<36}  {:<28}  {:<12}  {:>6}  {:>10}  {:>10}  {:>10}  {:>12}",
            position.id,
            position.key(),
            position.status.as_str(),
            position.quantity,
            position.entry_price.to_string(),
            position.exit_price.map(|p| p.to_string()).unwrap_or_else(dash),
            position.realized_pnl.map(|p| p.to_string()).unwrap_or_else(dash),
            position.realized_cash_pnl.map(|p| p.to_string()).unwrap_or_else(dash),
        );
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tradepilot={}", logging.level, logging.level)));

    // `rolling::daily` panics if it cannot create the first file, so check writability first
    let file_layer = logging.dir.as_ref().and_then(|log_dir| {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                log_dir.display(),
                e
            );
            return None;
        }
        let test_path = log_dir.join(".tradepilot_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(log_dir, "tradepilot.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Lives for the whole process
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir.display(),
                    e
                );
                None
            }
        }
    });

    let (console_layer, json_layer) = if logging.json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, &logging.dir) {
        eprintln!("Logging to: {}/tradepilot.log", dir.display());
    }
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
