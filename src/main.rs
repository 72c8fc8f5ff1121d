use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use poc_monitor::api::{BinanceClient, MarketData, RateBudget};
use poc_monitor::db::{PocStore, PostgresPersistence, PriceStore};
use poc_monitor::detection::rank_hot_symbols;
use poc_monitor::feed::BatchFetcher;
use poc_monitor::monitor::{CycleMode, CycleReport, MonitorCycle, MonitorLoop};
use poc_monitor::notify::{LogNotifier, Notifier, TelegramNotifier};
use poc_monitor::persistence::RedisPersistence;
use poc_monitor::settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const RECENT_EVENTS: i64 = 10;

#[derive(Parser)]
#[command(name = "poc-monitor", version, about = "Binance futures POC crossover monitor")]
struct Cli {
    /// TOML config file (defaults to ./poc_monitor.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recompute POC levels for every symbol, then detect crossings
    Calc,
    /// One price-only detection pass against stored levels
    Monitor,
    /// Monitor continuously until Ctrl+C
    Loop,
    /// Check exchange and Telegram connectivity
    Test,
    /// Storage statistics and recent crossings
    Stats {
        /// Also send the summary to Telegram
        #[arg(long)]
        notify: bool,
    },
    /// Symbols trading closest to one of their POC levels
    Hot {
        #[arg(long, default_value_t = 20)]
        top: usize,
        /// Also send the list to Telegram
        #[arg(long)]
        notify: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command {
        Command::Calc => run_once(&settings, CycleMode::Calc).await,
        Command::Monitor => run_once(&settings, CycleMode::Monitor).await,
        Command::Loop => run_loop(&settings).await,
        Command::Test => run_connectivity_test(&settings).await,
        Command::Stats { notify } => show_stats(&settings, notify).await,
        Command::Hot { top, notify } => show_hot_symbols(&settings, top, notify).await,
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("poc_monitor=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn create_binance_client(settings: &Settings) -> Result<(BinanceClient, Arc<RateBudget>)> {
    let budget = Arc::new(RateBudget::from_settings(&settings.exchange));
    let client = BinanceClient::new(&settings.exchange, budget.clone())?;

    tracing::info!(
        "Exchange {} (budget {}/{}s)",
        settings.exchange.base_url,
        budget.effective_limit(),
        settings.exchange.weight_window_secs
    );

    Ok((client, budget))
}

/// Postgres is required; Redis takes over price snapshots when configured
async fn connect_storage(
    settings: &Settings,
) -> Result<(Arc<PostgresPersistence>, Arc<dyn PriceStore>)> {
    let postgres = Arc::new(
        PostgresPersistence::new(&settings.storage)
            .await
            .context("Cannot reach Postgres")?,
    );

    let price_store: Arc<dyn PriceStore> = match &settings.storage.redis_url {
        Some(redis_url) => {
            let timeout = Duration::from_secs(settings.storage.connect_timeout_secs);
            let redis = RedisPersistence::new(redis_url, timeout)
                .await
                .context("Cannot reach Redis")?;
            tracing::info!("Price snapshots stored in Redis");
            Arc::new(redis)
        }
        None => {
            tracing::info!("Price snapshots stored in Postgres");
            postgres.clone()
        }
    };

    Ok((postgres, price_store))
}

fn create_notifier(settings: &Settings) -> Arc<dyn Notifier> {
    match TelegramNotifier::new(&settings.telegram) {
        Some(telegram) => {
            tracing::info!("Telegram notifications enabled");
            Arc::new(telegram)
        }
        None => {
            tracing::info!("Crossings will be logged only");
            Arc::new(LogNotifier)
        }
    }
}

async fn build_cycle(settings: &Settings) -> Result<MonitorCycle> {
    let (client, budget) = create_binance_client(settings)?;
    let (postgres, price_store) = connect_storage(settings).await?;
    let poc_store: Arc<dyn PocStore> = postgres;

    Ok(MonitorCycle::new(
        settings,
        Arc::new(client),
        BatchFetcher::new(settings, budget),
        poc_store,
        price_store,
        create_notifier(settings),
    ))
}

/// Flips the returned flag on the first Ctrl+C
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("⚠️  Received Ctrl+C, finishing the current batch...");
            let _ = tx.send(true);
        }
    });

    rx
}

// ============================================================================
// Commands
// ============================================================================

async fn run_once(settings: &Settings, mode: CycleMode) -> Result<()> {
    let cycle = build_cycle(settings).await?;
    let shutdown = shutdown_on_ctrl_c();

    let report = cycle.run(mode, &shutdown).await?;
    print_report(&report);

    Ok(())
}

async fn run_loop(settings: &Settings) -> Result<()> {
    let cycle = build_cycle(settings).await?;
    let shutdown = shutdown_on_ctrl_c();

    tracing::info!("🚀 POC monitor loop starting, press Ctrl+C to stop");

    let stats = MonitorLoop::new(cycle, &settings.monitor).run(shutdown).await;

    tracing::info!(
        "👋 Stopped after {} cycles ({} calc passes, {} crossings)",
        stats.cycles,
        stats.calc_passes,
        stats.events
    );
    Ok(())
}

async fn run_connectivity_test(settings: &Settings) -> Result<()> {
    let (client, _budget) = create_binance_client(settings)?;

    client.ping().await.context("Exchange ping failed")?;
    println!("✅ Exchange reachable at {}", settings.exchange.base_url);

    let symbols = client.list_symbols().await.context("Failed to list symbols")?;
    println!("✅ {} tradable {} perpetuals", symbols.len(), settings.exchange.quote_asset);

    match TelegramNotifier::new(&settings.telegram) {
        Some(telegram) => {
            telegram
                .test_connection()
                .await
                .context("Telegram test message failed")?;
            println!("✅ Telegram test message sent");
        }
        None => println!("⚠️  Telegram not configured, skipping"),
    }

    Ok(())
}

async fn show_stats(settings: &Settings, notify: bool) -> Result<()> {
    let postgres = PostgresPersistence::new(&settings.storage)
        .await
        .context("Cannot reach Postgres")?;

    let stats = postgres.statistics().await?;
    println!("\n📊 POC monitor statistics");
    println!("  Symbols tracked:   {}", stats.symbols_tracked);
    println!("  Events today:      {}", stats.events_today);
    println!("  Total events:      {}", stats.total_events);
    println!("  Unnotified events: {}", stats.unnotified_events);

    let events = postgres.recent_events(RECENT_EVENTS).await?;
    if !events.is_empty() {
        println!("\n🕒 Recent crossings");
        for event in &events {
            println!(
                "  {} {:<14} {:<7} {} -> {} (level {}, {}%) {}",
                event.timestamp.format("%Y-%m-%d %H:%M"),
                event.symbol,
                event.level.code(),
                event.previous_price.normalize(),
                event.current_price.normalize(),
                event.level_price.normalize(),
                event.change_percent,
                event.impact
            );
        }
    }

    if notify {
        if let Some(telegram) = TelegramNotifier::new(&settings.telegram) {
            telegram.send_summary(&stats).await?;
        }
    }

    Ok(())
}

async fn show_hot_symbols(settings: &Settings, top: usize, notify: bool) -> Result<()> {
    let (postgres, price_store) = connect_storage(settings).await?;

    let mut entries = Vec::new();
    for levels in postgres.all_poc_levels().await? {
        if let Some(snapshot) = price_store.load_last_price(&levels.symbol).await? {
            entries.push((levels, snapshot.price));
        }
    }

    let hot = rank_hot_symbols(entries, top);
    if hot.is_empty() {
        println!("No symbols with both POC levels and a stored price yet, run calc first");
        return Ok(());
    }

    println!("\n🔥 Closest to a POC level");
    for (i, entry) in hot.iter().enumerate() {
        println!(
            "  {:>2}. {:<14} {:>16} {:<7} {:>16} {:>8}%  above {}/6",
            i + 1,
            entry.symbol,
            entry.price.normalize(),
            entry.nearest.level.code(),
            entry.nearest.price.normalize(),
            entry.nearest.distance_percent.round_dp(2),
            entry.levels_above
        );
    }

    if notify {
        if let Some(telegram) = TelegramNotifier::new(&settings.telegram) {
            telegram.send_hot_symbols(&hot).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_report(report: &CycleReport) {
    println!(
        "\n{} pass: {}/{} symbols ok in {} batches, {} failed, {} cancelled",
        report.mode,
        report.succeeded,
        report.symbols,
        report.batches,
        report.failures.len(),
        report.cancelled
    );

    for (symbol, err) in &report.failures {
        println!("  ❌ {}: {}", symbol, err);
    }

    for event in &report.events {
        println!(
            "  {} {} crossed {} at {} ({}%) impact {}",
            event.impact.emoji(),
            event.symbol,
            event.level,
            event.level_price.normalize(),
            event.change_percent,
            event.impact
        );
    }
}
