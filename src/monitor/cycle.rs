use crate::api::{ExchangeError, MarketData};
use crate::db::{PocStore, PriceStore, StorageError};
use crate::detection::build_events;
use crate::feed::{BatchFetcher, FetchError};
use crate::indicators::{calculate_poc_levels, history_start, PocError};
use crate::models::{normalize_price, Bar, CrossoverEvent, PocLevelSet, PriceSnapshot};
use crate::notify::Notifier;
use crate::settings::Settings;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// What a single pass does with POC levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Fetch history, recompute and store levels, then detect
    Calc,
    /// Fetch prices only and detect against stored levels
    Monitor,
}

impl fmt::Display for CycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleMode::Calc => f.write_str("calc"),
            CycleMode::Monitor => f.write_str("monitor"),
        }
    }
}

/// Why one symbol did not complete a pass
#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] ExchangeError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("POC calculation failed: {0}")]
    Poc(#[from] PocError),

    #[error("No stored POC levels, run calc first")]
    MissingLevels,

    #[error("Crossover event {id} could not be persisted: {source}")]
    EventNotPersisted {
        id: Uuid,
        #[source]
        source: StorageError,
    },

    #[error("Cancelled by shutdown")]
    Cancelled,
}

impl From<FetchError> for SymbolError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Exchange(e) => SymbolError::Fetch(e),
            FetchError::Cancelled => SymbolError::Cancelled,
        }
    }
}

/// Failure of the pass as a whole
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("Failed to load symbol universe: {0}")]
    Universe(#[source] ExchangeError),
}

/// Outcome of one pass
#[derive(Debug)]
pub struct CycleReport {
    pub mode: CycleMode,
    pub started_at: DateTime<Utc>,
    pub symbols: usize,
    pub batches: usize,
    pub succeeded: usize,
    pub failures: Vec<(String, SymbolError)>,
    pub events: Vec<CrossoverEvent>,
    pub cancelled: usize,
}

/// What the fetch stage returns per symbol
struct Fetched {
    price: Decimal,
    bars: Option<Vec<Bar>>,
}

/// One fetch → calculate/load → detect → persist pass over all symbols.
///
/// Per-symbol failures are collected in the report and never abort the pass.
pub struct MonitorCycle {
    market: Arc<dyn MarketData>,
    fetcher: BatchFetcher,
    poc_store: Arc<dyn PocStore>,
    price_store: Arc<dyn PriceStore>,
    notifier: Arc<dyn Notifier>,
    symbols: Vec<String>,
    history_days: i64,
    storage_retries: u32,
    storage_retry_delay: Duration,
}

impl MonitorCycle {
    pub fn new(
        settings: &Settings,
        market: Arc<dyn MarketData>,
        fetcher: BatchFetcher,
        poc_store: Arc<dyn PocStore>,
        price_store: Arc<dyn PriceStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            market,
            fetcher,
            poc_store,
            price_store,
            notifier,
            symbols: settings.monitor.symbols.clone(),
            history_days: settings.exchange.history_days,
            storage_retries: settings.monitor.storage_retries,
            storage_retry_delay: settings.monitor.storage_retry_delay(),
        }
    }

    /// Configured symbols, or the exchange's tradable universe when none are configured
    pub async fn resolve_symbols(&self) -> Result<Vec<String>, CycleError> {
        if !self.symbols.is_empty() {
            return Ok(self.symbols.clone());
        }

        self.fetcher.budget().acquire(1).await;
        self.market.list_symbols().await.map_err(CycleError::Universe)
    }

    pub async fn run(
        &self,
        mode: CycleMode,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        let symbols = self.resolve_symbols().await?;

        tracing::info!("Starting {} pass over {} symbols", mode, symbols.len());

        let fetch = self.fetch_all(mode, &symbols, started_at, shutdown).await;

        let mut report = CycleReport {
            mode,
            started_at,
            symbols: symbols.len(),
            batches: fetch.batches,
            succeeded: 0,
            failures: Vec::new(),
            events: Vec::new(),
            cancelled: 0,
        };

        for (symbol, fetched) in fetch.results {
            let outcome = match fetched {
                Ok(fetched) => self.process_symbol(&symbol, fetched, started_at).await,
                Err(err) => Err(SymbolError::from(err)),
            };

            match outcome {
                Ok(events) => {
                    report.succeeded += 1;
                    report.events.extend(events);
                }
                Err(SymbolError::Cancelled) => report.cancelled += 1,
                Err(err) => {
                    tracing::warn!(symbol = %symbol, "Skipped this pass: {}", err);
                    report.failures.push((symbol, err));
                }
            }
        }

        tracing::info!(
            "{} pass done: {}/{} symbols ok, {} failed, {} cancelled, {} crossings, {} batches",
            mode,
            report.succeeded,
            report.symbols,
            report.failures.len(),
            report.cancelled,
            report.events.len(),
            report.batches
        );

        Ok(report)
    }

    async fn fetch_all(
        &self,
        mode: CycleMode,
        symbols: &[String],
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> crate::feed::FetchReport<Fetched> {
        let market = &self.market;

        match mode {
            CycleMode::Monitor => {
                self.fetcher
                    .fetch(symbols, market.price_weight(), shutdown, |symbol| async move {
                        let price = market.get_latest_price(&symbol).await?;
                        Ok(Fetched { price, bars: None })
                    })
                    .await
            }
            CycleMode::Calc => {
                let since = history_start(now, self.history_days);
                let cost = market.price_weight() + market.bars_weight();

                self.fetcher
                    .fetch(symbols, cost, shutdown, |symbol| async move {
                        let price = market.get_latest_price(&symbol).await?;
                        let bars = market.get_daily_bars(&symbol, since).await?;
                        Ok(Fetched {
                            price,
                            bars: Some(bars),
                        })
                    })
                    .await
            }
        }
    }

    async fn process_symbol(
        &self,
        symbol: &str,
        fetched: Fetched,
        now: DateTime<Utc>,
    ) -> Result<Vec<CrossoverEvent>, SymbolError> {
        let levels = match fetched.bars {
            Some(bars) => {
                let levels = calculate_poc_levels(symbol, &bars, now)?;
                self.with_storage_retry(symbol, || self.poc_store.save_poc_levels(&levels))
                    .await?;
                levels
            }
            None => self
                .with_storage_retry(symbol, || self.poc_store.load_poc_levels(symbol))
                .await?
                .ok_or(SymbolError::MissingLevels)?,
        };

        let snapshot = PriceSnapshot {
            symbol: symbol.to_string(),
            price: normalize_price(fetched.price),
            timestamp: Utc::now(),
        };

        let previous = self
            .with_storage_retry(symbol, || self.price_store.load_last_price(symbol))
            .await?;

        let events = match previous {
            Some(previous) => self.detect_and_persist(&levels, &previous, &snapshot).await?,
            None => {
                tracing::debug!(symbol = %symbol, "First observation at {}", snapshot.price);
                Vec::new()
            }
        };

        self.with_storage_retry(symbol, || self.price_store.save_last_price(&snapshot))
            .await?;

        for event in &events {
            self.deliver(event).await;
        }

        Ok(events)
    }

    /// Detect crossings and append them. The snapshot is only advanced by the caller once
    /// every event is stored, so an unpersisted crossing is detected again next pass.
    async fn detect_and_persist(
        &self,
        levels: &PocLevelSet,
        previous: &PriceSnapshot,
        current: &PriceSnapshot,
    ) -> Result<Vec<CrossoverEvent>, SymbolError> {
        let events = build_events(levels, previous, current);

        for event in &events {
            tracing::info!(
                symbol = %event.symbol,
                "{} crossed {} at {} ({} -> {}), impact {}",
                event.symbol,
                event.level,
                event.level_price,
                event.previous_price,
                event.current_price,
                event.impact
            );

            self.with_storage_retry(&event.symbol, || self.poc_store.append_crossover_event(event))
                .await
                .map_err(|source| SymbolError::EventNotPersisted {
                    id: event.id,
                    source,
                })?;
        }

        Ok(events)
    }

    /// Notify and mark delivered. Failures are logged; the stored event stays.
    async fn deliver(&self, event: &CrossoverEvent) {
        if let Err(e) = self.notifier.notify(event).await {
            tracing::warn!(symbol = %event.symbol, "Failed to notify crossover {}: {}", event.id, e);
            return;
        }

        if let Err(e) = self.poc_store.mark_event_notified(event.id).await {
            tracing::warn!(symbol = %event.symbol, "Failed to mark {} notified: {}", event.id, e);
        }
    }

    /// Retry transient storage failures with doubling delay
    async fn with_storage_retry<T, F, Fut>(&self, symbol: &str, op: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.storage_retries => {
                    let delay = self.storage_retry_delay.saturating_mul(2u32.saturating_pow(attempt));
                    tracing::warn!(
                        symbol = %symbol,
                        "Storage attempt {} failed ({}), retrying in {}ms",
                        attempt + 1,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
