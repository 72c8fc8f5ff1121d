pub mod binance;
pub mod error;
pub mod rate_budget;

pub use binance::BinanceClient;
pub use error::ExchangeError;
pub use rate_budget::RateBudget;

use crate::models::Bar;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Market data the monitor consumes from the exchange
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Daily bars with open time at or after `since`, oldest first
    async fn get_daily_bars(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Bar>, ExchangeError>;

    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Tradable symbols to monitor when no explicit list is configured
    async fn list_symbols(&self) -> Result<Vec<String>, ExchangeError>;

    /// Estimated request weight of one `get_daily_bars` call
    fn bars_weight(&self) -> u32 {
        2
    }

    /// Estimated request weight of one `get_latest_price` call
    fn price_weight(&self) -> u32 {
        1
    }
}
