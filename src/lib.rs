// Core modules
pub mod api;
pub mod db;
pub mod detection;
pub mod feed;
pub mod indicators;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod persistence;
pub mod settings;

// Re-export commonly used types
pub use api::{BinanceClient, ExchangeError, MarketData, RateBudget};
pub use models::*;
pub use monitor::{CycleMode, MonitorCycle, MonitorLoop};
pub use settings::Settings;
