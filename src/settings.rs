use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "poc_monitor";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Root configuration, loaded once at startup and handed to each component
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub exchange: ExchangeSettings,
    pub fetch: FetchSettings,
    pub monitor: MonitorSettings,
    pub storage: StorageSettings,
    pub telegram: TelegramSettings,
}

/// Exchange endpoint and request-weight budget
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Weight ceiling per window as published by the exchange
    pub weight_limit: u32,
    /// Fraction of `weight_limit` we allow ourselves to consume
    pub safety_margin: f64,
    pub weight_window_secs: u64,
    /// Max klines per request
    pub kline_limit: u32,
    pub history_days: i64,
    pub quote_asset: String,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            request_timeout_secs: 30,
            weight_limit: 2400,
            safety_margin: 0.8,
            weight_window_secs: 60,
            kline_limit: 500,
            history_days: 365,
            quote_asset: "USDT".to_string(),
        }
    }
}

impl ExchangeSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn weight_window(&self) -> Duration {
        Duration::from_secs(self.weight_window_secs)
    }
}

/// Batch throttling toward the exchange
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub max_concurrent: usize,
    /// Minimum spacing between two request starts, 0 disables pacing
    pub request_stagger_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter_ms: u64,
    /// Minimum backoff after the exchange bans our IP
    pub ban_backoff_secs: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay_ms: 5000,
            max_concurrent: 5,
            request_stagger_ms: 300,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            retry_max_delay_ms: 30_000,
            retry_jitter_ms: 250,
            ban_backoff_secs: 300,
        }
    }
}

impl FetchSettings {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn request_stagger(&self) -> Duration {
        Duration::from_millis(self.request_stagger_ms)
    }

    pub fn ban_backoff(&self) -> Duration {
        Duration::from_secs(self.ban_backoff_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: u64,
    /// Run a full recompute every N loop ticks (first tick included), 0 = never
    pub recalc_every_cycles: u32,
    pub storage_retries: u32,
    pub storage_retry_delay_ms: u64,
    /// Explicit symbol list; empty means the exchange's full perpetual universe
    pub symbols: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            recalc_every_cycles: 60,
            storage_retries: 3,
            storage_retry_delay_ms: 500,
            symbols: Vec::new(),
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn storage_retry_delay(&self) -> Duration {
        Duration::from_millis(self.storage_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/poc_monitor".to_string(),
            redis_url: None,
            max_connections: 5,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramSettings {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

impl Settings {
    /// Load defaults, then the optional TOML file, then `POC__*` environment overrides.
    ///
    /// Plain `DATABASE_URL`, `REDIS_URL`, `TELEGRAM_BOT_TOKEN` and `TELEGRAM_CHAT_ID`
    /// are used when the prefixed variables leave those fields unset.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let mut settings: Settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("POC")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("monitor.symbols")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.apply_env_fallbacks();
        settings.validate()?;

        Ok(settings)
    }

    fn apply_env_fallbacks(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if self.storage.database_url == StorageSettings::default().database_url {
                self.storage.database_url = url;
            }
        }
        if self.storage.redis_url.is_none() {
            self.storage.redis_url = std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty());
        }
        if self.telegram.bot_token.is_empty() {
            self.telegram.bot_token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        }
        if self.telegram.chat_id.is_empty() {
            self.telegram.chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.fetch.batch_size == 0 {
            return fail("fetch.batch_size must be greater than zero");
        }
        if self.fetch.max_concurrent == 0 {
            return fail("fetch.max_concurrent must be greater than zero");
        }
        if self.exchange.weight_limit == 0 {
            return fail("exchange.weight_limit must be greater than zero");
        }
        if !(self.exchange.safety_margin > 0.0 && self.exchange.safety_margin <= 1.0) {
            return fail("exchange.safety_margin must be in (0, 1]");
        }
        if self.exchange.weight_window_secs == 0 {
            return fail("exchange.weight_window_secs must be greater than zero");
        }
        if self.exchange.kline_limit == 0 || self.exchange.kline_limit > 1500 {
            return fail("exchange.kline_limit must be in 1..=1500");
        }
        if self.monitor.interval_secs == 0 {
            return fail("monitor.interval_secs must be greater than zero");
        }
        if self.storage.database_url.trim().is_empty() {
            return fail("storage.database_url must be set");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_exchange_contract() {
        let settings = Settings::default();

        assert_eq!(settings.fetch.batch_size, 50);
        assert_eq!(settings.fetch.batch_delay(), Duration::from_secs(5));
        assert_eq!(settings.fetch.max_concurrent, 5);
        assert_eq!(settings.fetch.request_stagger(), Duration::from_millis(300));
        assert_eq!(settings.exchange.weight_limit, 2400);
        assert_eq!(settings.exchange.safety_margin, 0.8);
        assert_eq!(settings.monitor.interval(), Duration::from_secs(60));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_batch_size() {
        let mut settings = Settings::default();
        settings.fetch.batch_size = 0;

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_validation_rejects_bad_safety_margin() {
        let mut settings = Settings::default();
        settings.exchange.safety_margin = 1.5;
        assert!(settings.validate().is_err());

        settings.exchange.safety_margin = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = std::env::temp_dir().join(format!("poc-settings-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("custom.toml");
        std::fs::write(
            &path,
            r#"
            [fetch]
            batch_size = 25

            [monitor]
            symbols = ["BTCUSDT", "ETHUSDT"]
            "#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();

        assert_eq!(settings.fetch.batch_size, 25);
        assert_eq!(settings.fetch.max_concurrent, 5);
        assert_eq!(settings.monitor.symbols, vec!["BTCUSDT", "ETHUSDT"]);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_telegram_configured_needs_both_fields() {
        let mut telegram = TelegramSettings::default();
        assert!(!telegram.is_configured());

        telegram.bot_token = "token".to_string();
        assert!(!telegram.is_configured());

        telegram.chat_id = "42".to_string();
        assert!(telegram.is_configured());
    }
}
