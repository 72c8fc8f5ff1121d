use super::{Notifier, NotifyError};
use crate::db::StorageStats;
use crate::detection::HotSymbol;
use crate::models::CrossoverEvent;
use crate::settings::TelegramSettings;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// The JSON payload for the Telegram `sendMessage` endpoint.
#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

/// Sends HTML-formatted messages through the Telegram Bot API.
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// Returns `None` if the token or chat id is missing, so callers can fall back to
    /// log-only notifications.
    pub fn new(settings: &TelegramSettings) -> Option<Self> {
        Self::with_api_base(settings, TELEGRAM_API)
    }

    pub fn with_api_base(settings: &TelegramSettings, api_base: &str) -> Option<Self> {
        if !settings.is_configured() {
            tracing::warn!("Telegram notifier is not configured (missing bot_token or chat_id)");
            return None;
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .ok()?;

        Some(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: settings.bot_token.clone(),
            chat_id: settings.chat_id.clone(),
        })
    }

    pub async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let payload = SendMessagePayload {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
        };

        let response = self.client.post(&url).json(&payload).send().await?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to decode error response".to_string());
            return Err(NotifyError::Api(error_text));
        }

        Ok(())
    }

    pub async fn test_connection(&self) -> Result<(), NotifyError> {
        self.send_message("🤖 POC monitor test message").await?;
        tracing::info!("Telegram connection OK");
        Ok(())
    }

    pub async fn send_summary(&self, stats: &StorageStats) -> Result<(), NotifyError> {
        self.send_message(&format_summary(stats)).await
    }

    pub async fn send_hot_symbols(&self, hot: &[HotSymbol]) -> Result<(), NotifyError> {
        if hot.is_empty() {
            return Ok(());
        }
        self.send_message(&format_hot_symbols(hot)).await
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: &CrossoverEvent) -> Result<(), NotifyError> {
        self.send_message(&format_crossover(event)).await
    }
}

// ============== Message Formatting ==============

pub fn format_crossover(event: &CrossoverEvent) -> String {
    format!(
        "{emoji} <b>POC breakout</b>\n\n\
         <b>Symbol:</b> {symbol}\n\
         <b>Price:</b> ${price}\n\
         <b>Level:</b> {level} ({description})\n\
         <b>Level price:</b> ${level_price}\n\
         <b>Change:</b> {change}%\n\
         <b>Time:</b> {time}\n\n\
         <b>Impact:</b> {impact} {label}",
        emoji = event.impact.emoji(),
        symbol = escape_html(&event.symbol),
        price = event.current_price.normalize(),
        level = event.level,
        description = event.level.description(),
        level_price = event.level_price.normalize(),
        change = signed(event.change_percent.round_dp(2)),
        time = event.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        impact = event.impact,
        label = event.impact.label(),
    )
}

pub fn format_summary(stats: &StorageStats) -> String {
    format!(
        "📊 <b>POC monitor summary</b>\n\n\
         <b>Symbols tracked:</b> {}\n\
         <b>Events today:</b> {}\n\
         <b>Total events:</b> {}\n\
         <b>Unnotified events:</b> {}",
        stats.symbols_tracked, stats.events_today, stats.total_events, stats.unnotified_events
    )
}

pub fn format_hot_symbols(hot: &[HotSymbol]) -> String {
    let mut message = String::from("🔥 <b>Closest to a POC level</b>\n\n");

    for (i, entry) in hot.iter().enumerate() {
        message.push_str(&format!(
            "{}. <b>{}</b>\n   Price: ${}\n   Nearest: {} ${}\n   Distance: {}%\n\n",
            i + 1,
            escape_html(&entry.symbol),
            entry.price.normalize(),
            entry.nearest.level,
            entry.nearest.price.normalize(),
            entry.nearest.distance_percent.round_dp(2),
        ));
    }

    message
}

fn signed(value: Decimal) -> String {
    if value.is_sign_negative() && !value.is_zero() {
        value.to_string()
    } else {
        format!("+{}", value)
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
