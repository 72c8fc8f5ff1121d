pub mod telegram;

pub use telegram::TelegramNotifier;

use crate::models::CrossoverEvent;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Notification API returned an error: {0}")]
    Api(String),
}

/// Delivery of crossover events to a human
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &CrossoverEvent) -> Result<(), NotifyError>;
}

/// Writes events to the log; used when no chat channel is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &CrossoverEvent) -> Result<(), NotifyError> {
        tracing::info!(
            symbol = %event.symbol,
            "{} {} crossed {} at {} ({} -> {}, {}%) impact {}",
            event.impact.emoji(),
            event.symbol,
            event.level,
            event.level_price.normalize(),
            event.previous_price.normalize(),
            event.current_price.normalize(),
            event.change_percent,
            event.impact
        );
        Ok(())
    }
}
