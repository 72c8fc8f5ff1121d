use crate::db::{PriceStore, StorageError};
use crate::models::PriceSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};

/// Snapshot as stored in Redis
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    price: Decimal,
    timestamp: DateTime<Utc>,
}

/// Redis persistence for last-seen prices
///
/// One JSON value per symbol under `last_price:{symbol}`
#[derive(Clone)]
pub struct RedisPersistence {
    conn: ConnectionManager,
}

impl RedisPersistence {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `connect_timeout` - How long to wait for the first connection
    pub async fn new(redis_url: &str, connect_timeout: Duration) -> Result<Self, StorageError> {
        let client = Client::open(redis_url)?;

        let conn = timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StorageError::Unavailable(format!(
                    "Redis connection timeout after {} seconds",
                    connect_timeout.as_secs()
                ))
            })??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    fn key(symbol: &str) -> String {
        format!("last_price:{}", symbol)
    }
}

#[async_trait]
impl PriceStore for RedisPersistence {
    async fn load_last_price(&self, symbol: &str) -> Result<Option<PriceSnapshot>, StorageError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(Self::key(symbol)).await?;

        let Some(json) = value else {
            return Ok(None);
        };
        let stored: StoredSnapshot = serde_json::from_str(&json)?;

        Ok(Some(PriceSnapshot {
            symbol: symbol.to_string(),
            price: stored.price,
            timestamp: stored.timestamp,
        }))
    }

    async fn save_last_price(&self, snapshot: &PriceSnapshot) -> Result<(), StorageError> {
        let stored = StoredSnapshot {
            price: snapshot.price,
            timestamp: snapshot.timestamp,
        };
        let value = serde_json::to_string(&stored)?;

        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::key(&snapshot.symbol), value).await?;

        tracing::debug!("Saved last price for {} to Redis", snapshot.symbol);

        Ok(())
    }
}
