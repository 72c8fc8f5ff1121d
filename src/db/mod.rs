pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PostgresPersistence, StorageStats};

use crate::models::{CrossoverEvent, PocLevelSet, PriceSnapshot};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Whether the same write may succeed if retried shortly
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_)
            ),
            StorageError::Redis(err) => {
                err.is_io_error()
                    || err.is_timeout()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
            }
            StorageError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// POC levels and the crossover event log
#[async_trait]
pub trait PocStore: Send + Sync {
    async fn load_poc_levels(&self, symbol: &str) -> Result<Option<PocLevelSet>, StorageError>;

    /// Replace the stored set for `levels.symbol`
    async fn save_poc_levels(&self, levels: &PocLevelSet) -> Result<(), StorageError>;

    /// Append an event. Appending an id that is already stored is a no-op.
    async fn append_crossover_event(&self, event: &CrossoverEvent) -> Result<(), StorageError>;

    async fn mark_event_notified(&self, id: Uuid) -> Result<(), StorageError>;
}

/// Last observed price per symbol
#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn load_last_price(&self, symbol: &str) -> Result<Option<PriceSnapshot>, StorageError>;

    /// Overwrite the snapshot for `snapshot.symbol`
    async fn save_last_price(&self, snapshot: &PriceSnapshot) -> Result<(), StorageError>;
}
