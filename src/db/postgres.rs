use super::{PocStore, PriceStore, StorageError};
use crate::models::{CrossoverEvent, Direction, ImpactLevel, PocLevel, PocLevelSet, PriceSnapshot};
use crate::settings::StorageSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// Postgres persistence for POC levels, price snapshots and crossover events
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

/// Counters shown by the `stats` command
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub symbols_tracked: i64,
    pub total_events: i64,
    pub events_today: i64,
    pub unnotified_events: i64,
}

impl PostgresPersistence {
    /// Connect to Postgres and run pending migrations
    pub async fn new(settings: &StorageSettings) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .connect(&settings.database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    /// Aggregate counts over the stored state
    pub async fn statistics(&self) -> Result<StorageStats, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM poc_levels) AS symbols_tracked,
                (SELECT COUNT(*) FROM crossover_events) AS total_events,
                (SELECT COUNT(*) FROM crossover_events
                    WHERE detected_at >= date_trunc('day', NOW() AT TIME ZONE 'UTC') AT TIME ZONE 'UTC')
                    AS events_today,
                (SELECT COUNT(*) FROM crossover_events WHERE NOT notified) AS unnotified_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageStats {
            symbols_tracked: row.get("symbols_tracked"),
            total_events: row.get("total_events"),
            events_today: row.get("events_today"),
            unnotified_events: row.get("unnotified_events"),
        })
    }

    /// Most recent events, newest first
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<CrossoverEvent>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, level, level_price, previous_price, current_price,
                   change_percent, direction, impact, detected_at
            FROM crossover_events
            ORDER BY detected_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    /// Every stored level set, ordered by symbol
    pub async fn all_poc_levels(&self) -> Result<Vec<PocLevelSet>, StorageError> {
        let rows = sqlx::query(&format!("{} ORDER BY symbol", SELECT_POC_LEVELS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(levels_from_row).collect()
    }

    /// Delete all rows
    #[cfg(test)]
    pub async fn clear_all(&self) -> Result<(), StorageError> {
        sqlx::query("TRUNCATE crossover_events, price_snapshots, poc_levels")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const SELECT_POC_LEVELS: &str = r#"
    SELECT symbol, current_month, previous_month, prev_prev_month,
           current_quarter, previous_quarter, prev_prev_quarter,
           global_poc, fallback_levels, days_active, calculated_at
    FROM poc_levels
"#;

#[async_trait]
impl PocStore for PostgresPersistence {
    async fn load_poc_levels(&self, symbol: &str) -> Result<Option<PocLevelSet>, StorageError> {
        let row = sqlx::query(&format!("{} WHERE symbol = $1", SELECT_POC_LEVELS))
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(levels_from_row).transpose()
    }

    async fn save_poc_levels(&self, levels: &PocLevelSet) -> Result<(), StorageError> {
        let fallback: Vec<String> = levels
            .fallback_levels
            .iter()
            .map(|l| l.code().to_string())
            .collect();

        sqlx::query(
            r#"
            INSERT INTO poc_levels (
                symbol, current_month, previous_month, prev_prev_month,
                current_quarter, previous_quarter, prev_prev_quarter,
                global_poc, fallback_levels, days_active, calculated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (symbol) DO UPDATE SET
                current_month = EXCLUDED.current_month,
                previous_month = EXCLUDED.previous_month,
                prev_prev_month = EXCLUDED.prev_prev_month,
                current_quarter = EXCLUDED.current_quarter,
                previous_quarter = EXCLUDED.previous_quarter,
                prev_prev_quarter = EXCLUDED.prev_prev_quarter,
                global_poc = EXCLUDED.global_poc,
                fallback_levels = EXCLUDED.fallback_levels,
                days_active = EXCLUDED.days_active,
                calculated_at = EXCLUDED.calculated_at,
                updated_at = NOW()
            "#,
        )
        .bind(&levels.symbol)
        .bind(levels.current_month)
        .bind(levels.previous_month)
        .bind(levels.prev_prev_month)
        .bind(levels.current_quarter)
        .bind(levels.previous_quarter)
        .bind(levels.prev_prev_quarter)
        .bind(levels.global)
        .bind(&fallback)
        .bind(levels.days_active)
        .bind(levels.calculated_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved POC levels for {} to Postgres", levels.symbol);

        Ok(())
    }

    async fn append_crossover_event(&self, event: &CrossoverEvent) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO crossover_events (
                id, symbol, level, level_price, previous_price, current_price,
                change_percent, direction, impact, detected_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.symbol)
        .bind(event.level.code())
        .bind(event.level_price)
        .bind(event.previous_price)
        .bind(event.current_price)
        .bind(event.change_percent)
        .bind(event.direction.as_str())
        .bind(event.impact.value() as i16)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_event_notified(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query("UPDATE crossover_events SET notified = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PriceStore for PostgresPersistence {
    async fn load_last_price(&self, symbol: &str) -> Result<Option<PriceSnapshot>, StorageError> {
        let row = sqlx::query("SELECT symbol, price, observed_at FROM price_snapshots WHERE symbol = $1")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(snapshot_from_row))
    }

    async fn save_last_price(&self, snapshot: &PriceSnapshot) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO price_snapshots (symbol, price, observed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (symbol) DO UPDATE SET
                price = EXCLUDED.price,
                observed_at = EXCLUDED.observed_at
            "#,
        )
        .bind(&snapshot.symbol)
        .bind(snapshot.price)
        .bind(snapshot.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ============== Row Mapping ==============

fn levels_from_row(row: &PgRow) -> Result<PocLevelSet, StorageError> {
    let symbol: String = row.get("symbol");
    let fallback_codes: Vec<String> = row.get("fallback_levels");

    let fallback_levels = fallback_codes
        .iter()
        .map(|code| {
            code.parse::<PocLevel>()
                .map_err(|e| StorageError::Corrupt(format!("{}: {}", symbol, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PocLevelSet {
        current_month: row.get("current_month"),
        previous_month: row.get("previous_month"),
        prev_prev_month: row.get("prev_prev_month"),
        current_quarter: row.get("current_quarter"),
        previous_quarter: row.get("previous_quarter"),
        prev_prev_quarter: row.get("prev_prev_quarter"),
        global: row.get("global_poc"),
        fallback_levels,
        days_active: row.get("days_active"),
        calculated_at: row.get("calculated_at"),
        symbol,
    })
}

fn snapshot_from_row(row: &PgRow) -> PriceSnapshot {
    PriceSnapshot {
        symbol: row.get("symbol"),
        price: row.get("price"),
        timestamp: row.get("observed_at"),
    }
}

fn event_from_row(row: &PgRow) -> Result<CrossoverEvent, StorageError> {
    let id: Uuid = row.get("id");
    let level_code: String = row.get("level");
    let direction: String = row.get("direction");
    let impact: i16 = row.get("impact");

    let level = level_code
        .parse::<PocLevel>()
        .map_err(|e| StorageError::Corrupt(format!("event {}: {}", id, e)))?;
    if direction != Direction::Up.as_str() {
        return Err(StorageError::Corrupt(format!("event {}: direction {}", id, direction)));
    }
    let impact = u8::try_from(impact)
        .ok()
        .and_then(|n| ImpactLevel::from_count(n as usize))
        .ok_or_else(|| StorageError::Corrupt(format!("event {}: impact {}", id, impact)))?;

    let level_price: Decimal = row.get("level_price");
    let detected_at: DateTime<Utc> = row.get("detected_at");

    Ok(CrossoverEvent {
        id,
        symbol: row.get("symbol"),
        level,
        level_price,
        previous_price: row.get("previous_price"),
        current_price: row.get("current_price"),
        change_percent: row.get("change_percent"),
        direction: Direction::Up,
        impact,
        timestamp: detected_at,
    })
}
