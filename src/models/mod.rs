use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Decimal places kept for prices, levels and VWAPs.
pub const PRICE_SCALE: u32 = 8;

/// Round a price to the fixed comparison scale.
pub fn normalize_price(price: Decimal) -> Decimal {
    price.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// One daily OHLCV sample for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// The six tracked point-of-control levels, in reporting order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PocLevel {
    CurrentMonth,
    PreviousMonth,
    PrevPrevMonth,
    CurrentQuarter,
    PreviousQuarter,
    PrevPrevQuarter,
}

impl PocLevel {
    pub const ALL: [PocLevel; 6] = [
        PocLevel::CurrentMonth,
        PocLevel::PreviousMonth,
        PocLevel::PrevPrevMonth,
        PocLevel::CurrentQuarter,
        PocLevel::PreviousQuarter,
        PocLevel::PrevPrevQuarter,
    ];

    /// Short code used in storage and messages
    pub fn code(&self) -> &'static str {
        match self {
            PocLevel::CurrentMonth => "MPOC",
            PocLevel::PreviousMonth => "PMPOC",
            PocLevel::PrevPrevMonth => "PPMPOC",
            PocLevel::CurrentQuarter => "QPOC",
            PocLevel::PreviousQuarter => "PQPOC",
            PocLevel::PrevPrevQuarter => "PPQPOC",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PocLevel::CurrentMonth => "current month",
            PocLevel::PreviousMonth => "previous month",
            PocLevel::PrevPrevMonth => "two months back",
            PocLevel::CurrentQuarter => "current quarter",
            PocLevel::PreviousQuarter => "previous quarter",
            PocLevel::PrevPrevQuarter => "two quarters back",
        }
    }
}

impl fmt::Display for PocLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for PocLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PocLevel::ALL
            .into_iter()
            .find(|level| level.code().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown POC level: {}", s))
    }
}

/// The six POC levels for one symbol, recomputed wholesale on every calc pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PocLevelSet {
    pub symbol: String,
    pub current_month: Decimal,
    pub previous_month: Decimal,
    pub prev_prev_month: Decimal,
    pub current_quarter: Decimal,
    pub previous_quarter: Decimal,
    pub prev_prev_quarter: Decimal,
    /// VWAP over the whole fetched history, substituted for empty windows
    pub global: Decimal,
    /// Levels that were filled from `global` because their window had no bars
    pub fallback_levels: Vec<PocLevel>,
    /// Days since the first available bar
    pub days_active: i64,
    pub calculated_at: DateTime<Utc>,
}

impl PocLevelSet {
    pub fn get(&self, level: PocLevel) -> Decimal {
        match level {
            PocLevel::CurrentMonth => self.current_month,
            PocLevel::PreviousMonth => self.previous_month,
            PocLevel::PrevPrevMonth => self.prev_prev_month,
            PocLevel::CurrentQuarter => self.current_quarter,
            PocLevel::PreviousQuarter => self.previous_quarter,
            PocLevel::PrevPrevQuarter => self.prev_prev_quarter,
        }
    }

    pub fn set(&mut self, level: PocLevel, value: Decimal) {
        let slot = match level {
            PocLevel::CurrentMonth => &mut self.current_month,
            PocLevel::PreviousMonth => &mut self.previous_month,
            PocLevel::PrevPrevMonth => &mut self.prev_prev_month,
            PocLevel::CurrentQuarter => &mut self.current_quarter,
            PocLevel::PreviousQuarter => &mut self.previous_quarter,
            PocLevel::PrevPrevQuarter => &mut self.prev_prev_quarter,
        };
        *slot = value;
    }

    /// Levels paired with their prices, in reporting order
    pub fn iter(&self) -> impl Iterator<Item = (PocLevel, Decimal)> + '_ {
        PocLevel::ALL.into_iter().map(move |level| (level, self.get(level)))
    }

    pub fn is_fallback(&self, level: PocLevel) -> bool {
        self.fallback_levels.contains(&level)
    }
}

/// Last observed price for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Crossing direction. Only upward penetration produces events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
        }
    }
}

/// Number of levels crossed by a single observation, 1 to 6
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImpactLevel(u8);

impl ImpactLevel {
    pub const MAX: u8 = 6;

    /// `None` for zero crossings, otherwise the count clamped to 1..=6
    pub fn from_count(count: usize) -> Option<Self> {
        if count == 0 {
            return None;
        }
        Some(Self(count.min(Self::MAX as usize) as u8))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn emoji(&self) -> &'static str {
        match self.0 {
            6 => "🚀🚀🚀",
            5 => "🚀🚀",
            4 => "🚀",
            3 => "⚡",
            2 => "📈",
            _ => "➡️",
        }
    }

    pub fn label(&self) -> &'static str {
        match self.0 {
            6 => "Extreme impact",
            5 => "Strong impact",
            4 => "Significant impact",
            3 => "Moderate impact",
            2 => "Mild impact",
            _ => "Weak impact",
        }
    }
}

impl fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, Self::MAX)
    }
}

/// A detected crossing of one POC level. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossoverEvent {
    pub id: Uuid,
    pub symbol: String,
    pub level: PocLevel,
    pub level_price: Decimal,
    pub previous_price: Decimal,
    pub current_price: Decimal,
    pub change_percent: Decimal,
    pub direction: Direction,
    pub impact: ImpactLevel,
    pub timestamp: DateTime<Utc>,
}
