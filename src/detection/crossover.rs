use crate::models::{
    normalize_price, CrossoverEvent, Direction, ImpactLevel, PocLevel, PocLevelSet, PriceSnapshot,
};
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

const CHANGE_PERCENT_SCALE: u32 = 4;

/// Namespace for crossover event ids
const EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_52a4_0d3e_4b8a_9c27_e5f0_b1d4_a863);

/// Levels crossed upward between two observations, in reporting order.
///
/// A level counts iff `previous < level <= current`. Downward moves never match, and an
/// unchanged price can never match, so re-running with the same reading is a no-op.
pub fn detect_crossings(previous: Decimal, current: Decimal, levels: &PocLevelSet) -> Vec<PocLevel> {
    let previous = normalize_price(previous);
    let current = normalize_price(current);

    levels
        .iter()
        .filter(|(_, level_price)| {
            let level_price = normalize_price(*level_price);
            previous < level_price && level_price <= current
        })
        .map(|(level, _)| level)
        .collect()
}

/// (current - previous) / previous * 100, to 4 decimal places. Zero when `previous` is zero.
pub fn change_percent(previous: Decimal, current: Decimal) -> Decimal {
    if previous.is_zero() {
        return Decimal::ZERO;
    }
    ((current - previous) / previous * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(CHANGE_PERCENT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Stable id for crossing `level` away from the `previous` observation.
///
/// A pass that fails before advancing the snapshot re-detects the same crossing from the
/// same previous observation, so it derives the same id and the append stays idempotent.
pub fn event_id(symbol: &str, level: PocLevel, previous: &PriceSnapshot) -> Uuid {
    let name = format!(
        "{}|{}|{}|{}",
        symbol,
        level.code(),
        normalize_price(previous.price).normalize(),
        previous.timestamp.timestamp_millis()
    );
    Uuid::new_v5(&EVENT_NAMESPACE, name.as_bytes())
}

/// One event per crossed level, all sharing the impact of the whole move
pub fn build_events(
    levels: &PocLevelSet,
    previous: &PriceSnapshot,
    current: &PriceSnapshot,
) -> Vec<CrossoverEvent> {
    let crossed = detect_crossings(previous.price, current.price, levels);
    let Some(impact) = ImpactLevel::from_count(crossed.len()) else {
        return Vec::new();
    };

    let change = change_percent(previous.price, current.price);

    crossed
        .into_iter()
        .map(|level| CrossoverEvent {
            id: event_id(&current.symbol, level, previous),
            symbol: current.symbol.clone(),
            level,
            level_price: normalize_price(levels.get(level)),
            previous_price: normalize_price(previous.price),
            current_price: normalize_price(current.price),
            change_percent: change,
            direction: Direction::Up,
            impact,
            timestamp: current.timestamp,
        })
        .collect()
}
