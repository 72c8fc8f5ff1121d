use crate::models::{normalize_price, Bar};
use rust_decimal::Decimal;

/// Volume-weighted average of the bars' typical prices.
///
/// Computed as `Σ((h + l + c) · v) / (3 · Σv)` so the division happens once, then rounded
/// to the price scale. Zero-volume bars are skipped; `None` when no volume remains.
pub fn calculate_vwap<'a, I>(bars: I) -> Option<Decimal>
where
    I: IntoIterator<Item = &'a Bar>,
{
    let mut weighted = Decimal::ZERO;
    let mut volume = Decimal::ZERO;

    for bar in bars {
        if bar.volume <= Decimal::ZERO {
            continue;
        }
        weighted += (bar.high + bar.low + bar.close) * bar.volume;
        volume += bar.volume;
    }

    if volume.is_zero() {
        return None;
    }

    Some(normalize_price(weighted / (volume * Decimal::from(3))))
}
