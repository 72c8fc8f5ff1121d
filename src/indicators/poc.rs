use super::periods::{PeriodKind, PeriodWindow};
use super::vwap::calculate_vwap;
use crate::models::{Bar, PocLevel, PocLevelSet};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PocError {
    #[error("No price history")]
    NoHistory,

    #[error("Price history has no traded volume")]
    ZeroVolume,

    #[error("Reference time {0} is outside the supported calendar range")]
    OutOfRange(DateTime<Utc>),
}

/// The six POC windows relative to `now`, in reporting order
fn level_windows(now: DateTime<Utc>) -> Result<[(PocLevel, PeriodWindow); 6], PocError> {
    let out_of_range = || PocError::OutOfRange(now);
    let month = PeriodWindow::containing(PeriodKind::Month, now).ok_or_else(out_of_range)?;
    let quarter = PeriodWindow::containing(PeriodKind::Quarter, now).ok_or_else(out_of_range)?;

    Ok([
        (PocLevel::CurrentMonth, month),
        (PocLevel::PreviousMonth, month.previous(1).ok_or_else(out_of_range)?),
        (PocLevel::PrevPrevMonth, month.previous(2).ok_or_else(out_of_range)?),
        (PocLevel::CurrentQuarter, quarter),
        (PocLevel::PreviousQuarter, quarter.previous(1).ok_or_else(out_of_range)?),
        (PocLevel::PrevPrevQuarter, quarter.previous(2).ok_or_else(out_of_range)?),
    ])
}

/// Earliest bar a calc pass needs: `history_days` back, or the start of the quarter two
/// quarters ago if that is earlier.
pub fn history_start(now: DateTime<Utc>, history_days: i64) -> DateTime<Utc> {
    let by_days = now - Duration::days(history_days.max(0));

    PeriodWindow::containing(PeriodKind::Quarter, now)
        .and_then(|q| q.previous(2))
        .map(|q| q.start.min(by_days))
        .unwrap_or(by_days)
}

/// Compute the six POC levels for one symbol from its daily bars.
///
/// Current windows are running VWAPs over bars opened up to `now`; closed windows use every
/// bar inside them. A window with no traded volume takes the VWAP of the whole history and
/// is listed in `fallback_levels`. Output depends only on `bars` and `now`.
pub fn calculate_poc_levels(
    symbol: &str,
    bars: &[Bar],
    now: DateTime<Utc>,
) -> Result<PocLevelSet, PocError> {
    let history: Vec<&Bar> = bars.iter().filter(|b| b.open_time <= now).collect();
    if history.is_empty() {
        return Err(PocError::NoHistory);
    }

    let global = calculate_vwap(history.iter().copied()).ok_or(PocError::ZeroVolume)?;

    let first_open = history
        .iter()
        .map(|b| b.open_time)
        .min()
        .ok_or(PocError::NoHistory)?;
    let days_active = (now - first_open).num_days();

    let mut levels = PocLevelSet {
        symbol: symbol.to_string(),
        current_month: global,
        previous_month: global,
        prev_prev_month: global,
        current_quarter: global,
        previous_quarter: global,
        prev_prev_quarter: global,
        global,
        fallback_levels: Vec::new(),
        days_active,
        calculated_at: now,
    };

    for (level, window) in level_windows(now)? {
        let in_window = history.iter().copied().filter(|b| window.contains(b.open_time));

        match calculate_vwap(in_window) {
            Some(vwap) => levels.set(level, vwap),
            None => levels.fallback_levels.push(level),
        }
    }

    if !levels.fallback_levels.is_empty() {
        tracing::debug!(
            symbol = %symbol,
            "{} of 6 POC windows empty, using global VWAP {}",
            levels.fallback_levels.len(),
            global
        );
    }

    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn flat_bar(at: DateTime<Utc>, price: Decimal, volume: Decimal) -> Bar {
        Bar {
            open_time: at,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    /// One flat bar per day from `from` (inclusive) to `to` (exclusive)
    fn daily_bars(from: DateTime<Utc>, to: DateTime<Utc>, price: Decimal) -> Vec<Bar> {
        let mut bars = Vec::new();
        let mut at = from;
        while at < to {
            bars.push(flat_bar(at, price, dec!(10)));
            at += Duration::days(1);
        }
        bars
    }

    #[test]
    fn test_levels_use_their_own_windows() {
        let now = utc(2024, 5, 15);
        let mut bars = Vec::new();
        bars.extend(daily_bars(utc(2023, 10, 1), utc(2024, 1, 1), dec!(50))); // Q4 2023
        bars.extend(daily_bars(utc(2024, 1, 1), utc(2024, 3, 1), dec!(60))); // Jan-Feb
        bars.extend(daily_bars(utc(2024, 3, 1), utc(2024, 4, 1), dec!(70))); // Mar
        bars.extend(daily_bars(utc(2024, 4, 1), utc(2024, 5, 1), dec!(80))); // Apr
        bars.extend(daily_bars(utc(2024, 5, 1), utc(2024, 5, 16), dec!(90))); // May to date

        let levels = calculate_poc_levels("BTCUSDT", &bars, now).unwrap();

        assert_eq!(levels.current_month, dec!(90));
        assert_eq!(levels.previous_month, dec!(80));
        assert_eq!(levels.prev_prev_month, dec!(70));
        assert_eq!(levels.prev_prev_quarter, dec!(50));
        // Q1: 60 days of Jan-Feb at 60, 31 days of March at 70
        assert_eq!(
            levels.previous_quarter,
            crate::models::normalize_price(dec!(5770) / dec!(91))
        );
        // Q2 to date: 30 days at 80, 15 days at 90
        assert_eq!(
            levels.current_quarter,
            crate::models::normalize_price(dec!(3750) / dec!(45))
        );
        assert!(levels.fallback_levels.is_empty());
    }

    #[test]
    fn test_current_window_ignores_bars_after_now() {
        let now = utc(2024, 5, 10);
        let mut bars = daily_bars(utc(2024, 5, 1), utc(2024, 5, 11), dec!(100));
        bars.push(flat_bar(utc(2024, 5, 20), dec!(1000), dec!(10)));

        let levels = calculate_poc_levels("ETHUSDT", &bars, now).unwrap();

        assert_eq!(levels.current_month, dec!(100));
    }

    #[test]
    fn test_empty_windows_fall_back_to_global_vwap() {
        // Listed two weeks ago: every previous window is empty
        let now = utc(2024, 5, 15);
        let bars = vec![
            flat_bar(utc(2024, 5, 1), dec!(2), dec!(100)),
            flat_bar(utc(2024, 5, 2), dec!(4), dec!(100)),
        ];

        let levels = calculate_poc_levels("NEWUSDT", &bars, now).unwrap();

        assert_eq!(levels.global, dec!(3));
        for level in [
            PocLevel::PreviousMonth,
            PocLevel::PrevPrevMonth,
            PocLevel::PreviousQuarter,
            PocLevel::PrevPrevQuarter,
        ] {
            assert_eq!(levels.get(level), levels.global);
            assert!(levels.is_fallback(level));
        }
        assert!(!levels.is_fallback(PocLevel::CurrentMonth));
        assert_eq!(levels.days_active, 14);
    }

    #[test]
    fn test_all_levels_populated_for_any_history() {
        let now = utc(2024, 8, 31);
        let bars = vec![flat_bar(utc(2023, 2, 1), dec!(7), dec!(1))];

        let levels = calculate_poc_levels("OLDUSDT", &bars, now).unwrap();

        assert_eq!(levels.iter().count(), 6);
        assert!(levels.iter().all(|(_, price)| price == dec!(7)));
        assert_eq!(levels.fallback_levels.len(), 6);
    }

    #[test]
    fn test_no_history_and_no_volume_are_errors() {
        let now = utc(2024, 5, 15);
        assert_eq!(
            calculate_poc_levels("X", &[], now),
            Err(PocError::NoHistory)
        );

        let dead = vec![flat_bar(utc(2024, 5, 1), dec!(1), dec!(0))];
        assert_eq!(
            calculate_poc_levels("X", &dead, now),
            Err(PocError::ZeroVolume)
        );
    }

    #[test]
    fn test_calculation_is_deterministic() {
        let now = utc(2024, 5, 15);
        let bars = daily_bars(utc(2023, 9, 1), utc(2024, 5, 15), dec!(1.2345));

        let first = calculate_poc_levels("DETUSDT", &bars, now).unwrap();
        let second = calculate_poc_levels("DETUSDT", &bars, now).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_history_start_covers_prev_prev_quarter() {
        // Two quarters before Q2 2024 starts 2023-10-01, later than 365 days back
        assert_eq!(history_start(utc(2024, 5, 15), 365), utc(2023, 5, 16));
        // With a short lookback the quarter boundary wins
        assert_eq!(history_start(utc(2024, 5, 15), 30), utc(2023, 10, 1));
    }
}
