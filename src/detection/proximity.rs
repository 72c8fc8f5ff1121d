use crate::models::{PocLevel, PocLevelSet};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearestLevel {
    pub level: PocLevel,
    pub price: Decimal,
    /// |price - level| / level * 100
    pub distance_percent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HotSymbol {
    pub symbol: String,
    pub price: Decimal,
    pub nearest: NearestLevel,
    /// How many of the six levels the price is already above
    pub levels_above: usize,
}

/// Level closest to `price` in absolute terms; ties go to the earlier level
pub fn nearest_level(levels: &PocLevelSet, price: Decimal) -> Option<NearestLevel> {
    let (level, level_price) = levels
        .iter()
        .filter(|(_, p)| *p > Decimal::ZERO)
        .fold(None::<(PocLevel, Decimal)>, |best, candidate| match best {
            Some(b) if (price - b.1).abs() <= (price - candidate.1).abs() => Some(b),
            _ => Some(candidate),
        })?;

    let distance_percent = ((price - level_price).abs() / level_price * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero);

    Some(NearestLevel {
        level,
        price: level_price,
        distance_percent,
    })
}

pub fn levels_above(levels: &PocLevelSet, price: Decimal) -> usize {
    levels.iter().filter(|(_, p)| price > *p).count()
}

/// Symbols sorted by distance to their nearest level, closest first, at most `top`
pub fn rank_hot_symbols<I>(entries: I, top: usize) -> Vec<HotSymbol>
where
    I: IntoIterator<Item = (PocLevelSet, Decimal)>,
{
    let mut hot: Vec<HotSymbol> = entries
        .into_iter()
        .filter_map(|(levels, price)| {
            let nearest = nearest_level(&levels, price)?;
            Some(HotSymbol {
                levels_above: levels_above(&levels, price),
                symbol: levels.symbol,
                price,
                nearest,
            })
        })
        .collect();

    hot.sort_by(|a, b| {
        a.nearest
            .distance_percent
            .cmp(&b.nearest.distance_percent)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    hot.truncate(top);
    hot
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn levels(symbol: &str, prices: [Decimal; 6]) -> PocLevelSet {
        PocLevelSet {
            symbol: symbol.to_string(),
            current_month: prices[0],
            previous_month: prices[1],
            prev_prev_month: prices[2],
            current_quarter: prices[3],
            previous_quarter: prices[4],
            prev_prev_quarter: prices[5],
            global: prices[0],
            fallback_levels: Vec::new(),
            days_active: 400,
            calculated_at: Utc::now(),
        }
    }

    #[test]
    fn test_nearest_level_and_distance() {
        let set = levels("AUSDT", [dec!(100), dec!(95), dec!(90), dec!(110), dec!(105), dec!(80)]);

        let nearest = nearest_level(&set, dec!(104)).unwrap();

        assert_eq!(nearest.level, PocLevel::PreviousQuarter);
        assert_eq!(nearest.price, dec!(105));
        assert_eq!(nearest.distance_percent, dec!(0.9524));
    }

    #[test]
    fn test_tie_goes_to_reporting_order() {
        let set = levels("AUSDT", [dec!(90), dec!(110), dec!(1), dec!(1), dec!(1), dec!(1)]);
        assert_eq!(nearest_level(&set, dec!(100)).unwrap().level, PocLevel::CurrentMonth);
    }

    #[test]
    fn test_levels_above_counts_strictly() {
        let set = levels("AUSDT", [dec!(100), dec!(95), dec!(90), dec!(110), dec!(105), dec!(100)]);

        assert_eq!(levels_above(&set, dec!(100)), 2);
        assert_eq!(levels_above(&set, dec!(101)), 4);
    }

    #[test]
    fn test_hot_ranking_sorts_by_distance() {
        let entries = vec![
            (levels("FARUSDT", [dec!(100); 6]), dec!(150)),
            (levels("NEARUSDT", [dec!(100); 6]), dec!(101)),
            (levels("MIDUSDT", [dec!(100); 6]), dec!(110)),
        ];

        let hot = rank_hot_symbols(entries, 2);

        let names: Vec<&str> = hot.iter().map(|h| h.symbol.as_str()).collect();
        assert_eq!(names, vec!["NEARUSDT", "MIDUSDT"]);
        assert_eq!(hot[0].levels_above, 6);
    }
}
