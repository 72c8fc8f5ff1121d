use chrono::{DateTime, Datelike, NaiveDate, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodKind {
    Month,
    Quarter,
}

/// Half-open calendar window [start, end) aligned to a month or quarter boundary.
///
/// `index` counts periods since year 0: `year * 12 + (month - 1)` for months and
/// `year * 4 + (quarter - 1)` for quarters, so stepping back is plain subtraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWindow {
    pub kind: PeriodKind,
    pub index: i32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodWindow {
    pub fn from_index(kind: PeriodKind, index: i32) -> Option<Self> {
        let months = match kind {
            PeriodKind::Month => 1,
            PeriodKind::Quarter => 3,
        };
        let first_month = index * months;

        Some(Self {
            kind,
            index,
            start: month_start(first_month)?,
            end: month_start(first_month + months)?,
        })
    }

    /// The window of `kind` that contains `at`
    pub fn containing(kind: PeriodKind, at: DateTime<Utc>) -> Option<Self> {
        let month0 = at.month0() as i32;
        let index = match kind {
            PeriodKind::Month => at.year() * 12 + month0,
            PeriodKind::Quarter => at.year() * 4 + month0 / 3,
        };
        Self::from_index(kind, index)
    }

    /// The window `n` periods before this one
    pub fn previous(&self, n: i32) -> Option<Self> {
        Self::from_index(self.kind, self.index - n)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Midnight UTC on the first day of the month with absolute index `year * 12 + month0`
fn month_start(month_index: i32) -> Option<DateTime<Utc>> {
    let year = month_index.div_euclid(12);
    let month = month_index.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_month_window_bounds() {
        let window = PeriodWindow::containing(PeriodKind::Month, utc(2024, 2, 15)).unwrap();

        assert_eq!(window.start, utc(2024, 2, 1));
        assert_eq!(window.end, utc(2024, 3, 1));
        assert!(window.contains(utc(2024, 2, 29)));
        assert!(!window.contains(utc(2024, 3, 1)));
    }

    #[test]
    fn test_previous_months_cross_year_boundary() {
        let january = PeriodWindow::containing(PeriodKind::Month, utc(2024, 1, 10)).unwrap();

        let december = january.previous(1).unwrap();
        assert_eq!(december.start, utc(2023, 12, 1));
        assert_eq!(december.end, utc(2024, 1, 1));

        let november = january.previous(2).unwrap();
        assert_eq!(november.start, utc(2023, 11, 1));
    }

    #[test]
    fn test_quarter_windows() {
        let q2 = PeriodWindow::containing(PeriodKind::Quarter, utc(2024, 5, 20)).unwrap();
        assert_eq!(q2.start, utc(2024, 4, 1));
        assert_eq!(q2.end, utc(2024, 7, 1));

        let q4_prev_year = q2.previous(2).unwrap();
        assert_eq!(q4_prev_year.start, utc(2023, 10, 1));
        assert_eq!(q4_prev_year.end, utc(2024, 1, 1));
    }
}
