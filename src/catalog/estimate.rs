use chrono::{Datelike, NaiveDate};

/// Whole calendar months between two dates, ignoring the day of month.
pub fn months_between(a: NaiveDate, b: NaiveDate) -> u32 {
    let months = (a.year() - b.year()) * 12 + a.month() as i32 - b.month() as i32;
    months.unsigned_abs()
}

/// Turns a month distance into a tile count using an assumed catalog density,
/// scaled down by `safety_factor`.
#[derive(Debug, Clone, Copy)]
pub struct OffsetEstimator {
    pub density: f64,
    pub safety_factor: f64,
}

impl OffsetEstimator {
    pub fn new(density: f64, safety_factor: f64) -> Self {
        Self { density, safety_factor }
    }

    pub fn estimated_entries(&self, months: u32) -> f64 {
        months as f64 * self.density
    }

    /// Skip magnitude for a gap of `months`. Never less than one.
    pub fn skip_for_months(&self, months: u32) -> usize {
        let skip = (self.estimated_entries(months) * self.safety_factor).floor();
        if skip.is_finite() && skip >= 1.0 {
            skip as usize
        } else {
            1
        }
    }

    pub fn skip_between(&self, reference: NaiveDate, target: NaiveDate) -> usize {
        self.skip_for_months(months_between(reference, target))
    }

    /// Where to start a bounded traversal. Zero when the target sits in the
    /// reference month, since every tile there may already be in range.
    pub fn initial_offset(&self, reference: NaiveDate, target: NaiveDate) -> usize {
        match months_between(reference, target) {
            0 => 0,
            months => self.skip_for_months(months),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn ten_months_at_default_density() {
        let est = OffsetEstimator::new(27.0, 0.8);
        assert_eq!(est.skip_for_months(10), 216);
    }

    #[test]
    fn never_below_one() {
        let est = OffsetEstimator::new(27.0, 0.8);
        assert_eq!(est.skip_for_months(0), 1);
        assert_eq!(OffsetEstimator::new(0.5, 0.8).skip_for_months(1), 1);
    }

    #[test]
    fn months_ignore_day_and_order() {
        assert_eq!(months_between(d(2025, 6, 1), d(2025, 3, 31)), 3);
        assert_eq!(months_between(d(2025, 3, 31), d(2025, 6, 1)), 3);
        assert_eq!(months_between(d(2025, 1, 15), d(2024, 12, 15)), 1);
        assert_eq!(months_between(d(2025, 3, 1), d(2025, 3, 31)), 0);
    }

    #[test]
    fn skip_shrinks_as_gap_narrows() {
        let est = OffsetEstimator::new(27.0, 0.8);
        let far = est.skip_between(d(2025, 10, 1), d(2025, 3, 1));
        let near = est.skip_between(d(2025, 4, 1), d(2025, 3, 1));
        assert!(far > near);
        assert_eq!(near, 21);
    }

    #[test]
    fn initial_offset_same_month_is_zero() {
        let est = OffsetEstimator::new(27.0, 0.8);
        assert_eq!(est.initial_offset(d(2025, 3, 20), d(2025, 3, 1)), 0);
        assert_eq!(est.initial_offset(d(2025, 12, 1), d(2025, 2, 1)), 216);
    }
}
