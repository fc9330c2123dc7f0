//! Weekly rollup of daily trends for the analytics view.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use super::{round2, DailyTrend};

/// Number of most recent weeks kept.
pub const WEEKS_RETAINED: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeeklyRollup {
    /// Sunday opening the week.
    pub week_start: NaiveDate,
    pub analyses: u64,
    /// Count-weighted mean of the daily averages.
    pub accuracy: f64,
    /// Approximation: one in ten analyses. Not a measured value.
    pub estimated_hallucinations: u64,
}

pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_sunday()))
}

/// Bucket `daily` into Sunday-based weeks, keeping the latest
/// [`WEEKS_RETAINED`] weeks in ascending order.
pub fn weekly(daily: &[DailyTrend]) -> Vec<WeeklyRollup> {
    let mut buckets: BTreeMap<NaiveDate, (u64, f64)> = BTreeMap::new();
    for day in daily {
        let bucket = buckets.entry(week_start(day.date)).or_default();
        bucket.0 += day.count;
        bucket.1 += day.average_accuracy * day.count as f64;
    }

    let skip = buckets.len().saturating_sub(WEEKS_RETAINED);
    buckets
        .into_iter()
        .skip(skip)
        .map(|(week_start, (analyses, weighted))| WeeklyRollup {
            week_start,
            analyses,
            accuracy: if analyses == 0 {
                0.0
            } else {
                round2(weighted / analyses as f64)
            },
            // floor(analyses * 0.1), exact in integers
            estimated_hallucinations: analyses / 10,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32, count: u64, avg: f64) -> DailyTrend {
        DailyTrend {
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            count,
            average_accuracy: avg,
        }
    }

    #[test]
    fn test_week_starts_on_sunday() {
        // 2024-05-01 is a Wednesday.
        let wed = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(week_start(wed), NaiveDate::from_ymd_opt(2024, 4, 28).unwrap());
        let sun = NaiveDate::from_ymd_opt(2024, 4, 28).unwrap();
        assert_eq!(week_start(sun), sun);
    }

    #[test]
    fn test_accuracy_is_count_weighted() {
        // Same week: 9 analyses at 90, 1 analysis at 10.
        let weeks = weekly(&[day(2024, 5, 1, 9, 90.0), day(2024, 5, 2, 1, 10.0)]);
        assert_eq!(weeks.len(), 1);
        assert_eq!(weeks[0].analyses, 10);
        // A plain mean of means would give 50.
        assert_eq!(weeks[0].accuracy, 82.0);
        assert_eq!(weeks[0].estimated_hallucinations, 1);
    }

    #[test]
    fn test_only_latest_four_weeks_are_kept() {
        let daily: Vec<DailyTrend> = (0..6)
            .map(|w| {
                let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::weeks(w);
                DailyTrend {
                    date,
                    count: 5 + w as u64,
                    average_accuracy: 70.0,
                }
            })
            .collect();
        let weeks = weekly(&daily);
        assert_eq!(weeks.len(), 4);
        assert_eq!(weeks[0].analyses, 7);
        assert_eq!(weeks[3].analyses, 10);
        assert_eq!(weeks[3].estimated_hallucinations, 1);
        assert!(weeks.windows(2).all(|w| w[0].week_start < w[1].week_start));
    }

    #[test]
    fn test_empty_daily_gives_empty_weekly() {
        assert!(weekly(&[]).is_empty());
    }
}
