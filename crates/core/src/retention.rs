use std::collections::HashSet;

use chrono::{DateTime, Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: 3,
            weekly: 2,
            monthly: 2,
            yearly: 1,
        }
    }
}

impl RetentionPolicy {
    pub fn new(daily: u32, weekly: u32, monthly: u32, yearly: u32) -> Result<Self> {
        let policy = Self {
            daily,
            weekly,
            monthly,
            yearly,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.daily == 0 && self.weekly == 0 && self.monthly == 0 && self.yearly == 0 {
            return Err(Error::InvalidConfig {
                message: "retention: not all values can be 0".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Bucket {
    Day,
    Week,
    Month,
    Year,
}

impl Bucket {
    /// First day of the period containing `date`. Weeks start on Monday.
    fn period(self, date: NaiveDate) -> NaiveDate {
        match self {
            Bucket::Day => date,
            Bucket::Week => date
                .checked_sub_days(Days::new(date.weekday().num_days_from_monday() as u64))
                .unwrap_or(date),
            Bucket::Month => date.with_day(1).unwrap_or(date),
            Bucket::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        }
    }
}

/// Timestamps (ms since epoch, UTC) that fall outside `policy`. The newest one is always kept.
pub fn snapshots_to_delete(timestamps: &[i64], policy: &RetentionPolicy) -> Vec<i64> {
    let mut dated: Vec<(i64, NaiveDate)> = timestamps
        .iter()
        .map(|&t| (t, utc_date(t)))
        .collect();
    dated.sort_by(|a, b| b.0.cmp(&a.0));

    let mut keep = HashSet::<i64>::new();
    if let Some((newest, _)) = dated.first() {
        keep.insert(*newest);
    }
    for (bucket, count) in [
        (Bucket::Day, policy.daily),
        (Bucket::Week, policy.weekly),
        (Bucket::Month, policy.monthly),
        (Bucket::Year, policy.yearly),
    ] {
        keep.extend(representatives(&dated, bucket, count));
    }

    let mut out: Vec<i64> = timestamps
        .iter()
        .copied()
        .filter(|t| !keep.contains(t))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

fn representatives(dated: &[(i64, NaiveDate)], bucket: Bucket, count: u32) -> Vec<i64> {
    let mut out = Vec::new();
    if count == 0 {
        return out;
    }
    let mut last: Option<NaiveDate> = None;
    for &(t, date) in dated {
        let period = bucket.period(date);
        if last != Some(period) {
            out.push(t);
            if out.len() >= count as usize {
                break;
            }
            last = Some(period);
        }
    }
    out
}

fn utc_date(ms: i64) -> NaiveDate {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}
