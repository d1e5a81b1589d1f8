//! Fixed-frequency bucketing of raw readings.
//!
//! Bucket starts are counted from the Unix epoch with Euclidean division,
//! so every timestamp maps to exactly one bucket and later timestamps never
//! land in an earlier one. Weekly buckets start on Monday 00:00 UTC.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Operation, QueryError};

// ---

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 60 * 60;
const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;

/// 1970-01-01 was a Thursday; the Monday before it is three days earlier.
const WEEK_ORIGIN_OFFSET: i64 = 3 * SECONDS_PER_DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Frequency {
    #[serde(rename = "W")]
    Weekly,
    #[serde(rename = "1D")]
    Daily,
    #[default]
    #[serde(rename = "1H")]
    Hourly,
    #[serde(rename = "1Min")]
    Minute,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Weekly => "W",
            Frequency::Daily => "1D",
            Frequency::Hourly => "1H",
            Frequency::Minute => "1Min",
        }
    }

    fn width_secs(&self) -> i64 {
        match self {
            Frequency::Weekly => SECONDS_PER_WEEK,
            Frequency::Daily => SECONDS_PER_DAY,
            Frequency::Hourly => SECONDS_PER_HOUR,
            Frequency::Minute => SECONDS_PER_MINUTE,
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        // ---
        let width = self.width_secs();
        let origin = match self {
            Frequency::Weekly => -WEEK_ORIGIN_OFFSET,
            _ => 0,
        };
        let start = (ts.timestamp() - origin).div_euclid(width) * width + origin;
        DateTime::from_timestamp(start, 0).unwrap_or(ts)
    }
}

impl FromStr for Frequency {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "W" => Ok(Frequency::Weekly),
            "1D" => Ok(Frequency::Daily),
            "1H" => Ok(Frequency::Hourly),
            "1Min" => Ok(Frequency::Minute),
            other => Err(QueryError::UnknownFrequency(other.to_string())),
        }
    }
}

/// A numeric reading ready for bucketing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub sensor_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// One aggregated bucket. `sensor_id` is `None` when pooled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<Uuid>,
    pub value: f64,
    pub count: usize,
}

/// Bucket readings per sensor or pooled, summarising each bucket with `op`.
///
/// Only non-empty buckets are returned, ordered by sensor then time
/// (pooled: by time).
pub fn resample(readings: &[Reading], frequency: Frequency, per_sensor: bool, op: Operation) -> Vec<Bucket> {
    // ---
    let mut groups: BTreeMap<(Option<Uuid>, DateTime<Utc>), Vec<f64>> = BTreeMap::new();

    for r in readings {
        let sensor = per_sensor.then_some(r.sensor_id);
        groups
            .entry((sensor, frequency.bucket_start(r.timestamp)))
            .or_default()
            .push(r.value);
    }

    groups
        .into_iter()
        .filter_map(|((sensor_id, timestamp), values)| {
            op.apply(&values).map(|value| Bucket {
                timestamp,
                sensor_id,
                value,
                count: values.len(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Datelike, Duration, TimeZone, Weekday};

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    fn reading(sensor: Uuid, ts: DateTime<Utc>, value: f64) -> Reading {
        Reading {
            sensor_id: sensor,
            timestamp: ts,
            value,
        }
    }

    #[test]
    fn test_bucket_start_per_frequency() {
        // ---
        let ts = at(6, 13, 47); // Wednesday
        assert_eq!(Frequency::Minute.bucket_start(ts), at(6, 13, 47));
        assert_eq!(Frequency::Hourly.bucket_start(ts), at(6, 13, 0));
        assert_eq!(Frequency::Daily.bucket_start(ts), at(6, 0, 0));

        let week = Frequency::Weekly.bucket_start(ts);
        assert_eq!(week, at(4, 0, 0));
        assert_eq!(week.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_bucket_start_is_monotonic() {
        // ---
        let base = at(1, 0, 0);
        let mut last = Frequency::Weekly.bucket_start(base);
        for step in 0..200 {
            let next = Frequency::Weekly.bucket_start(base + Duration::hours(step * 7));
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn test_pooled_hourly_mean() {
        // ---
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let readings = vec![
            reading(a, at(1, 10, 5), 1.0),
            reading(b, at(1, 10, 50), 3.0),
            reading(a, at(1, 11, 0), 10.0),
        ];

        let buckets = resample(&readings, Frequency::Hourly, false, Operation::Mean);

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].timestamp, at(1, 10, 0));
        assert_eq!(buckets[0].value, 2.0);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].sensor_id, None);
        assert_eq!(buckets[1].value, 10.0);
    }

    #[test]
    fn test_per_sensor_keeps_sensors_apart() {
        // ---
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let readings = vec![
            reading(b, at(1, 10, 5), 4.0),
            reading(a, at(1, 10, 6), 1.0),
            reading(a, at(1, 10, 7), 2.0),
        ];

        let buckets = resample(&readings, Frequency::Daily, true, Operation::Sum);

        assert_eq!(buckets.len(), 2);
        assert_eq!((buckets[0].sensor_id, buckets[0].value), (Some(a), 3.0));
        assert_eq!((buckets[1].sensor_id, buckets[1].value), (Some(b), 4.0));
    }

    #[test]
    fn test_frequency_from_str() {
        // ---
        assert_eq!("1Min".parse::<Frequency>().unwrap(), Frequency::Minute);
        assert!("2H".parse::<Frequency>().is_err());
    }
}
