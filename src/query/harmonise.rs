//! Alignment of several attribute series onto a shared time index.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::QueryError;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Index of the longest series; one row per (timestamp, attribute).
    Long,
    /// Union of all timestamps; one row per timestamp, a column per attribute.
    Wide,
}

impl FromStr for Layout {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Layout::Long),
            "wide" => Ok(Layout::Wide),
            other => Err(QueryError::UnknownLayout(other.to_string())),
        }
    }
}

/// One attribute's numeric series.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub attribute: String,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

impl Series {
    /// Points keyed by timestamp; repeated timestamps are averaged.
    fn by_timestamp(&self) -> BTreeMap<DateTime<Utc>, f64> {
        // ---
        let mut sums: BTreeMap<DateTime<Utc>, (f64, usize)> = BTreeMap::new();
        for (ts, v) in &self.points {
            let entry = sums.entry(*ts).or_insert((0.0, 0));
            entry.0 += v;
            entry.1 += 1;
        }
        sums.into_iter().map(|(ts, (sum, n))| (ts, sum / n as f64)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LongRow {
    pub timestamp: DateTime<Utc>,
    pub attribute: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WideRow {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub values: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "layout", rename_all = "lowercase")]
pub enum Harmonised {
    Long {
        index: Vec<DateTime<Utc>>,
        rows: Vec<LongRow>,
    },
    Wide {
        index: Vec<DateTime<Utc>>,
        rows: Vec<WideRow>,
    },
}

impl Harmonised {
    pub fn index(&self) -> &[DateTime<Utc>] {
        match self {
            Harmonised::Long { index, .. } | Harmonised::Wide { index, .. } => index,
        }
    }
}

/// Align `series` onto a common index. Timestamps must already be bucketed
/// to the same frequency; matching is exact and gaps come out as `None`.
pub fn harmonise(series: &[Series], layout: Layout) -> Harmonised {
    // ---
    let keyed: Vec<(&str, BTreeMap<DateTime<Utc>, f64>)> =
        series.iter().map(|s| (s.attribute.as_str(), s.by_timestamp())).collect();

    match layout {
        Layout::Long => {
            // Earliest series wins ties.
            let index: Vec<DateTime<Utc>> = keyed
                .iter()
                .fold(None::<&BTreeMap<DateTime<Utc>, f64>>, |longest, (_, points)| match longest {
                    Some(l) if l.len() >= points.len() => Some(l),
                    _ => Some(points),
                })
                .map(|points| points.keys().copied().collect())
                .unwrap_or_default();

            let rows = keyed
                .iter()
                .flat_map(|(attribute, points)| {
                    index.iter().map(move |ts| LongRow {
                        timestamp: *ts,
                        attribute: attribute.to_string(),
                        value: points.get(ts).copied(),
                    })
                })
                .collect();
            Harmonised::Long { index, rows }
        }
        Layout::Wide => {
            let index: Vec<DateTime<Utc>> = keyed
                .iter()
                .flat_map(|(_, points)| points.keys().copied())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            let rows = index
                .iter()
                .map(|ts| WideRow {
                    timestamp: *ts,
                    values: keyed
                        .iter()
                        .map(|(attribute, points)| (attribute.to_string(), points.get(ts).copied()))
                        .collect(),
                })
                .collect();
            Harmonised::Wide { index, rows }
        }
    }
}
