//! Summary statistics over attribute values.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::QueryError;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Sum,
    Mean,
    Median,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Sum => "sum",
            Operation::Mean => "mean",
            Operation::Median => "median",
        }
    }

    /// Apply the statistic. Mean and median of nothing are `None`; the sum
    /// of nothing is zero.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        // ---
        match self {
            Operation::Sum => Some(values.iter().sum()),
            Operation::Mean if values.is_empty() => None,
            Operation::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
            Operation::Median => median(values),
        }
    }
}

impl FromStr for Operation {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Operation::Sum),
            "mean" => Ok(Operation::Mean),
            "median" => Ok(Operation::Median),
            other => Err(QueryError::UnknownOperation(other.to_string())),
        }
    }
}

fn median(values: &[f64]) -> Option<f64> {
    // ---
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Parse stored text values as numbers, failing on the first that is not.
pub fn parse_numeric<'a, I>(table: &str, values: I) -> Result<Vec<f64>, QueryError>
where
    I: IntoIterator<Item = &'a str>,
{
    // ---
    values
        .into_iter()
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .ok_or_else(|| QueryError::NonNumeric {
                    table: table.to_string(),
                    value: v.to_string(),
                })
        })
        .collect()
}

pub fn is_numeric(value: &str) -> bool {
    value.trim().parse::<f64>().is_ok_and(f64::is_finite)
}
