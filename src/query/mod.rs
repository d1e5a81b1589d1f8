//! Read path: per-attribute reads, aggregation, resampling, harmonisation
//! and the optional forecast block.
//!
//! [`run_query`] resolves attribute names, then answers each attribute in
//! one of three shapes: raw values, a single aggregate, or resampled
//! buckets. Harmonisation combines the resampled series of every attribute.
//! A non-numeric attribute fails on its own; the others are unaffected.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::forecast::{
    forecast_series, ForecastError, ForecastOutcome, Forecaster, ALL_SENSORS, DEFAULT_HORIZON, MAX_FORECAST_ROWS,
};
use crate::models::{Attribute, ValueRow};
use crate::store::{Store, StoreError, ValueFilter, ValueOrder};

pub mod aggregate;
pub mod harmonise;
pub mod resample;

pub use aggregate::{is_numeric, parse_numeric, Operation};
pub use harmonise::{harmonise, Harmonised, Layout, LongRow, Series, WideRow};
pub use resample::{resample, Bucket, Frequency, Reading};

// ---

pub const DEFAULT_LIMIT: i64 = 30;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("table {table} holds non-numeric value {value:?}")]
    NonNumeric { table: String, value: String },

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("unknown frequency: {0}")]
    UnknownFrequency(String),

    #[error("unknown harmonising method: {0}")]
    UnknownLayout(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("invalid sensor id: {0}")]
    InvalidSensorId(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Forecast(#[from] ForecastError),
}

/// One read request over one or more attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeQuery {
    // ---
    pub attribute_names: Vec<String>,
    pub limit: i64,
    pub offset: i64,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub operation: Option<Operation>,
    pub grouped: bool,
    pub frequency: Frequency,
    pub per_sensor: bool,
    pub harmonising_method: Option<Layout>,
    /// Restricts the forecast series to one sensor.
    pub sensor_id: Option<Uuid>,
    pub predict: bool,
    pub prediction_horizon: usize,
}

impl AttributeQuery {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AttributeQuery {
            attribute_names: names.into_iter().map(Into::into).collect(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            from_date: None,
            to_date: None,
            operation: None,
            grouped: false,
            frequency: Frequency::default(),
            per_sensor: false,
            harmonising_method: None,
            sensor_id: None,
            predict: false,
            prediction_horizon: DEFAULT_HORIZON,
        }
    }

    /// The window applies only when both ends are given.
    pub fn window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.from_date.zip(self.to_date)
    }

    fn is_bucketed(&self) -> bool {
        self.grouped || self.harmonising_method.is_some()
    }

    /// Filter for raw reads. Latest-N is newest first; a window is read
    /// oldest first with `limit`/`offset` applied inside it.
    fn raw_filter(&self) -> ValueFilter {
        // ---
        match self.window() {
            Some(window) => ValueFilter {
                window: Some(window),
                order: ValueOrder::OldestFirst,
                limit: Some(self.limit),
                offset: self.offset,
                ..Default::default()
            },
            None => ValueFilter::latest(self.limit),
        }
    }

    /// Filter for aggregation: every row in the window, or the whole table.
    fn aggregate_filter(&self) -> ValueFilter {
        ValueFilter {
            window: self.window(),
            ..Default::default()
        }
    }
}

/// Parse `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` or RFC 3339 as UTC.
///
/// A bare date used as the end of a window means the end of that day.
pub fn parse_query_date(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, QueryError> {
    // ---
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| QueryError::InvalidDate(raw.to_string()))?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| QueryError::InvalidDate(raw.to_string()))?;
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueRecord {
    pub sensor_id: Uuid,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

impl From<ValueRow> for ValueRecord {
    fn from(row: ValueRow) -> Self {
        ValueRecord {
            sensor_id: row.s_id,
            value: row.value,
            timestamp: row.api_timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeData {
    Values {
        values: Vec<ValueRecord>,
    },
    Aggregate {
        operation: Operation,
        aggregate_result: Option<f64>,
    },
    Resampled {
        frequency: Frequency,
        per_sensor: bool,
        operation: Operation,
        buckets: Vec<Bucket>,
    },
    Failed {
        error: String,
    },
}

/// Result envelope for one attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeResult {
    pub table_name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub unit_value: Option<String>,
    /// Full-table count, independent of any window or limit.
    pub total_row_count: i64,
    #[serde(flatten)]
    pub data: AttributeData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResponse {
    pub attributes: Vec<AttributeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harmonised: Option<Harmonised>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast: Option<ForecastOutcome>,
}

/// Answer `query`. Unknown attribute names are skipped.
pub async fn run_query<S: Store>(
    store: &S,
    query: &AttributeQuery,
    forecaster: &dyn Forecaster,
) -> Result<QueryResponse, QueryError> {
    // ---
    let mut attributes = store.find_attributes_by_names(&query.attribute_names).await?;
    // Answer in request order; the forecast uses the first one.
    attributes.sort_by_key(|a| query.attribute_names.iter().position(|n| *n == a.name));
    if attributes.is_empty() {
        info!("No attributes match {:?}", query.attribute_names);
        return Ok(QueryResponse::default());
    }

    let mut response = QueryResponse::default();
    let mut series = Vec::new();

    for attr in &attributes {
        let total_row_count = store.count_values(&attr.table_name).await?;

        let data = match read_attribute(store, attr, query).await {
            Ok((data, bucketed)) => {
                if let Some(s) = bucketed {
                    series.push(s);
                }
                data
            }
            Err(e @ QueryError::NonNumeric { .. }) => {
                warn!("Attribute {} cannot be summarised: {}", attr.name, e);
                AttributeData::Failed { error: e.to_string() }
            }
            Err(e) => return Err(e),
        };

        response.attributes.push(AttributeResult {
            table_name: attr.table_name.clone(),
            display_name: attr.name.clone(),
            description: attr.description.clone(),
            unit_value: attr.unit_value.clone(),
            total_row_count,
            data,
        });
    }

    if let Some(layout) = query.harmonising_method {
        let harmonised = harmonise(&series, layout);
        debug!("Harmonised {} series onto {} timestamps", series.len(), harmonised.index().len());
        response.harmonised = Some(harmonised);
    }

    if query.predict {
        if let Some(first) = response.attributes.first() {
            response.forecast = forecast_attribute(store, first, query, forecaster).await?;
        }
    }

    Ok(response)
}

/// Read one attribute; the series is returned when harmonising.
async fn read_attribute<S: Store>(
    store: &S,
    attr: &Attribute,
    query: &AttributeQuery,
) -> Result<(AttributeData, Option<Series>), QueryError> {
    // ---
    let table = attr.table_name.as_str();

    if !query.is_bucketed() {
        if let Some(operation) = query.operation {
            let rows = store.fetch_values(table, &query.aggregate_filter()).await?;
            let values = parse_numeric(table, rows.iter().map(|r| r.value.as_str()))?;
            debug!("{} {} over {} rows", operation.as_str(), table, values.len());
            return Ok((
                AttributeData::Aggregate {
                    operation,
                    aggregate_result: operation.apply(&values),
                },
                None,
            ));
        }

        let rows = store.fetch_values(table, &query.raw_filter()).await?;
        let values = rows.into_iter().map(ValueRecord::from).collect();
        return Ok((AttributeData::Values { values }, None));
    }

    let rows = store.fetch_values(table, &query.raw_filter()).await?;
    let numbers = parse_numeric(table, rows.iter().map(|r| r.value.as_str()))?;
    let readings: Vec<Reading> = rows
        .iter()
        .zip(numbers)
        .map(|(row, value)| Reading {
            sensor_id: row.s_id,
            timestamp: row.api_timestamp,
            value,
        })
        .collect();

    let operation = query.operation.unwrap_or(Operation::Mean);
    // Harmonised series are always pooled.
    let per_sensor = query.per_sensor && query.harmonising_method.is_none();
    let buckets = resample(&readings, query.frequency, per_sensor, operation);

    let series = query.harmonising_method.map(|_| Series {
        attribute: attr.name.clone(),
        points: buckets.iter().map(|b| (b.timestamp, b.value)).collect(),
    });

    Ok((
        AttributeData::Resampled {
            frequency: query.frequency,
            per_sensor,
            operation,
            buckets,
        },
        series,
    ))
}

/// Forecast block for the first attribute, or `None` when it is empty or
/// not numeric.
async fn forecast_attribute<S: Store>(
    store: &S,
    first: &AttributeResult,
    query: &AttributeQuery,
    forecaster: &dyn Forecaster,
) -> Result<Option<ForecastOutcome>, QueryError> {
    // ---
    if first.total_row_count == 0 {
        info!("Not forecasting {}: table is empty", first.table_name);
        return Ok(None);
    }

    let filter = ValueFilter {
        sensor_id: query.sensor_id,
        limit: Some(MAX_FORECAST_ROWS),
        ..Default::default()
    };
    let rows = store.fetch_values(&first.table_name, &filter).await?;

    if rows.first().is_some_and(|r| !is_numeric(&r.value)) {
        info!("Not forecasting {}: values are not numeric", first.table_name);
        return Ok(None);
    }
    let values = match parse_numeric(&first.table_name, rows.iter().map(|r| r.value.as_str())) {
        Ok(values) => values,
        Err(e) => {
            warn!("Not forecasting {}: {}", first.table_name, e);
            return Ok(None);
        }
    };
    let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.api_timestamp).collect();

    let label = query
        .sensor_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| ALL_SENSORS.to_string());
    let outcome = forecast_series(forecaster, &label, &values, &timestamps, query.prediction_horizon)?;
    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_parse_query_date_forms() {
        // ---
        let start = parse_query_date("2024-02-03", false).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-02-03T00:00:00+00:00");

        let end = parse_query_date("2024-02-03", true).unwrap();
        assert!(end > start && end < parse_query_date("2024-02-04", false).unwrap());

        let exact = parse_query_date("2024-02-03T10:15:00Z", true).unwrap();
        assert_eq!(exact, parse_query_date("2024-02-03 10:15:00", false).unwrap());

        assert!(matches!(parse_query_date("03/02/2024", false), Err(QueryError::InvalidDate(_))));
    }

    #[test]
    fn test_window_needs_both_ends() {
        // ---
        let mut q = AttributeQuery::new(["no2"]);
        q.from_date = Some(Utc::now());
        assert!(q.window().is_none());
        assert_eq!(q.raw_filter().order, ValueOrder::NewestFirst);

        q.to_date = Some(Utc::now());
        assert!(q.window().is_some());
        assert_eq!(q.raw_filter().order, ValueOrder::OldestFirst);
        assert_eq!(q.aggregate_filter().limit, None);
    }

    #[test]
    fn test_defaults() {
        // ---
        let q = AttributeQuery::new(["a", "b"]);
        assert_eq!(q.limit, DEFAULT_LIMIT);
        assert_eq!(q.frequency, Frequency::Hourly);
        assert_eq!(q.prediction_horizon, DEFAULT_HORIZON);
        assert!(!q.is_bucketed());
    }
}
