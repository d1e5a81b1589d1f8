//! Canonical row normalization.
//!
//! A provider payload is first flattened into an [`Extract`] (rows x named
//! columns), then a [`ColumnMapping`] picks out the columns that play the
//! sensor, attribute, value, latitude, longitude, description and source
//! timestamp roles. The result is a flat list of [`CanonicalRow`]s.
//!
//! Nothing here raises: an empty or malformed payload comes back as
//! [`Normalized::NoData`] so the caller can skip the run.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

// ---

/// A tabular extract. Cells are `None` where the source had no value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extract {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Extract {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Extract {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row; it is padded or truncated to the column count.
    pub fn push_row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        // ---
        let mut row: Vec<Option<String>> = cells.into_iter().map(|c| c.map(Into::into)).collect();
        row.resize(self.columns.len(), None);
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Non-empty, trimmed cell content.
    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .and_then(|c| c.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Flatten a nested JSON payload.
    ///
    /// With an `object_separator`, every object holding that key becomes a
    /// row; without one, every object whose fields are all scalars does.
    /// Rows inherit scalar fields from enclosing objects, nearest wins.
    /// Fields named in `ignore_tags` are dropped.
    pub fn from_json(payload: &Value, object_separator: Option<&str>, ignore_tags: &[String]) -> Self {
        // ---
        let mut flattener = Flattener {
            separator: object_separator,
            ignore_tags,
            columns: Vec::new(),
            records: Vec::new(),
        };
        flattener.walk(payload, &[]);

        let mut extract = Extract::new(flattener.columns.clone());
        for record in flattener.records {
            let cells: Vec<Option<String>> = flattener
                .columns
                .iter()
                .map(|col| {
                    record
                        .iter()
                        .rev()
                        .find(|(k, _)| k == col)
                        .and_then(|(_, v)| v.clone())
                })
                .collect();
            extract.push_row(cells);
        }
        extract
    }
}

type Record = Vec<(String, Option<String>)>;

struct Flattener<'a> {
    separator: Option<&'a str>,
    ignore_tags: &'a [String],
    columns: Vec<String>,
    records: Vec<Record>,
}

impl Flattener<'_> {
    fn walk(&mut self, value: &Value, inherited: &[(String, Option<String>)]) {
        // ---
        match value {
            Value::Array(items) => {
                for item in items {
                    self.walk(item, inherited);
                }
            }
            Value::Object(map) => {
                let mut context: Record = inherited.to_vec();
                let mut all_scalar = true;

                for (key, field) in map {
                    if self.ignore_tags.iter().any(|t| t == key) {
                        continue;
                    }
                    match scalar_text(field) {
                        Some(text) => context.push((key.clone(), text)),
                        None => all_scalar = false,
                    }
                }

                let is_record = match self.separator {
                    Some(sep) => map.contains_key(sep),
                    None => all_scalar,
                };
                if is_record {
                    for (key, _) in &context {
                        if !self.columns.contains(key) {
                            self.columns.push(key.clone());
                        }
                    }
                    self.records.push(context.clone());
                }

                for field in map.values() {
                    if matches!(field, Value::Array(_) | Value::Object(_)) {
                        self.walk(field, &context);
                    }
                }
            }
            _ => {}
        }
    }
}

/// `Some(cell)` for scalar JSON values, `None` for arrays and objects.
fn scalar_text(value: &Value) -> Option<Option<String>> {
    match value {
        Value::Null => Some(None),
        Value::String(s) => Some(Some(s.clone())),
        Value::Number(n) => Some(Some(n.to_string())),
        Value::Bool(b) => Some(Some(b.to_string())),
        Value::Array(_) | Value::Object(_) => None,
    }
}

// ---

/// Where attribute names and readings live in the extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum AttributeLayout {
    /// One column names the attribute, another holds the reading.
    Long { attribute: String, value: String },
    /// Each listed column is an attribute; its cells are the readings.
    /// The parallel lists follow the broadcast rule of
    /// [`crate::ingest::resolve::broadcast`].
    Wide {
        columns: Vec<String>,
        #[serde(default)]
        unit_values: Vec<String>,
        #[serde(default)]
        descriptions: Vec<String>,
        #[serde(default)]
        unit_ids: Vec<i32>,
        #[serde(default)]
        sub_themes: Vec<i32>,
    },
}

/// Column roles for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub sensor: String,
    #[serde(flatten)]
    pub attributes: AttributeLayout,
    pub latitude: String,
    pub longitude: String,
    pub description: Option<String>,
    pub source_timestamp: Option<String>,
}

impl ColumnMapping {
    /// Mapping for a long extract.
    pub fn long(
        sensor: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
        latitude: impl Into<String>,
        longitude: impl Into<String>,
    ) -> Self {
        ColumnMapping {
            sensor: sensor.into(),
            attributes: AttributeLayout::Long {
                attribute: attribute.into(),
                value: value.into(),
            },
            latitude: latitude.into(),
            longitude: longitude.into(),
            description: None,
            source_timestamp: None,
        }
    }

    pub fn with_description(mut self, column: impl Into<String>) -> Self {
        self.description = Some(column.into());
        self
    }

    pub fn with_source_timestamp(mut self, column: impl Into<String>) -> Self {
        self.source_timestamp = Some(column.into());
        self
    }
}

/// Optional columns carrying per-row unit information.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitColumns<'a> {
    pub unit: Option<&'a str>,
    pub unit_value: Option<&'a str>,
}

/// A normalized reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRow {
    // ---
    pub sensor: String,
    pub attribute: String,
    pub value: String,
    pub latitude: f64,
    pub longitude: f64,
    pub description: Option<String>,
    /// `None` when the source timestamp was missing or unparseable.
    pub timestamp: Option<DateTime<Utc>>,
    /// Row-level unit id, only when a unit column is mapped.
    pub unit: Option<i32>,
    /// Row-level unit value, only when a unit-value column is mapped.
    pub unit_value: Option<String>,
}

/// Why a payload produced nothing to ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoData {
    EmptyPayload,
    MissingColumn(String),
    NoUsableRows,
}

impl std::fmt::Display for NoData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoData::EmptyPayload => write!(f, "payload is empty"),
            NoData::MissingColumn(c) => write!(f, "mapped column {c:?} is missing"),
            NoData::NoUsableRows => write!(f, "no row carries sensor, attribute, value and location"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Rows(Vec<CanonicalRow>),
    NoData(NoData),
}

struct Resolved {
    sensor: usize,
    latitude: usize,
    longitude: usize,
    description: Option<usize>,
    timestamp: Option<usize>,
    unit: Option<usize>,
    unit_value: Option<usize>,
}

/// Turn an extract into canonical rows.
///
/// Rows missing a sensor, attribute, value or a parseable coordinate are
/// dropped. Wide extracts yield one row per (extract row, attribute column).
pub fn normalize(extract: &Extract, mapping: &ColumnMapping, units: UnitColumns<'_>) -> Normalized {
    // ---
    if extract.is_empty() {
        return Normalized::NoData(NoData::EmptyPayload);
    }

    let required = |name: &str| {
        extract
            .column_index(name)
            .ok_or_else(|| NoData::MissingColumn(name.to_string()))
    };
    let optional = |name: Option<&str>| match name {
        Some(n) => required(n).map(Some),
        None => Ok(None),
    };

    let cols = match (|| -> Result<Resolved, NoData> {
        Ok(Resolved {
            sensor: required(&mapping.sensor)?,
            latitude: required(&mapping.latitude)?,
            longitude: required(&mapping.longitude)?,
            description: optional(mapping.description.as_deref())?,
            timestamp: optional(mapping.source_timestamp.as_deref())?,
            unit: optional(units.unit)?,
            unit_value: optional(units.unit_value)?,
        })
    })() {
        Ok(cols) => cols,
        Err(missing) => return Normalized::NoData(missing),
    };

    // (attribute name or column index, value column index)
    let attribute_sources: Vec<(AttributeSource, usize)> = match &mapping.attributes {
        AttributeLayout::Long { attribute, value } => match (required(attribute), required(value)) {
            (Ok(a), Ok(v)) => vec![(AttributeSource::Column(a), v)],
            (Err(missing), _) | (_, Err(missing)) => return Normalized::NoData(missing),
        },
        AttributeLayout::Wide { columns, .. } => {
            let mut sources = Vec::with_capacity(columns.len());
            for name in columns {
                match required(name) {
                    Ok(idx) => sources.push((AttributeSource::Named(name.clone()), idx)),
                    Err(missing) => return Normalized::NoData(missing),
                }
            }
            sources
        }
    };

    let mut rows = Vec::new();
    let mut dropped = 0usize;

    for i in 0..extract.len() {
        let location = (
            extract.cell(i, cols.latitude).and_then(|v| v.parse::<f64>().ok()),
            extract.cell(i, cols.longitude).and_then(|v| v.parse::<f64>().ok()),
        );
        let sensor = extract.cell(i, cols.sensor);
        let timestamp = cols
            .timestamp
            .and_then(|c| extract.cell(i, c))
            .and_then(parse_source_timestamp);

        for (source, value_col) in &attribute_sources {
            let attribute = match source {
                AttributeSource::Column(c) => extract.cell(i, *c),
                AttributeSource::Named(n) => Some(n.as_str()),
            };
            let value = extract.cell(i, *value_col);

            let (Some(sensor), Some(attribute), Some(value), (Some(latitude), Some(longitude))) =
                (sensor, attribute, value, location)
            else {
                dropped += 1;
                continue;
            };

            rows.push(CanonicalRow {
                sensor: sensor.to_string(),
                attribute: attribute.to_string(),
                value: value.to_string(),
                latitude,
                longitude,
                description: cols.description.and_then(|c| extract.cell(i, c)).map(String::from),
                timestamp,
                unit: cols.unit.and_then(|c| extract.cell(i, c)).and_then(|u| u.parse().ok()),
                unit_value: cols.unit_value.and_then(|c| extract.cell(i, c)).map(String::from),
            });
        }
    }

    if dropped > 0 {
        warn!("Dropped {} incomplete rows during normalization", dropped);
    }
    debug!("Normalized {} canonical rows", rows.len());

    if rows.is_empty() {
        Normalized::NoData(NoData::NoUsableRows)
    } else {
        Normalized::Rows(rows)
    }
}

enum AttributeSource {
    Column(usize),
    Named(String),
}

/// Parse a provider timestamp into UTC.
///
/// Accepts Unix epoch seconds (integer or fractional; values beyond 1e11
/// are read as milliseconds), RFC 3339, and the common naive layouts, which
/// are taken as UTC.
pub fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    // ---
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(epoch) = raw.parse::<f64>() {
        if !epoch.is_finite() {
            return None;
        }
        let millis = if epoch.abs() > 1e11 { epoch } else { epoch * 1000.0 };
        return DateTime::from_timestamp_millis(millis.round() as i64);
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: [&str; 5] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn site_extract() -> Extract {
        // ---
        let mut extract = Extract::new([
            "@SiteCode",
            "@SpeciesCode",
            "@Value",
            "@Latitude",
            "@Longitude",
            "@MeasurementDateGMT",
        ]);
        extract.push_row([
            Some("BG1"),
            Some("NO2"),
            Some("22"),
            Some("51.56"),
            Some("0.17"),
            Some("1539000000"),
        ]);
        extract.push_row([
            Some("BG2"),
            Some("SO2"),
            Some("23"),
            Some("51.57"),
            Some("0.18"),
            Some("not a date"),
        ]);
        extract
    }

    fn site_mapping() -> ColumnMapping {
        ColumnMapping::long("@SiteCode", "@SpeciesCode", "@Value", "@Latitude", "@Longitude")
            .with_source_timestamp("@MeasurementDateGMT")
    }

    #[test]
    fn test_long_extract_yields_canonical_rows() {
        // ---
        let Normalized::Rows(rows) = normalize(&site_extract(), &site_mapping(), UnitColumns::default()) else {
            panic!("expected rows");
        };

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sensor, "BG1");
        assert_eq!(rows[0].attribute, "NO2");
        assert_eq!(rows[0].value, "22");
        assert_eq!(rows[0].latitude, 51.56);
        assert_eq!(rows[0].timestamp, DateTime::from_timestamp(1_539_000_000, 0));
    }

    #[test]
    fn test_unparseable_timestamp_is_kept_as_null() {
        // ---
        let Normalized::Rows(rows) = normalize(&site_extract(), &site_mapping(), UnitColumns::default()) else {
            panic!("expected rows");
        };
        assert_eq!(rows[1].attribute, "SO2");
        assert_eq!(rows[1].timestamp, None);
    }

    #[test]
    fn test_empty_or_malformed_payload_is_no_data() {
        // ---
        let empty = Extract::new(["@SiteCode"]);
        assert_eq!(
            normalize(&empty, &site_mapping(), UnitColumns::default()),
            Normalized::NoData(NoData::EmptyPayload)
        );

        let mut wrong = Extract::new(["foo"]);
        wrong.push_row([Some("bar")]);
        assert_eq!(
            normalize(&wrong, &site_mapping(), UnitColumns::default()),
            Normalized::NoData(NoData::MissingColumn("@SiteCode".into()))
        );
    }

    #[test]
    fn test_rows_without_location_are_dropped() {
        // ---
        let mut extract = site_extract();
        extract.push_row([Some("BG3"), Some("NO2"), Some("5"), None, Some("0.1"), None]);

        let Normalized::Rows(rows) = normalize(&extract, &site_mapping(), UnitColumns::default()) else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_wide_extract_melts_attribute_columns() {
        // ---
        let mut extract = Extract::new(["site", "no2", "pm10", "lat", "lon"]);
        extract.push_row([Some("S1"), Some("10"), Some("30"), Some("1.0"), Some("2.0")]);
        extract.push_row([Some("S2"), Some("11"), None, Some("1.5"), Some("2.5")]);

        let mapping = ColumnMapping {
            sensor: "site".into(),
            attributes: AttributeLayout::Wide {
                columns: vec!["no2".into(), "pm10".into()],
                unit_values: vec![],
                descriptions: vec![],
                unit_ids: vec![],
                sub_themes: vec![],
            },
            latitude: "lat".into(),
            longitude: "lon".into(),
            description: None,
            source_timestamp: None,
        };

        let Normalized::Rows(rows) = normalize(&extract, &mapping, UnitColumns::default()) else {
            panic!("expected rows");
        };
        let pairs: Vec<(&str, &str, &str)> = rows
            .iter()
            .map(|r| (r.sensor.as_str(), r.attribute.as_str(), r.value.as_str()))
            .collect();
        assert_eq!(pairs, vec![("S1", "no2", "10"), ("S1", "pm10", "30"), ("S2", "no2", "11")]);
    }

    #[test]
    fn test_from_json_inherits_parent_scalars() {
        // ---
        let payload = json!({
            "AirQualityData": {
                "@SiteCode": "BG1",
                "Data": [
                    {"@SpeciesCode": "NO2", "@MeasurementDateGMT": "2018-10-08 10:00:00", "@Value": "22"},
                    {"@SpeciesCode": "PM10", "@MeasurementDateGMT": "2018-10-08 10:00:00", "@Value": 13.5}
                ]
            }
        });

        let extract = Extract::from_json(&payload, Some("@SpeciesCode"), &[]);

        assert_eq!(extract.len(), 2);
        let site = extract.column_index("@SiteCode").unwrap();
        let value = extract.column_index("@Value").unwrap();
        assert_eq!(extract.cell(0, site), Some("BG1"));
        assert_eq!(extract.cell(1, value), Some("13.5"));
    }

    #[test]
    fn test_from_json_honours_ignore_tags_and_leaf_objects() {
        // ---
        let payload = json!([
            {"site": "A", "lat": 1.0, "lon": 2.0, "noise": "x"},
            {"site": "B", "lat": 3.0, "lon": 4.0, "noise": "y"}
        ]);

        let extract = Extract::from_json(&payload, None, &["noise".to_string()]);

        assert_eq!(extract.len(), 2);
        assert_eq!(extract.column_index("noise"), None);
        assert_eq!(extract.columns(), &["lat", "lon", "site"]);
    }

    #[test]
    fn test_parse_source_timestamp_formats() {
        // ---
        let expected = Utc.with_ymd_and_hms(2018, 10, 8, 12, 0, 0).unwrap();
        assert_eq!(parse_source_timestamp("1539000000"), Some(expected));
        assert_eq!(parse_source_timestamp("1539000000.0"), Some(expected));
        assert_eq!(parse_source_timestamp("1539000000000"), Some(expected));
        assert_eq!(parse_source_timestamp("2018-10-08 12:00:00"), Some(expected));
        assert_eq!(parse_source_timestamp("2018-10-08T12:00:00Z"), Some(expected));
        assert_eq!(parse_source_timestamp("2018-10-08T14:00:00+02:00"), Some(expected));
        assert_eq!(parse_source_timestamp(""), None);
        assert_eq!(parse_source_timestamp("yesterday"), None);
    }
}
