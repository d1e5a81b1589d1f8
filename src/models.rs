//! Dimension entities and value rows persisted by the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// One registered external source.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Api {
    // ---
    pub id: i64,
    pub name: String,
    pub url: String,
    /// Poll interval in seconds.
    pub refresh_time: i64,
    pub api_key: String,
    /// Handler reference, e.g. the importer type that owns this source.
    pub api_class: String,
    pub token_expiry: Option<DateTime<Utc>>,
}

/// Registration payload for an [`Api`]; the id is assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewApi {
    // ---
    pub name: String,
    pub url: String,
    pub refresh_time: i64,
    pub api_key: String,
    pub api_class: String,
    pub token_expiry: Option<DateTime<Utc>>,
}

/// A latitude/longitude pair with its derived WKT point.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Location {
    // ---
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub geo: String,
}

impl Location {
    /// WKT point for a coordinate pair (x = longitude, y = latitude, SRID 4326).
    pub fn point_wkt(lat: f64, lon: f64) -> String {
        format!("SRID=4326;POINT({lon:.6} {lat:.6})")
    }
}

/// A named measurement source bound to one API and one location.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Sensor {
    // ---
    pub id: Uuid,
    pub a_id: i64,
    pub l_id: i64,
    pub name: String,
}

impl Sensor {
    pub fn new(a_id: i64, l_id: i64, name: impl Into<String>) -> Self {
        Sensor {
            id: Uuid::new_v4(),
            a_id,
            l_id,
            name: name.into(),
        }
    }
}

/// A measured quantity and the physical table holding its readings.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Attribute {
    // ---
    pub id: Uuid,
    pub name: String,
    pub table_name: String,
    pub sub_theme: Option<i32>,
    pub unit: Option<i32>,
    pub unit_value: Option<String>,
    pub description: Option<String>,
}

impl Attribute {
    /// Build a new attribute with a freshly generated physical table name.
    pub fn new(key: AttributeKey, sub_theme: Option<i32>, description: Option<String>) -> Self {
        // ---
        let id = Uuid::new_v4();
        Attribute {
            id,
            table_name: table_name_for(&key.name, Uuid::new_v4()),
            name: key.name,
            sub_theme,
            unit: key.unit,
            unit_value: key.unit_value,
            description,
        }
    }

    pub fn key(&self) -> AttributeKey {
        AttributeKey {
            name: self.name.clone(),
            unit: self.unit,
            unit_value: self.unit_value.clone(),
        }
    }
}

/// Uniqueness key of an [`Attribute`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeKey {
    pub name: String,
    pub unit: Option<i32>,
    pub unit_value: Option<String>,
}

/// Longest attribute-name prefix kept in a table name. Postgres truncates
/// identifiers at 63 bytes and the uuid suffix takes 33.
const TABLE_PREFIX_MAX: usize = 29;

/// Generate a lowercase table name `<sanitised name>_<uuid>`.
pub fn table_name_for(attribute: &str, suffix: Uuid) -> String {
    // ---
    let mut prefix: String = attribute
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(TABLE_PREFIX_MAX)
        .collect();

    if !prefix.starts_with(|c: char| c.is_ascii_alphabetic()) {
        prefix.insert(0, 'a');
    }

    format!("{}_{}", prefix, suffix.simple())
}

/// Records that a sensor emits an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, sqlx::FromRow)]
pub struct SensorAttribute {
    pub s_id: Uuid,
    pub a_id: Uuid,
}

/// One reading destined for an attribute table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ValueRow {
    // ---
    pub s_id: Uuid,
    pub value: String,
    pub api_timestamp: DateTime<Utc>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ValueRow {
    /// Primary key of the row inside its attribute table.
    pub fn key(&self) -> (Uuid, &str, DateTime<Utc>) {
        (self.s_id, self.value.as_str(), self.api_timestamp)
    }
}
