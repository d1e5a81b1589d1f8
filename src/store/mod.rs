//! Persistence seam for the ingestion pipeline and the query engine.
//!
//! Everything that touches storage goes through [`Store`]. Two backends ship
//! with the crate:
//! - [`PgStore`]: PostgreSQL via `sqlx`, used by the service binary
//! - [`MemoryStore`]: in-process, same semantics, used by tests and dry runs
//!
//! Value tables are addressed by name because they are created at runtime,
//! one per attribute. Every backend validates those names with
//! [`validate_identifier`] before they reach a statement.

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Api, Attribute, AttributeKey, Location, NewApi, Sensor, SensorAttribute, ValueRow};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// Errors raised by a [`Store`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row with the same primary key already exists. The enclosing
    /// transaction has been rolled back.
    #[error("duplicate key: {0}")]
    Conflict(String),

    #[error("invalid table identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        // ---
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(e),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Rows to insert into one attribute table.
#[derive(Debug, Clone, Copy)]
pub struct TableBatch<'a> {
    pub table: &'a str,
    pub rows: &'a [ValueRow],
}

/// Sort order applied to value reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Read filter for an attribute table. `None` fields do not restrict.
#[derive(Debug, Clone, Default)]
pub struct ValueFilter {
    /// Inclusive `[from, to]` window on the source timestamp.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub sensor_id: Option<Uuid>,
    pub order: ValueOrder,
    pub limit: Option<i64>,
    pub offset: i64,
}

impl ValueFilter {
    pub fn latest(limit: i64) -> Self {
        ValueFilter {
            order: ValueOrder::NewestFirst,
            limit: Some(limit),
            ..Default::default()
        }
    }

    fn matches(&self, row: &ValueRow) -> bool {
        // ---
        let in_window = self
            .window
            .map_or(true, |(from, to)| row.api_timestamp >= from && row.api_timestamp <= to);
        let for_sensor = self.sensor_id.map_or(true, |s| row.s_id == s);
        in_window && for_sensor
    }
}

/// Storage backend used by the pipeline and the query engine.
///
/// Lookups return `Ok(None)` when nothing matches; only backend failures are
/// errors. [`Store::insert_values`] is all-or-nothing across every batch it
/// receives.
pub trait Store: Send + Sync {
    // ---
    /// Get-or-create an API by its unique name.
    fn register_api(&self, api: &NewApi) -> impl Future<Output = StoreResult<Api>> + Send;

    fn update_api_credentials(
        &self,
        api_id: i64,
        api_key: &str,
        token_expiry: Option<DateTime<Utc>>,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn find_location(&self, lat: f64, lon: f64) -> impl Future<Output = StoreResult<Option<Location>>> + Send;

    fn insert_location(&self, lat: f64, lon: f64) -> impl Future<Output = StoreResult<Location>> + Send;

    fn find_sensor_by_name(&self, name: &str) -> impl Future<Output = StoreResult<Option<Sensor>>> + Send;

    fn find_sensor_by_name_location(
        &self,
        name: &str,
        l_id: i64,
    ) -> impl Future<Output = StoreResult<Option<Sensor>>> + Send;

    fn find_sensor_by_name_api(
        &self,
        name: &str,
        a_id: i64,
    ) -> impl Future<Output = StoreResult<Option<Sensor>>> + Send;

    fn find_sensor_by_api_location_name(
        &self,
        a_id: i64,
        l_id: i64,
        name: &str,
    ) -> impl Future<Output = StoreResult<Option<Sensor>>> + Send;

    fn insert_sensor(&self, sensor: &Sensor) -> impl Future<Output = StoreResult<()>> + Send;

    /// Exact match on (name, unit id, unit value).
    fn find_attribute(&self, key: &AttributeKey) -> impl Future<Output = StoreResult<Option<Attribute>>> + Send;

    fn find_attributes_by_names(&self, names: &[String]) -> impl Future<Output = StoreResult<Vec<Attribute>>> + Send;

    fn insert_attribute(&self, attribute: &Attribute) -> impl Future<Output = StoreResult<()>> + Send;

    /// Returns `true` when the link was created, `false` when it already existed.
    fn link_sensor_attribute(&self, link: &SensorAttribute) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Names of every table currently in the catalog.
    fn list_tables(&self) -> impl Future<Output = StoreResult<Vec<String>>> + Send;

    /// Create a value table with the fixed reading schema. No-op when it exists.
    fn create_value_table(&self, table: &str) -> impl Future<Output = StoreResult<()>> + Send;

    /// Insert every batch in one transaction. Any duplicate key rolls back
    /// the whole call and yields [`StoreError::Conflict`].
    fn insert_values(&self, batches: &[TableBatch<'_>]) -> impl Future<Output = StoreResult<()>> + Send;

    /// Total rows in a value table, ignoring any filter.
    fn count_values(&self, table: &str) -> impl Future<Output = StoreResult<i64>> + Send;

    fn fetch_values(
        &self,
        table: &str,
        filter: &ValueFilter,
    ) -> impl Future<Output = StoreResult<Vec<ValueRow>>> + Send;
}

/// Accept only the lowercase identifiers produced by
/// [`crate::models::table_name_for`].
pub fn validate_identifier(name: &str) -> StoreResult<&str> {
    // ---
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}
