//! In-process backend for [`Store`].
//!
//! Mirrors the Postgres semantics the pipeline relies on: case-insensitive
//! catalog, `CREATE TABLE IF NOT EXISTS`, a composite primary key per value
//! table, a sensor foreign key on value rows, and all-or-nothing inserts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{validate_identifier, Store, StoreError, StoreResult, TableBatch, ValueFilter, ValueOrder};
use crate::models::{Api, Attribute, AttributeKey, Location, NewApi, Sensor, SensorAttribute, ValueRow};

// ---

#[derive(Debug, Default)]
struct MemoryState {
    apis: Vec<Api>,
    locations: Vec<Location>,
    sensors: Vec<Sensor>,
    attributes: Vec<Attribute>,
    links: HashSet<SensorAttribute>,
    tables: BTreeMap<String, Vec<ValueRow>>,
    tables_created: usize,
}

/// Thread-safe in-memory [`Store`]. Clones share the same state.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn api_count(&self) -> usize {
        self.state().apis.len()
    }

    pub fn sensor_count(&self) -> usize {
        self.state().sensors.len()
    }

    pub fn location_count(&self) -> usize {
        self.state().locations.len()
    }

    pub fn attribute_count(&self) -> usize {
        self.state().attributes.len()
    }

    pub fn link_count(&self) -> usize {
        self.state().links.len()
    }

    /// Number of `CREATE TABLE` statements that actually created a table.
    pub fn tables_created(&self) -> usize {
        self.state().tables_created
    }

    /// Snapshot of a value table in insertion order.
    pub fn rows(&self, table: &str) -> Vec<ValueRow> {
        self.state()
            .tables
            .get(&table.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Register a table under its exact name, the way an external migration would.
    pub fn create_foreign_table(&self, table: &str) {
        self.state().tables.entry(table.to_string()).or_default();
    }
}

impl Store for MemoryStore {
    // ---
    async fn register_api(&self, api: &NewApi) -> StoreResult<Api> {
        // ---
        let mut state = self.state();
        if let Some(existing) = state.apis.iter().find(|a| a.name == api.name) {
            return Ok(existing.clone());
        }
        let registered = Api {
            id: state.apis.len() as i64 + 1,
            name: api.name.clone(),
            url: api.url.clone(),
            refresh_time: api.refresh_time,
            api_key: api.api_key.clone(),
            api_class: api.api_class.clone(),
            token_expiry: api.token_expiry,
        };
        state.apis.push(registered.clone());
        Ok(registered)
    }

    async fn update_api_credentials(
        &self,
        api_id: i64,
        api_key: &str,
        token_expiry: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        // ---
        let mut state = self.state();
        let api = state
            .apis
            .iter_mut()
            .find(|a| a.id == api_id)
            .ok_or_else(|| StoreError::NotFound(format!("api {api_id}")))?;
        api.api_key = api_key.to_string();
        api.token_expiry = token_expiry;
        Ok(())
    }

    async fn find_location(&self, lat: f64, lon: f64) -> StoreResult<Option<Location>> {
        Ok(self
            .state()
            .locations
            .iter()
            .find(|l| l.lat == lat && l.lon == lon)
            .cloned())
    }

    async fn insert_location(&self, lat: f64, lon: f64) -> StoreResult<Location> {
        // ---
        let mut state = self.state();
        let loc = Location {
            id: state.locations.len() as i64 + 1,
            lat,
            lon,
            geo: Location::point_wkt(lat, lon),
        };
        state.locations.push(loc.clone());
        Ok(loc)
    }

    async fn find_sensor_by_name(&self, name: &str) -> StoreResult<Option<Sensor>> {
        Ok(self.state().sensors.iter().find(|s| s.name == name).cloned())
    }

    async fn find_sensor_by_name_location(&self, name: &str, l_id: i64) -> StoreResult<Option<Sensor>> {
        Ok(self
            .state()
            .sensors
            .iter()
            .find(|s| s.name == name && s.l_id == l_id)
            .cloned())
    }

    async fn find_sensor_by_name_api(&self, name: &str, a_id: i64) -> StoreResult<Option<Sensor>> {
        Ok(self
            .state()
            .sensors
            .iter()
            .find(|s| s.name == name && s.a_id == a_id)
            .cloned())
    }

    async fn find_sensor_by_api_location_name(
        &self,
        a_id: i64,
        l_id: i64,
        name: &str,
    ) -> StoreResult<Option<Sensor>> {
        Ok(self
            .state()
            .sensors
            .iter()
            .find(|s| s.a_id == a_id && s.l_id == l_id && s.name == name)
            .cloned())
    }

    async fn insert_sensor(&self, sensor: &Sensor) -> StoreResult<()> {
        // ---
        let mut state = self.state();
        if state.sensors.iter().any(|s| s.id == sensor.id) {
            return Err(StoreError::Conflict(format!("sensor {}", sensor.id)));
        }
        state.sensors.push(sensor.clone());
        Ok(())
    }

    async fn find_attribute(&self, key: &AttributeKey) -> StoreResult<Option<Attribute>> {
        Ok(self
            .state()
            .attributes
            .iter()
            .find(|a| a.key() == *key)
            .cloned())
    }

    async fn find_attributes_by_names(&self, names: &[String]) -> StoreResult<Vec<Attribute>> {
        // ---
        let mut found: Vec<Attribute> = self
            .state()
            .attributes
            .iter()
            .filter(|a| names.contains(&a.name))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn insert_attribute(&self, attribute: &Attribute) -> StoreResult<()> {
        // ---
        let mut state = self.state();
        if state
            .attributes
            .iter()
            .any(|a| a.id == attribute.id || a.table_name == attribute.table_name)
        {
            return Err(StoreError::Conflict(format!("attribute {}", attribute.table_name)));
        }
        state.attributes.push(attribute.clone());
        Ok(())
    }

    async fn link_sensor_attribute(&self, link: &SensorAttribute) -> StoreResult<bool> {
        Ok(self.state().links.insert(link.clone()))
    }

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        Ok(self.state().tables.keys().cloned().collect())
    }

    async fn create_value_table(&self, table: &str) -> StoreResult<()> {
        // ---
        let table = validate_identifier(table)?;
        let mut state = self.state();
        if !state.tables.contains_key(table) {
            state.tables.insert(table.to_string(), Vec::new());
            state.tables_created += 1;
        }
        Ok(())
    }

    async fn insert_values(&self, batches: &[TableBatch<'_>]) -> StoreResult<()> {
        // ---
        let mut state = self.state();
        let known_sensors: HashSet<Uuid> = state.sensors.iter().map(|s| s.id).collect();

        // Validate everything before touching state so a failure leaves no trace.
        let mut staged: HashMap<&str, HashSet<(Uuid, &str, DateTime<Utc>)>> = HashMap::new();
        for batch in batches {
            let table = validate_identifier(batch.table)?;
            let existing = state
                .tables
                .get(table)
                .ok_or_else(|| StoreError::NotFound(format!("table {table}")))?;
            let seen = staged.entry(table).or_default();

            for row in batch.rows {
                if !known_sensors.contains(&row.s_id) {
                    return Err(StoreError::NotFound(format!("sensor {}", row.s_id)));
                }
                let key = row.key();
                if existing.iter().any(|r| r.key() == key) || !seen.insert(key) {
                    return Err(StoreError::Conflict(format!(
                        "{table}: ({}, {}, {})",
                        row.s_id, row.value, row.api_timestamp
                    )));
                }
            }
        }

        for batch in batches {
            if let Some(rows) = state.tables.get_mut(batch.table) {
                rows.extend_from_slice(batch.rows);
            }
        }
        Ok(())
    }

    async fn count_values(&self, table: &str) -> StoreResult<i64> {
        // ---
        let table = validate_identifier(table)?;
        let state = self.state();
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::NotFound(format!("table {table}")))?;
        Ok(rows.len() as i64)
    }

    async fn fetch_values(&self, table: &str, filter: &ValueFilter) -> StoreResult<Vec<ValueRow>> {
        // ---
        let table = validate_identifier(table)?;
        let state = self.state();
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::NotFound(format!("table {table}")))?;

        let mut selected: Vec<ValueRow> = rows.iter().filter(|r| filter.matches(r)).cloned().collect();
        match filter.order {
            ValueOrder::OldestFirst => selected.sort_by_key(|r| r.api_timestamp),
            ValueOrder::NewestFirst => selected.sort_by(|a, b| b.api_timestamp.cmp(&a.api_timestamp)),
        }

        let offset = usize::try_from(filter.offset).unwrap_or(0);
        let limit = filter
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);
        Ok(selected.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn row(s_id: Uuid, value: &str, hour: u32) -> ValueRow {
        ValueRow {
            s_id,
            value: value.to_string(),
            api_timestamp: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_insert_values_is_all_or_nothing() {
        // ---
        let store = MemoryStore::new();
        let sensor = Sensor::new(1, 1, "s1");
        store.insert_sensor(&sensor).await.unwrap();
        store.create_value_table("no2_x").await.unwrap();

        let first = [row(sensor.id, "1", 0)];
        store
            .insert_values(&[TableBatch { table: "no2_x", rows: &first }])
            .await
            .unwrap();

        let second = [row(sensor.id, "2", 1), row(sensor.id, "1", 0)];
        let err = store
            .insert_values(&[TableBatch { table: "no2_x", rows: &second }])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.rows("no2_x").len(), 1);
    }

    #[tokio::test]
    async fn test_insert_values_rejects_unknown_sensor() {
        // ---
        let store = MemoryStore::new();
        store.create_value_table("no2_x").await.unwrap();

        let rows = [row(Uuid::new_v4(), "1", 0)];
        let err = store
            .insert_values(&[TableBatch { table: "no2_x", rows: &rows }])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_register_api_is_get_or_create() {
        // ---
        let store = MemoryStore::new();
        let api = NewApi {
            name: "kcl".into(),
            url: "http://example.invalid".into(),
            refresh_time: 3600,
            api_key: String::new(),
            api_class: "HttpJsonImporter".into(),
            token_expiry: None,
        };

        let a = tokio_test::block_on(store.register_api(&api)).unwrap();
        let b = tokio_test::block_on(store.register_api(&api)).unwrap();
        assert_eq!(a.id, b.id);
    }
}
