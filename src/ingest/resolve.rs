//! Entity resolution: canonical rows to persisted locations, sensors and
//! attributes.
//!
//! All caches here live for one ingestion call only.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::normalize::CanonicalRow;
use crate::models::{Attribute, AttributeKey, Location, Sensor, SensorAttribute};
use crate::store::{Store, StoreResult};

// ---

/// How an incoming sensor is matched against sensors already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorExistence {
    ByName,
    ByNameLocation,
    ByNameApi,
    /// Always create, relying on in-run dedup only.
    #[default]
    None,
}

/// Pick the entry for `index` out of a list parallel to `count` items.
///
/// A list exactly `count` long maps one-to-one; any other non-empty list
/// broadcasts its first entry; an empty list yields `None`.
pub fn broadcast<T: Clone>(list: &[T], index: usize, count: usize) -> Option<T> {
    // ---
    if list.len() == count {
        list.get(index).cloned()
    } else {
        list.first().cloned()
    }
}

pub fn sensor_display_name(prefix: Option<&str>, raw: &str) -> String {
    match prefix {
        Some(p) => format!("{p}{raw}"),
        None => raw.to_string(),
    }
}

/// Sensors resolved during one call, keyed by display name.
pub type SensorCache = HashMap<String, Sensor>;

/// Resolves sensors (and their locations) for one API within one call.
pub struct SensorResolver<'s, S> {
    store: &'s S,
    api_id: i64,
    prefix: Option<String>,
    strategy: SensorExistence,
    is_dependent: bool,
    sensors: SensorCache,
    seen: HashSet<(i64, i64, String)>,
    created: usize,
}

impl<'s, S: Store> SensorResolver<'s, S> {
    pub fn new(store: &'s S, api_id: i64) -> Self {
        SensorResolver {
            store,
            api_id,
            prefix: None,
            strategy: SensorExistence::None,
            is_dependent: false,
            sensors: HashMap::new(),
            seen: HashSet::new(),
            created: 0,
        }
    }

    pub fn prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn strategy(mut self, strategy: SensorExistence) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn dependent(mut self, is_dependent: bool) -> Self {
        self.is_dependent = is_dependent;
        self
    }

    /// Resolve the sensor of every row, creating what does not exist yet.
    pub async fn resolve(mut self, rows: &[CanonicalRow]) -> StoreResult<SensorCache> {
        // ---
        for row in rows {
            self.resolve_one(row).await?;
        }
        debug!(
            "Resolved {} sensors ({} created) for API {}",
            self.sensors.len(),
            self.created,
            self.api_id
        );
        Ok(self.sensors)
    }

    async fn resolve_one(&mut self, row: &CanonicalRow) -> StoreResult<()> {
        // ---
        let name = sensor_display_name(self.prefix.as_deref(), &row.sensor);

        if let Some(existing) = self.find_existing(&name, row).await? {
            self.sensors.insert(existing.name.clone(), existing);
            return Ok(());
        }

        let loc = self.location(row.latitude, row.longitude).await?;

        let key = (self.api_id, loc.id, name.clone());
        if self.seen.contains(&key) {
            return Ok(());
        }

        if self.is_dependent {
            if let Some(existing) = self
                .store
                .find_sensor_by_api_location_name(self.api_id, loc.id, &name)
                .await?
            {
                info!(
                    "{} sensor already exists with API ID: {} and Location ID: {}",
                    name, self.api_id, loc.id
                );
                self.sensors.insert(existing.name.clone(), existing);
                self.seen.insert(key);
                return Ok(());
            }
        }

        let sensor = Sensor::new(self.api_id, loc.id, name);
        self.store.insert_sensor(&sensor).await?;
        self.seen.insert(key);
        self.created += 1;
        self.sensors.insert(sensor.name.clone(), sensor);
        Ok(())
    }

    async fn find_existing(&self, name: &str, row: &CanonicalRow) -> StoreResult<Option<Sensor>> {
        // ---
        match self.strategy {
            SensorExistence::ByName => self.store.find_sensor_by_name(name).await,
            SensorExistence::ByNameApi => self.store.find_sensor_by_name_api(name, self.api_id).await,
            SensorExistence::ByNameLocation => {
                match self.store.find_location(row.latitude, row.longitude).await? {
                    Some(loc) => self.store.find_sensor_by_name_location(name, loc.id).await,
                    None => Ok(None),
                }
            }
            SensorExistence::None => Ok(None),
        }
    }

    async fn location(&self, lat: f64, lon: f64) -> StoreResult<Location> {
        // ---
        match self.store.find_location(lat, lon).await? {
            Some(loc) => Ok(loc),
            None => self.store.insert_location(lat, lon).await,
        }
    }
}

// ---

/// Attribute names with their parallel metadata lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSpecs {
    pub names: Vec<String>,
    pub unit_values: Vec<Option<String>>,
    pub descriptions: Vec<Option<String>>,
    pub unit_ids: Vec<Option<i32>>,
    pub sub_themes: Vec<Option<i32>>,
}

impl AttributeSpecs {
    /// Unique attribute keys with their sub-theme and description, in
    /// first-seen order.
    pub fn entries(&self) -> Vec<(AttributeKey, Option<i32>, Option<String>)> {
        // ---
        let n = self.names.len();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for (i, name) in self.names.iter().enumerate() {
            let key = AttributeKey {
                name: name.clone(),
                unit: broadcast(&self.unit_ids, i, n).flatten(),
                unit_value: broadcast(&self.unit_values, i, n).flatten(),
            };
            if !seen.insert(key.clone()) {
                continue;
            }
            let sub_theme = broadcast(&self.sub_themes, i, n).flatten();
            let description = broadcast(&self.descriptions, i, n).flatten();
            entries.push((key, sub_theme, description));
        }
        entries
    }
}

/// Reuse or create one [`Attribute`] per unique (name, unit id, unit value).
pub async fn resolve_attributes<S: Store>(store: &S, specs: &AttributeSpecs) -> StoreResult<Vec<Attribute>> {
    // ---
    let mut attributes = Vec::new();

    for (key, sub_theme, description) in specs.entries() {
        if let Some(existing) = store.find_attribute(&key).await? {
            info!(
                "{} attribute with Unit ID: {:?} and Unit Value: {:?} already exists",
                key.name, key.unit, key.unit_value
            );
            attributes.push(existing);
            continue;
        }

        let attribute = Attribute::new(key, sub_theme, description);
        store.insert_attribute(&attribute).await?;
        attributes.push(attribute);
    }

    Ok(attributes)
}

/// Link every sensor to every attribute; returns the number of new links.
pub async fn link_sensor_attributes<'a, S, I>(store: &S, sensors: I, attributes: &[Attribute]) -> StoreResult<usize>
where
    S: Store,
    I: IntoIterator<Item = &'a Sensor>,
{
    // ---
    let mut created = 0;
    for sensor in sensors {
        for attr in attributes {
            let link = SensorAttribute {
                s_id: sensor.id,
                a_id: attr.id,
            };
            if store.link_sensor_attribute(&link).await? {
                created += 1;
            } else {
                debug!("Sensor ID: {}, Attribute ID: {} already linked", sensor.id, attr.id);
            }
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::MemoryStore;

    fn row(sensor: &str, lat: f64, lon: f64) -> CanonicalRow {
        CanonicalRow {
            sensor: sensor.to_string(),
            attribute: "NO2".to_string(),
            value: "1".to_string(),
            latitude: lat,
            longitude: lon,
            description: None,
            timestamp: None,
            unit: None,
            unit_value: None,
        }
    }

    #[test]
    fn test_broadcast_one_to_one_and_first() {
        // ---
        let one = vec!["ppm".to_string()];
        let three = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let none: Vec<String> = vec![];

        for i in 0..3 {
            assert_eq!(broadcast(&one, i, 3).as_deref(), Some("ppm"));
            assert_eq!(broadcast(&none, i, 3), None);
        }
        assert_eq!(broadcast(&three, 0, 3).as_deref(), Some("a"));
        assert_eq!(broadcast(&three, 2, 3).as_deref(), Some("c"));

        // Neither one nor N long: first entry wins.
        let two = vec![1, 2];
        assert_eq!(broadcast(&two, 2, 3), Some(1));
    }

    #[test]
    fn test_attribute_specs_dedup_by_unit_combination() {
        // ---
        let specs = AttributeSpecs {
            names: vec!["NO2".into(), "NO2".into(), "NO2".into()],
            unit_values: vec![Some("1".into()), Some("1".into()), Some("1000".into())],
            descriptions: vec![],
            unit_ids: vec![Some(1)],
            sub_themes: vec![Some(4)],
        };

        let entries = specs.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|(k, st, _)| k.unit == Some(1) && *st == Some(4)));
        assert_eq!(entries[1].0.unit_value.as_deref(), Some("1000"));
    }

    #[tokio::test]
    async fn test_by_name_reuses_existing_sensor() {
        // ---
        let store = MemoryStore::new();
        let rows = vec![row("BG1", 51.0, 0.1)];

        let first = SensorResolver::new(&store, 1)
            .strategy(SensorExistence::ByName)
            .resolve(&rows)
            .await
            .unwrap();
        let second = SensorResolver::new(&store, 1)
            .strategy(SensorExistence::ByName)
            .resolve(&rows)
            .await
            .unwrap();

        assert_eq!(store.sensor_count(), 1);
        assert_eq!(first["BG1"].id, second["BG1"].id);
    }

    #[tokio::test]
    async fn test_none_strategy_dedups_within_run_only() {
        // ---
        let store = MemoryStore::new();
        let rows = vec![row("BG1", 51.0, 0.1), row("BG1", 51.0, 0.1)];

        SensorResolver::new(&store, 1).resolve(&rows).await.unwrap();
        assert_eq!(store.sensor_count(), 1);
        assert_eq!(store.location_count(), 1);

        SensorResolver::new(&store, 1).resolve(&rows).await.unwrap();
        assert_eq!(store.sensor_count(), 2);
        assert_eq!(store.location_count(), 1);
    }

    #[tokio::test]
    async fn test_dependent_sensor_resolves_within_api_and_location() {
        // ---
        let store = MemoryStore::new();
        let rows = vec![row("S", 1.0, 1.0)];

        SensorResolver::new(&store, 7).dependent(true).resolve(&rows).await.unwrap();
        SensorResolver::new(&store, 7).dependent(true).resolve(&rows).await.unwrap();
        assert_eq!(store.sensor_count(), 1);

        // Same name under another API is a different sensor.
        SensorResolver::new(&store, 8).dependent(true).resolve(&rows).await.unwrap();
        assert_eq!(store.sensor_count(), 2);
    }

    #[tokio::test]
    async fn test_by_name_location_distinguishes_locations() {
        // ---
        let store = MemoryStore::new();
        let here = vec![row("S", 1.0, 1.0)];
        let there = vec![row("S", 2.0, 2.0)];

        for rows in [&here, &here, &there] {
            SensorResolver::new(&store, 1)
                .strategy(SensorExistence::ByNameLocation)
                .resolve(rows)
                .await
                .unwrap();
        }
        assert_eq!(store.sensor_count(), 2);
    }

    #[tokio::test]
    async fn test_prefix_applies_to_display_name() {
        // ---
        let store = MemoryStore::new();
        let sensors = SensorResolver::new(&store, 1)
            .prefix(Some("kcl_".into()))
            .resolve(&[row("BG1", 0.0, 0.0)])
            .await
            .unwrap();
        assert!(sensors.contains_key("kcl_BG1"));
    }

    #[tokio::test]
    async fn test_resolve_attributes_reuses_exact_key() {
        // ---
        let store = MemoryStore::new();
        let specs = AttributeSpecs {
            names: vec!["NO2".into(), "SO2".into()],
            unit_values: vec![Some("1".into())],
            unit_ids: vec![Some(1)],
            ..Default::default()
        };

        let first = resolve_attributes(&store, &specs).await.unwrap();
        let second = resolve_attributes(&store, &specs).await.unwrap();

        assert_eq!(store.attribute_count(), 2);
        assert_eq!(first[0].table_name, second[0].table_name);
        assert_eq!(first[1].unit_value.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_link_sensor_attributes_is_idempotent() {
        // ---
        let store = MemoryStore::new();
        let sensors = SensorResolver::new(&store, 1)
            .resolve(&[row("A", 0.0, 0.0), row("B", 1.0, 1.0)])
            .await
            .unwrap();
        let attrs = resolve_attributes(
            &store,
            &AttributeSpecs {
                names: vec!["NO2".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(link_sensor_attributes(&store, sensors.values(), &attrs).await.unwrap(), 2);
        assert_eq!(link_sensor_attributes(&store, sensors.values(), &attrs).await.unwrap(), 0);
        assert_eq!(store.link_count(), 2);
    }
}
