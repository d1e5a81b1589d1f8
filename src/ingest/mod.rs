//! Write path: normalize, resolve entities, provision tables, load values.
//!
//! [`ingest`] runs the whole path for one extract from one API. Every cache
//! it builds (sensors by name, attributes by key, table handles) is local
//! to the call and dropped when it returns.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{Attribute, NewApi};
use crate::observer::{Phase, PipelineObserver};
use crate::schema::ensure_value_tables;
use crate::store::{Store, StoreError};

pub mod loader;
pub mod normalize;
pub mod resolve;

pub use loader::{LoadReport, Loader, TableLoad, ValueCandidate, DEFAULT_BATCH_SIZE};
pub use normalize::{
    normalize, parse_source_timestamp, AttributeLayout, CanonicalRow, ColumnMapping, Extract, NoData, Normalized,
    UnitColumns,
};
pub use resolve::{
    broadcast, link_sensor_attributes, resolve_attributes, sensor_display_name, AttributeSpecs, SensorCache,
    SensorExistence, SensorResolver,
};

// ---

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid ingestion options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Optional settings for one ingestion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestOptions {
    // ---
    pub sensor_prefix: Option<String>,
    /// Column holding a per-row unit id (long layout).
    pub unit_tag: Option<String>,
    /// Column holding a per-row unit value (long layout).
    pub unit_value_tag: Option<String>,
    pub unit_id_default: i32,
    pub unit_value_default: String,
    pub sub_theme_default: i32,
    pub sensor_existence: SensorExistence,
    pub is_dependent: bool,
    pub batch_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            sensor_prefix: None,
            unit_tag: None,
            unit_value_tag: None,
            unit_id_default: 1,
            unit_value_default: "1".to_string(),
            sub_theme_default: 1,
            sensor_existence: SensorExistence::None,
            is_dependent: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub api_id: i64,
    pub rows: usize,
    pub sensors: usize,
    pub attributes: usize,
    pub links_created: usize,
    pub tables_created: usize,
    pub load: LoadReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Loaded(IngestReport),
    /// Nothing to ingest; the run is a soft no-op.
    Skipped(NoData),
}

/// Ingest one extract for one API.
pub async fn ingest<S: Store>(
    store: &S,
    api: &NewApi,
    extract: &Extract,
    mapping: &ColumnMapping,
    options: &IngestOptions,
    observer: &dyn PipelineObserver,
) -> Result<IngestOutcome, IngestError> {
    // ---
    match run(store, api, extract, mapping, options, observer).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            observer.on_phase(Phase::Failed { error: e.to_string() });
            Err(e)
        }
    }
}

async fn run<S: Store>(
    store: &S,
    api: &NewApi,
    extract: &Extract,
    mapping: &ColumnMapping,
    options: &IngestOptions,
    observer: &dyn PipelineObserver,
) -> Result<IngestOutcome, IngestError> {
    // ---
    if options.batch_size == 0 {
        return Err(IngestError::InvalidOptions("batch_size must be positive".into()));
    }

    // The source is registered even when this poll yields nothing.
    let api_row = store.register_api(api).await?;
    observer.on_phase(Phase::RegisterApi {
        api_name: api_row.name.clone(),
    });

    let units = UnitColumns {
        unit: options.unit_tag.as_deref(),
        unit_value: options.unit_value_tag.as_deref(),
    };
    let rows = match normalize(extract, mapping, units) {
        Normalized::Rows(rows) => rows,
        Normalized::NoData(reason) => {
            warn!("Skipping ingestion for {}: {}", api.name, reason);
            observer.on_phase(Phase::Skipped {
                reason: reason.to_string(),
            });
            return Ok(IngestOutcome::Skipped(reason));
        }
    };
    observer.on_phase(Phase::Normalize { rows: rows.len() });

    let sensors = SensorResolver::new(store, api_row.id)
        .prefix(options.sensor_prefix.clone())
        .strategy(options.sensor_existence)
        .dependent(options.is_dependent)
        .resolve(&rows)
        .await?;
    observer.on_phase(Phase::ResolveSensors { sensors: sensors.len() });

    let specs = attribute_specs(&rows, mapping, options);
    let attributes = resolve_attributes(store, &specs).await?;
    observer.on_phase(Phase::ResolveAttributes {
        attributes: attributes.len(),
    });

    let links_created = link_sensor_attributes(store, sensors.values(), &attributes).await?;
    observer.on_phase(Phase::LinkSensorAttributes { created: links_created });

    let registry = ensure_value_tables(store, &attributes).await?;
    observer.on_phase(Phase::ProvisionTables {
        created: registry.created(),
    });

    // Wide attributes take their units from the mapping, not from the rows.
    let by_unit = matches!(mapping.attributes, AttributeLayout::Long { .. });
    let loads: Vec<TableLoad> = attributes
        .iter()
        .filter_map(|attr| {
            let handle = registry.get(&attr.id)?;
            Some(TableLoad {
                table: handle.table_name.clone(),
                rows: route_rows(&rows, attr, &sensors, options, by_unit),
            })
        })
        .collect();

    let load = Loader::new(store)
        .batch_size(options.batch_size)
        .load(&loads)
        .await?;
    observer.on_phase(Phase::LoadValues { inserted: load.inserted });

    let report = IngestReport {
        api_id: api_row.id,
        rows: rows.len(),
        sensors: sensors.len(),
        attributes: attributes.len(),
        links_created,
        tables_created: registry.created(),
        load,
    };
    info!(
        "Ingested {} rows for {}: {} sensors, {} attributes, {} values inserted",
        report.rows, api.name, report.sensors, report.attributes, report.load.inserted
    );
    observer.on_phase(Phase::Done);

    Ok(IngestOutcome::Loaded(report))
}

/// Attribute names and metadata lists for the resolver.
fn attribute_specs(rows: &[CanonicalRow], mapping: &ColumnMapping, options: &IngestOptions) -> AttributeSpecs {
    // ---
    let or_default = |list: Vec<Option<String>>, default: &str| {
        if list.is_empty() {
            vec![Some(default.to_string())]
        } else {
            list
        }
    };

    match &mapping.attributes {
        AttributeLayout::Long { .. } => AttributeSpecs {
            names: rows.iter().map(|r| r.attribute.clone()).collect(),
            unit_values: match options.unit_value_tag {
                Some(_) => rows.iter().map(|r| r.unit_value.clone()).collect(),
                None => vec![Some(options.unit_value_default.clone())],
            },
            descriptions: rows.iter().map(|r| r.description.clone()).collect(),
            unit_ids: match options.unit_tag {
                Some(_) => rows.iter().map(|r| r.unit).collect(),
                None => vec![Some(options.unit_id_default)],
            },
            sub_themes: vec![Some(options.sub_theme_default)],
        },
        AttributeLayout::Wide {
            columns,
            unit_values,
            descriptions,
            unit_ids,
            sub_themes,
        } => AttributeSpecs {
            names: columns.clone(),
            unit_values: or_default(unit_values.iter().cloned().map(Some).collect(), &options.unit_value_default),
            descriptions: descriptions.iter().cloned().map(Some).collect(),
            unit_ids: if unit_ids.is_empty() {
                vec![Some(options.unit_id_default)]
            } else {
                unit_ids.iter().copied().map(Some).collect()
            },
            sub_themes: if sub_themes.is_empty() {
                vec![Some(options.sub_theme_default)]
            } else {
                sub_themes.iter().copied().map(Some).collect()
            },
        },
    }
}

/// Candidates for one attribute, in source order.
///
/// With `by_unit`, rows carrying their own unit id or unit value only go to
/// the attribute with the same unit combination.
fn route_rows(
    rows: &[CanonicalRow],
    attr: &Attribute,
    sensors: &SensorCache,
    options: &IngestOptions,
    by_unit: bool,
) -> Vec<ValueCandidate> {
    // ---
    let mut routed = Vec::new();

    for row in rows {
        if row.attribute != attr.name {
            continue;
        }
        if by_unit {
            let unit_value_differs = row.unit_value.is_some() && row.unit_value != attr.unit_value;
            let unit_differs = row.unit.is_some() && row.unit != attr.unit;
            if unit_value_differs || unit_differs {
                debug!(
                    "Row of {} with unit {:?}/{:?} does not belong to {}",
                    row.sensor, row.unit, row.unit_value, attr.table_name
                );
                continue;
            }
        }

        let sensor_name = sensor_display_name(options.sensor_prefix.as_deref(), &row.sensor);
        let Some(sensor) = sensors.get(&sensor_name) else {
            warn!("No resolved sensor for {}, dropping value", sensor_name);
            continue;
        };

        routed.push(ValueCandidate {
            sensor_name,
            s_id: sensor.id,
            value: row.value.clone(),
            api_timestamp: row.timestamp,
        });
    }
    routed
}
