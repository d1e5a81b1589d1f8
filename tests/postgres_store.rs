//! Postgres-backed checks. Skipped unless `DATABASE_URL` is set.

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::OnceCell;
use uuid::Uuid;

use sensorflow_harmoniser::ingest::{ingest, ColumnMapping, Extract, IngestOptions, IngestOutcome, SensorExistence};
use sensorflow_harmoniser::models::{Attribute, AttributeKey, NewApi, Sensor, ValueRow};
use sensorflow_harmoniser::observer::RecordingObserver;
use sensorflow_harmoniser::query::{run_query, AttributeData, AttributeQuery};
use sensorflow_harmoniser::schema::create_schema;
use sensorflow_harmoniser::store::{PgStore, Store, StoreError, TableBatch, ValueFilter};
use sensorflow_harmoniser::NaiveForecaster;

// ---

static SCHEMA: OnceCell<()> = OnceCell::const_new();

async fn connect() -> Result<Option<PgStore>> {
    // ---
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return Ok(None);
    };
    let pool = PgPoolOptions::new().max_connections(2).connect(&url).await?;
    // Concurrent CREATE TABLE IF NOT EXISTS can still race in the catalog.
    SCHEMA.get_or_try_init(|| create_schema(&pool)).await?;
    Ok(Some(PgStore::new(pool)))
}

fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

#[tokio::test]
async fn register_api_is_get_or_create() -> Result<()> {
    // ---
    let Some(store) = connect().await? else {
        return Ok(());
    };
    let api = NewApi {
        name: unique("api"),
        url: "https://example.invalid/?key=".into(),
        refresh_time: 60,
        api_key: "k1".into(),
        api_class: "test".into(),
        token_expiry: None,
    };

    let first = store.register_api(&api).await?;
    let second = store.register_api(&api).await?;
    assert_eq!(first.id, second.id);

    let expiry = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    store.update_api_credentials(first.id, "k2", Some(expiry)).await?;
    let refreshed = store.register_api(&api).await?;
    assert_eq!(refreshed.api_key, "k2");
    assert_eq!(refreshed.token_expiry, Some(expiry));
    Ok(())
}

#[tokio::test]
async fn insert_values_rolls_back_on_conflict() -> Result<()> {
    // ---
    let Some(store) = connect().await? else {
        return Ok(());
    };
    let api = store
        .register_api(&NewApi {
            name: unique("api"),
            url: String::new(),
            refresh_time: 60,
            api_key: String::new(),
            api_class: "test".into(),
            token_expiry: None,
        })
        .await?;
    let loc = store.insert_location(10.0, 20.0).await?;
    let sensor = Sensor::new(api.id, loc.id, unique("sensor"));
    store.insert_sensor(&sensor).await?;

    let attribute = Attribute::new(
        AttributeKey {
            name: unique("Attr"),
            unit: Some(1),
            unit_value: Some("1".into()),
        },
        Some(1),
        None,
    );
    store.insert_attribute(&attribute).await?;
    store.create_value_table(&attribute.table_name).await?;
    store.create_value_table(&attribute.table_name).await?;
    assert!(store.list_tables().await?.contains(&attribute.table_name));

    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let row = |value: &str, minutes: i64| ValueRow {
        s_id: sensor.id,
        value: value.to_string(),
        api_timestamp: at + Duration::minutes(minutes),
        timestamp: Some(at),
    };

    let table = attribute.table_name.as_str();
    store
        .insert_values(&[TableBatch {
            table,
            rows: &[row("1", 0)],
        }])
        .await?;

    let err = store
        .insert_values(&[TableBatch {
            table,
            rows: &[row("2", 1), row("1", 0)],
        }])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert_eq!(store.count_values(table).await?, 1);

    let latest = store.fetch_values(table, &ValueFilter::latest(5)).await?;
    assert_eq!(latest.len(), 1);
    Ok(())
}

#[tokio::test]
async fn ingest_then_query_round_trip() -> Result<()> {
    // ---
    let Some(store) = connect().await? else {
        return Ok(());
    };
    let species = unique("NO2");
    let site = unique("site");

    let mut extract = Extract::new(["site", "species", "value", "lat", "lon", "when"]);
    for (value, when) in [("1", "2024-03-01 00:00:00"), ("2", "2024-03-01 01:00:00"), ("3", "2024-03-01 02:00:00")] {
        extract.push_row([
            Some(site.as_str()),
            Some(species.as_str()),
            Some(value),
            Some("48.1"),
            Some("11.5"),
            Some(when),
        ]);
    }
    let mapping = ColumnMapping::long("site", "species", "value", "lat", "lon").with_source_timestamp("when");
    let options = IngestOptions {
        sensor_existence: SensorExistence::ByName,
        ..Default::default()
    };
    let api = NewApi {
        name: unique("api"),
        url: String::new(),
        refresh_time: 60,
        api_key: String::new(),
        api_class: "test".into(),
        token_expiry: None,
    };

    let observer = RecordingObserver::new();
    let first = ingest(&store, &api, &extract, &mapping, &options, &observer).await?;
    assert!(matches!(first, IngestOutcome::Loaded(ref r) if r.load.inserted == 3));
    let second = ingest(&store, &api, &extract, &mapping, &options, &observer).await?;
    assert!(matches!(second, IngestOutcome::Loaded(ref r) if r.load.inserted == 0));

    let mut query = AttributeQuery::new([species.as_str()]);
    query.limit = 2;
    let response = run_query(&store, &query, &NaiveForecaster).await?;
    assert_eq!(response.attributes[0].total_row_count, 3);
    let AttributeData::Values { values } = &response.attributes[0].data else {
        panic!("expected values");
    };
    let got: Vec<&str> = values.iter().map(|v| v.value.as_str()).collect();
    assert_eq!(got, vec!["3", "2"]);
    Ok(())
}
