//! Database schema management.
//!
//! Two layers:
//! - [`create_schema`]: the static dimension tables, applied once on startup
//!   from `main.rs`
//! - [`ensure_value_tables`]: one value table per attribute, provisioned on
//!   demand during every ingestion call

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::Attribute;
use crate::store::{Store, StoreResult};

// ---

/// Create the static schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist. Value
/// tables are not created here.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS apis (
            id           BIGSERIAL   PRIMARY KEY,
            name         TEXT        NOT NULL UNIQUE,
            url          TEXT        NOT NULL,
            refresh_time BIGINT      NOT NULL,
            api_key      TEXT        NOT NULL,
            api_class    TEXT        NOT NULL,
            token_expiry TIMESTAMPTZ
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS locations (
            id  BIGSERIAL        PRIMARY KEY,
            lat DOUBLE PRECISION NOT NULL,
            lon DOUBLE PRECISION NOT NULL,
            geo TEXT             NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensors (
            id   UUID   PRIMARY KEY,
            a_id BIGINT NOT NULL REFERENCES apis (id),
            l_id BIGINT NOT NULL REFERENCES locations (id),
            name TEXT   NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attributes (
            id          UUID    PRIMARY KEY,
            name        TEXT    NOT NULL,
            table_name  TEXT    NOT NULL UNIQUE,
            sub_theme   INTEGER,
            unit        INTEGER,
            unit_value  TEXT,
            description TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_attributes (
            s_id UUID NOT NULL REFERENCES sensors (id),
            a_id UUID NOT NULL REFERENCES attributes (id),
            PRIMARY KEY (s_id, a_id)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Lookup paths used by entity resolution
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_locations_lat_lon ON locations (lat, lon);")
        .execute(&mut *tx)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sensors_name ON sensors (name);")
        .execute(&mut *tx)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_attributes_name ON attributes (name);")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

// ---

/// Handle to a provisioned value table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    pub attribute_id: Uuid,
    pub table_name: String,
}

/// Value-table handles for one ingestion call, keyed by attribute id.
///
/// Built by [`ensure_value_tables`] and dropped when the call ends, so no
/// table knowledge survives into the next run.
#[derive(Debug, Default)]
pub struct TableRegistry {
    handles: HashMap<Uuid, TableHandle>,
    created: usize,
}

impl TableRegistry {
    pub fn get(&self, attribute_id: &Uuid) -> Option<&TableHandle> {
        self.handles.get(attribute_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Tables this call actually created.
    pub fn created(&self) -> usize {
        self.created
    }
}

/// Make sure every attribute has its value table.
///
/// Reads the catalog once and compares names case-insensitively. Tables are
/// only ever created, never altered or dropped.
pub async fn ensure_value_tables<S: Store>(store: &S, attributes: &[Attribute]) -> StoreResult<TableRegistry> {
    // ---
    let existing: HashSet<String> = store
        .list_tables()
        .await?
        .into_iter()
        .map(|t| t.to_lowercase())
        .collect();

    let mut registry = TableRegistry::default();
    for attr in attributes {
        let table_name = attr.table_name.to_lowercase();

        if registry.handles.contains_key(&attr.id) {
            continue;
        }
        if existing.contains(&table_name) {
            debug!("{} already exists", table_name);
        } else {
            store.create_value_table(&table_name).await?;
            registry.created += 1;
            info!("Created table {}", table_name);
        }

        registry.handles.insert(
            attr.id,
            TableHandle {
                attribute_id: attr.id,
                table_name,
            },
        );
    }

    Ok(registry)
}
