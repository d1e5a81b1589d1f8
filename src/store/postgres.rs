//! PostgreSQL backend for [`Store`].

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use super::{validate_identifier, Store, StoreResult, TableBatch, ValueFilter, ValueOrder};
use crate::models::{Api, Attribute, AttributeKey, Location, NewApi, Sensor, SensorAttribute, ValueRow};

// ---

/// [`Store`] over a `sqlx` connection pool.
///
/// The static tables must exist first; see [`crate::schema::create_schema`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Store for PgStore {
    // ---
    async fn register_api(&self, api: &NewApi) -> StoreResult<Api> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO apis (name, url, refresh_time, api_key, api_class, token_expiry)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&api.name)
        .bind(&api.url)
        .bind(api.refresh_time)
        .bind(&api.api_key)
        .bind(&api.api_class)
        .bind(api.token_expiry)
        .execute(&self.pool)
        .await?;

        let registered = sqlx::query_as::<_, Api>("SELECT * FROM apis WHERE name = $1")
            .bind(&api.name)
            .fetch_one(&self.pool)
            .await?;

        Ok(registered)
    }

    async fn update_api_credentials(
        &self,
        api_id: i64,
        api_key: &str,
        token_expiry: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        // ---
        sqlx::query("UPDATE apis SET api_key = $2, token_expiry = $3 WHERE id = $1")
            .bind(api_id)
            .bind(api_key)
            .bind(token_expiry)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_location(&self, lat: f64, lon: f64) -> StoreResult<Option<Location>> {
        // ---
        let loc = sqlx::query_as::<_, Location>("SELECT * FROM locations WHERE lat = $1 AND lon = $2 LIMIT 1")
            .bind(lat)
            .bind(lon)
            .fetch_optional(&self.pool)
            .await?;
        Ok(loc)
    }

    async fn insert_location(&self, lat: f64, lon: f64) -> StoreResult<Location> {
        // ---
        let loc = sqlx::query_as::<_, Location>(
            "INSERT INTO locations (lat, lon, geo) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(lat)
        .bind(lon)
        .bind(Location::point_wkt(lat, lon))
        .fetch_one(&self.pool)
        .await?;
        Ok(loc)
    }

    async fn find_sensor_by_name(&self, name: &str) -> StoreResult<Option<Sensor>> {
        // ---
        let sensor = sqlx::query_as::<_, Sensor>("SELECT * FROM sensors WHERE name = $1 LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sensor)
    }

    async fn find_sensor_by_name_location(&self, name: &str, l_id: i64) -> StoreResult<Option<Sensor>> {
        // ---
        let sensor = sqlx::query_as::<_, Sensor>("SELECT * FROM sensors WHERE name = $1 AND l_id = $2 LIMIT 1")
            .bind(name)
            .bind(l_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sensor)
    }

    async fn find_sensor_by_name_api(&self, name: &str, a_id: i64) -> StoreResult<Option<Sensor>> {
        // ---
        let sensor = sqlx::query_as::<_, Sensor>("SELECT * FROM sensors WHERE name = $1 AND a_id = $2 LIMIT 1")
            .bind(name)
            .bind(a_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sensor)
    }

    async fn find_sensor_by_api_location_name(
        &self,
        a_id: i64,
        l_id: i64,
        name: &str,
    ) -> StoreResult<Option<Sensor>> {
        // ---
        let sensor = sqlx::query_as::<_, Sensor>(
            "SELECT * FROM sensors WHERE a_id = $1 AND l_id = $2 AND name = $3 LIMIT 1",
        )
        .bind(a_id)
        .bind(l_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sensor)
    }

    async fn insert_sensor(&self, sensor: &Sensor) -> StoreResult<()> {
        // ---
        sqlx::query("INSERT INTO sensors (id, a_id, l_id, name) VALUES ($1, $2, $3, $4)")
            .bind(sensor.id)
            .bind(sensor.a_id)
            .bind(sensor.l_id)
            .bind(&sensor.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_attribute(&self, key: &AttributeKey) -> StoreResult<Option<Attribute>> {
        // ---
        let attr = sqlx::query_as::<_, Attribute>(
            r#"
            SELECT * FROM attributes
            WHERE name = $1
              AND unit IS NOT DISTINCT FROM $2
              AND unit_value IS NOT DISTINCT FROM $3
            LIMIT 1
            "#,
        )
        .bind(&key.name)
        .bind(key.unit)
        .bind(&key.unit_value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attr)
    }

    async fn find_attributes_by_names(&self, names: &[String]) -> StoreResult<Vec<Attribute>> {
        // ---
        let attrs = sqlx::query_as::<_, Attribute>("SELECT * FROM attributes WHERE name = ANY($1) ORDER BY name")
            .bind(names)
            .fetch_all(&self.pool)
            .await?;
        Ok(attrs)
    }

    async fn insert_attribute(&self, attribute: &Attribute) -> StoreResult<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO attributes (id, name, table_name, sub_theme, unit, unit_value, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(attribute.id)
        .bind(&attribute.name)
        .bind(&attribute.table_name)
        .bind(attribute.sub_theme)
        .bind(attribute.unit)
        .bind(&attribute.unit_value)
        .bind(&attribute.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn link_sensor_attribute(&self, link: &SensorAttribute) -> StoreResult<bool> {
        // ---
        let result = sqlx::query(
            "INSERT INTO sensor_attributes (s_id, a_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(link.s_id)
        .bind(link.a_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        // ---
        let tables = sqlx::query_scalar::<_, String>("SELECT tablename::TEXT FROM pg_catalog.pg_tables")
            .fetch_all(&self.pool)
            .await?;
        Ok(tables)
    }

    async fn create_value_table(&self, table: &str) -> StoreResult<()> {
        // ---
        let table = validate_identifier(table)?;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                s_id          UUID        NOT NULL REFERENCES sensors (id),
                value         TEXT        NOT NULL,
                api_timestamp TIMESTAMPTZ NOT NULL,
                timestamp     TIMESTAMPTZ,
                PRIMARY KEY (s_id, value, api_timestamp)
            )
            "#
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_values(&self, batches: &[TableBatch<'_>]) -> StoreResult<()> {
        // ---
        let mut tx = self.pool.begin().await?;

        for batch in batches {
            let table = validate_identifier(batch.table)?;
            let sql = format!(
                r#"INSERT INTO "{table}" (s_id, value, api_timestamp, timestamp) VALUES ($1, $2, $3, $4)"#
            );
            for row in batch.rows {
                // Dropping `tx` on error rolls the whole call back.
                sqlx::query(&sql)
                    .bind(row.s_id)
                    .bind(&row.value)
                    .bind(row.api_timestamp)
                    .bind(row.timestamp)
                    .execute(&mut *tx)
                    .await?;
            }
            debug!("Staged {} rows for {}", batch.rows.len(), table);
        }

        tx.commit().await?;
        Ok(())
    }

    async fn count_values(&self, table: &str) -> StoreResult<i64> {
        // ---
        let table = validate_identifier(table)?;
        let count = sqlx::query_scalar::<_, i64>(&format!(r#"SELECT COUNT(*) FROM "{table}""#))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_values(&self, table: &str, filter: &ValueFilter) -> StoreResult<Vec<ValueRow>> {
        // ---
        let table = validate_identifier(table)?;
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            r#"SELECT s_id, value, api_timestamp, timestamp FROM "{table}" WHERE TRUE"#
        ));

        if let Some((from, to)) = filter.window {
            qb.push(" AND api_timestamp >= ")
                .push_bind(from)
                .push(" AND api_timestamp <= ")
                .push_bind(to);
        }
        if let Some(sensor_id) = filter.sensor_id {
            qb.push(" AND s_id = ").push_bind(sensor_id);
        }

        qb.push(match filter.order {
            ValueOrder::OldestFirst => " ORDER BY api_timestamp ASC",
            ValueOrder::NewestFirst => " ORDER BY api_timestamp DESC",
        });

        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        if filter.offset > 0 {
            qb.push(" OFFSET ").push_bind(filter.offset);
        }

        let rows = qb.build_query_as::<ValueRow>().fetch_all(&self.pool).await?;
        Ok(rows)
    }
}
