//! Configuration loader for the `sensorflow-harmoniser` service.
//!
//! All runtime settings and their defaults are read here from environment
//! variables (the caller may load a `.env` first), so no other module calls
//! `env::var` directly.
use std::env;

use anyhow::{anyhow, Result};

use crate::ingest::{ColumnMapping, IngestOptions, DEFAULT_BATCH_SIZE};
use crate::query::DEFAULT_LIMIT;

/// Parse an optional numeric environment variable with a default value.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name).map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// A source to ingest once at startup.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    // ---
    /// Endpoint; the API key is appended verbatim.
    pub url: String,
    pub name: String,
    pub api_key: String,
    /// Poll interval recorded on the API row, in seconds.
    pub refresh_secs: i64,
    pub mapping: ColumnMapping,
    pub options: IngestOptions,
    pub object_separator: Option<String>,
    pub ignore_tags: Vec<String>,
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Address the HTTP server binds to.
    pub bind_addr: String,

    /// Rows per loader flush.
    pub ingest_batch_size: usize,

    /// Rows returned by latest-N queries when no limit is given.
    pub query_default_limit: i64,

    pub source: Option<SourceConfig>,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `BIND_ADDR` – listen address (default: `0.0.0.0:8080`)
/// - `INGEST_BATCH_SIZE` – rows per flush (default: 10)
/// - `QUERY_DEFAULT_LIMIT` – latest-N size (default: 30)
/// - `SOURCE_URL`, `SOURCE_NAME`, `SOURCE_API_KEY`, `SOURCE_REFRESH_SECS` –
///   a source ingested once at startup; `SOURCE_URL` enables it
/// - `SOURCE_MAPPING` (JSON column mapping, required with `SOURCE_URL`),
///   `SOURCE_OPTIONS` (JSON ingestion options), `SOURCE_OBJECT_SEPARATOR`,
///   `SOURCE_IGNORE_TAGS` (comma-separated)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env!("DB_POOL_MAX", u32, 5);
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let ingest_batch_size = parse_env!("INGEST_BATCH_SIZE", usize, DEFAULT_BATCH_SIZE);
    let query_default_limit = parse_env!("QUERY_DEFAULT_LIMIT", i64, DEFAULT_LIMIT);

    if ingest_batch_size == 0 {
        return Err(anyhow!("INGEST_BATCH_SIZE must be greater than zero"));
    }
    if query_default_limit <= 0 {
        return Err(anyhow!("QUERY_DEFAULT_LIMIT must be greater than zero"));
    }

    let source = match env::var("SOURCE_URL") {
        Ok(url) => Some(load_source(url, ingest_batch_size)?),
        Err(_) => None,
    };

    Ok(Config {
        db_url,
        db_pool_max,
        bind_addr,
        ingest_batch_size,
        query_default_limit,
        source,
    })
}

fn load_source(url: String, batch_size: usize) -> Result<SourceConfig> {
    // ---
    let mapping_json = require_env!("SOURCE_MAPPING");
    let mapping: ColumnMapping =
        serde_json::from_str(&mapping_json).map_err(|e| anyhow!("Invalid SOURCE_MAPPING: {}", e))?;

    let mut options: IngestOptions = match env::var("SOURCE_OPTIONS") {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| anyhow!("Invalid SOURCE_OPTIONS: {}", e))?,
        Err(_) => IngestOptions::default(),
    };
    options.batch_size = batch_size;

    let ignore_tags: Vec<String> = env::var("SOURCE_IGNORE_TAGS")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Ok(SourceConfig {
        url,
        name: require_env!("SOURCE_NAME"),
        api_key: env::var("SOURCE_API_KEY").unwrap_or_default(),
        refresh_secs: parse_env!("SOURCE_REFRESH_SECS", i64, 3600),
        mapping,
        options,
        object_separator: env::var("SOURCE_OBJECT_SEPARATOR").ok(),
        ignore_tags,
    })
}

/// Replace the password of a connection URL with `****`.
fn mask_password(url: &str) -> String {
    // ---
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            // A colon right after the scheme means there is no password.
            if !url[colon_pos..].starts_with("://") {
                return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
            }
        }
    }
    url.to_string()
}

impl Config {
    /// Log the loaded configuration with the database password masked.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL        : {}", mask_password(&self.db_url));
        tracing::info!("  DB_POOL_MAX         : {}", self.db_pool_max);
        tracing::info!("  BIND_ADDR           : {}", self.bind_addr);
        tracing::info!("  INGEST_BATCH_SIZE   : {}", self.ingest_batch_size);
        tracing::info!("  QUERY_DEFAULT_LIMIT : {}", self.query_default_limit);
        match &self.source {
            Some(source) => {
                tracing::info!("  SOURCE_NAME         : {}", source.name);
                tracing::info!("  SOURCE_URL          : {}", source.url);
                tracing::info!("  SOURCE_API_KEY      : {}", if source.api_key.is_empty() { "" } else { "****" });
                tracing::info!("  SOURCE_REFRESH_SECS : {}", source.refresh_secs);
                tracing::info!("  SOURCE_IGNORE_TAGS  : {:?}", source.ignore_tags);
            }
            None => tracing::info!("  SOURCE_URL          : (none)"),
        }
    }
}
