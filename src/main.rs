//! Application entry point for the `sensorflow-harmoniser` service.
//!
//! Startup sequence:
//! - Load configuration from environment variables or `.env`
//! - Initialize structured logging/tracing
//! - Establish a PostgreSQL connection pool and create the static schema
//! - Optionally ingest one configured source (`SOURCE_URL`)
//! - Mount the query routes and serve them
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See [`sensorflow_harmoniser::config`] for the rest.
use std::env;

use is_terminal::IsTerminal;

use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::Result;

use sensorflow_harmoniser::config::{self, SourceConfig};
use sensorflow_harmoniser::models::NewApi;
use sensorflow_harmoniser::{routes, run_importer, schema, HttpJsonImporter, IngestOutcome, PgStore, TracingObserver};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database");

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;
    let store = PgStore::new(pool);

    if let Some(source) = &cfg.source {
        ingest_source(&store, source).await;
    }

    let app: Router = routes::router(store, cfg.clone());

    tracing::info!("Listening on {}", cfg.bind_addr);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Ingest the configured source once. Failures are logged; the server
/// still starts.
async fn ingest_source(store: &PgStore, source: &SourceConfig) {
    // ---
    let api = NewApi {
        name: source.name.clone(),
        url: source.url.clone(),
        refresh_time: source.refresh_secs,
        api_key: source.api_key.clone(),
        api_class: "HttpJsonImporter".to_string(),
        token_expiry: None,
    };

    let mut importer = HttpJsonImporter::new(api, source.mapping.clone())
        .ignore_tags(source.ignore_tags.iter().cloned())
        .with_options(source.options.clone());
    if let Some(separator) = &source.object_separator {
        importer = importer.object_separator(separator.clone());
    }

    match run_importer(&importer, store, &TracingObserver).await {
        Ok(IngestOutcome::Loaded(report)) => {
            tracing::info!(
                "Startup ingestion of {} loaded {} values",
                source.name,
                report.load.inserted
            );
        }
        Ok(IngestOutcome::Skipped(reason)) => {
            tracing::warn!("Startup ingestion of {} skipped: {}", source.name, reason);
        }
        Err(e) => {
            tracing::error!("Startup ingestion of {} failed: {}", source.name, e);
        }
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// - Color output: `FORCE_COLOR=1|true|yes` forces it on,
///   `FORCE_COLOR=0|false|no` forces it off, otherwise TTY detection
/// - Span events from `AXUM_SPAN_EVENTS`: `"full"` (ENTER, EXIT and CLOSE),
///   `"enter_exit"`, or CLOSE only by default
/// - Level from `RUST_LOG` when set, else `AXUM_LOG_LEVEL`
///
/// Call once at startup before any logging.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
