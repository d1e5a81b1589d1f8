//! Ingestion and harmonised query service for heterogeneous sensor feeds.
//!
//! Write path: [`ingest`] turns a provider extract into sensors, attributes
//! and per-attribute value tables, loading readings idempotently.
//! Read path: [`query`] serves latest-N, windowed, aggregated, resampled and
//! harmonised reads, with an optional [`forecast`] block.
//!
//! Persistence goes through the [`store::Store`] trait: [`store::PgStore`] in
//! production, [`store::MemoryStore`] for tests.

pub mod config;
pub mod forecast;
pub mod importer;
pub mod ingest;
pub mod models;
pub mod observer;
pub mod query;
pub mod routes;
pub mod schema;
pub mod store;

pub use config::Config;
pub use forecast::{Forecaster, NaiveForecaster};
pub use importer::{run_importer, HttpJsonImporter, Importer};
pub use ingest::{ingest, ColumnMapping, Extract, IngestOptions, IngestOutcome};
pub use observer::{PipelineObserver, RecordingObserver, TracingObserver};
pub use query::{run_query, AttributeQuery, QueryResponse};
pub use store::{MemoryStore, PgStore, Store};
