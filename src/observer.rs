//! Phase reporting for ingestion runs.
//!
//! Callers hand an observer to [`crate::ingest::ingest`] and
//! [`crate::importer::run_importer`]; there is no process-wide status.

use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

// ---

/// A phase transition inside one ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    // ---
    Fetch { api_name: String },
    RefreshCredentials { api_name: String },
    RegisterApi { api_name: String },
    Normalize { rows: usize },
    ResolveSensors { sensors: usize },
    ResolveAttributes { attributes: usize },
    LinkSensorAttributes { created: usize },
    ProvisionTables { created: usize },
    LoadValues { inserted: usize },
    Done,
    Skipped { reason: String },
    Failed { error: String },
}

pub trait PipelineObserver: Send + Sync {
    fn on_phase(&self, phase: Phase);
}

/// Logs every phase through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_phase(&self, phase: Phase) {
        info!(?phase, "ingestion phase");
    }
}

/// Keeps every phase in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    phases: Mutex<Vec<Phase>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phases(&self) -> Vec<Phase> {
        match self.phases.lock() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl PipelineObserver for RecordingObserver {
    fn on_phase(&self, phase: Phase) {
        match self.phases.lock() {
            Ok(mut p) => p.push(phase),
            Err(poisoned) => poisoned.into_inner().push(phase),
        }
    }
}
