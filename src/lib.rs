// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod batch;
pub mod config;
pub mod error;
pub mod model;

// Ingestion: source adapters, fetch/validate/publish pipeline.
pub mod collect;
pub mod sources;

// Persistence: artifact store, ledger, content-addressed writer.
pub mod store;

// Weekly analysis and the narrative adapter.
pub mod analysis;

// Orchestration and the HTTP edge.
pub mod api;
pub mod metrics;
pub mod scheduler;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::batch::{NormalizedBatch, Observation, RawBatch};
pub use crate::error::{PipelineError, PipelineResult};
pub use crate::model::{CollectionRecord, Outcome, Period, SourceId, SourceKind, Window};
pub use crate::scheduler::Scheduler;
