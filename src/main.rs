//! Pipeline service entrypoint.
//! Boots the cadence and analysis loops, then serves the HTTP API and
//! Prometheus metrics over one listener.
//!
//! See `README.md` for quickstart and `config/pipeline.toml` for the
//! deployed configuration shape.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ena_pipeline::analysis::narrative::build_narrative_client;
use ena_pipeline::api::{create_router, AppState};
use ena_pipeline::config::PipelineConfig;
use ena_pipeline::metrics::Metrics;
use ena_pipeline::scheduler::Scheduler;
use ena_pipeline::sources::build_clients;
use ena_pipeline::store::{FsObjectStore, Ledger, ObjectStore, SqliteLedger};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ena_pipeline=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op where the environment is injected.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Arc::new(PipelineConfig::load_default()?);
    std::fs::create_dir_all(config.artifacts_dir())?;

    // Recorder must exist before the first counter fires in a loop.
    let metrics = Metrics::init(config.enabled_sources().count());

    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.artifacts_dir())?);
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::open(config.ledger_path())?);

    let clients = build_clients(&config)?;
    let narrative = build_narrative_client(&config.analysis.narrative);
    let scheduler = Arc::new(Scheduler::new(
        &config,
        clients,
        store.clone(),
        ledger.clone(),
        narrative,
    ));
    let loops = scheduler.spawn();
    info!(
        loops = loops.len(),
        sources = config.enabled_sources().count(),
        data_dir = %config.data_dir.display(),
        "background loops started"
    );

    let state = AppState {
        config: config.clone(),
        ledger,
        store,
        scheduler,
    };
    let app = create_router(state).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
