// src/api.rs
//
// HTTP surface: a read-only facade over the ledger and artifact store,
// health/dashboard endpoints, and admin triggers for manual collection
// and analysis runs. Reads never mutate pipeline state; the admin POST
// routes delegate to the scheduler so single-flight and claim semantics
// hold no matter where a run originates.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use tower_http::cors::CorsLayer;

use crate::analysis::ReportSummary;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{CollectionRecord, Period, SourceId};
use crate::scheduler::{Scheduler, TriggerOutcome};
use crate::store::{report_key, Ledger, LedgerStats, ObjectMeta, ObjectStore};

/// Hard ceiling on page sizes; requests asking for more are clamped.
pub const MAX_PAGE_SIZE: usize = 50;
const DEFAULT_PAGE_SIZE: usize = 20;
const DASHBOARD_WINDOW_HOURS: i64 = 24;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PipelineConfig>,
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn ObjectStore>,
    pub scheduler: Arc<Scheduler>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sources", get(list_sources))
        .route("/api/sources/{source}/collections", get(list_collections))
        .route("/api/reports/{period}", get(get_report))
        .route("/api/dashboard/summary", get(dashboard_summary))
        .route("/api/artifacts", get(list_artifacts))
        .route("/admin/collect/{source}", post(trigger_collect))
        .route("/admin/collect/{source}/cancel", post(cancel_collect))
        .route("/admin/analyze/{period}", post(trigger_analysis))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Maps pipeline errors onto HTTP statuses at the edge. Everything the
/// handlers bubble up arrives here via `?`.
struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.detail_code(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn clamp_limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Resolve a path segment to a configured source id, 404 otherwise.
fn known_source(config: &PipelineConfig, id: &str) -> Result<SourceId, ApiError> {
    if config.sources.iter().any(|s| s.id == id) {
        Ok(SourceId::new(id))
    } else {
        Err(PipelineError::not_found(format!("unknown source: {id}")).into())
    }
}

#[derive(serde::Serialize)]
struct DependencyHealth {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl DependencyHealth {
    fn from_probe(result: crate::error::PipelineResult<()>) -> Self {
        match result {
            Ok(()) => DependencyHealth {
                status: "ok",
                error: None,
            },
            Err(e) => DependencyHealth {
                status: "down",
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    ledger: DependencyHealth,
    object_store: DependencyHealth,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (ledger, store) = tokio::join!(state.ledger.probe(), state.store.probe());
    let ledger = DependencyHealth::from_probe(ledger);
    let object_store = DependencyHealth::from_probe(store);
    let all_ok = ledger.status == "ok" && object_store.status == "ok";
    let code = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if all_ok { "ok" } else { "degraded" },
        ledger,
        object_store,
    };
    (code, Json(body))
}

#[derive(serde::Serialize)]
struct LastRun {
    seq: u64,
    outcome: &'static str,
    finished_at: DateTime<Utc>,
    row_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_detail: Option<String>,
}

impl LastRun {
    fn from_record(r: &CollectionRecord) -> Self {
        LastRun {
            seq: r.seq,
            outcome: r.outcome.as_str(),
            finished_at: r.finished_at,
            row_count: r.row_count,
            error_detail: r.error_detail.clone(),
        }
    }
}

#[derive(serde::Serialize)]
struct SourceInfo {
    id: String,
    kind: &'static str,
    enabled: bool,
    cadence_secs: u64,
    mode: &'static str,
    last_run: Option<LastRun>,
}

#[derive(serde::Serialize)]
struct SourcesResponse {
    sources: Vec<SourceInfo>,
}

async fn list_sources(State(state): State<AppState>) -> ApiResult<Json<SourcesResponse>> {
    let mut sources = Vec::with_capacity(state.config.sources.len());
    for cfg in &state.config.sources {
        let id = SourceId::new(&cfg.id);
        let last_run = state.ledger.latest(&id).await?.map(|r| LastRun::from_record(&r));
        sources.push(SourceInfo {
            id: cfg.id.clone(),
            kind: cfg.kind.as_str(),
            enabled: cfg.enabled,
            cadence_secs: cfg.cadence_secs,
            mode: if cfg.base_url.is_some() { "http" } else { "fixture" },
            last_run,
        });
    }
    Ok(Json(SourcesResponse { sources }))
}

#[derive(serde::Deserialize)]
struct PageParams {
    limit: Option<usize>,
    before: Option<u64>,
}

#[derive(serde::Serialize)]
struct CollectionsResponse {
    source: String,
    collections: Vec<CollectionRecord>,
    /// Pass back as `before` to fetch the next (older) page. Absent on
    /// the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    next_before: Option<u64>,
}

async fn list_collections(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<CollectionsResponse>> {
    let id = known_source(&state.config, &source)?;
    let limit = clamp_limit(params.limit);
    let collections = state.ledger.recent(&id, limit, params.before).await?;
    let next_before = if collections.len() == limit {
        collections.last().map(|r| r.seq)
    } else {
        None
    };
    Ok(Json(CollectionsResponse {
        source,
        collections,
        next_before,
    }))
}

async fn get_report(
    State(state): State<AppState>,
    Path(period): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let period = Period::parse_key(&period)?;
    let key = report_key(&period);
    let bytes = state
        .store
        .get(&key)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("no report for period {}", period.key())))?;
    let report: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(PipelineError::from)?;
    Ok(Json(report))
}

#[derive(serde::Serialize)]
struct SourceHealth {
    id: String,
    kind: &'static str,
    enabled: bool,
    last_outcome: Option<&'static str>,
    last_finished_at: Option<DateTime<Utc>>,
}

#[derive(serde::Serialize)]
struct DashboardSummary {
    generated_at: DateTime<Utc>,
    window_hours: i64,
    runs: LedgerStats,
    total_runs: u64,
    /// Share of runs in the window that produced trustworthy data.
    success_rate: f64,
    sources: Vec<SourceHealth>,
}

async fn dashboard_summary(State(state): State<AppState>) -> ApiResult<Json<DashboardSummary>> {
    let now = Utc::now();
    let since = now - Duration::hours(DASHBOARD_WINDOW_HOURS);
    let runs = state.ledger.stats_since(since).await?;
    let total_runs = runs.total();
    let success_rate = if total_runs == 0 {
        0.0
    } else {
        (runs.success + runs.success_empty) as f64 / total_runs as f64
    };

    let mut sources = Vec::with_capacity(state.config.sources.len());
    for cfg in &state.config.sources {
        let latest = state.ledger.latest(&SourceId::new(&cfg.id)).await?;
        sources.push(SourceHealth {
            id: cfg.id.clone(),
            kind: cfg.kind.as_str(),
            enabled: cfg.enabled,
            last_outcome: latest.as_ref().map(|r| r.outcome.as_str()),
            last_finished_at: latest.as_ref().map(|r| r.finished_at),
        });
    }

    Ok(Json(DashboardSummary {
        generated_at: now,
        window_hours: DASHBOARD_WINDOW_HOURS,
        runs,
        total_runs,
        success_rate,
        sources,
    }))
}

#[derive(serde::Deserialize)]
struct ArtifactParams {
    prefix: Option<String>,
    limit: Option<usize>,
}

#[derive(serde::Serialize)]
struct ArtifactsResponse {
    prefix: String,
    count: usize,
    artifacts: Vec<ObjectMeta>,
}

async fn list_artifacts(
    State(state): State<AppState>,
    Query(params): Query<ArtifactParams>,
) -> ApiResult<Json<ArtifactsResponse>> {
    let prefix = params.prefix.unwrap_or_default();
    let limit = clamp_limit(params.limit);
    let artifacts = state.store.list(&prefix, limit).await?;
    Ok(Json(ArtifactsResponse {
        count: artifacts.len(),
        prefix,
        artifacts,
    }))
}

#[derive(serde::Serialize)]
struct TriggerResponse {
    source: String,
    /// False when the request coalesced into a run already in flight.
    ran: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<CollectionRecord>,
}

async fn trigger_collect(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> ApiResult<Json<TriggerResponse>> {
    let id = known_source(&state.config, &source)?;
    let outcome = state.scheduler.run_source_now(&id).await?;
    let response = match outcome {
        TriggerOutcome::Ran(record) => TriggerResponse {
            source,
            ran: true,
            record: Some(record),
        },
        TriggerOutcome::Coalesced => TriggerResponse {
            source,
            ran: false,
            record: None,
        },
    };
    Ok(Json(response))
}

#[derive(serde::Serialize)]
struct CancelResponse {
    source: String,
    /// True when an in-flight run was flagged; false when the source
    /// was idle.
    cancelled: bool,
}

async fn cancel_collect(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let id = known_source(&state.config, &source)?;
    let cancelled = state.scheduler.cancel_source(&id);
    Ok(Json(CancelResponse { source, cancelled }))
}

#[derive(serde::Deserialize)]
struct AnalyzeParams {
    #[serde(default)]
    force: bool,
}

async fn trigger_analysis(
    State(state): State<AppState>,
    Path(period): Path<String>,
    Query(params): Query<AnalyzeParams>,
) -> ApiResult<Json<ReportSummary>> {
    let period = Period::parse_key(&period)?;
    let summary = state
        .scheduler
        .run_analysis_now(&period, params.force, Utc::now())
        .await?;
    Ok(Json(summary))
}
