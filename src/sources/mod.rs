// src/sources/mod.rs
pub mod economic;
pub mod market;
pub mod news;
pub mod weather;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::batch::RawBatch;
use crate::config::{PipelineConfig, SourceConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::model::{SourceId, SourceKind, Window};

pub use economic::EconomicClient;
pub use market::MarketClient;
pub use news::NewsClient;
pub use weather::WeatherClient;

/// One upstream data source. Implementations own credentials, pagination
/// and rate budget; retries live in the collection pipeline, not here.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch raw rows for one collection window.
    async fn fetch(&self, window: &Window) -> PipelineResult<RawBatch>;
    fn id(&self) -> &SourceId;
    fn kind(&self) -> SourceKind;
}

/// Build clients for every enabled source in the config.
pub fn build_clients(cfg: &PipelineConfig) -> PipelineResult<Vec<Arc<dyn SourceClient>>> {
    let mut clients: Vec<Arc<dyn SourceClient>> = Vec::new();
    for sc in cfg.enabled_sources() {
        let client: Arc<dyn SourceClient> = match sc.kind {
            SourceKind::Market => Arc::new(MarketClient::from_config(sc)?),
            SourceKind::Weather => Arc::new(WeatherClient::from_config(sc)?),
            SourceKind::Economic => Arc::new(EconomicClient::from_config(sc)?),
            SourceKind::News => Arc::new(NewsClient::from_config(sc)?),
        };
        clients.push(client);
    }
    Ok(clients)
}

/// Resolve the API key named by `api_key_env`. A configured-but-missing
/// key is an auth failure, recorded in the ledger without retries.
pub(crate) fn resolve_api_key(
    source: &SourceId,
    api_key_env: &Option<String>,
) -> PipelineResult<Option<String>> {
    match api_key_env {
        None => Ok(None),
        Some(var) => match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
            _ => Err(PipelineError::auth(
                source.as_str(),
                format!("credential env {var} is unset"),
            )),
        },
    }
}

/// Map an HTTP status onto the failure taxonomy.
pub(crate) fn classify_status(source: &SourceId, status: reqwest::StatusCode) -> PipelineError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        PipelineError::auth(source.as_str(), format!("upstream returned {status}"))
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        PipelineError::transient(source.as_str(), format!("upstream returned {status}"))
    } else {
        // Remaining 4xx: the request shape no longer matches the API.
        PipelineError::schema_drift(source.as_str(), format!("upstream returned {status}"))
    }
}

/// Network-level reqwest failures are transient by definition.
pub(crate) fn classify_transport(source: &SourceId, err: reqwest::Error) -> PipelineError {
    PipelineError::transient(source.as_str(), err.to_string())
}

/// Shared HTTP endpoint used by the JSON adapters.
pub(crate) struct HttpEndpoint {
    pub base_url: String,
    pub api_key_env: Option<String>,
    pub client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(source: &SourceId, sc: &SourceConfig, base_url: String) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(sc.timeout_secs))
            .build()
            .map_err(|e| {
                PipelineError::config(format!("building http client for {source}: {e}"))
            })?;
        Ok(HttpEndpoint {
            base_url,
            api_key_env: sc.api_key_env.clone(),
            client,
        })
    }

    /// GET `{base_url}{path}` and decode the JSON body.
    pub async fn get_json(
        &self,
        source: &SourceId,
        path: &str,
    ) -> PipelineResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut req = self.client.get(&url);
        if let Some(key) = resolve_api_key(source, &self.api_key_env)? {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| classify_transport(source, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(source, status));
        }
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| PipelineError::schema_drift(source.as_str(), format!("bad json: {e}")))
    }
}

/// Raw rows carry observation timestamps as RFC 3339 strings.
pub(crate) fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Hour marks inside the window, oldest first. The fixture generators
/// derive every value from these, so a window always synthesizes the
/// same batch.
pub(crate) fn window_hours(window: &Window) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    let mut t = window.start;
    while t < window.end {
        out.push(t);
        t += chrono::Duration::hours(1);
    }
    out
}

/// Triangle wave over absolute hours, rounded to two decimals. Purely a
/// function of the timestamp, which keeps fixture batches reproducible.
pub(crate) fn fixture_wave(ts: DateTime<Utc>, lo: f64, hi: f64, period_hours: i64, phase: i64) -> f64 {
    let h = ts.timestamp() / 3600 + phase;
    let pos = h.rem_euclid(period_hours.max(1)) as f64 / period_hours.max(1) as f64;
    let tri = if pos < 0.5 { pos * 2.0 } else { (1.0 - pos) * 2.0 };
    let v = lo + (hi - lo) * tri;
    (v * 100.0).round() / 100.0
}
