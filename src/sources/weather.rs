// src/sources/weather.rs
//
// Regional weather observations: one request per configured region, with
// the configured gap between requests as the upstream's rate budget.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::batch::RawBatch;
use crate::config::SourceConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{SourceId, SourceKind, Window};
use crate::sources::{fixture_wave, rfc3339, window_hours, HttpEndpoint, SourceClient};

const DEFAULT_REGIONS: &[&str] = &["DE", "FR"];

pub struct WeatherClient {
    id: SourceId,
    mode: Mode,
    regions: Vec<String>,
    request_gap: Duration,
}

enum Mode {
    Fixture,
    Http(HttpEndpoint),
}

impl WeatherClient {
    pub fn from_config(sc: &SourceConfig) -> PipelineResult<Self> {
        let id = SourceId::new(&sc.id);
        let mode = match &sc.base_url {
            Some(url) => Mode::Http(HttpEndpoint::new(&id, sc, url.clone())?),
            None => Mode::Fixture,
        };
        let regions = if sc.regions.is_empty() {
            DEFAULT_REGIONS.iter().map(|s| s.to_string()).collect()
        } else {
            sc.regions.clone()
        };
        Ok(WeatherClient {
            id,
            mode,
            regions,
            request_gap: Duration::from_millis(sc.min_request_gap_ms),
        })
    }

    pub fn fixture(id: impl Into<String>) -> Self {
        WeatherClient {
            id: SourceId::new(id),
            mode: Mode::Fixture,
            regions: DEFAULT_REGIONS.iter().map(|s| s.to_string()).collect(),
            request_gap: Duration::ZERO,
        }
    }

    fn fixture_rows(&self, window: &Window) -> Vec<Value> {
        let mut rows = Vec::new();
        for ts in window_hours(window) {
            for (i, region) in self.regions.iter().enumerate() {
                let phase = i as i64 * 5;
                rows.push(json!({
                    "ts": rfc3339(ts),
                    "region": region,
                    "temperature_c": fixture_wave(ts, 11.0, 29.0, 24, phase),
                    "humidity_pct": fixture_wave(ts, 40.0, 90.0, 24, phase + 7),
                    "wind_speed_ms": fixture_wave(ts, 1.0, 14.0, 12, phase + 2),
                    "cloud_cover_pct": fixture_wave(ts, 0.0, 100.0, 24, phase + 11),
                }));
            }
        }
        rows
    }

    async fn fetch_http(&self, ep: &HttpEndpoint, window: &Window) -> PipelineResult<RawBatch> {
        let mut rows: Vec<Value> = Vec::new();
        for (i, region) in self.regions.iter().enumerate() {
            if i > 0 && !self.request_gap.is_zero() {
                tokio::time::sleep(self.request_gap).await;
            }
            let path = format!(
                "/v1/observations?start={}&end={}&region={}",
                window.start.timestamp(),
                window.end.timestamp(),
                region
            );
            let body = ep.get_json(&self.id, &path).await?;
            let region_rows = body
                .get("rows")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    PipelineError::schema_drift(self.id.as_str(), "response missing rows array")
                })?;
            rows.extend(region_rows.iter().cloned());
        }
        Ok(RawBatch {
            source: self.id.clone(),
            rows,
            truncated: false,
        })
    }
}

#[async_trait]
impl SourceClient for WeatherClient {
    async fn fetch(&self, window: &Window) -> PipelineResult<RawBatch> {
        match &self.mode {
            Mode::Fixture => Ok(RawBatch {
                source: self.id.clone(),
                rows: self.fixture_rows(window),
                truncated: false,
            }),
            Mode::Http(ep) => self.fetch_http(ep, window).await,
        }
    }

    fn id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Weather
    }
}
