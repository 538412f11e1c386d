// src/sources/economic.rs
//
// Economic indicator series (gas storage, demand indices). Daily
// resolution; one request per indicator.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::batch::RawBatch;
use crate::config::SourceConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{SourceId, SourceKind, Window};
use crate::sources::{fixture_wave, rfc3339, HttpEndpoint, SourceClient};

const DEFAULT_INDICATORS: &[&str] = &["gas_storage_pct", "power_demand_index"];

pub struct EconomicClient {
    id: SourceId,
    mode: Mode,
    indicators: Vec<String>,
    request_gap: Duration,
}

enum Mode {
    Fixture,
    Http(HttpEndpoint),
}

impl EconomicClient {
    pub fn from_config(sc: &SourceConfig) -> PipelineResult<Self> {
        let id = SourceId::new(&sc.id);
        let mode = match &sc.base_url {
            Some(url) => Mode::Http(HttpEndpoint::new(&id, sc, url.clone())?),
            None => Mode::Fixture,
        };
        let indicators = if sc.indicators.is_empty() {
            DEFAULT_INDICATORS.iter().map(|s| s.to_string()).collect()
        } else {
            sc.indicators.clone()
        };
        Ok(EconomicClient {
            id,
            mode,
            indicators,
            request_gap: Duration::from_millis(sc.min_request_gap_ms),
        })
    }

    pub fn fixture(id: impl Into<String>) -> Self {
        EconomicClient {
            id: SourceId::new(id),
            mode: Mode::Fixture,
            indicators: DEFAULT_INDICATORS.iter().map(|s| s.to_string()).collect(),
            request_gap: Duration::ZERO,
        }
    }

    fn fixture_rows(&self, window: &Window) -> Vec<Value> {
        // One point per indicator per day in the window.
        let mut rows = Vec::new();
        let mut day = Window::day_of(window.start).start;
        while day < window.end {
            if window.contains(day) {
                for (i, indicator) in self.indicators.iter().enumerate() {
                    rows.push(json!({
                        "ts": rfc3339(day),
                        "indicator": indicator,
                        "value": fixture_wave(day, 30.0, 95.0, 24 * 14, i as i64 * 40),
                    }));
                }
            }
            day += chrono::Duration::days(1);
        }
        rows
    }

    async fn fetch_http(&self, ep: &HttpEndpoint, window: &Window) -> PipelineResult<RawBatch> {
        let mut rows: Vec<Value> = Vec::new();
        for (i, indicator) in self.indicators.iter().enumerate() {
            if i > 0 && !self.request_gap.is_zero() {
                tokio::time::sleep(self.request_gap).await;
            }
            let path = format!(
                "/v1/series/{}?start={}&end={}",
                indicator,
                window.start.timestamp(),
                window.end.timestamp()
            );
            let body = ep.get_json(&self.id, &path).await?;
            let series_rows = body
                .get("rows")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    PipelineError::schema_drift(self.id.as_str(), "response missing rows array")
                })?;
            rows.extend(series_rows.iter().cloned());
        }
        Ok(RawBatch {
            source: self.id.clone(),
            rows,
            truncated: false,
        })
    }
}

#[async_trait]
impl SourceClient for EconomicClient {
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
        SourceKind::Economic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn fixture_emits_one_point_per_indicator_per_day() {
        let client = EconomicClient::fixture("economic");
        let w = Window::new(
            Utc.with_ymd_and_hms(2026, 8, 17, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 19, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let batch = client.fetch(&w).await.unwrap();
        // 2 days x 2 indicators
        assert_eq!(batch.rows.len(), 4);
        assert!(batch.rows.iter().all(|r| r.get("indicator").is_some()));
    }

    #[tokio::test]
    async fn sub_day_window_yields_at_most_one_point_per_indicator() {
        let client = EconomicClient::fixture("economic");
        let w = Window::new(
            Utc.with_ymd_and_hms(2026, 8, 17, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 17, 6, 0, 0).unwrap(),
        )
        .unwrap();
        let batch = client.fetch(&w).await.unwrap();
        assert_eq!(batch.rows.len(), 2);
    }
}
