// src/metrics.rs
//
// Prometheus exporter wiring. Counters and histograms are described next
// to the code that emits them; this module only installs the recorder and
// serves the exposition endpoint.

use axum::{routing::get, Router};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Call once at startup,
    /// before the first counter fires.
    pub fn init(enabled_sources: usize) -> Self {
        let builder = PrometheusBuilder::new();

        let handle = builder
            .install_recorder()
            .expect("prometheus: install recorder");

        // Static gauge so dashboards can spot a misconfigured deploy
        // (zero enabled sources) without scraping the config.
        gauge!("pipeline_sources_enabled").set(enabled_sources as f64);

        Self { handle }
    }

    /// Router exposing `/metrics` in the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
