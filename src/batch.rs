// src/batch.rs
//
// Raw and normalized batch shapes plus the content hash that makes
// artifact writes idempotent. Normalization is deterministic: the same
// observations always serialize to the same bytes, so re-collecting an
// unchanged window reproduces the same hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineResult;
use crate::model::{SourceId, Window};

/// Version tag embedded in every artifact payload.
pub const SCHEMA_VERSION: u32 = 1;

/// One validated observation in long form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Unix seconds, UTC.
    pub ts: i64,
    /// Series identifier within the source (region, indicator, feed).
    pub series: String,
    /// Measured quantity (`price_eur_mwh`, `temperature_c`, ...).
    pub metric: String,
    /// Finite by the time validation has run.
    pub value: f64,
}

impl Observation {
    pub fn new(ts: i64, series: impl Into<String>, metric: impl Into<String>, value: f64) -> Self {
        Observation {
            ts,
            series: series.into(),
            metric: metric.into(),
            value,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.ts, 0)
    }
}

/// What a source adapter hands to validation: undecoded rows plus fetch
/// metadata. `truncated` is set when the page budget ran out before the
/// upstream did.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub source: SourceId,
    pub rows: Vec<serde_json::Value>,
    pub truncated: bool,
}

impl RawBatch {
    pub fn new(source: SourceId, rows: Vec<serde_json::Value>) -> Self {
        RawBatch {
            source,
            rows,
            truncated: false,
        }
    }
}

/// Columnar artifact payload. Parallel vectors, rows sorted by
/// (ts, series, metric, value) with exact duplicates removed; field order
/// here is the canonical serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBatch {
    pub schema_version: u32,
    pub source: SourceId,
    pub window: Window,
    pub ts: Vec<i64>,
    pub series: Vec<String>,
    pub metric: Vec<String>,
    pub value: Vec<f64>,
}

impl NormalizedBatch {
    /// Build the canonical columnar form from validated observations.
    pub fn from_observations(
        source: SourceId,
        window: Window,
        mut obs: Vec<Observation>,
    ) -> Self {
        obs.sort_by(|a, b| {
            a.ts.cmp(&b.ts)
                .then_with(|| a.series.cmp(&b.series))
                .then_with(|| a.metric.cmp(&b.metric))
                .then_with(|| a.value.total_cmp(&b.value))
        });
        obs.dedup();

        let mut batch = NormalizedBatch {
            schema_version: SCHEMA_VERSION,
            source,
            window,
            ts: Vec::with_capacity(obs.len()),
            series: Vec::with_capacity(obs.len()),
            metric: Vec::with_capacity(obs.len()),
            value: Vec::with_capacity(obs.len()),
        };
        for o in obs {
            batch.ts.push(o.ts);
            batch.series.push(o.series);
            batch.metric.push(o.metric);
            batch.value.push(o.value);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    /// Stable byte form used for both the artifact body and the hash.
    pub fn canonical_bytes(&self) -> PipelineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Rebuild row-form observations (analysis reads artifacts this way).
    pub fn observations(&self) -> Vec<Observation> {
        (0..self.len())
            .map(|i| Observation {
                ts: self.ts[i],
                series: self.series[i].clone(),
                metric: self.metric[i].clone(),
                value: self.value[i],
            })
            .collect()
    }
}

/// Hex sha-256 over artifact bytes. Equal bytes, equal hash; this is the
/// identity the ledger and writer key idempotence on.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2026, 8, 17, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 18, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn obs(ts: i64, series: &str, metric: &str, value: f64) -> Observation {
        Observation::new(ts, series, metric, value)
    }

    #[test]
    fn normalization_is_order_insensitive() {
        let a = vec![
            obs(200, "DE", "price_eur_mwh", 81.5),
            obs(100, "FR", "price_eur_mwh", 77.0),
            obs(100, "DE", "price_eur_mwh", 80.0),
        ];
        let mut b = a.clone();
        b.reverse();

        let src = SourceId::new("market");
        let left = NormalizedBatch::from_observations(src.clone(), window(), a);
        let right = NormalizedBatch::from_observations(src, window(), b);

        assert_eq!(left, right);
        assert_eq!(
            content_hash(&left.canonical_bytes().unwrap()),
            content_hash(&right.canonical_bytes().unwrap())
        );
    }

    #[test]
    fn exact_duplicates_collapse() {
        let rows = vec![
            obs(100, "DE", "price_eur_mwh", 80.0),
            obs(100, "DE", "price_eur_mwh", 80.0),
            obs(100, "DE", "demand_mw", 41200.0),
        ];
        let batch = NormalizedBatch::from_observations(SourceId::new("market"), window(), rows);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn rows_are_sorted_by_ts_then_series_then_metric() {
        let rows = vec![
            obs(200, "DE", "price_eur_mwh", 81.5),
            obs(100, "FR", "price_eur_mwh", 77.0),
            obs(100, "DE", "supply_mw", 43000.0),
            obs(100, "DE", "demand_mw", 41200.0),
        ];
        let batch = NormalizedBatch::from_observations(SourceId::new("market"), window(), rows);
        assert_eq!(batch.ts, vec![100, 100, 100, 200]);
        assert_eq!(batch.series, vec!["DE", "DE", "FR", "DE"]);
        assert_eq!(batch.metric[0], "demand_mw");
        assert_eq!(batch.metric[1], "supply_mw");
    }

    #[test]
    fn observations_round_trip_through_columns() {
        let rows = vec![
            obs(100, "DE", "price_eur_mwh", 80.0),
            obs(200, "DE", "price_eur_mwh", 81.5),
        ];
        let batch =
            NormalizedBatch::from_observations(SourceId::new("market"), window(), rows.clone());
        assert_eq!(batch.observations(), rows);
    }

    #[test]
    fn content_hash_is_full_hex_sha256() {
        let h = content_hash(b"payload");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, content_hash(b"payload"));
        assert_ne!(h, content_hash(b"payload2"));
    }

    #[test]
    fn canonical_bytes_embed_schema_version() {
        let batch = NormalizedBatch::from_observations(SourceId::new("market"), window(), vec![]);
        let bytes = batch.canonical_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("{\"schema_version\":1"));
    }
}
