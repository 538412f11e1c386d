// src/collect/validate.rs
//
// Per-kind row validation. Raw rows either become observations or count
// as malformed; a batch whose malformed ratio exceeds the configured
// threshold is rejected wholesale as schema drift. The bound is
// inclusive: ratio == threshold still passes.
//
// Numeric fields must be finite and within their domain bounds: prices,
// loads and wind speeds are non-negative, percentage metrics sit in
// 0..=100. A bound violation counts as a malformed row.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::batch::{Observation, RawBatch};
use crate::error::{PipelineError, PipelineResult};
use crate::model::SourceKind;

const SECS_PER_DAY: i64 = 86_400;

/// Outcome of validating one raw batch.
#[derive(Debug)]
pub struct ValidationReport {
    pub observations: Vec<Observation>,
    pub total_rows: usize,
    pub malformed_rows: usize,
}

impl ValidationReport {
    pub fn malformed_ratio(&self) -> f64 {
        if self.total_rows == 0 {
            0.0
        } else {
            self.malformed_rows as f64 / self.total_rows as f64
        }
    }
}

pub fn validate_batch(
    kind: SourceKind,
    batch: &RawBatch,
    threshold: f64,
) -> PipelineResult<ValidationReport> {
    let total = batch.rows.len();
    let mut malformed = 0usize;
    let mut first_reason: Option<String> = None;
    let mut observations = Vec::new();
    // News rows aggregate into per-feed daily article counts.
    let mut news_counts: BTreeMap<(String, i64), f64> = BTreeMap::new();

    for row in &batch.rows {
        let parsed = match kind {
            SourceKind::Market => market_row(row),
            SourceKind::Weather => weather_row(row),
            SourceKind::Economic => economic_row(row),
            SourceKind::News => news_row(row),
        };
        match parsed {
            Ok(Parsed::Observations(mut obs)) => observations.append(&mut obs),
            Ok(Parsed::Article { feed, ts }) => {
                let day = ts - ts.rem_euclid(SECS_PER_DAY);
                *news_counts.entry((feed, day)).or_insert(0.0) += 1.0;
            }
            Err(reason) => {
                malformed += 1;
                if first_reason.is_none() {
                    first_reason = Some(reason);
                }
            }
        }
    }

    for ((feed, day), count) in news_counts {
        observations.push(Observation {
            ts: day,
            series: feed,
            metric: "article_count".to_string(),
            value: count,
        });
    }

    let report = ValidationReport {
        observations,
        total_rows: total,
        malformed_rows: malformed,
    };

    if report.malformed_ratio() > threshold {
        let reason = first_reason.unwrap_or_else(|| "unknown".to_string());
        return Err(PipelineError::schema_drift(
            batch.source.as_str(),
            format!(
                "{malformed} of {total} rows malformed (threshold {:.0}%), first: {reason}",
                threshold * 100.0
            ),
        ));
    }
    Ok(report)
}

enum Parsed {
    Observations(Vec<Observation>),
    Article { feed: String, ts: i64 },
}

fn market_row(row: &Value) -> Result<Parsed, String> {
    let ts = ts_field(row)?;
    let region = str_field(row, "region")?;
    let obs = ["price_eur_mwh", "demand_mw", "supply_mw"]
        .iter()
        .map(|metric| {
            Ok(Observation {
                ts,
                series: region.to_string(),
                metric: (*metric).to_string(),
                value: non_negative_field(row, metric)?,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(Parsed::Observations(obs))
}

fn weather_row(row: &Value) -> Result<Parsed, String> {
    let ts = ts_field(row)?;
    let region = str_field(row, "region")?;
    let fields = [
        ("temperature_c", num_field(row, "temperature_c")?),
        ("humidity_pct", pct_field(row, "humidity_pct")?),
        ("wind_speed_ms", non_negative_field(row, "wind_speed_ms")?),
        ("cloud_cover_pct", pct_field(row, "cloud_cover_pct")?),
    ];
    let obs = fields
        .iter()
        .map(|(metric, value)| Observation {
            ts,
            series: region.to_string(),
            metric: (*metric).to_string(),
            value: *value,
        })
        .collect();
    Ok(Parsed::Observations(obs))
}

fn economic_row(row: &Value) -> Result<Parsed, String> {
    let ts = ts_field(row)?;
    let indicator = str_field(row, "indicator")?;
    Ok(Parsed::Observations(vec![Observation {
        ts,
        series: indicator.to_string(),
        metric: "value".to_string(),
        value: num_field(row, "value")?,
    }]))
}

fn news_row(row: &Value) -> Result<Parsed, String> {
    let ts = ts_field(row)?;
    let feed = str_field(row, "feed")?;
    let title = str_field(row, "title")?;
    if title.trim().is_empty() {
        return Err("empty title".to_string());
    }
    Ok(Parsed::Article {
        feed: feed.to_string(),
        ts,
    })
}

fn ts_field(row: &Value) -> Result<i64, String> {
    let raw = row
        .get("ts")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing ts".to_string())?;
    let dt: DateTime<Utc> = raw
        .parse::<DateTime<chrono::FixedOffset>>()
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("bad ts {raw:?}: {e}"))?;
    Ok(dt.timestamp())
}

fn str_field<'a>(row: &'a Value, name: &str) -> Result<&'a str, String> {
    let s = row
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing {name}"))?;
    if s.is_empty() {
        return Err(format!("empty {name}"));
    }
    Ok(s)
}

fn num_field(row: &Value, name: &str) -> Result<f64, String> {
    let v = row
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("missing {name}"))?;
    if !v.is_finite() {
        return Err(format!("non-finite {name}"));
    }
    Ok(v)
}

fn non_negative_field(row: &Value, name: &str) -> Result<f64, String> {
    let v = num_field(row, name)?;
    if v < 0.0 {
        return Err(format!("negative {name}: {v}"));
    }
    Ok(v)
}

fn pct_field(row: &Value, name: &str) -> Result<f64, String> {
    let v = num_field(row, name)?;
    if !(0.0..=100.0).contains(&v) {
        return Err(format!("{name} out of percent range: {v}"));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceId;
    use serde_json::json;

    fn batch(rows: Vec<Value>) -> RawBatch {
        RawBatch {
            source: SourceId::new("test"),
            rows,
            truncated: false,
        }
    }

    fn market(ts: &str, region: &str, price: f64) -> Value {
        json!({
            "ts": ts, "region": region,
            "price_eur_mwh": price, "demand_mw": 50_000.0, "supply_mw": 52_000.0,
        })
    }

    #[test]
    fn clean_market_rows_become_observations() {
        let b = batch(vec![
            market("2026-08-17T00:00:00Z", "DE", 81.5),
            market("2026-08-17T01:00:00Z", "DE", 79.0),
        ]);
        let r = validate_batch(SourceKind::Market, &b, 0.10).unwrap();
        assert_eq!(r.total_rows, 2);
        assert_eq!(r.malformed_rows, 0);
        assert_eq!(r.observations.len(), 6);
        assert!(r
            .observations
            .iter()
            .any(|o| o.metric == "price_eur_mwh" && (o.value - 81.5).abs() < 1e-9));
    }

    #[test]
    fn malformed_below_threshold_are_dropped() {
        // 1 of 20 malformed = 5%, under the 10% threshold.
        let mut rows: Vec<Value> = (0..19)
            .map(|h| market(&format!("2026-08-17T{h:02}:00:00Z"), "DE", 80.0))
            .collect();
        rows.push(json!({"ts": "not-a-date", "region": "DE"}));
        let r = validate_batch(SourceKind::Market, &batch(rows), 0.10).unwrap();
        assert_eq!(r.total_rows, 20);
        assert_eq!(r.malformed_rows, 1);
        assert_eq!(r.observations.len(), 19 * 3);
    }

    #[test]
    fn threshold_bound_is_inclusive() {
        // Exactly 10% malformed still passes.
        let mut rows: Vec<Value> = (0..9)
            .map(|h| market(&format!("2026-08-17T{h:02}:00:00Z"), "DE", 80.0))
            .collect();
        rows.push(json!({"bogus": true}));
        let r = validate_batch(SourceKind::Market, &batch(rows), 0.10).unwrap();
        assert_eq!(r.malformed_rows, 1);
    }

    #[test]
    fn exceeding_threshold_is_schema_drift() {
        let rows = vec![
            market("2026-08-17T00:00:00Z", "DE", 80.0),
            json!({"bogus": 1}),
        ];
        let err = validate_batch(SourceKind::Market, &batch(rows), 0.10).unwrap_err();
        match err {
            PipelineError::SchemaDrift { message, .. } => {
                assert!(message.contains("1 of 2"));
            }
            other => panic!("expected schema drift, got {other}"),
        }
    }

    #[test]
    fn non_finite_numbers_are_malformed() {
        let rows = vec![json!({
            "ts": "2026-08-17T00:00:00Z", "region": "DE",
            "price_eur_mwh": null, "demand_mw": 1.0, "supply_mw": 1.0,
        })];
        let err = validate_batch(SourceKind::Market, &batch(rows), 0.0).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaDrift { .. }));
    }

    #[test]
    fn negative_market_values_are_malformed() {
        let rows = vec![
            market("2026-08-17T00:00:00Z", "DE", 80.0),
            market("2026-08-17T01:00:00Z", "DE", -12.5),
            json!({
                "ts": "2026-08-17T02:00:00Z", "region": "DE",
                "price_eur_mwh": 75.0, "demand_mw": -100.0, "supply_mw": 1.0,
            }),
        ];
        let r = validate_batch(SourceKind::Market, &batch(rows), 1.0).unwrap();
        assert_eq!(r.malformed_rows, 2);
        assert_eq!(r.observations.len(), 3, "only the clean row survives");
    }

    #[test]
    fn out_of_range_weather_percentages_are_malformed() {
        fn weather(humidity: f64, cloud: f64) -> Value {
            json!({
                "ts": "2026-08-17T00:00:00Z", "region": "DE",
                "temperature_c": -3.5, "humidity_pct": humidity,
                "wind_speed_ms": 4.2, "cloud_cover_pct": cloud,
            })
        }
        let rows = vec![
            weather(62.0, 85.0),
            weather(150.0, 85.0),
            weather(62.0, -5.0),
        ];
        let r = validate_batch(SourceKind::Weather, &batch(rows), 1.0).unwrap();
        assert_eq!(r.malformed_rows, 2);
        // Sub-zero temperatures are fine; only percentages are bounded.
        assert_eq!(r.observations.len(), 4);
    }

    #[test]
    fn empty_batch_is_valid() {
        let r = validate_batch(SourceKind::Market, &batch(vec![]), 0.10).unwrap();
        assert_eq!(r.total_rows, 0);
        assert!(r.observations.is_empty());
    }

    #[test]
    fn news_rows_aggregate_to_daily_counts() {
        let rows = vec![
            json!({"ts": "2026-08-17T06:15:00Z", "feed": "wire", "title": "a"}),
            json!({"ts": "2026-08-17T09:40:00Z", "feed": "wire", "title": "b"}),
            json!({"ts": "2026-08-18T07:05:00Z", "feed": "wire", "title": "c"}),
            json!({"ts": "2026-08-17T05:30:00Z", "feed": "daily", "title": "d"}),
        ];
        let r = validate_batch(SourceKind::News, &batch(rows), 0.10).unwrap();
        assert_eq!(r.observations.len(), 3);
        let wire_mon = r
            .observations
            .iter()
            .find(|o| o.series == "wire" && o.ts == 1_786_924_800)
            .expect("wire monday bucket");
        assert_eq!(wire_mon.metric, "article_count");
        assert!((wire_mon.value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn null_ts_news_rows_are_malformed() {
        let rows = vec![
            json!({"ts": null, "feed": "wire", "title": "a"}),
            json!({"ts": "2026-08-17T06:15:00Z", "feed": "wire", "title": "b"}),
        ];
        let r = validate_batch(SourceKind::News, &batch(rows), 0.50).unwrap();
        assert_eq!(r.malformed_rows, 1);
        assert_eq!(r.observations.len(), 1);
    }

    #[test]
    fn economic_rows_use_indicator_as_series() {
        let rows = vec![json!({
            "ts": "2026-08-17T00:00:00Z", "indicator": "gas_storage_pct", "value": 73.4,
        })];
        let r = validate_batch(SourceKind::Economic, &batch(rows), 0.10).unwrap();
        assert_eq!(r.observations[0].series, "gas_storage_pct");
        assert_eq!(r.observations[0].metric, "value");
    }
}
