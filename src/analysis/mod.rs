// src/analysis/mod.rs
pub mod aggregates;
pub mod narrative;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analysis::aggregates::{
    correlations, daily_means, extremes, summarize, SeriesPoints, SeriesStats,
};
use crate::analysis::narrative::DynNarrativeClient;
use crate::batch::NormalizedBatch;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{CollectionRecord, Outcome, Period, SourceId, Window};
use crate::store::{report_key, Ledger, ObjectStore};

/// Version tag embedded in every report payload.
pub const REPORT_SCHEMA_VERSION: u32 = 1;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("analysis_runs_total", "Finished analysis runs by status.");
        describe_histogram!("analysis_ms", "Analysis duration in milliseconds.");
        describe_gauge!("analysis_last_run_ts", "Unix ts of the last analysis run.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// Every enabled source covered the full period and the narrative
    /// section (if configured) came back.
    Complete,
    Partial,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Complete => "complete",
            ReportStatus::Partial => "partial",
        }
    }
}

/// What an analysis run left behind.
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub period: String,
    pub report_key: String,
    pub status: ReportStatus,
    /// False when an existing report was kept (unforced re-run).
    pub written: bool,
}

/// Per-source period coverage verdict.
#[derive(Debug, Clone, Serialize)]
pub struct Coverage {
    pub covered: Vec<String>,
    pub missing: Vec<String>,
}

impl Coverage {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Weekly report builder. Reads success records and their artifacts for
/// one period, computes the quantitative sections, asks the narrative
/// service for an insight paragraph, and publishes the report artifact.
pub struct Analyzer {
    sources: Vec<SourceId>,
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn Ledger>,
    narrative: DynNarrativeClient,
}

impl Analyzer {
    pub fn new(
        cfg: &PipelineConfig,
        store: Arc<dyn ObjectStore>,
        ledger: Arc<dyn Ledger>,
        narrative: DynNarrativeClient,
    ) -> Self {
        Analyzer {
            sources: cfg.enabled_sources().map(|s| SourceId::new(&s.id)).collect(),
            store,
            ledger,
            narrative,
        }
    }

    /// Analyze one period. A report that already exists is kept as-is
    /// unless `force` is set.
    pub async fn run(&self, period: &Period, force: bool) -> PipelineResult<ReportSummary> {
        ensure_metrics_described();
        let t0 = std::time::Instant::now();
        let key = report_key(period);

        if !force {
            if let Some(existing) = self.store.get(&key).await? {
                let status = existing_status(&existing);
                info!(period = %period.key(), "report already exists, keeping it");
                return Ok(ReportSummary {
                    period: period.key(),
                    report_key: key,
                    status,
                    written: false,
                });
            }
        }

        let window = period.window();
        let records = self.ledger.in_window(&window).await?;
        let coverage = coverage(&self.sources, &records, &window);

        let used: Vec<&CollectionRecord> = records
            .iter()
            .filter(|r| r.outcome == Outcome::Success)
            .collect();
        let series = self.load_series(&used, &window).await?;

        let stats: BTreeMap<String, SeriesStats> = series
            .iter()
            .filter_map(|(k, p)| summarize(p).map(|s| (k.clone(), s)))
            .collect();
        let daily: BTreeMap<String, SeriesPoints> = series
            .iter()
            .map(|(k, p)| (k.clone(), daily_means(p)))
            .collect();
        let correlation_matrix = correlations(&daily);
        let extreme_obs = extremes(&series);

        let mut per_source: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for r in &used {
            let e = per_source.entry(r.source.to_string()).or_insert((0, 0));
            e.0 += 1;
            e.1 += r.row_count;
        }
        let total_rows: u64 = per_source.values().map(|(_, rows)| rows).sum();

        let narrative_input = serde_json::to_string(&json!({
            "period": period.key(),
            "coverage": &coverage,
            "series_stats": &stats,
            "correlations": &correlation_matrix,
        }))?;
        let narrative = self.narrative.summarize(&narrative_input).await;
        let narrative_status = if !self.narrative.enabled() {
            "disabled"
        } else if narrative.is_some() {
            "ok"
        } else {
            warn!(period = %period.key(), "narrative unavailable, report degrades to partial");
            "failed"
        };

        let mut status = if coverage.is_complete() {
            ReportStatus::Complete
        } else {
            ReportStatus::Partial
        };
        if narrative_status == "failed" {
            status = ReportStatus::Partial;
        }

        let report = json!({
            "schema_version": REPORT_SCHEMA_VERSION,
            "period_start": period.start_date().to_string(),
            "period_end": period.end_date().to_string(),
            "generated_at": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "status": status,
            "coverage": coverage,
            "executive_summary": {
                "total_rows": total_rows,
                "sources": per_source
                    .iter()
                    .map(|(s, (records, rows))| {
                        (s.clone(), json!({"records": records, "rows": rows}))
                    })
                    .collect::<BTreeMap<String, serde_json::Value>>(),
            },
            "series_stats": stats,
            "correlations": correlation_matrix,
            "extremes": extreme_obs,
            "narrative": narrative,
            "narrative_status": narrative_status,
            "source_records_used": used
                .iter()
                .map(|r| {
                    json!({
                        "seq": r.seq,
                        "source": r.source,
                        "window": r.window,
                        "content_hash": r.content_hash,
                    })
                })
                .collect::<Vec<_>>(),
        });
        let bytes = serde_json::to_vec_pretty(&report)?;
        self.store.put(&key, &bytes).await?;

        let elapsed_ms = t0.elapsed().as_secs_f64() * 1_000.0;
        counter!("analysis_runs_total", "status" => status.as_str()).increment(1);
        histogram!("analysis_ms").record(elapsed_ms);
        gauge!("analysis_last_run_ts").set(Utc::now().timestamp() as f64);
        info!(
            period = %period.key(),
            status = status.as_str(),
            series = stats.len(),
            rows = total_rows,
            missing = coverage.missing.len(),
            "report published"
        );

        Ok(ReportSummary {
            period: period.key(),
            report_key: key,
            status,
            written: true,
        })
    }

    /// Read every used artifact and fold its observations into
    /// `<source>.<series>.<metric>` keyed points, clipped to the window.
    async fn load_series(
        &self,
        used: &[&CollectionRecord],
        window: &Window,
    ) -> PipelineResult<BTreeMap<String, SeriesPoints>> {
        let lo = window.start.timestamp();
        let hi = window.end.timestamp();
        let mut series: BTreeMap<String, SeriesPoints> = BTreeMap::new();
        for r in used {
            let key = r.artifact_key.as_deref().ok_or_else(|| {
                PipelineError::storage(format!("success record {} lacks artifact key", r.seq))
            })?;
            let bytes = self.store.get(key).await?.ok_or_else(|| {
                PipelineError::storage(format!("artifact {key} referenced by ledger is missing"))
            })?;
            let batch: NormalizedBatch = serde_json::from_slice(&bytes)?;
            for o in batch.observations() {
                if o.ts < lo || o.ts >= hi {
                    continue;
                }
                series
                    .entry(series_key(&r.source, &o.series, &o.metric))
                    .or_default()
                    .insert(o.ts, o.value);
            }
        }
        Ok(series)
    }
}

pub fn series_key(source: &SourceId, series: &str, metric: &str) -> String {
    format!("{source}.{series}.{metric}")
}

/// Per-source coverage of `window` by records whose outcome counts
/// (success and success-empty; partial and failed never do). The
/// scheduler uses this to decide when a closed period is ready.
pub fn coverage(sources: &[SourceId], records: &[CollectionRecord], window: &Window) -> Coverage {
    let mut covered = Vec::new();
    let mut missing = Vec::new();
    for source in sources {
        let intervals: Vec<(i64, i64)> = records
            .iter()
            .filter(|r| &r.source == source && r.outcome.counts_for_coverage())
            .map(|r| {
                (
                    r.window.start.timestamp().max(window.start.timestamp()),
                    r.window.end.timestamp().min(window.end.timestamp()),
                )
            })
            .filter(|(s, e)| s < e)
            .collect();
        if covers_fully(intervals, window.start.timestamp(), window.end.timestamp()) {
            covered.push(source.to_string());
        } else {
            missing.push(source.to_string());
        }
    }
    Coverage { covered, missing }
}

/// Union check over clipped, possibly overlapping intervals.
fn covers_fully(mut intervals: Vec<(i64, i64)>, start: i64, end: i64) -> bool {
    if intervals.is_empty() {
        return false;
    }
    intervals.sort();
    let mut reached = start;
    for (s, e) in intervals {
        if s > reached {
            return false;
        }
        reached = reached.max(e);
        if reached >= end {
            return true;
        }
    }
    reached >= end
}

fn existing_status(bytes: &[u8]) -> ReportStatus {
    let parsed: Option<serde_json::Value> = serde_json::from_slice(bytes).ok();
    match parsed
        .as_ref()
        .and_then(|v| v.get("status"))
        .and_then(|v| v.as_str())
    {
        Some("complete") => ReportStatus::Complete,
        _ => ReportStatus::Partial,
    }
}
