// src/scheduler.rs
//
// Per-source run loops plus the weekly analysis trigger.
//
// Each source has at most one run in flight: a trigger while a run is
// active coalesces instead of queueing. The analysis poller claims a
// closed period through the ledger marker, so across restarts (and
// across processes sharing the ledger) each period is analyzed once.

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::analysis::{coverage, Analyzer, ReportSummary};
use crate::analysis::narrative::DynNarrativeClient;
use crate::collect::{CancelToken, Collector};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{CollectionRecord, Period, SourceId, Window};
use crate::sources::SourceClient;
use crate::store::{Ledger, ObjectStore};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "scheduler_coalesced_total",
            "Triggers skipped because the source was already running."
        );
        describe_counter!(
            "scheduler_cancel_requests_total",
            "Cancellation requests delivered to a running source."
        );
    });
}

/// How many closed periods, newest first, each analysis poll considers.
/// Bounds the catch-up work after downtime longer than one week.
const ANALYSIS_LOOKBACK_PERIODS: u32 = 4;

/// What a manual or scheduled trigger did.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// The run executed to a terminal ledger record.
    Ran(CollectionRecord),
    /// Another run for this source was already in flight.
    Coalesced,
}

pub struct Scheduler {
    clients: HashMap<SourceId, Arc<dyn SourceClient>>,
    cadences: Vec<(SourceId, u64)>,
    collector: Collector,
    analyzer: Analyzer,
    ledger: Arc<dyn Ledger>,
    sources: Vec<SourceId>,
    poll_secs: u64,
    grace_secs: u64,
    running: Mutex<HashMap<SourceId, CancelToken>>,
}

impl Scheduler {
    pub fn new(
        cfg: &PipelineConfig,
        clients: Vec<Arc<dyn SourceClient>>,
        store: Arc<dyn ObjectStore>,
        ledger: Arc<dyn Ledger>,
        narrative: DynNarrativeClient,
    ) -> Self {
        ensure_metrics_described();
        let cadences = cfg
            .enabled_sources()
            .map(|s| (SourceId::new(&s.id), s.cadence_secs))
            .collect();
        Scheduler {
            clients: clients
                .into_iter()
                .map(|c| (c.id().clone(), c))
                .collect(),
            cadences,
            collector: Collector::new(cfg, store.clone(), ledger.clone()),
            analyzer: Analyzer::new(cfg, store, ledger.clone(), narrative),
            ledger,
            sources: cfg.enabled_sources().map(|s| SourceId::new(&s.id)).collect(),
            poll_secs: cfg.analysis.poll_secs,
            grace_secs: cfg.analysis.grace_secs,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Run one source for the current UTC day window, unless a run is
    /// already in flight. Waits for the run to finish.
    pub async fn run_source_now(&self, source: &SourceId) -> PipelineResult<TriggerOutcome> {
        let client = self
            .clients
            .get(source)
            .cloned()
            .ok_or_else(|| PipelineError::not_found(format!("unknown source: {source}")))?;

        let cancel = CancelToken::new();
        {
            let mut running = self.running.lock().expect("scheduler state poisoned");
            if running.contains_key(source) {
                counter!("scheduler_coalesced_total").increment(1);
                debug!(source = %source, "trigger coalesced, run already active");
                return Ok(TriggerOutcome::Coalesced);
            }
            running.insert(source.clone(), cancel.clone());
        }
        let _slot = SlotGuard {
            scheduler: self,
            source: source.clone(),
        };

        let window = Window::day_of(Utc::now());
        let record = self.collector.run(client.as_ref(), window, &cancel).await?;
        Ok(TriggerOutcome::Ran(record))
    }

    /// Flag the active run for `source`, if any. The run observes the
    /// flag at its next suspension point and ends as failed/cancelled.
    pub fn cancel_source(&self, source: &SourceId) -> bool {
        let running = self.running.lock().expect("scheduler state poisoned");
        match running.get(source) {
            Some(token) => {
                token.cancel();
                counter!("scheduler_cancel_requests_total").increment(1);
                info!(source = %source, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Analyze the most recently closed period if it is ready and not
    /// yet claimed. Ready means full coverage, or closure plus the grace
    /// delay for a period that will stay incomplete.
    ///
    /// Periods missed while the process was down are caught up, newest
    /// first, one per poll tick, up to `ANALYSIS_LOOKBACK_PERIODS` back.
    /// Older periods are only picked up when they hold collected data;
    /// weeks without any collections stay unreported (an operator can
    /// still force them through `run_analysis_now`).
    pub async fn maybe_run_analysis(
        &self,
        now: DateTime<Utc>,
    ) -> PipelineResult<Option<ReportSummary>> {
        let newest = Period::containing(now).previous();
        if let Some(summary) = self.try_analyze(&newest, now, false).await? {
            return Ok(Some(summary));
        }
        let mut period = newest.previous();
        for _ in 1..ANALYSIS_LOOKBACK_PERIODS {
            if let Some(summary) = self.try_analyze(&period, now, true).await? {
                return Ok(Some(summary));
            }
            period = period.previous();
        }
        Ok(None)
    }

    async fn try_analyze(
        &self,
        period: &Period,
        now: DateTime<Utc>,
        require_data: bool,
    ) -> PipelineResult<Option<ReportSummary>> {
        if self.ledger.analysis_claimed(period).await? {
            return Ok(None);
        }

        let window = period.window();
        let records = self.ledger.in_window(&window).await?;
        if require_data && !records.iter().any(|r| r.outcome.counts_for_coverage()) {
            return Ok(None);
        }
        let cov = coverage(&self.sources, &records, &window);
        let deadline = window.end + chrono::Duration::seconds(self.grace_secs as i64);
        if !cov.is_complete() && now < deadline {
            debug!(
                period = %period.key(),
                missing = ?cov.missing,
                "holding analysis for missing coverage"
            );
            return Ok(None);
        }

        if !self.ledger.try_claim_analysis(period).await? {
            return Ok(None);
        }
        // The claim already guarantees single execution; force so a
        // preview published before closure cannot shadow the full data.
        let summary = self.analyzer.run(period, true).await?;
        Ok(Some(summary))
    }

    /// Operator-triggered analysis. For a closed period this claims the
    /// marker so the poller will not re-run it; an open period stays
    /// unclaimed and the preview report gets rebuilt once the period
    /// closes.
    pub async fn run_analysis_now(
        &self,
        period: &Period,
        force: bool,
        now: DateTime<Utc>,
    ) -> PipelineResult<ReportSummary> {
        if period.is_closed_at(now) {
            let _ = self.ledger.try_claim_analysis(period).await?;
        }
        self.analyzer.run(period, force).await
    }

    /// Spawn the cadence loop for every enabled source plus the analysis
    /// poller. Handles run until the process exits.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (source, cadence_secs) in &self.cadences {
            let sched = Arc::clone(self);
            let source = source.clone();
            let secs = *cadence_secs;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(secs));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match sched.run_source_now(&source).await {
                        Ok(TriggerOutcome::Ran(_)) => {}
                        Ok(TriggerOutcome::Coalesced) => {
                            debug!(source = %source, "cadence tick coalesced")
                        }
                        Err(e) => {
                            error!(source = %source, error = %e, "scheduled collection errored")
                        }
                    }
                }
            }));
        }

        let sched = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(sched.poll_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match sched.maybe_run_analysis(Utc::now()).await {
                    Ok(Some(summary)) => {
                        info!(period = %summary.period, status = summary.status.as_str(), "weekly analysis done")
                    }
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "analysis poll failed"),
                }
            }
        }));
        handles
    }
}

/// Clears the running slot when a run ends, normally or by abort.
struct SlotGuard<'a> {
    scheduler: &'a Scheduler,
    source: SourceId,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut running = self
            .scheduler
            .running
            .lock()
            .expect("scheduler state poisoned");
        running.remove(&self.source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::narrative::MockClient;
    use crate::analysis::ReportStatus;
    use crate::batch::RawBatch;
    use crate::model::{Outcome, SourceKind};
    use crate::store::{MemoryLedger, MemoryObjectStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    /// Economic-shaped client that takes `delay` to answer.
    struct SlowClient {
        id: SourceId,
        delay: Duration,
    }

    #[async_trait]
    impl SourceClient for SlowClient {
        async fn fetch(&self, window: &Window) -> PipelineResult<RawBatch> {
            tokio::time::sleep(self.delay).await;
            Ok(RawBatch {
                source: self.id.clone(),
                rows: vec![json!({
                    "ts": window.start.to_rfc3339(),
                    "indicator": "gas_storage_pct",
                    "value": 70.0,
                })],
                truncated: false,
            })
        }
        fn id(&self) -> &SourceId {
            &self.id
        }
        fn kind(&self) -> SourceKind {
            SourceKind::Economic
        }
    }

    fn one_source_config() -> PipelineConfig {
        let mut cfg = PipelineConfig::builtin_defaults();
        cfg.sources.retain(|s| s.id == "economic");
        cfg
    }

    fn scheduler_with(cfg: &PipelineConfig, delay_ms: u64) -> (Arc<Scheduler>, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryObjectStore::new());
        let clients: Vec<Arc<dyn SourceClient>> = vec![Arc::new(SlowClient {
            id: SourceId::new("economic"),
            delay: Duration::from_millis(delay_ms),
        })];
        let narrative = Arc::new(MockClient {
            fixed: Some("ok".to_string()),
        });
        (
            Arc::new(Scheduler::new(cfg, clients, store, ledger.clone(), narrative)),
            ledger,
        )
    }

    #[tokio::test]
    async fn concurrent_triggers_coalesce_to_one_run() {
        let cfg = one_source_config();
        let (sched, ledger) = scheduler_with(&cfg, 100);
        let id = SourceId::new("economic");

        let (a, b) = tokio::join!(sched.run_source_now(&id), sched.run_source_now(&id));
        let outcomes = [a.unwrap(), b.unwrap()];
        let ran = outcomes
            .iter()
            .filter(|o| matches!(o, TriggerOutcome::Ran(_)))
            .count();
        let coalesced = outcomes
            .iter()
            .filter(|o| matches!(o, TriggerOutcome::Coalesced))
            .count();
        assert_eq!(ran, 1);
        assert_eq!(coalesced, 1);

        let records = ledger.recent(&id, 50, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn slot_frees_after_completion() {
        let cfg = one_source_config();
        let (sched, _ledger) = scheduler_with(&cfg, 1);
        let id = SourceId::new("economic");

        let first = sched.run_source_now(&id).await.unwrap();
        assert!(matches!(first, TriggerOutcome::Ran(_)));
        let second = sched.run_source_now(&id).await.unwrap();
        assert!(matches!(second, TriggerOutcome::Ran(_)));
    }

    #[tokio::test]
    async fn cancel_marks_the_run_failed_cancelled() {
        let cfg = one_source_config();
        let (sched, _ledger) = scheduler_with(&cfg, 150);
        let id = SourceId::new("economic");

        let runner = {
            let sched = Arc::clone(&sched);
            let id = id.clone();
            tokio::spawn(async move { sched.run_source_now(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sched.cancel_source(&id));

        let outcome = runner.await.unwrap().unwrap();
        match outcome {
            TriggerOutcome::Ran(record) => {
                assert_eq!(record.outcome, Outcome::Failed);
                assert_eq!(record.error_detail.as_deref(), Some("cancelled"));
            }
            TriggerOutcome::Coalesced => panic!("expected a run"),
        }
        // Nothing left to cancel.
        assert!(!sched.cancel_source(&id));
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let cfg = one_source_config();
        let (sched, _) = scheduler_with(&cfg, 1);
        let err = sched
            .run_source_now(&SourceId::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    async fn seed_empty_days(
        ledger: &MemoryLedger,
        source: &str,
        days: std::ops::RangeInclusive<u32>,
    ) {
        for day in days {
            let start = Utc.with_ymd_and_hms(2026, 8, day, 0, 0, 0).unwrap();
            let w = Window::new(start, start + chrono::Duration::days(1)).unwrap();
            ledger
                .append(&CollectionRecord {
                    seq: 0,
                    source: SourceId::new(source),
                    window: w,
                    started_at: w.start,
                    finished_at: w.end,
                    outcome: Outcome::SuccessEmpty,
                    row_count: 0,
                    attempts: 1,
                    content_hash: None,
                    artifact_key: None,
                    error_detail: None,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn closed_covered_period_is_analyzed_exactly_once() {
        let cfg = one_source_config();
        let (sched, ledger) = scheduler_with(&cfg, 1);
        seed_empty_days(&ledger, "economic", 17..=23).await;

        let now = Utc.with_ymd_and_hms(2026, 8, 25, 12, 0, 0).unwrap();
        let first = sched.maybe_run_analysis(now).await.unwrap();
        let summary = first.expect("first poll analyzes");
        assert_eq!(summary.period, "2026-08-17");
        assert_eq!(summary.status, ReportStatus::Complete);

        let second = sched.maybe_run_analysis(now).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn incomplete_period_waits_for_grace_then_goes_partial() {
        let cfg = one_source_config();
        let (sched, ledger) = scheduler_with(&cfg, 1);
        // No coverage at all for the closed period.

        let just_closed = Utc.with_ymd_and_hms(2026, 8, 24, 1, 0, 0).unwrap();
        assert!(sched.maybe_run_analysis(just_closed).await.unwrap().is_none());
        assert!(!ledger
            .analysis_claimed(&Period::parse_key("2026-08-17").unwrap())
            .await
            .unwrap());

        let past_grace = Utc.with_ymd_and_hms(2026, 8, 24, 7, 0, 0).unwrap();
        let summary = sched
            .maybe_run_analysis(past_grace)
            .await
            .unwrap()
            .expect("analyzes after grace");
        assert_eq!(summary.status, ReportStatus::Partial);
    }

    #[tokio::test]
    async fn downtime_catchup_reaches_older_covered_periods() {
        let cfg = one_source_config();
        let (sched, ledger) = scheduler_with(&cfg, 1);
        // Collections covered the week of Aug 10, but the process was
        // down for every poll that should have analyzed it.
        seed_empty_days(&ledger, "economic", 10..=16).await;
        let now = Utc.with_ymd_and_hms(2026, 8, 25, 12, 0, 0).unwrap();

        // First poll settles the newest closed week (no data, past
        // grace, published partial).
        let first = sched.maybe_run_analysis(now).await.unwrap().unwrap();
        assert_eq!(first.period, "2026-08-17");
        assert_eq!(first.status, ReportStatus::Partial);

        // The next poll reaches back and analyzes the covered week.
        let second = sched.maybe_run_analysis(now).await.unwrap().unwrap();
        assert_eq!(second.period, "2026-08-10");
        assert_eq!(second.status, ReportStatus::Complete);

        // Older weeks hold no data: skipped, not claimed.
        assert!(sched.maybe_run_analysis(now).await.unwrap().is_none());
        assert!(!ledger
            .analysis_claimed(&Period::parse_key("2026-08-03").unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn forced_rerun_overwrites_existing_report() {
        let cfg = one_source_config();
        let (sched, ledger) = scheduler_with(&cfg, 1);
        seed_empty_days(&ledger, "economic", 17..=23).await;
        let period = Period::parse_key("2026-08-17").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 8, 25, 12, 0, 0).unwrap();

        let first = sched.run_analysis_now(&period, false, now).await.unwrap();
        assert!(first.written);
        let again = sched.run_analysis_now(&period, false, now).await.unwrap();
        assert!(!again.written);
        let forced = sched.run_analysis_now(&period, true, now).await.unwrap();
        assert!(forced.written);

        // The closed-period trigger claimed the marker; the poller
        // stays quiet.
        assert!(sched.maybe_run_analysis(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_period_preview_does_not_block_the_scheduled_run() {
        let cfg = one_source_config();
        let (sched, ledger) = scheduler_with(&cfg, 1);
        seed_empty_days(&ledger, "economic", 17..=23).await;
        let period = Period::parse_key("2026-08-17").unwrap();

        // Mid-week preview: the period is still open.
        let midweek = Utc.with_ymd_and_hms(2026, 8, 20, 9, 0, 0).unwrap();
        let preview = sched.run_analysis_now(&period, false, midweek).await.unwrap();
        assert!(preview.written);
        assert!(!ledger.analysis_claimed(&period).await.unwrap());

        // After closure the poller still owns the authoritative run and
        // rebuilds over the preview.
        let closed = Utc.with_ymd_and_hms(2026, 8, 25, 12, 0, 0).unwrap();
        let scheduled = sched
            .maybe_run_analysis(closed)
            .await
            .unwrap()
            .expect("scheduled run proceeds past the preview");
        assert!(scheduled.written);
        assert_eq!(scheduled.period, "2026-08-17");
    }
}
