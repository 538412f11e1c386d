// src/collect/mod.rs
pub mod validate;

use chrono::Utc;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::batch::{NormalizedBatch, RawBatch};
use crate::config::{PipelineConfig, RetryConfig, ValidationConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::model::{CollectionRecord, Outcome, Window};
use crate::sources::SourceClient;
use crate::store::{ArtifactWriter, Ledger, ObjectStore};
use crate::collect::validate::validate_batch;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("collect_runs_total", "Finished collection runs by outcome.");
        describe_counter!("collect_rows_total", "Observations written to artifacts.");
        describe_counter!("collect_retries_total", "Fetch attempts beyond the first.");
        describe_counter!("collect_pages_total", "Upstream pages fetched.");
        describe_counter!("collect_dedup_total", "Runs that matched an existing artifact.");
        describe_histogram!("collect_fetch_ms", "Fetch duration in milliseconds.");
        describe_histogram!("collect_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!("collect_last_run_ts", "Unix ts of the last finished run.");
    });
}

/// Cooperative cancellation flag, checked at the run's suspension points.
/// A cancelled run finishes with `failed` / `cancelled` in the ledger.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> PipelineResult<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Delay before the attempt after `failures` failed ones: exponential
/// from the configured base, capped, with 50..100% jitter so parallel
/// sources do not retry in lockstep.
pub(crate) fn backoff_delay(retry: &RetryConfig, failures: u32) -> Duration {
    let exp = retry
        .base_delay_ms
        .saturating_mul(1u64 << failures.min(16));
    let capped = exp.min(retry.max_delay_ms).max(1);
    let jitter = 0.5 + 0.5 * rand::random::<f64>();
    Duration::from_millis((capped as f64 * jitter).round() as u64)
}

/// Fetch with retries. Only transient errors are retried; the attempt
/// count is returned either way so the ledger can record it.
pub async fn fetch_with_retry(
    client: &dyn SourceClient,
    window: &Window,
    retry: &RetryConfig,
    cancel: &CancelToken,
) -> (PipelineResult<RawBatch>, u32) {
    let mut attempts = 0u32;
    loop {
        if let Err(e) = cancel.checkpoint() {
            return (Err(e), attempts);
        }
        attempts += 1;
        match client.fetch(window).await {
            Ok(batch) => return (Ok(batch), attempts),
            Err(e) if e.is_retryable() && attempts < retry.max_attempts => {
                counter!("collect_retries_total").increment(1);
                let delay = backoff_delay(retry, attempts - 1);
                tracing::warn!(
                    source = %client.id(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (Err(e), attempts),
        }
    }
}

/// Runs one collection end to end: fetch, validate, publish, append.
/// Every run leaves exactly one ledger record behind (or reuses the
/// existing one when the content hash already matches).
pub struct Collector {
    retry: RetryConfig,
    validation: ValidationConfig,
    writer: ArtifactWriter,
    ledger: Arc<dyn Ledger>,
}

impl Collector {
    pub fn new(
        cfg: &PipelineConfig,
        store: Arc<dyn ObjectStore>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Collector {
            retry: cfg.retry,
            validation: cfg.validation,
            writer: ArtifactWriter::new(store, ledger.clone()),
            ledger,
        }
    }

    pub async fn run(
        &self,
        client: &dyn SourceClient,
        window: Window,
        cancel: &CancelToken,
    ) -> PipelineResult<CollectionRecord> {
        ensure_metrics_described();
        let started_at = Utc::now();
        let source = client.id().clone();

        let t0 = std::time::Instant::now();
        let (fetched, attempts) = fetch_with_retry(client, &window, &self.retry, cancel).await;
        histogram!("collect_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        let mut record = CollectionRecord {
            seq: 0,
            source: source.clone(),
            window,
            started_at,
            finished_at: started_at,
            outcome: Outcome::Failed,
            row_count: 0,
            attempts,
            content_hash: None,
            artifact_key: None,
            error_detail: None,
        };

        let step = match fetched {
            Ok(raw) => self.publish(client, raw, &mut record, cancel).await,
            Err(e) => Err(e),
        };
        if let Err(e) = step {
            record.outcome = Outcome::Failed;
            record.row_count = 0;
            record.content_hash = None;
            record.artifact_key = None;
            record.error_detail = Some(e.error_detail());
            tracing::warn!(source = %record.source, error = %e, "collection failed");
        }

        record.finished_at = Utc::now();
        let appended = self.ledger.append(&record).await?;
        record.seq = appended.seq();
        if appended.is_existing() {
            counter!("collect_dedup_total").increment(1);
        }

        counter!(
            "collect_runs_total",
            "source" => record.source.to_string(),
            "outcome" => record.outcome.as_str()
        )
        .increment(1);
        counter!("collect_rows_total").increment(record.row_count);
        gauge!("collect_last_run_ts").set(record.finished_at.timestamp() as f64);
        tracing::info!(
            source = %record.source,
            window = %record.window,
            outcome = record.outcome.as_str(),
            rows = record.row_count,
            attempts = record.attempts,
            deduplicated = appended.is_existing(),
            "collection finished"
        );
        Ok(record)
    }

    /// Validate and publish a fetched batch, filling `record` in place.
    /// Errors bubble to `run`, which converts them into a failed record.
    async fn publish(
        &self,
        client: &dyn SourceClient,
        raw: RawBatch,
        record: &mut CollectionRecord,
        cancel: &CancelToken,
    ) -> PipelineResult<()> {
        cancel.checkpoint()?;
        let report = validate_batch(
            client.kind(),
            &raw,
            self.validation.malformed_row_threshold,
        )?;
        if report.malformed_rows > 0 {
            tracing::warn!(
                source = %record.source,
                malformed = report.malformed_rows,
                total = report.total_rows,
                "dropped malformed rows"
            );
        }

        if report.observations.is_empty() {
            if raw.truncated {
                // Budget ran out before anything usable arrived.
                return Err(PipelineError::transient(
                    record.source.as_str(),
                    "pagination budget exhausted before any valid rows",
                ));
            }
            record.outcome = Outcome::SuccessEmpty;
            return Ok(());
        }

        let normalized = NormalizedBatch::from_observations(
            record.source.clone(),
            record.window,
            report.observations,
        );
        cancel.checkpoint()?;
        let receipt = self.writer.write(&normalized).await?;

        record.outcome = if raw.truncated {
            Outcome::Partial
        } else {
            Outcome::Success
        };
        record.row_count = normalized.len() as u64;
        record.content_hash = Some(receipt.content_hash);
        record.artifact_key = Some(receipt.artifact_key);
        Ok(())
    }
}
