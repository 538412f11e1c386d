// src/store/mod.rs
//
// Storage seams: the artifact object store and the append-only collection
// ledger. Both are traits so the pipeline, scheduler and API can run
// against in-memory backends in tests and the filesystem + SQLite pair in
// the binary.

pub mod fs;
pub mod memory;
pub mod sqlite;
pub mod writer;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};

use crate::error::PipelineResult;
use crate::model::{CollectionRecord, Period, SourceId, Window};

pub use fs::FsObjectStore;
pub use memory::{MemoryLedger, MemoryObjectStore};
pub use sqlite::SqliteLedger;
pub use writer::{ArtifactWriter, WriteReceipt};

/// Key for a raw artifact: partitioned by source and the window's start
/// day, addressed by content hash.
///
/// `raw/<source>/<yyyy>/<mm>/<dd>/<hash>.json`
pub fn artifact_key(source: &SourceId, window: &Window, content_hash: &str) -> String {
    let d = window.start.date_naive();
    format!(
        "raw/{}/{:04}/{:02}/{:02}/{}.json",
        source,
        d.year(),
        d.month(),
        d.day(),
        content_hash
    )
}

/// Key for a weekly report artifact.
pub fn report_key(period: &Period) -> String {
    format!("reports/{}.json", period.key())
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

/// Immutable object storage. Keys are content-addressed, so a replayed
/// put writes byte-identical data; publishes must be atomic (readers
/// never observe a partial object).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> PipelineResult<()>;
    async fn get(&self, key: &str) -> PipelineResult<Option<Vec<u8>>>;
    async fn exists(&self, key: &str) -> PipelineResult<bool>;
    /// Keys under `prefix`, lexicographically sorted, at most `limit`.
    async fn list(&self, prefix: &str, limit: usize) -> PipelineResult<Vec<ObjectMeta>>;
    /// Cheap liveness check for /health.
    async fn probe(&self) -> PipelineResult<()> {
        self.list("", 1).await.map(|_| ())
    }
}

/// Result of a conditional ledger append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new row was stored under this sequence number.
    Appended(u64),
    /// An identical logical record (same source, window, content hash)
    /// already existed; its sequence number is returned.
    Existing(u64),
}

impl AppendOutcome {
    pub fn seq(&self) -> u64 {
        match *self {
            AppendOutcome::Appended(s) | AppendOutcome::Existing(s) => s,
        }
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, AppendOutcome::Existing(_))
    }
}

/// Aggregate counts for the dashboard summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LedgerStats {
    pub success: u64,
    pub success_empty: u64,
    pub partial: u64,
    pub failed: u64,
    pub rows_ingested: u64,
}

impl LedgerStats {
    pub fn total(&self) -> u64 {
        self.success + self.success_empty + self.partial + self.failed
    }
}

/// Append-only record of finished collection runs, plus the analysis
/// markers that make weekly report triggering exactly-once.
///
/// `append` is conditional: rows carrying a content hash are unique per
/// (source, window, hash), and concurrent appends of the same logical
/// record store exactly one row. Failed rows always append.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn append(&self, record: &CollectionRecord) -> PipelineResult<AppendOutcome>;

    /// Newest-first records for one source. `before_seq` pages backwards;
    /// callers cap `limit` at the API edge.
    async fn recent(
        &self,
        source: &SourceId,
        limit: usize,
        before_seq: Option<u64>,
    ) -> PipelineResult<Vec<CollectionRecord>>;

    /// Records whose window intersects `window`, oldest-first.
    async fn in_window(&self, window: &Window) -> PipelineResult<Vec<CollectionRecord>>;

    /// The stored row for (source, window, hash), if any.
    async fn find_by_identity(
        &self,
        source: &SourceId,
        window: &Window,
        content_hash: &str,
    ) -> PipelineResult<Option<CollectionRecord>>;

    /// Most recent record for a source regardless of outcome.
    async fn latest(&self, source: &SourceId) -> PipelineResult<Option<CollectionRecord>>;

    /// Outcome counts over records finished at or after `since`.
    async fn stats_since(&self, since: DateTime<Utc>) -> PipelineResult<LedgerStats>;

    /// Claim the analysis run for `period`. True exactly once per period;
    /// later calls (from any process sharing the ledger) get false.
    async fn try_claim_analysis(&self, period: &Period) -> PipelineResult<bool>;

    /// Whether `period` has already been claimed.
    async fn analysis_claimed(&self, period: &Period) -> PipelineResult<bool>;

    /// Cheap liveness check for /health.
    async fn probe(&self) -> PipelineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn artifact_keys_partition_by_window_day() {
        let w = Window::new(
            Utc.with_ymd_and_hms(2026, 8, 17, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 18, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let key = artifact_key(&SourceId::new("market"), &w, "deadbeef");
        assert_eq!(key, "raw/market/2026/08/17/deadbeef.json");
    }

    #[test]
    fn report_keys_use_the_period_key() {
        let p = Period::parse_key("2026-08-17").unwrap();
        assert_eq!(report_key(&p), "reports/2026-08-17.json");
    }
}
