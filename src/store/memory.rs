// src/store/memory.rs
//
// In-memory backends. The object store counts puts so tests can assert
// that an idempotent re-run touched storage zero times; the ledger keeps
// the same conditional-append contract as the SQLite implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::PipelineResult;
use crate::model::{CollectionRecord, Outcome, Period, SourceId, Window};
use crate::store::{AppendOutcome, Ledger, LedgerStats, ObjectMeta, ObjectStore};

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls observed since construction.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> PipelineResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .expect("object store mutex poisoned")
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> PipelineResult<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .expect("object store mutex poisoned")
            .get(key)
            .cloned())
    }

    async fn exists(&self, key: &str) -> PipelineResult<bool> {
        Ok(self
            .objects
            .lock()
            .expect("object store mutex poisoned")
            .contains_key(key))
    }

    async fn list(&self, prefix: &str, limit: usize) -> PipelineResult<Vec<ObjectMeta>> {
        let objects = self.objects.lock().expect("object store mutex poisoned");
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| ObjectMeta {
                key: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }
}

#[derive(Default)]
struct LedgerInner {
    records: Vec<CollectionRecord>,
    claimed: HashSet<String>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ledger mutex poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn append(&self, record: &CollectionRecord) -> PipelineResult<AppendOutcome> {
        record.check_consistent()?;
        let mut inner = self.inner.lock().expect("ledger mutex poisoned");
        if let Some(hash) = &record.content_hash {
            if let Some(existing) = inner.records.iter().find(|r| {
                r.source == record.source
                    && r.window == record.window
                    && r.content_hash.as_deref() == Some(hash.as_str())
            }) {
                return Ok(AppendOutcome::Existing(existing.seq));
            }
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let mut stored = record.clone();
        stored.seq = seq;
        inner.records.push(stored);
        Ok(AppendOutcome::Appended(seq))
    }

    async fn recent(
        &self,
        source: &SourceId,
        limit: usize,
        before_seq: Option<u64>,
    ) -> PipelineResult<Vec<CollectionRecord>> {
        let inner = self.inner.lock().expect("ledger mutex poisoned");
        let mut matching: Vec<_> = inner
            .records
            .iter()
            .filter(|r| r.source == *source)
            .filter(|r| before_seq.map_or(true, |b| r.seq < b))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.seq.cmp(&a.seq));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn in_window(&self, window: &Window) -> PipelineResult<Vec<CollectionRecord>> {
        let inner = self.inner.lock().expect("ledger mutex poisoned");
        let mut matching: Vec<_> = inner
            .records
            .iter()
            .filter(|r| r.window.start < window.end && r.window.end > window.start)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.seq.cmp(&b.seq));
        Ok(matching)
    }

    async fn find_by_identity(
        &self,
        source: &SourceId,
        window: &Window,
        content_hash: &str,
    ) -> PipelineResult<Option<CollectionRecord>> {
        let inner = self.inner.lock().expect("ledger mutex poisoned");
        Ok(inner
            .records
            .iter()
            .find(|r| {
                r.source == *source
                    && r.window == *window
                    && r.content_hash.as_deref() == Some(content_hash)
            })
            .cloned())
    }

    async fn latest(&self, source: &SourceId) -> PipelineResult<Option<CollectionRecord>> {
        let inner = self.inner.lock().expect("ledger mutex poisoned");
        Ok(inner
            .records
            .iter()
            .filter(|r| r.source == *source)
            .max_by_key(|r| r.seq)
            .cloned())
    }

    async fn stats_since(&self, since: DateTime<Utc>) -> PipelineResult<LedgerStats> {
        let inner = self.inner.lock().expect("ledger mutex poisoned");
        let mut stats = LedgerStats::default();
        for r in inner.records.iter().filter(|r| r.finished_at >= since) {
            match r.outcome {
                Outcome::Success => stats.success += 1,
                Outcome::SuccessEmpty => stats.success_empty += 1,
                Outcome::Partial => stats.partial += 1,
                Outcome::Failed => stats.failed += 1,
            }
            stats.rows_ingested += r.row_count;
        }
        Ok(stats)
    }

    async fn try_claim_analysis(&self, period: &Period) -> PipelineResult<bool> {
        let mut inner = self.inner.lock().expect("ledger mutex poisoned");
        Ok(inner.claimed.insert(period.key()))
    }

    async fn analysis_claimed(&self, period: &Period) -> PipelineResult<bool> {
        let inner = self.inner.lock().expect("ledger mutex poisoned");
        Ok(inner.claimed.contains(&period.key()))
    }

    async fn probe(&self) -> PipelineResult<()> {
        Ok(())
    }
}
