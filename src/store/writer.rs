// src/store/writer.rs
//
// Content-addressed artifact writer. The batch's canonical bytes produce
// the hash, the hash produces the key, and a ledger hit on
// (source, window, hash) means the bytes are already published: the run
// completes without touching storage again.

use std::sync::Arc;
use tracing::debug;

use crate::batch::{content_hash, NormalizedBatch};
use crate::error::PipelineResult;
use crate::store::{artifact_key, Ledger, ObjectStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub content_hash: String,
    pub artifact_key: String,
    /// True when an identical artifact was already on record and the
    /// object store was not written.
    pub deduplicated: bool,
}

pub struct ArtifactWriter {
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn Ledger>,
}

impl ArtifactWriter {
    pub fn new(store: Arc<dyn ObjectStore>, ledger: Arc<dyn Ledger>) -> Self {
        ArtifactWriter { store, ledger }
    }

    pub async fn write(&self, batch: &NormalizedBatch) -> PipelineResult<WriteReceipt> {
        let bytes = batch.canonical_bytes()?;
        let hash = content_hash(&bytes);
        let key = artifact_key(&batch.source, &batch.window, &hash);

        if self
            .ledger
            .find_by_identity(&batch.source, &batch.window, &hash)
            .await?
            .is_some()
        {
            debug!(source = %batch.source, %key, "artifact already recorded, skipping put");
            return Ok(WriteReceipt {
                content_hash: hash,
                artifact_key: key,
                deduplicated: true,
            });
        }

        self.store.put(&key, &bytes).await?;
        Ok(WriteReceipt {
            content_hash: hash,
            artifact_key: key,
            deduplicated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CollectionRecord, Outcome, SourceId, Window};
    use crate::store::{MemoryLedger, MemoryObjectStore};
    use chrono::{TimeZone, Utc};

    fn batch() -> NormalizedBatch {
        let window = Window::new(
            Utc.with_ymd_and_hms(2026, 8, 17, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 18, 0, 0, 0).unwrap(),
        )
        .unwrap();
        NormalizedBatch::from_observations(
            SourceId::new("market"),
            window,
            vec![crate::batch::Observation::new(
                1_784_700_000,
                "DE",
                "price_eur_mwh",
                80.5,
            )],
        )
    }

    #[tokio::test]
    async fn first_write_publishes_the_artifact() {
        let store = Arc::new(MemoryObjectStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let writer = ArtifactWriter::new(store.clone(), ledger);

        let receipt = writer.write(&batch()).await.unwrap();
        assert!(!receipt.deduplicated);
        assert_eq!(store.put_count(), 1);
        assert!(store.exists(&receipt.artifact_key).await.unwrap());
        assert!(receipt.artifact_key.starts_with("raw/market/2026/08/17/"));
        assert!(receipt.artifact_key.ends_with(&format!("{}.json", receipt.content_hash)));
    }

    #[tokio::test]
    async fn recorded_identity_skips_storage() {
        let store = Arc::new(MemoryObjectStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let writer = ArtifactWriter::new(store.clone(), ledger.clone());

        let b = batch();
        let first = writer.write(&b).await.unwrap();

        // Ledger now holds the record, as the pipeline would leave it.
        let record = CollectionRecord {
            seq: 0,
            source: b.source.clone(),
            window: b.window,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: Outcome::Success,
            row_count: b.len() as u64,
            attempts: 1,
            content_hash: Some(first.content_hash.clone()),
            artifact_key: Some(first.artifact_key.clone()),
            error_detail: None,
        };
        ledger.append(&record).await.unwrap();

        let second = writer.write(&b).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.content_hash, first.content_hash);
        assert_eq!(store.put_count(), 1);
    }
}
