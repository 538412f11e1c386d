//! SQLite collection ledger.
//!
//! Append-only: rows are inserted once and never updated or deleted.
//! Idempotence rests on a partial unique index over
//! (source, window_start, window_end, content_hash); a lost insert race
//! resolves to the winner's row. Analysis markers live in a second table
//! keyed by period so the weekly job triggers exactly once even when
//! several scheduler instances share the database file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::model::{CollectionRecord, Outcome, Period, SourceId, Window};
use crate::store::{AppendOutcome, Ledger, LedgerStats};

const SCHEMA_VERSION: u32 = 1;

const RECORD_COLS: &str = "seq, source, window_start, window_end, started_at, finished_at, \
     outcome, row_count, attempts, content_hash, artifact_key, error_detail";

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    pub fn open<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(&path)?;
        let ledger = SqliteLedger {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.initialize_schema()?;
        info!(path = %path.as_ref().display(), "opened collection ledger");
        Ok(ledger)
    }

    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = SqliteLedger {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.initialize_schema()?;
        Ok(ledger)
    }

    fn initialize_schema(&self) -> PipelineResult<()> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match current {
            None => {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS collection_records (
                        seq INTEGER PRIMARY KEY AUTOINCREMENT,
                        source TEXT NOT NULL,
                        window_start INTEGER NOT NULL,
                        window_end INTEGER NOT NULL,
                        started_at INTEGER NOT NULL,
                        finished_at INTEGER NOT NULL,
                        outcome TEXT NOT NULL,
                        row_count INTEGER NOT NULL,
                        attempts INTEGER NOT NULL,
                        content_hash TEXT,
                        artifact_key TEXT,
                        error_detail TEXT
                    );

                    -- Identity of a successful collection. NULL hashes
                    -- (empty and failed runs) stay outside the index, so
                    -- every failure keeps its own row.
                    CREATE UNIQUE INDEX IF NOT EXISTS idx_records_identity
                        ON collection_records(source, window_start, window_end, content_hash)
                        WHERE content_hash IS NOT NULL;

                    CREATE INDEX IF NOT EXISTS idx_records_source_seq
                        ON collection_records(source, seq DESC);
                    CREATE INDEX IF NOT EXISTS idx_records_window
                        ON collection_records(window_start, window_end);
                    CREATE INDEX IF NOT EXISTS idx_records_finished
                        ON collection_records(finished_at DESC);

                    CREATE TABLE IF NOT EXISTS analysis_markers (
                        period_key TEXT PRIMARY KEY,
                        claimed_at INTEGER NOT NULL
                    );
                    "#,
                )?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    [SCHEMA_VERSION],
                )?;
                info!("created ledger schema v{SCHEMA_VERSION}");
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("ledger schema at v{v}");
            }
            Some(v) => {
                warn!("ledger schema version mismatch: expected {SCHEMA_VERSION}, got {v}");
            }
        }
        Ok(())
    }
}

fn find_identity_seq(
    conn: &Connection,
    source: &SourceId,
    window: &Window,
    content_hash: &str,
) -> PipelineResult<Option<u64>> {
    let seq: Option<i64> = conn
        .query_row(
            "SELECT seq FROM collection_records
             WHERE source = ?1 AND window_start = ?2 AND window_end = ?3 AND content_hash = ?4",
            params![
                source.as_str(),
                window.start.timestamp(),
                window.end.timestamp(),
                content_hash
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(seq.map(|s| s as u64))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Raw row before outcome/time decoding.
struct RawRecord {
    seq: i64,
    source: String,
    window_start: i64,
    window_end: i64,
    started_at: i64,
    finished_at: i64,
    outcome: String,
    row_count: i64,
    attempts: i64,
    content_hash: Option<String>,
    artifact_key: Option<String>,
    error_detail: Option<String>,
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        seq: row.get(0)?,
        source: row.get(1)?,
        window_start: row.get(2)?,
        window_end: row.get(3)?,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        outcome: row.get(6)?,
        row_count: row.get(7)?,
        attempts: row.get(8)?,
        content_hash: row.get(9)?,
        artifact_key: row.get(10)?,
        error_detail: row.get(11)?,
    })
}

fn decode_ts(secs: i64) -> PipelineResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| PipelineError::storage(format!("timestamp {secs} out of range")))
}

fn decode(raw: RawRecord) -> PipelineResult<CollectionRecord> {
    Ok(CollectionRecord {
        seq: raw.seq as u64,
        source: SourceId::new(raw.source),
        window: Window {
            start: decode_ts(raw.window_start)?,
            end: decode_ts(raw.window_end)?,
        },
        started_at: decode_ts(raw.started_at)?,
        finished_at: decode_ts(raw.finished_at)?,
        outcome: Outcome::parse(&raw.outcome)?,
        row_count: raw.row_count as u64,
        attempts: raw.attempts as u32,
        content_hash: raw.content_hash,
        artifact_key: raw.artifact_key,
        error_detail: raw.error_detail,
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn append(&self, record: &CollectionRecord) -> PipelineResult<AppendOutcome> {
        record.check_consistent()?;
        let conn = self.conn.lock().expect("ledger mutex poisoned");

        if let Some(hash) = &record.content_hash {
            if let Some(seq) = find_identity_seq(&conn, &record.source, &record.window, hash)? {
                return Ok(AppendOutcome::Existing(seq));
            }
        }

        let insert = conn.execute(
            "INSERT INTO collection_records
                (source, window_start, window_end, started_at, finished_at,
                 outcome, row_count, attempts, content_hash, artifact_key, error_detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.source.as_str(),
                record.window.start.timestamp(),
                record.window.end.timestamp(),
                record.started_at.timestamp(),
                record.finished_at.timestamp(),
                record.outcome.as_str(),
                record.row_count as i64,
                record.attempts as i64,
                record.content_hash,
                record.artifact_key,
                record.error_detail,
            ],
        );

        match insert {
            Ok(_) => Ok(AppendOutcome::Appended(conn.last_insert_rowid() as u64)),
            Err(e) if is_unique_violation(&e) => {
                // Lost the insert race; hand back the winner's row.
                let hash = record
                    .content_hash
                    .as_deref()
                    .ok_or_else(|| PipelineError::storage("unique violation without hash"))?;
                find_identity_seq(&conn, &record.source, &record.window, hash)?
                    .map(AppendOutcome::Existing)
                    .ok_or_else(|| PipelineError::storage("winning ledger row disappeared"))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recent(
        &self,
        source: &SourceId,
        limit: usize,
        before_seq: Option<u64>,
    ) -> PipelineResult<Vec<CollectionRecord>> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let before = before_seq.map(|b| b as i64).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLS} FROM collection_records
             WHERE source = ?1 AND seq < ?2
             ORDER BY seq DESC LIMIT ?3"
        ))?;
        let raws = stmt
            .query_map(params![source.as_str(), before, limit as i64], read_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(decode).collect()
    }

    async fn in_window(&self, window: &Window) -> PipelineResult<Vec<CollectionRecord>> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLS} FROM collection_records
             WHERE window_start < ?1 AND window_end > ?2
             ORDER BY seq ASC"
        ))?;
        let raws = stmt
            .query_map(
                params![window.end.timestamp(), window.start.timestamp()],
                read_raw,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(decode).collect()
    }

    async fn find_by_identity(
        &self,
        source: &SourceId,
        window: &Window,
        content_hash: &str,
    ) -> PipelineResult<Option<CollectionRecord>> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLS} FROM collection_records
                     WHERE source = ?1 AND window_start = ?2 AND window_end = ?3
                       AND content_hash = ?4"
                ),
                params![
                    source.as_str(),
                    window.start.timestamp(),
                    window.end.timestamp(),
                    content_hash
                ],
                read_raw,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    async fn latest(&self, source: &SourceId) -> PipelineResult<Option<CollectionRecord>> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLS} FROM collection_records
                     WHERE source = ?1 ORDER BY seq DESC LIMIT 1"
                ),
                params![source.as_str()],
                read_raw,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    async fn stats_since(&self, since: DateTime<Utc>) -> PipelineResult<LedgerStats> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT outcome, COUNT(*), COALESCE(SUM(row_count), 0)
             FROM collection_records WHERE finished_at >= ?1 GROUP BY outcome",
        )?;
        let rows = stmt
            .query_map(params![since.timestamp()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = LedgerStats::default();
        for (outcome, count, rows_sum) in rows {
            match Outcome::parse(&outcome)? {
                Outcome::Success => stats.success = count as u64,
                Outcome::SuccessEmpty => stats.success_empty = count as u64,
                Outcome::Partial => stats.partial = count as u64,
                Outcome::Failed => stats.failed = count as u64,
            }
            stats.rows_ingested += rows_sum as u64;
        }
        Ok(stats)
    }

    async fn try_claim_analysis(&self, period: &Period) -> PipelineResult<bool> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let changed = conn.execute(
            "INSERT OR IGNORE INTO analysis_markers (period_key, claimed_at) VALUES (?1, ?2)",
            params![period.key(), Utc::now().timestamp()],
        )?;
        Ok(changed == 1)
    }

    async fn analysis_claimed(&self, period: &Period) -> PipelineResult<bool> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let found: Option<i64> = conn
            .query_row(
                "SELECT claimed_at FROM analysis_markers WHERE period_key = ?1",
                params![period.key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn probe(&self) -> PipelineResult<()> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, d, h, 0, 0).unwrap()
    }

    fn record(source: &str, day: u32, outcome: Outcome, hash: Option<&str>) -> CollectionRecord {
        let window = Window::new(ts(day, 0), ts(day + 1, 0)).unwrap();
        let has_artifact = outcome.has_artifact();
        CollectionRecord {
            seq: 0,
            source: SourceId::new(source),
            window,
            started_at: ts(day + 1, 1),
            finished_at: ts(day + 1, 2),
            outcome,
            row_count: if has_artifact { 7 } else { 0 },
            attempts: 1,
            content_hash: hash.map(str::to_string),
            artifact_key: hash.map(|h| format!("raw/{source}/{h}.json")),
            error_detail: (outcome == Outcome::Failed).then(|| "transient: 503".to_string()),
        }
    }

    #[tokio::test]
    async fn append_and_read_back_round_trips() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let rec = record("market", 17, Outcome::Success, Some("aaa"));
        let out = ledger.append(&rec).await.unwrap();
        assert!(matches!(out, AppendOutcome::Appended(1)));

        let got = ledger
            .recent(&SourceId::new("market"), 10, None)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].seq, 1);
        assert_eq!(got[0].outcome, Outcome::Success);
        assert_eq!(got[0].row_count, 7);
        assert_eq!(got[0].window, rec.window);
        assert_eq!(got[0].content_hash.as_deref(), Some("aaa"));
    }

    #[tokio::test]
    async fn duplicate_identity_resolves_to_existing_row() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let rec = record("market", 17, Outcome::Success, Some("aaa"));
        assert!(matches!(
            ledger.append(&rec).await.unwrap(),
            AppendOutcome::Appended(1)
        ));
        assert!(matches!(
            ledger.append(&rec).await.unwrap(),
            AppendOutcome::Existing(1)
        ));

        let all = ledger
            .recent(&SourceId::new("market"), 10, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn failed_runs_each_keep_their_own_row() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let rec = record("market", 17, Outcome::Failed, None);
        ledger.append(&rec).await.unwrap();
        ledger.append(&rec).await.unwrap();
        let all = ledger
            .recent(&SourceId::new("market"), 10, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn in_window_returns_intersecting_records_in_order() {
        let ledger = SqliteLedger::in_memory().unwrap();
        ledger
            .append(&record("market", 16, Outcome::Success, Some("a")))
            .await
            .unwrap();
        ledger
            .append(&record("market", 17, Outcome::Success, Some("b")))
            .await
            .unwrap();
        ledger
            .append(&record("market", 20, Outcome::Success, Some("c")))
            .await
            .unwrap();

        let w = Window::new(ts(17, 0), ts(19, 0)).unwrap();
        let hits = ledger.in_window(&w).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content_hash.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn stats_count_by_outcome_since_cutoff() {
        let ledger = SqliteLedger::in_memory().unwrap();
        ledger
            .append(&record("market", 16, Outcome::Success, Some("a")))
            .await
            .unwrap();
        ledger
            .append(&record("weather", 17, Outcome::Failed, None))
            .await
            .unwrap();
        ledger
            .append(&record("economic", 17, Outcome::SuccessEmpty, None))
            .await
            .unwrap();

        let stats = ledger.stats_since(ts(17, 3)).await.unwrap();
        assert_eq!(stats.success, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_empty, 1);
        assert_eq!(stats.total(), 2);

        let all = ledger.stats_since(ts(15, 0)).await.unwrap();
        assert_eq!(all.success, 1);
        assert_eq!(all.rows_ingested, 7);
    }

    #[tokio::test]
    async fn markers_claim_exactly_once_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let period = Period::parse_key("2026-08-17").unwrap();
        {
            let ledger = SqliteLedger::open(&path).unwrap();
            assert!(ledger.try_claim_analysis(&period).await.unwrap());
            assert!(!ledger.try_claim_analysis(&period).await.unwrap());
        }
        // Reopen: the claim survives the process.
        let ledger = SqliteLedger::open(&path).unwrap();
        assert!(ledger.analysis_claimed(&period).await.unwrap());
        assert!(!ledger.try_claim_analysis(&period).await.unwrap());
    }

    #[tokio::test]
    async fn latest_tracks_the_newest_row_per_source() {
        let ledger = SqliteLedger::in_memory().unwrap();
        ledger
            .append(&record("market", 16, Outcome::Success, Some("a")))
            .await
            .unwrap();
        ledger
            .append(&record("market", 17, Outcome::Failed, None))
            .await
            .unwrap();
        let latest = ledger.latest(&SourceId::new("market")).await.unwrap().unwrap();
        assert_eq!(latest.outcome, Outcome::Failed);
        assert!(ledger.latest(&SourceId::new("news")).await.unwrap().is_none());
    }
}
