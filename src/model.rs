//! model.rs — shared vocabulary: sources, windows, periods, outcomes,
//! and the ledger's collection record.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Stable identifier of a configured source (e.g. `"market"`, `"weather"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        SourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        SourceId(s.to_string())
    }
}

/// Which adapter and declared schema a source uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Market,
    Weather,
    Economic,
    News,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Market => "market",
            SourceKind::Weather => "weather",
            SourceKind::Economic => "economic",
            SourceKind::News => "news",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(SourceKind::Market),
            "weather" => Ok(SourceKind::Weather),
            "economic" => Ok(SourceKind::Economic),
            "news" => Ok(SourceKind::News),
            other => Err(PipelineError::config(format!("unknown source kind: {other}"))),
        }
    }
}

/// Half-open collection window `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> PipelineResult<Self> {
        if start >= end {
            return Err(PipelineError::config(format!(
                "window start {start} must precede end {end}"
            )));
        }
        Ok(Window { start, end })
    }

    /// The UTC day containing `ts`: `[midnight, next midnight)`.
    pub fn day_of(ts: DateTime<Utc>) -> Self {
        let start = ts.date_naive().and_time(NaiveTime::MIN).and_utc();
        Window {
            start,
            end: start + Duration::days(1),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// One analysis period: seven days starting on a Monday (UTC).
///
/// Periods tile the calendar; the period key is the ISO date of its Monday
/// and doubles as the report identifier in the API and the artifact store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Period {
    start: NaiveDate,
}

pub const PERIOD_DAYS: i64 = 7;

impl Period {
    /// The period containing `ts`.
    pub fn containing(ts: DateTime<Utc>) -> Self {
        let date = ts.date_naive();
        let back = date.weekday().num_days_from_monday() as i64;
        Period {
            start: date - Duration::days(back),
        }
    }

    /// Parse a period key (`YYYY-MM-DD`). The date must be a Monday.
    pub fn parse_key(key: &str) -> PipelineResult<Self> {
        let date = NaiveDate::parse_from_str(key, "%Y-%m-%d")
            .map_err(|e| PipelineError::not_found(format!("bad period key {key:?}: {e}")))?;
        if date.weekday().num_days_from_monday() != 0 {
            return Err(PipelineError::not_found(format!(
                "period key {key} is not a Monday"
            )));
        }
        Ok(Period { start: date })
    }

    pub fn key(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start
    }

    /// Exclusive end date (the following Monday).
    pub fn end_date(&self) -> NaiveDate {
        self.start + Duration::days(PERIOD_DAYS)
    }

    /// The period as a UTC collection window.
    pub fn window(&self) -> Window {
        let start = self.start.and_time(NaiveTime::MIN).and_utc();
        Window {
            start,
            end: start + Duration::days(PERIOD_DAYS),
        }
    }

    pub fn previous(&self) -> Self {
        Period {
            start: self.start - Duration::days(PERIOD_DAYS),
        }
    }

    /// True once `now` has moved past the period's end.
    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.window().end
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.key(), self.end_date().format("%Y-%m-%d"))
    }
}

/// Terminal outcome of a collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Fetched, validated, artifact written.
    #[serde(rename = "success")]
    Success,
    /// The source answered authoritatively with zero rows.
    #[serde(rename = "success-empty")]
    SuccessEmpty,
    /// Fetch was truncated (page budget); artifact holds what arrived.
    #[serde(rename = "partial")]
    Partial,
    /// No usable data; no artifact.
    #[serde(rename = "failed")]
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::SuccessEmpty => "success-empty",
            Outcome::Partial => "partial",
            Outcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        match s {
            "success" => Ok(Outcome::Success),
            "success-empty" => Ok(Outcome::SuccessEmpty),
            "partial" => Ok(Outcome::Partial),
            "failed" => Ok(Outcome::Failed),
            other => Err(PipelineError::storage(format!("unknown outcome: {other}"))),
        }
    }

    /// Whether a record with this outcome satisfies period coverage.
    /// Truncated and failed runs never do.
    pub fn counts_for_coverage(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::SuccessEmpty)
    }

    /// Success and partial runs leave an artifact behind; empty and failed
    /// runs do not.
    pub fn has_artifact(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Partial)
    }
}

/// One terminal ledger row. Records are only ever written after a run has
/// finished; there is no in-progress state in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRecord {
    /// Ledger sequence number; 0 until the ledger assigns one on append.
    #[serde(default)]
    pub seq: u64,
    pub source: SourceId,
    pub window: Window,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub row_count: u64,
    pub attempts: u32,
    pub content_hash: Option<String>,
    pub artifact_key: Option<String>,
    pub error_detail: Option<String>,
}

impl CollectionRecord {
    /// Internal-consistency check enforced by the ledger on append.
    pub fn check_consistent(&self) -> PipelineResult<()> {
        if self.finished_at < self.started_at {
            return Err(PipelineError::storage(format!(
                "record for {} finished before it started",
                self.source
            )));
        }
        match self.outcome {
            Outcome::Success | Outcome::Partial => {
                if self.content_hash.is_none() || self.artifact_key.is_none() {
                    return Err(PipelineError::storage(format!(
                        "{} record for {} is missing its artifact reference",
                        self.outcome.as_str(),
                        self.source
                    )));
                }
                if self.outcome == Outcome::Success && self.row_count == 0 {
                    return Err(PipelineError::storage(format!(
                        "success record for {} has zero rows",
                        self.source
                    )));
                }
            }
            Outcome::SuccessEmpty | Outcome::Failed => {
                if self.row_count != 0 {
                    return Err(PipelineError::storage(format!(
                        "{} record for {} must carry zero rows",
                        self.outcome.as_str(),
                        self.source
                    )));
                }
                if self.content_hash.is_some() || self.artifact_key.is_some() {
                    return Err(PipelineError::storage(format!(
                        "{} record for {} must not reference an artifact",
                        self.outcome.as_str(),
                        self.source
                    )));
                }
            }
        }
        if self.outcome == Outcome::Failed && self.error_detail.is_none() {
            return Err(PipelineError::storage(format!(
                "failed record for {} is missing error detail",
                self.source
            )));
        }
        Ok(())
    }
}
