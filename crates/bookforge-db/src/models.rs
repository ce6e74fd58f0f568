//! Database model structs.
//!
//! Each model maps to a table row and provides a `from_row` constructor for
//! use with `rusqlite::Row`.

use std::fmt;
use std::str::FromStr;

use bookforge_common::{ConversionKind, Error, FanOutGroupId, JobKey, JobStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Render a timestamp in the fixed-width form stored in every TEXT column.
///
/// Microsecond precision with a `Z` suffix, so string comparison in SQL
/// orders the same way as time.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

fn conversion_failure(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_col<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse::<T>().map_err(|e| conversion_failure(idx, e))
}

fn parse_json(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_failure(idx, e))
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub subject_id: String,
    pub kind: ConversionKind,
    pub status: JobStatus,
    pub progress: f64,
    pub started_at: Option<String>,
    pub updated_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub result_path: Option<String>,
}

impl JobRecord {
    pub const COLS: &'static str = "subject_id, kind, status, progress, started_at, updated_at,
        completed_at, error_message, result_path";

    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            subject_id: row.get(0)?,
            kind: parse_col(row, 1)?,
            status: parse_col(row, 2)?,
            progress: row.get(3)?,
            started_at: row.get(4)?,
            updated_at: row.get(5)?,
            completed_at: row.get(6)?,
            error_message: row.get(7)?,
            result_path: row.get(8)?,
        })
    }

    /// The record reported for a key that has never been started.
    pub fn not_started(key: &JobKey) -> Self {
        Self {
            subject_id: key.subject_id.clone(),
            kind: key.kind,
            status: JobStatus::NotStarted,
            progress: 0.0,
            started_at: None,
            updated_at: None,
            completed_at: None,
            error_message: None,
            result_path: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.subject_id.clone(), self.kind)
    }
}

// ---------------------------------------------------------------------------
// Fan-out queue
// ---------------------------------------------------------------------------

/// State of one queued sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "cancelled" => Ok(TaskState::Cancelled),
            other => Err(Error::Validation(format!("unknown task state: {other}"))),
        }
    }
}

/// One distributed fan-out: the shared completion counter for a job instance.
#[derive(Debug, Clone)]
pub struct FanOutGroup {
    pub id: FanOutGroupId,
    pub subject_id: String,
    pub kind: ConversionKind,
    /// Registered plan name; selects the handler and aggregator.
    pub plan: String,
    pub total: usize,
    pub settled: usize,
    pub cancelled: bool,
    pub context: serde_json::Value,
    pub created_at: String,
}

impl FanOutGroup {
    pub const COLS: &'static str =
        "id, subject_id, kind, plan, total, settled, cancelled, context, created_at";

    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_col(row, 0)?,
            subject_id: row.get(1)?,
            kind: parse_col(row, 2)?,
            plan: row.get(3)?,
            total: row.get::<_, i64>(4)? as usize,
            settled: row.get::<_, i64>(5)? as usize,
            cancelled: row.get(6)?,
            context: parse_json(row, 7)?,
            created_at: row.get(8)?,
        })
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.subject_id.clone(), self.kind)
    }
}

/// One sub-task row.
#[derive(Debug, Clone)]
pub struct FanOutTask {
    pub group_id: FanOutGroupId,
    pub index: usize,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub artifact: Option<String>,
    pub error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
}

impl FanOutTask {
    pub const COLS: &'static str =
        "group_id, idx, payload, status, artifact, error, locked_by, locked_at";

    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            group_id: parse_col(row, 0)?,
            index: row.get::<_, i64>(1)? as usize,
            payload: parse_json(row, 2)?,
            state: parse_col(row, 3)?,
            artifact: row.get(4)?,
            error: row.get(5)?,
            locked_by: row.get(6)?,
            locked_at: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_are_fixed_width_and_sortable() {
        let a = format_ts(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
        let b = format_ts(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
        assert_eq!(a, "2024-01-01T09:00:00.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn not_started_record() {
        let key = JobKey::new("book.aax", ConversionKind::ChapteredConvert);
        let rec = JobRecord::not_started(&key);
        assert_eq!(rec.status, JobStatus::NotStarted);
        assert_eq!(rec.progress, 0.0);
        assert_eq!(rec.key(), key);
        assert!(rec.error_message.is_none());
    }

    #[test]
    fn task_state_parse() {
        assert_eq!("running".parse::<TaskState>().unwrap(), TaskState::Running);
        assert!("done".parse::<TaskState>().is_err());
        assert!(TaskState::Cancelled.is_settled());
        assert!(!TaskState::Queued.is_settled());
    }
}
