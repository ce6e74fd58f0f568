//! Job record operations.
//!
//! Every mutation is a single statement whose `WHERE` clause encodes the
//! allowed state transition, so the status machine holds even when several
//! processes share the database file.

use bookforge_common::{Completion, Error, JobKey, JobStatus, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::models::{format_ts, now_ts, JobRecord};

const ACTIVE: &str = "('starting', 'converting')";
const TERMINAL: &str = "('completed', 'failed')";

/// Move a key into `Starting` unless it is already active.
///
/// Inserts the record on first use; otherwise resets progress, error and
/// timestamps in place. `result_path` is left alone until the next
/// successful completion. Returns `false` (and changes nothing) when the key
/// is already `Starting` or `Converting`.
pub fn upsert_starting(conn: &Connection, key: &JobKey) -> Result<bool> {
    let now = now_ts();
    let q = format!(
        "INSERT INTO conversion_jobs (subject_id, kind, status, progress, started_at, updated_at)
         VALUES (?1, ?2, 'starting', 0, ?3, ?3)
         ON CONFLICT(subject_id, kind) DO UPDATE SET
             status = 'starting',
             progress = 0,
             started_at = excluded.started_at,
             updated_at = excluded.updated_at,
             completed_at = NULL,
             error_message = NULL
         WHERE conversion_jobs.status NOT IN {ACTIVE}"
    );
    let n = conn
        .execute(&q, rusqlite::params![key.subject_id, key.kind.as_str(), now])
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Record progress for an active job.
///
/// The stored value never decreases. Returns `false` if the record is not
/// active (finished, interrupted, or never started).
pub fn update_progress(
    conn: &Connection,
    key: &JobKey,
    pct: f64,
    status: JobStatus,
) -> Result<bool> {
    if !status.is_active() {
        return Err(Error::Validation(format!(
            "progress updates cannot set status '{status}'"
        )));
    }
    let q = format!(
        "UPDATE conversion_jobs
         SET progress = MAX(progress, ?3), status = ?4, updated_at = ?5
         WHERE subject_id = ?1 AND kind = ?2 AND status IN {ACTIVE}"
    );
    let n = conn
        .execute(
            &q,
            rusqlite::params![
                key.subject_id,
                key.kind.as_str(),
                pct.clamp(0.0, 100.0),
                status.as_str(),
                now_ts()
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Write the terminal result for an active job.
///
/// A completion for a record that is no longer active (for instance one that
/// was already marked interrupted during shutdown) is ignored and returns
/// `false`.
pub fn complete(conn: &Connection, key: &JobKey, completion: &Completion) -> Result<bool> {
    let now = now_ts();
    let n = match completion {
        Completion::Success { result_path } => conn.execute(
            &format!(
                "UPDATE conversion_jobs
                 SET status = 'completed', progress = 100, result_path = ?3,
                     error_message = NULL, completed_at = ?4, updated_at = ?4
                 WHERE subject_id = ?1 AND kind = ?2 AND status IN {ACTIVE}"
            ),
            rusqlite::params![key.subject_id, key.kind.as_str(), result_path, now],
        ),
        Completion::Failure { error_message } => conn.execute(
            &format!(
                "UPDATE conversion_jobs
                 SET status = 'failed', error_message = ?3, completed_at = ?4, updated_at = ?4
                 WHERE subject_id = ?1 AND kind = ?2 AND status IN {ACTIVE}"
            ),
            rusqlite::params![key.subject_id, key.kind.as_str(), error_message, now],
        ),
    }
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Get the record for a key, if one exists.
pub fn get(conn: &Connection, key: &JobKey) -> Result<Option<JobRecord>> {
    let q = format!(
        "SELECT {} FROM conversion_jobs WHERE subject_id = ?1 AND kind = ?2",
        JobRecord::COLS
    );
    let result = conn.query_row(
        &q,
        rusqlite::params![key.subject_id, key.kind.as_str()],
        JobRecord::from_row,
    );
    match result {
        Ok(r) => Ok(Some(r)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// List all records in `Starting` or `Converting`, oldest first.
pub fn list_active(conn: &Connection) -> Result<Vec<JobRecord>> {
    let q = format!(
        "SELECT {} FROM conversion_jobs WHERE status IN {ACTIVE} ORDER BY started_at ASC",
        JobRecord::COLS
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], JobRecord::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Delete finished records last touched before `cutoff`.
pub fn sweep_stale(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let q = format!("DELETE FROM conversion_jobs WHERE status IN {TERMINAL} AND updated_at < ?1");
    conn.execute(&q, [format_ts(cutoff)])
        .map_err(|e| Error::database(e.to_string()))
}

/// Fail active records whose last update is older than `cutoff`.
pub fn reap_in_flight(conn: &Connection, cutoff: DateTime<Utc>, reason: &str) -> Result<usize> {
    let now = now_ts();
    let q = format!(
        "UPDATE conversion_jobs
         SET status = 'failed', error_message = ?2, completed_at = ?3, updated_at = ?3
         WHERE status IN {ACTIVE} AND updated_at < ?1"
    );
    conn.execute(&q, rusqlite::params![format_ts(cutoff), reason, now])
        .map_err(|e| Error::database(e.to_string()))
}
