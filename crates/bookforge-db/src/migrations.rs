//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order. A
//! `schema_migrations` table tracks which versions have been applied.

use bookforge_common::{Error, Result};
use rusqlite::Connection;

/// V1: one mutable row per (subject, kind).
const V1_CONVERSION_JOBS: &str = r#"
CREATE TABLE conversion_jobs (
    subject_id    TEXT NOT NULL,
    kind          TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'not_started',
    progress      REAL NOT NULL DEFAULT 0,
    started_at    TEXT,
    updated_at    TEXT NOT NULL,
    completed_at  TEXT,
    error_message TEXT,
    result_path   TEXT,
    PRIMARY KEY (subject_id, kind)
);

CREATE INDEX idx_conversion_jobs_status ON conversion_jobs(status, updated_at);
"#;

/// V2: shared fan-out counters and sub-task queue for distributed workers.
const V2_FANOUT_QUEUE: &str = r#"
CREATE TABLE fanout_groups (
    id         TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL,
    kind       TEXT NOT NULL,
    plan       TEXT NOT NULL,
    total      INTEGER NOT NULL,
    settled    INTEGER NOT NULL DEFAULT 0,
    cancelled  INTEGER NOT NULL DEFAULT 0,
    context    TEXT NOT NULL DEFAULT 'null',
    created_at TEXT NOT NULL
);

CREATE TABLE fanout_tasks (
    group_id  TEXT NOT NULL REFERENCES fanout_groups(id) ON DELETE CASCADE,
    idx       INTEGER NOT NULL,
    payload   TEXT NOT NULL,
    status    TEXT NOT NULL DEFAULT 'queued',
    artifact  TEXT,
    error     TEXT,
    locked_by TEXT,
    locked_at TEXT,
    queued_at TEXT NOT NULL,
    PRIMARY KEY (group_id, idx)
);

CREATE INDEX idx_fanout_tasks_status ON fanout_tasks(status, queued_at);
CREATE INDEX idx_fanout_groups_created ON fanout_groups(created_at);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, V1_CONVERSION_JOBS), (2, V2_FANOUT_QUEUE)];

/// Run all pending migrations on `conn`.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        // A concurrent process may have applied this version first.
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
        tracing::debug!(version, "Applied migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }

    #[test]
    fn job_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let insert = "INSERT INTO conversion_jobs (subject_id, kind, status, updated_at)
                      VALUES ('a.aax', 'full-convert', 'starting', 'now')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
