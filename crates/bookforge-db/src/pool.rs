//! Connection pool management for SQLite via r2d2.

use std::path::Path;
use std::time::Duration;

use bookforge_common::{Error, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::migrations;

/// Type alias for the database connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Type alias for a pooled database connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize a database pool backed by a file on disk.
///
/// Creates the SQLite file (and its parent directory) if missing, enables
/// foreign keys, WAL journal mode and a busy timeout on every new
/// connection, and runs pending migrations. Several processes may open the
/// same file; that is how distributed queue workers share state.
pub fn init_pool(db_path: &Path) -> Result<DbPool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;",
        )
    });

    let pool = Pool::builder()
        .max_size(8)
        .build(manager)
        .map_err(|e| Error::database(format!("Failed to create connection pool: {e}")))?;

    let conn = get_conn(&pool)?;
    migrations::run_migrations(&conn)?;

    tracing::debug!(path = %db_path.display(), "Database pool ready");
    Ok(pool)
}

/// Initialize an in-memory database pool (useful for tests).
///
/// Each call creates a uniquely-named shared-cache in-memory database so
/// parallel tests do not interfere with each other. The pool holds a single
/// connection: shared-cache table locks are not covered by the busy timeout.
pub fn init_memory_pool() -> Result<DbPool> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let uri = format!("file:bookforge_mem_{n}?mode=memory&cache=shared");

    let manager = SqliteConnectionManager::file(uri)
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::database(format!("Failed to create in-memory pool: {e}")))?;

    let conn = get_conn(&pool)?;
    migrations::run_migrations(&conn)?;

    Ok(pool)
}

/// Convenience helper to get a connection from the pool.
pub fn get_conn(pool: &DbPool) -> Result<PooledConnection> {
    pool.get()
        .map_err(|e| Error::database(format!("Failed to get connection from pool: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pool_has_foreign_keys() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn migrations_run_on_init() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('conversion_jobs', 'fanout_groups', 'fanout_tasks')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn memory_pools_are_isolated() {
        let a = init_memory_pool().unwrap();
        let b = init_memory_pool().unwrap();
        get_conn(&a)
            .unwrap()
            .execute(
                "INSERT INTO conversion_jobs (subject_id, kind, status, updated_at)
                 VALUES ('x', 'full-convert', 'failed', '2024-01-01T00:00:00.000000Z')",
                [],
            )
            .unwrap();
        let n: i64 = get_conn(&b)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM conversion_jobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn file_pool_uses_wal_and_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        let pool = init_pool(&path).unwrap();
        let conn = get_conn(&pool).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());
    }

    #[test]
    fn reopening_file_pool_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        drop(init_pool(&path).unwrap());
        assert!(init_pool(&path).is_ok());
    }
}
