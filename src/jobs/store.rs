//! Job record store.
//!
//! Wraps the `conversion_jobs` queries with a per-key write lock so that
//! writers for one key are serialized inside the process while unrelated keys
//! proceed in parallel. Cross-process safety comes from the guarded SQL
//! statements themselves.

use std::sync::Arc;
use std::time::Duration;

use bookforge_common::{Completion, JobFailure, JobKey, JobStatus, Result};
use bookforge_db::models::JobRecord;
use bookforge_db::pool::{get_conn, DbPool};
use bookforge_db::queries::{conversion_jobs, fanout};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// What a retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub records: usize,
    pub fanout_groups: usize,
}

#[derive(Clone)]
pub struct JobStore {
    pool: DbPool,
    locks: Arc<DashMap<JobKey, Arc<Mutex<()>>>>,
}

impl JobStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn key_lock(&self, key: &JobKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the write lock for `key`.
    fn write<T>(&self, key: &JobKey, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let lock = self.key_lock(key);
        let _guard = lock.lock();
        let conn = get_conn(&self.pool)?;
        f(&conn)
    }

    /// Claim `key` for a new run. Returns `false` if it is already active.
    pub fn upsert_starting(&self, key: &JobKey) -> Result<bool> {
        self.write(key, |conn| conversion_jobs::upsert_starting(conn, key))
    }

    pub fn update_progress(&self, key: &JobKey, pct: f64, status: JobStatus) -> Result<bool> {
        self.write(key, |conn| {
            conversion_jobs::update_progress(conn, key, pct, status)
        })
    }

    /// Write the terminal state. Returns `false` if the record was no longer
    /// active, in which case nothing changed.
    pub fn complete(&self, key: &JobKey, completion: &Completion) -> Result<bool> {
        let applied = self.write(key, |conn| conversion_jobs::complete(conn, key, completion))?;
        if applied {
            tracing::info!(
                subject_id = %key.subject_id,
                kind = %key.kind,
                status = %completion.status(),
                "Job finished"
            );
        } else {
            tracing::debug!(
                subject_id = %key.subject_id,
                kind = %key.kind,
                "Completion ignored; record not active"
            );
        }
        Ok(applied)
    }

    /// The record for `key`, or a synthesized `NotStarted` record.
    pub fn get(&self, key: &JobKey) -> Result<JobRecord> {
        let conn = get_conn(&self.pool)?;
        Ok(conversion_jobs::get(&conn, key)?.unwrap_or_else(|| JobRecord::not_started(key)))
    }

    pub fn list_active(&self) -> Result<Vec<JobRecord>> {
        let conn = get_conn(&self.pool)?;
        conversion_jobs::list_active(&conn)
    }

    /// Delete terminal records and distributed fan-out groups older than `max_age`.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<SweepReport> {
        let cutoff = cutoff(max_age);
        let conn = get_conn(&self.pool)?;
        let report = SweepReport {
            records: conversion_jobs::sweep_stale(&conn, cutoff)?,
            fanout_groups: fanout::sweep_groups(&conn, cutoff)?,
        };
        drop(conn);

        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        if report != SweepReport::default() {
            tracing::info!(
                records = report.records,
                fanout_groups = report.fanout_groups,
                "Retention sweep removed stale entries"
            );
        }
        Ok(report)
    }

    /// Fail records stuck in flight for longer than `liveness_timeout`.
    pub fn reap_in_flight(&self, liveness_timeout: Duration) -> Result<usize> {
        let conn = get_conn(&self.pool)?;
        let reaped = conversion_jobs::reap_in_flight(
            &conn,
            cutoff(liveness_timeout),
            &JobFailure::StaleJobRecovered.to_string(),
        )?;
        if reaped > 0 {
            tracing::warn!(reaped, "Recovered stale in-flight jobs");
        }
        Ok(reaped)
    }

    /// Mark the given active records as interrupted by shutdown.
    pub fn mark_interrupted<'a>(&self, keys: impl IntoIterator<Item = &'a JobKey>) -> Result<usize> {
        let interrupted = Completion::failure(JobFailure::Cancelled);
        let mut n = 0;
        for key in keys {
            if self.complete(key, &interrupted)? {
                n += 1;
            }
        }
        Ok(n)
    }
}

/// `now - age`, saturating at the earliest representable time.
pub(crate) fn cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookforge_common::ConversionKind;
    use bookforge_db::pool::init_memory_pool;

    fn store() -> JobStore {
        JobStore::new(init_memory_pool().unwrap())
    }

    fn key(subject: &str) -> JobKey {
        JobKey::new(subject, ConversionKind::FullConvert)
    }

    #[test]
    fn get_unknown_key_is_not_started() {
        let store = store();
        let rec = store.get(&key("never.aax")).unwrap();
        assert_eq!(rec.status, JobStatus::NotStarted);
        assert_eq!(rec.subject_id, "never.aax");
    }

    #[test]
    fn mark_interrupted_only_touches_active_records() {
        let store = store();
        let a = key("a.aax");
        let b = key("b.aax");
        store.upsert_starting(&a).unwrap();
        store.upsert_starting(&b).unwrap();
        store.complete(&b, &Completion::success("/out/b.m4b")).unwrap();

        assert_eq!(store.mark_interrupted([&a, &b]).unwrap(), 1);
        let rec = store.get(&a).unwrap();
        assert_eq!(rec.status, JobStatus::Failed);
        assert_eq!(rec.error_message.as_deref(), Some("Server interrupted"));
        assert_eq!(store.get(&b).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn zero_liveness_reaps_everything_active() {
        let store = store();
        store.upsert_starting(&key("a.aax")).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(store.reap_in_flight(Duration::ZERO).unwrap(), 1);
        let rec = store.get(&key("a.aax")).unwrap();
        assert_eq!(
            rec.error_message.as_deref(),
            Some("Stale job recovered after restart")
        );
    }

    #[test]
    fn sweep_with_huge_age_removes_nothing() {
        let store = store();
        store.upsert_starting(&key("a.aax")).unwrap();
        store
            .complete(&key("a.aax"), &Completion::failure("x"))
            .unwrap();
        let report = store.sweep_stale(Duration::from_secs(u64::MAX)).unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn sweep_drops_unused_key_locks() {
        let store = store();
        store.upsert_starting(&key("a.aax")).unwrap();
        assert_eq!(store.locks.len(), 1);
        store.sweep_stale(Duration::from_secs(3600)).unwrap();
        assert!(store.locks.is_empty());
    }

    #[test]
    fn concurrent_starts_admit_exactly_one() {
        let store = store();
        let k = key("race.aax");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let k = k.clone();
                std::thread::spawn(move || store.upsert_starting(&k).unwrap())
            })
            .collect();
        let started = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|s| *s)
            .count();
        assert_eq!(started, 1);
    }
}
