//! Distributed fan-out queue operations.
//!
//! A group row is the shared completion counter for one job instance; its
//! task rows are the independently schedulable sub-tasks. Workers in any
//! process claim tasks with [`dequeue_next_task`] and report with
//! [`record_task_result`], which tells exactly one caller that the group is
//! fully settled.

use bookforge_common::{Error, FanOutGroupId, JobKey, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::models::{format_ts, now_ts, FanOutGroup, FanOutTask, TaskState};

/// Create a group and enqueue one task per payload, in index order.
pub fn create_group(
    conn: &Connection,
    key: &JobKey,
    plan: &str,
    context: &serde_json::Value,
    payloads: &[serde_json::Value],
) -> Result<FanOutGroupId> {
    let id = FanOutGroupId::new();
    let now = now_ts();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    tx.execute(
        "INSERT INTO fanout_groups (id, subject_id, kind, plan, total, context, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            id.to_string(),
            key.subject_id,
            key.kind.as_str(),
            plan,
            payloads.len() as i64,
            context.to_string(),
            now
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO fanout_tasks (group_id, idx, payload, queued_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(|e| Error::database(e.to_string()))?;
        for (idx, payload) in payloads.iter().enumerate() {
            stmt.execute(rusqlite::params![
                id.to_string(),
                idx as i64,
                payload.to_string(),
                now
            ])
            .map_err(|e| Error::database(e.to_string()))?;
        }
    }

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(id)
}

/// Get a group by ID.
pub fn get_group(conn: &Connection, id: FanOutGroupId) -> Result<Option<FanOutGroup>> {
    let q = format!("SELECT {} FROM fanout_groups WHERE id = ?1", FanOutGroup::COLS);
    conn.query_row(&q, [id.to_string()], FanOutGroup::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Atomically claim the oldest queued task of a non-cancelled group.
///
/// Sets `status='running'`, `locked_by` and `locked_at`.
pub fn dequeue_next_task(conn: &Connection, worker: &str) -> Result<Option<FanOutTask>> {
    let q = format!(
        "UPDATE fanout_tasks SET status = 'running', locked_by = ?1, locked_at = ?2
         WHERE rowid = (
             SELECT t.rowid FROM fanout_tasks t
             JOIN fanout_groups g ON g.id = t.group_id
             WHERE t.status = 'queued' AND g.cancelled = 0
             ORDER BY t.queued_at ASC, t.idx ASC LIMIT 1
         )
         RETURNING {}",
        FanOutTask::COLS
    );
    conn.query_row(&q, rusqlite::params![worker, now_ts()], FanOutTask::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Refresh the lease on a running task so it is not requeued.
///
/// Returns `false` when the lease is gone or the group was cancelled; the
/// caller should stop working on the task.
pub fn touch_task(
    conn: &Connection,
    group_id: FanOutGroupId,
    index: usize,
    worker: &str,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE fanout_tasks SET locked_at = ?4
             WHERE group_id = ?1 AND idx = ?2 AND status = 'running' AND locked_by = ?3
               AND group_id IN (SELECT id FROM fanout_groups WHERE cancelled = 0)",
            rusqlite::params![group_id.to_string(), index as i64, worker, now_ts()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Settle a running task and bump the group counter in one transaction.
///
/// Returns the group's `(settled, total)` after the write, or `None` when
/// the task was not running under `worker` (already settled, or requeued
/// and claimed elsewhere); such late results are not counted. A cancelled
/// result also marks the group cancelled and settles its still-queued tasks
/// as cancelled, so they are never started.
pub fn record_task_result(
    conn: &Connection,
    group_id: FanOutGroupId,
    index: usize,
    worker: &str,
    state: TaskState,
    artifact: Option<&str>,
    error: Option<&str>,
) -> Result<Option<(usize, usize)>> {
    if !state.is_settled() {
        return Err(Error::Validation(format!(
            "task result must be terminal, got '{state}'"
        )));
    }
    let gid = group_id.to_string();

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| Error::database(e.to_string()))?;

    let n = tx
        .execute(
            "UPDATE fanout_tasks SET status = ?4, artifact = ?5, error = ?6
             WHERE group_id = ?1 AND idx = ?2 AND status = 'running' AND locked_by = ?3
               AND group_id IN (SELECT id FROM fanout_groups WHERE cancelled = 0)",
            rusqlite::params![gid, index as i64, worker, state.as_str(), artifact, error],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }

    let mut bump = 1;
    if state == TaskState::Cancelled {
        bump += cancel_queued(&tx, &gid)?;
    }

    let Some((settled, total)) = bump_settled(&tx, &gid, bump)? else {
        return Err(Error::database(format!("fan-out group {gid} has no row")));
    };

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(Some((settled, total)))
}

/// Cancel a group: flag it and settle its queued tasks as cancelled.
///
/// Running tasks are left to their workers. Returns `None` when the group no
/// longer exists (already joined), otherwise whether this call settled the
/// last outstanding task, in which case the caller owns the join.
pub fn cancel_group(conn: &Connection, group_id: FanOutGroupId) -> Result<Option<bool>> {
    let gid = group_id.to_string();
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| Error::database(e.to_string()))?;

    let bump = cancel_queued(&tx, &gid)?;
    let Some((settled, total)) = bump_settled(&tx, &gid, bump)? else {
        return Ok(None);
    };

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(Some(bump > 0 && settled == total))
}

/// Flag the group cancelled and settle its queued tasks; returns how many.
fn cancel_queued(tx: &Transaction, gid: &str) -> Result<usize> {
    let n = tx
        .execute(
            "UPDATE fanout_tasks SET status = 'cancelled', error = 'not started'
             WHERE group_id = ?1 AND status = 'queued'",
            [gid],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    tx.execute("UPDATE fanout_groups SET cancelled = 1 WHERE id = ?1", [gid])
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n)
}

/// Add `bump` to the settled counter; `None` if the group is gone.
fn bump_settled(tx: &Transaction, gid: &str, bump: usize) -> Result<Option<(usize, usize)>> {
    tx.query_row(
        "UPDATE fanout_groups SET settled = settled + ?2 WHERE id = ?1
         RETURNING settled, total",
        rusqlite::params![gid, bump as i64],
        |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as usize)),
    )
    .optional()
    .map_err(|e| Error::database(e.to_string()))
}

/// All tasks of a group in index order.
pub fn load_tasks(conn: &Connection, group_id: FanOutGroupId) -> Result<Vec<FanOutTask>> {
    let q = format!(
        "SELECT {} FROM fanout_tasks WHERE group_id = ?1 ORDER BY idx ASC",
        FanOutTask::COLS
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([group_id.to_string()], FanOutTask::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Delete a group and (by cascade) its tasks.
pub fn delete_group(conn: &Connection, group_id: FanOutGroupId) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM fanout_groups WHERE id = ?1",
            [group_id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Outcome of [`requeue_abandoned_tasks`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requeued {
    /// Tasks put back in the queue.
    pub requeued: usize,
    /// Abandoned tasks of cancelled groups, settled as cancelled instead.
    pub cancelled: usize,
    /// Groups this call brought to `settled == total`; the caller owns their join.
    pub joinable: Vec<FanOutGroupId>,
}

/// Recover tasks whose lease expired before `cutoff`.
///
/// Tasks of live groups go back to the queue. Cancelled groups never hand
/// out work again, so their abandoned tasks are settled as cancelled and
/// counted, in the same transaction.
pub fn requeue_abandoned_tasks(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Requeued> {
    let cutoff = format_ts(cutoff);
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| Error::database(e.to_string()))?;

    let expired: Vec<(String, usize)> = {
        let mut stmt = tx
            .prepare(
                "SELECT t.group_id, COUNT(*) FROM fanout_tasks t
                 JOIN fanout_groups g ON g.id = t.group_id
                 WHERE t.status = 'running' AND t.locked_at < ?1 AND g.cancelled = 1
                 GROUP BY t.group_id",
            )
            .map_err(|e| Error::database(e.to_string()))?;
        let rows = stmt
            .query_map([&cutoff], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })
            .map_err(|e| Error::database(e.to_string()))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::database(e.to_string()))?
    };

    let mut report = Requeued::default();
    for (gid, n) in expired {
        report.cancelled += tx
            .execute(
                "UPDATE fanout_tasks
                 SET status = 'cancelled', error = 'lease expired', locked_by = NULL, locked_at = NULL
                 WHERE group_id = ?1 AND status = 'running' AND locked_at < ?2",
                rusqlite::params![gid, cutoff],
            )
            .map_err(|e| Error::database(e.to_string()))?;
        if let Some((settled, total)) = bump_settled(&tx, &gid, n)? {
            if settled == total {
                let id = gid
                    .parse::<FanOutGroupId>()
                    .map_err(|e| Error::database(e.to_string()))?;
                report.joinable.push(id);
            }
        }
    }

    report.requeued = tx
        .execute(
            "UPDATE fanout_tasks SET status = 'queued', locked_by = NULL, locked_at = NULL
             WHERE status = 'running' AND locked_at < ?1",
            [&cutoff],
        )
        .map_err(|e| Error::database(e.to_string()))?;

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(report)
}

/// Delete groups created before `cutoff`, whatever their state.
pub fn sweep_groups(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    conn.execute(
        "DELETE FROM fanout_groups WHERE created_at < ?1",
        [format_ts(cutoff)],
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Number of tasks waiting to be claimed.
pub fn count_queued(conn: &Connection) -> Result<usize> {
    conn.query_row(
        "SELECT COUNT(*) FROM fanout_tasks WHERE status = 'queued'",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as usize)
    .map_err(|e| Error::database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_memory_pool;
    use bookforge_common::ConversionKind;
    use chrono::Duration;
    use serde_json::json;

    fn key() -> JobKey {
        JobKey::new("book.aax", ConversionKind::ChapteredConvert)
    }

    fn payloads(n: usize) -> Vec<serde_json::Value> {
        (0..n).map(|i| json!({ "chapter": i })).collect()
    }

    #[test]
    fn create_group_enqueues_tasks_in_order() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();

        let id = create_group(&conn, &key(), "chapters", &json!({"dir": "/tmp/x"}), &payloads(3))
            .unwrap();
        let group = get_group(&conn, id).unwrap().unwrap();
        assert_eq!(group.total, 3);
        assert_eq!(group.settled, 0);
        assert_eq!(group.plan, "chapters");
        assert_eq!(group.key(), key());
        assert_eq!(group.context["dir"], "/tmp/x");

        let tasks = load_tasks(&conn, id).unwrap();
        let idx: Vec<usize> = tasks.iter().map(|t| t.index).collect();
        assert_eq!(idx, vec![0, 1, 2]);
        assert!(tasks.iter().all(|t| t.state == TaskState::Queued));
        assert_eq!(count_queued(&conn).unwrap(), 3);
    }

    #[test]
    fn dequeue_claims_each_task_once() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        create_group(&conn, &key(), "chapters", &json!(null), &payloads(2)).unwrap();

        let a = dequeue_next_task(&conn, "w1").unwrap().unwrap();
        let b = dequeue_next_task(&conn, "w2").unwrap().unwrap();
        assert!(dequeue_next_task(&conn, "w3").unwrap().is_none());

        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert_eq!(a.state, TaskState::Running);
        assert_eq!(a.locked_by.as_deref(), Some("w1"));
        assert_eq!(a.payload["chapter"], 0);
    }

    #[test]
    fn counter_reports_join_exactly_once() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = create_group(&conn, &key(), "chapters", &json!(null), &payloads(3)).unwrap();

        let mut joins = 0;
        while let Some(task) = dequeue_next_task(&conn, "w").unwrap() {
            let (settled, total) = record_task_result(
                &conn,
                id,
                task.index,
                "w",
                TaskState::Succeeded,
                Some("part.mp3"),
                None,
            )
            .unwrap()
            .unwrap();
            if settled == total {
                joins += 1;
            }
        }
        assert_eq!(joins, 1);
    }

    #[test]
    fn duplicate_result_is_not_counted() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = create_group(&conn, &key(), "chapters", &json!(null), &payloads(2)).unwrap();

        let t = dequeue_next_task(&conn, "w").unwrap().unwrap();
        let first = record_task_result(&conn, id, t.index, "w", TaskState::Failed, None, Some("x"))
            .unwrap();
        let second =
            record_task_result(&conn, id, t.index, "w", TaskState::Succeeded, Some("p"), None)
                .unwrap();

        assert_eq!(first, Some((1, 2)));
        assert_eq!(second, None);
        let tasks = load_tasks(&conn, id).unwrap();
        assert_eq!(tasks[0].state, TaskState::Failed);
        assert_eq!(tasks[0].error.as_deref(), Some("x"));
    }

    #[test]
    fn cancelled_result_settles_queued_tasks() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = create_group(&conn, &key(), "chapters", &json!(null), &payloads(4)).unwrap();

        let t0 = dequeue_next_task(&conn, "w1").unwrap().unwrap();
        let t1 = dequeue_next_task(&conn, "w2").unwrap().unwrap();

        let after_cancel =
            record_task_result(&conn, id, t0.index, "w1", TaskState::Cancelled, None, None)
                .unwrap();
        assert_eq!(after_cancel, Some((3, 4)));
        assert!(dequeue_next_task(&conn, "w3").unwrap().is_none());
        assert!(get_group(&conn, id).unwrap().unwrap().cancelled);

        let last = record_task_result(&conn, id, t1.index, "w2", TaskState::Succeeded, Some("p"), None)
            .unwrap();
        assert_eq!(last, Some((4, 4)));
    }

    #[test]
    fn non_terminal_result_rejected() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = create_group(&conn, &key(), "chapters", &json!(null), &payloads(1)).unwrap();
        assert!(record_task_result(&conn, id, 0, "w", TaskState::Running, None, None).is_err());
    }

    #[test]
    fn delete_group_cascades() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = create_group(&conn, &key(), "chapters", &json!(null), &payloads(2)).unwrap();

        assert!(delete_group(&conn, id).unwrap());
        assert!(get_group(&conn, id).unwrap().is_none());
        assert!(load_tasks(&conn, id).unwrap().is_empty());
    }

    #[test]
    fn abandoned_tasks_are_requeued() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = create_group(&conn, &key(), "chapters", &json!(null), &payloads(1)).unwrap();

        let t = dequeue_next_task(&conn, "dead").unwrap().unwrap();
        let early = requeue_abandoned_tasks(&conn, Utc::now() - Duration::minutes(5)).unwrap();
        assert_eq!(early, Requeued::default());
        let late = requeue_abandoned_tasks(&conn, Utc::now() + Duration::seconds(1)).unwrap();
        assert_eq!(late.requeued, 1);
        assert!(late.joinable.is_empty());

        // The dead worker's late report no longer counts.
        assert_eq!(
            record_task_result(&conn, id, t.index, "dead", TaskState::Succeeded, Some("p"), None)
                .unwrap(),
            None
        );
        let again = dequeue_next_task(&conn, "alive").unwrap().unwrap();
        assert_eq!(again.index, 0);
        assert!(touch_task(&conn, id, 0, "alive").unwrap());
        assert!(!touch_task(&conn, id, 0, "dead").unwrap());
    }

    #[test]
    fn abandoned_task_of_cancelled_group_is_settled() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = create_group(&conn, &key(), "chapters", &json!(null), &payloads(2)).unwrap();

        let t0 = dequeue_next_task(&conn, "w1").unwrap().unwrap();
        let _t1 = dequeue_next_task(&conn, "dead").unwrap().unwrap();
        assert_eq!(
            record_task_result(&conn, id, t0.index, "w1", TaskState::Cancelled, None, None).unwrap(),
            Some((1, 2))
        );

        // The worker holding t1 never comes back.
        let report = requeue_abandoned_tasks(&conn, Utc::now() + Duration::seconds(1)).unwrap();
        assert_eq!(report.requeued, 0);
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.joinable, vec![id]);

        let group = get_group(&conn, id).unwrap().unwrap();
        assert_eq!((group.settled, group.total), (2, 2));
        let tasks = load_tasks(&conn, id).unwrap();
        assert_eq!(tasks[1].state, TaskState::Cancelled);
        assert_eq!(tasks[1].error.as_deref(), Some("lease expired"));
        assert_eq!(count_queued(&conn).unwrap(), 0);

        // A second pass finds nothing left to settle.
        let again = requeue_abandoned_tasks(&conn, Utc::now() + Duration::seconds(1)).unwrap();
        assert_eq!(again, Requeued::default());
    }

    #[test]
    fn cancel_group_settles_queued_and_reports_last() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = create_group(&conn, &key(), "chapters", &json!(null), &payloads(3)).unwrap();
        let running = dequeue_next_task(&conn, "w").unwrap().unwrap();
        assert!(touch_task(&conn, id, running.index, "w").unwrap());

        // One task is still running, so its worker owns the join.
        assert_eq!(cancel_group(&conn, id).unwrap(), Some(false));
        let group = get_group(&conn, id).unwrap().unwrap();
        assert!(group.cancelled);
        assert_eq!(group.settled, 2);
        assert!(dequeue_next_task(&conn, "w2").unwrap().is_none());
        // The running worker is told to stop at its next lease refresh.
        assert!(!touch_task(&conn, id, running.index, "w").unwrap());

        assert_eq!(
            record_task_result(&conn, id, running.index, "w", TaskState::Succeeded, Some("p"), None)
                .unwrap(),
            Some((3, 3))
        );
        assert_eq!(cancel_group(&conn, id).unwrap(), Some(false));
    }

    #[test]
    fn cancel_group_with_nothing_running_owns_the_join() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = create_group(&conn, &key(), "chapters", &json!(null), &payloads(2)).unwrap();

        assert_eq!(cancel_group(&conn, id).unwrap(), Some(true));
        delete_group(&conn, id).unwrap();
        assert_eq!(cancel_group(&conn, id).unwrap(), None);
    }

    #[test]
    fn sweep_groups_by_age() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = create_group(&conn, &key(), "chapters", &json!(null), &payloads(1)).unwrap();

        assert_eq!(sweep_groups(&conn, Utc::now() - Duration::days(2)).unwrap(), 0);
        assert_eq!(sweep_groups(&conn, Utc::now() + Duration::seconds(1)).unwrap(), 1);
        assert!(get_group(&conn, id).unwrap().is_none());
    }
}
