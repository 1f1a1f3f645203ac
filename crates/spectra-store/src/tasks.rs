//! Durable two-phase task records for the parallel scheduler. A crash
//! leaves in-flight tasks identifiable as rows without `completed_at`.

use chrono::{DateTime, Utc};
use rusqlite::Row;

use crate::error::Result;
use crate::store::Store;
use crate::types::{parse_rfc3339, TaskRecord};

impl Store {
    /// Phase one: record the start before the task is launched.
    pub fn task_started(
        &self,
        task_id: &str,
        kind: &str,
        target: &str,
        session_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = now.to_rfc3339();
        self.with_retry("task_started", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO parallel_tasks
                 (task_id, task_type, target, session_handle, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![task_id, kind, target, session_handle, now],
            )
        })?;
        Ok(())
    }

    /// Phase two: record the outcome. The row becomes terminal.
    pub fn task_completed(
        &self,
        task_id: &str,
        success: bool,
        error: Option<&str>,
        result_json: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = now.to_rfc3339();
        self.with_retry("task_completed", |conn| {
            conn.execute(
                "UPDATE parallel_tasks
                 SET completed_at = ?1, success = ?2, error = ?3, result = ?4
                 WHERE task_id = ?5",
                rusqlite::params![now, success, error, result_json, task_id],
            )
        })?;
        Ok(())
    }

    pub fn task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT task_id, task_type, target, session_handle, started_at,
                    completed_at, success, error, result
             FROM parallel_tasks WHERE task_id = ?1",
            [task_id],
            row_to_task,
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every task of one kind, oldest first.
    pub fn tasks_of_kind(&self, kind: &str) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT task_id, task_type, target, session_handle, started_at,
                    completed_at, success, error, result
             FROM parallel_tasks WHERE task_type = ?1 ORDER BY started_at",
        )?;
        let tasks = stmt
            .query_map([kind], row_to_task)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    /// Tasks that started but never completed (live, or orphaned by a
    /// crash).
    pub fn in_flight_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT task_id, task_type, target, session_handle, started_at,
                    completed_at, success, error, result
             FROM parallel_tasks WHERE completed_at IS NULL ORDER BY started_at",
        )?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let started: String = row.get(4)?;
    let completed: Option<String> = row.get(5)?;
    Ok(TaskRecord {
        task_id: row.get(0)?,
        kind: row.get(1)?,
        target: row.get(2)?,
        session_handle: row.get(3)?,
        started_at: parse_rfc3339(&started).unwrap_or_else(|_| Utc::now()),
        completed_at: completed.as_deref().and_then(|s| parse_rfc3339(s).ok()),
        success: row.get::<_, Option<i64>>(6)?.map(|v| v != 0),
        error: row.get(7)?,
        result: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_phase_lifecycle() {
        let s = Store::open_in_memory().unwrap();
        let now = Utc::now();

        s.task_started("t1", "join", "@x", "alpha", now).unwrap();
        let t = s.task("t1").unwrap().unwrap();
        assert!(t.is_in_flight());
        assert_eq!(t.session_handle, "alpha");
        assert_eq!(s.in_flight_tasks().unwrap().len(), 1);

        s.task_completed("t1", true, None, Some("{\"id\":5}"), now)
            .unwrap();
        let t = s.task("t1").unwrap().unwrap();
        assert!(!t.is_in_flight());
        assert_eq!(t.success, Some(true));
        assert_eq!(t.result.as_deref(), Some("{\"id\":5}"));
        assert!(s.in_flight_tasks().unwrap().is_empty());
    }

    #[test]
    fn failed_task_records_error_class() {
        let s = Store::open_in_memory().unwrap();
        let now = Utc::now();
        s.task_started("t2", "archive", "@y", "bravo", now).unwrap();
        s.task_completed("t2", false, Some("FLOOD_WAIT"), None, now)
            .unwrap();

        let t = s.task("t2").unwrap().unwrap();
        assert_eq!(t.success, Some(false));
        assert_eq!(t.error.as_deref(), Some("FLOOD_WAIT"));
    }
}
