//! Persistent per-account usage and health counters backing the registry
//! and rotator.

use chrono::{DateTime, Utc};
use rusqlite::Row;

use crate::error::Result;
use crate::store::Store;
use crate::types::{parse_rfc3339, AccountHealth};

impl Store {
    /// Make sure an account row exists; existing counters are untouched.
    pub fn ensure_account(&self, session_handle: &str, api_id: i32, phone: Option<&str>) -> Result<()> {
        self.with_retry("ensure_account", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO account_rotation (session_handle, api_id, phone)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![session_handle, api_id, phone],
            )
        })?;
        Ok(())
    }

    pub fn account(&self, session_handle: &str) -> Result<Option<AccountHealth>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT session_handle, usage_count, last_used, last_error, cooldown_until,
                    is_banned, flood_wait_count, success_count
             FROM account_rotation WHERE session_handle = ?1",
            [session_handle],
            row_to_health,
        ) {
            Ok(h) => Ok(Some(h)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All account rows in registration order.
    pub fn accounts(&self) -> Result<Vec<AccountHealth>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_handle, usage_count, last_used, last_error, cooldown_until,
                    is_banned, flood_wait_count, success_count
             FROM account_rotation ORDER BY rowid",
        )?;
        let accounts = stmt
            .query_map([], row_to_health)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(accounts)
    }

    /// Bump usage on selection; persisted before the account is handed out.
    pub fn record_account_selection(
        &self,
        session_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = now.to_rfc3339();
        self.with_retry("record_account_selection", |conn| {
            conn.execute(
                "UPDATE account_rotation
                 SET usage_count = usage_count + 1, last_used = ?1
                 WHERE session_handle = ?2",
                rusqlite::params![now, session_handle],
            )
        })?;
        Ok(())
    }

    pub fn record_account_success(&self, session_handle: &str) -> Result<()> {
        self.with_retry("record_account_success", |conn| {
            conn.execute(
                "UPDATE account_rotation SET success_count = success_count + 1
                 WHERE session_handle = ?1",
                [session_handle],
            )
        })?;
        Ok(())
    }

    /// Persist a failure outcome. `cooldown_until` and `banned` are decided
    /// by the registry from the error class; `flood` bumps the flood-wait
    /// counter.
    pub fn record_account_failure(
        &self,
        session_handle: &str,
        error: &str,
        cooldown_until: Option<DateTime<Utc>>,
        flood: bool,
        banned: bool,
    ) -> Result<()> {
        let cooldown = cooldown_until.map(|dt| dt.to_rfc3339());
        self.with_retry("record_account_failure", |conn| {
            conn.execute(
                "UPDATE account_rotation SET
                    last_error = ?1,
                    cooldown_until = COALESCE(?2, cooldown_until),
                    flood_wait_count = flood_wait_count + ?3,
                    is_banned = is_banned OR ?4
                 WHERE session_handle = ?5",
                rusqlite::params![error, cooldown, flood as i64, banned, session_handle],
            )
        })?;
        Ok(())
    }

    /// Zero usage counters for all non-banned accounts.
    pub fn reset_usage_counts(&self) -> Result<()> {
        self.with_retry("reset_usage_counts", |conn| {
            conn.execute(
                "UPDATE account_rotation SET usage_count = 0 WHERE is_banned = 0",
                [],
            )
        })?;
        Ok(())
    }
}

fn row_to_health(row: &Row<'_>) -> rusqlite::Result<AccountHealth> {
    let last_used: Option<String> = row.get(2)?;
    let cooldown_until: Option<String> = row.get(4)?;
    Ok(AccountHealth {
        session_handle: row.get(0)?,
        usage_count: row.get(1)?,
        last_used: last_used.as_deref().and_then(|s| parse_rfc3339(s).ok()),
        last_error: row.get(3)?,
        cooldown_until: cooldown_until.as_deref().and_then(|s| parse_rfc3339(s).ok()),
        is_banned: row.get::<_, i64>(5)? != 0,
        flood_wait_count: row.get(6)?,
        success_count: row.get(7)?,
    })
}
