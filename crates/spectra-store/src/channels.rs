//! Channel metadata and the per-account access table the total-forward
//! mode works from.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::store::Store;
use crate::types::ChannelRow;

impl Store {
    pub fn upsert_channel(&self, channel: &ChannelRow, now: DateTime<Utc>) -> Result<()> {
        let now = now.to_rfc3339();
        self.with_retry("upsert_channel", |conn| {
            conn.execute(
                "INSERT INTO channels (id, type, title, username, access_hash, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO UPDATE SET last_seen = excluded.last_seen",
                rusqlite::params![
                    channel.id,
                    channel.kind,
                    channel.title,
                    channel.username,
                    channel.access_hash,
                    now
                ],
            )
        })?;
        Ok(())
    }

    /// Replace the access row for one (account, channel) pair.
    pub fn upsert_channel_access(
        &self,
        account_phone: &str,
        channel_id: i64,
        channel_name: Option<&str>,
        access_hash: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = now.to_rfc3339();
        self.with_retry("upsert_channel_access", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO account_channel_access
                 (account_phone, channel_id, channel_name, access_hash, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![account_phone, channel_id, channel_name, access_hash, now],
            )
        })?;
        Ok(())
    }

    /// Every channel the fleet has touched, in id order.
    pub fn channels(&self) -> Result<Vec<ChannelRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, type, title, username, access_hash FROM channels ORDER BY id",
        )?;
        let channels = stmt
            .query_map([], |row| {
                Ok(ChannelRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    title: row.get(2)?,
                    username: row.get(3)?,
                    access_hash: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(channels)
    }

    /// Distinct channels with one accessing account each, for total-forward
    /// mode. When several accounts can reach a channel the first-indexed
    /// one wins.
    pub fn channel_access_pairs(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT channel_id, MIN(account_phone) FROM account_channel_access
             GROUP BY channel_id ORDER BY channel_id",
        )?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(pairs)
    }

    /// Number of channels one account can access.
    pub fn channel_access_count(&self, account_phone: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM account_channel_access WHERE account_phone = ?1",
            [account_phone],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
