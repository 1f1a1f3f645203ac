//! Forward dedup records. `hash` is the primary key; insert-or-ignore makes
//! recording idempotent.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::store::Store;

impl Store {
    /// Durably record a successful main-destination forward.
    pub fn record_forwarded(
        &self,
        hash: &str,
        origin_id: &str,
        destination_id: &str,
        message_id: i64,
        preview: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = now.to_rfc3339();
        self.with_retry("record_forwarded", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO forwarded_messages
                 (hash, origin_id, destination_id, message_id, forwarded_at, content_preview)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![hash, origin_id, destination_id, message_id, now, preview],
            )
        })?;
        Ok(())
    }

    pub fn is_forwarded(&self, hash: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT 1 FROM forwarded_messages WHERE hash = ?1",
            [hash],
            |_| Ok(()),
        ) {
            Ok(()) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every recorded hash, for warming the in-memory dedup set.
    pub fn forwarded_hashes(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT hash FROM forwarded_messages")?;
        let hashes = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(hashes)
    }
}
