use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, ErrorCode};
use tracing::{debug, warn};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::IntegrityIssue;

/// Write attempts before giving up on a busy database.
const MAX_WRITE_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_secs(1);

/// Which checksum-bearing table an integrity scan walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumTable {
    Messages,
    Media,
}

impl ChecksumTable {
    fn name(&self) -> &'static str {
        match self {
            ChecksumTable::Messages => "messages",
            ChecksumTable::Media => "media",
        }
    }
}

/// Handle to the embedded store. A single internal lock serialises writers;
/// readers go through the same connection (WAL keeps external readers
/// unblocked). All mutating operations retry on `busy`/`locked`.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
    pub(crate) display_tz: Option<Tz>,
}

impl Store {
    /// Open (and create if missing) the store at `path`. Enables WAL and
    /// foreign-key checks, registers the `PAGE(rank, size)` SQL function
    /// and applies the schema.
    pub fn open(path: impl AsRef<Path>, display_tz: Option<&str>) -> Result<Store> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn, display_tz)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Store> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, display_tz: Option<&str>) -> Result<Store> {
        let tz = display_tz
            .map(|name| {
                name.parse::<Tz>()
                    .map_err(|_| StoreError::BadTimezone(name.to_string()))
            })
            .transpose()?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        register_page_function(&conn)?;
        init_db(&conn)?;

        Ok(Store {
            conn: Mutex::new(conn),
            display_tz: tz,
        })
    }

    /// Run `f` with the connection, retrying on busy/locked with
    /// exponential backoff. Non-lock errors propagate on first occurrence.
    pub(crate) fn with_retry<T>(
        &self,
        op: &str,
        mut f: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut delay = RETRY_BASE;
        let mut last = String::new();

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let outcome = {
                let conn = self.conn.lock().unwrap();
                f(&conn)
            };
            match outcome {
                Ok(v) => return Ok(v),
                Err(e) if is_lock_error(&e) && attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(op, attempt, retry_in_secs = delay.as_secs(), "database busy, retrying");
                    last = e.to_string();
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) if is_lock_error(&e) => {
                    return Err(StoreError::Contention {
                        attempts: MAX_WRITE_ATTEMPTS,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Contention {
            attempts: MAX_WRITE_ATTEMPTS,
            last,
        })
    }

    /// Run `f` inside a transaction: commit on `Ok`, rollback on `Err`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        match f(&tx) {
            Ok(v) => {
                tx.commit()?;
                Ok(v)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                drop(tx);
                Err(e)
            }
        }
    }

    /// Record the archive progress marker for `context`. Append-only; the
    /// newest row wins.
    pub fn save_checkpoint(&self, context: &str, last_message_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_retry("save_checkpoint", |conn| {
            conn.execute(
                "INSERT INTO checkpoints (context, last_message_id, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![context, last_message_id, now],
            )
        })?;
        debug!(context, last_message_id, "checkpoint saved");
        Ok(())
    }

    /// Resume point for `context`, if any pass has run before.
    pub fn latest_checkpoint(&self, context: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT last_message_id FROM checkpoints
             WHERE context = ?1 ORDER BY id DESC LIMIT 1",
            [context],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Report rows whose checksum column is NULL or empty, optionally
    /// bounded to an inclusive id range.
    pub fn verify_checksums(
        &self,
        table: ChecksumTable,
        id_range: Option<(i64, i64)>,
    ) -> Result<Vec<IntegrityIssue>> {
        let conn = self.conn.lock().unwrap();
        let (lo, hi) = id_range.unwrap_or((i64::MIN, i64::MAX));
        let sql = format!(
            "SELECT id FROM {} WHERE (checksum IS NULL OR checksum = '')
             AND id >= ?1 AND id <= ?2 ORDER BY id",
            table.name()
        );
        let mut stmt = conn.prepare(&sql)?;
        let issues = stmt
            .query_map(rusqlite::params![lo, hi], |row| row.get::<_, i64>(0))?
            .filter_map(|r| r.ok())
            .map(|id| IntegrityIssue {
                id,
                issue: "missing checksum".to_string(),
            })
            .collect();
        Ok(issues)
    }
}

/// `PAGE(rank, size) = ceil(rank / size)`, clamped so rank 0 still lands on
/// page 1. Mirrors the pagination maths of the site builder.
fn register_page_function(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "PAGE",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let rank: i64 = ctx.get(0)?;
            let size: i64 = ctx.get(1)?;
            if size <= 0 {
                return Ok(1i64);
            }
            Ok(((rank + size - 1) / size).max(1))
        },
    )
}

fn is_lock_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked
    )
}
