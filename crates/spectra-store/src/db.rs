use rusqlite::{Connection, Result};

/// Initialise the full schema. Safe to call on every startup (idempotent).
///
/// Timestamp conventions: `messages.date`/`edit_date` use
/// `YYYY-MM-DD HH:MM:SS` UTC so the strftime-based timeline readers work;
/// every other table stores RFC 3339 UTC strings.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_archive_tables(conn)?;
    create_fleet_tables(conn)?;
    create_discovery_tables(conn)?;
    create_forwarding_tables(conn)?;
    Ok(())
}

fn create_archive_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id           INTEGER NOT NULL PRIMARY KEY,
            username     TEXT,
            first_name   TEXT,
            last_name    TEXT,
            tags         TEXT,
            avatar       TEXT,
            last_updated TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS media (
            id          INTEGER NOT NULL PRIMARY KEY,
            type        TEXT,
            url         TEXT,
            title       TEXT,
            description TEXT,
            thumb       TEXT,
            mime        TEXT,
            checksum    TEXT
        );
        CREATE TABLE IF NOT EXISTS topics (
            id         INTEGER NOT NULL PRIMARY KEY,
            entity_id  INTEGER NOT NULL,
            title      TEXT,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS messages (
            id        INTEGER NOT NULL PRIMARY KEY,
            type      TEXT NOT NULL,
            date      TIMESTAMP NOT NULL,
            edit_date TIMESTAMP,
            content   TEXT,
            reply_to  INTEGER,
            user_id   INTEGER,
            media_id  INTEGER,
            topic_id  INTEGER,
            checksum  TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(media_id) REFERENCES media(id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(date);
        CREATE TABLE IF NOT EXISTS username_mentions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            username    TEXT NOT NULL,
            message_id  INTEGER NOT NULL,
            date        TEXT NOT NULL,
            source_type TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_mentions_username
            ON username_mentions(username);
        CREATE TABLE IF NOT EXISTS checkpoints (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            context         TEXT NOT NULL,
            last_message_id INTEGER NOT NULL,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_checkpoints_context
            ON checkpoints(context, id DESC);",
    )
}

fn create_fleet_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS channels (
            id          INTEGER NOT NULL PRIMARY KEY,
            type        TEXT NOT NULL,
            title       TEXT,
            username    TEXT,
            access_hash INTEGER,
            last_seen   TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS account_channel_access (
            account_phone TEXT NOT NULL,
            channel_id    INTEGER NOT NULL,
            channel_name  TEXT,
            access_hash   INTEGER,
            last_seen     TEXT NOT NULL,
            PRIMARY KEY (account_phone, channel_id)
        );
        CREATE TABLE IF NOT EXISTS account_rotation (
            session_handle   TEXT PRIMARY KEY,
            api_id           INTEGER,
            phone            TEXT,
            usage_count      INTEGER NOT NULL DEFAULT 0,
            last_used        TEXT,
            last_error       TEXT,
            cooldown_until   TEXT,
            is_banned        INTEGER NOT NULL DEFAULT 0,
            flood_wait_count INTEGER NOT NULL DEFAULT 0,
            success_count    INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS parallel_tasks (
            task_id        TEXT PRIMARY KEY,
            task_type      TEXT NOT NULL,
            target         TEXT NOT NULL,
            session_handle TEXT NOT NULL,
            started_at     TEXT NOT NULL,
            completed_at   TEXT,
            success        INTEGER,
            error          TEXT,
            result         TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_inflight
            ON parallel_tasks(completed_at) WHERE completed_at IS NULL;",
    )
}

fn create_discovery_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS discovered_groups (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            group_link      TEXT NOT NULL UNIQUE,
            group_type      TEXT NOT NULL,
            date_discovered TEXT NOT NULL,
            source          TEXT NOT NULL,
            priority        REAL NOT NULL DEFAULT 0.0,
            status          TEXT NOT NULL DEFAULT 'new',
            last_checked    TEXT,
            title           TEXT
        );
        CREATE TABLE IF NOT EXISTS group_relationships (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            source_group      TEXT NOT NULL,
            target_group      TEXT NOT NULL,
            relationship_type TEXT NOT NULL DEFAULT 'mention',
            weight            REAL NOT NULL DEFAULT 1.0,
            UNIQUE(source_group, target_group, relationship_type)
        );
        CREATE TABLE IF NOT EXISTS discovery_sources (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            source_entity TEXT NOT NULL,
            date_crawled  TEXT NOT NULL,
            groups_found  INTEGER NOT NULL,
            depth         INTEGER NOT NULL
        );",
    )
}

fn create_forwarding_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS forwarded_messages (
            hash            TEXT PRIMARY KEY,
            origin_id       TEXT NOT NULL,
            destination_id  TEXT NOT NULL,
            message_id      INTEGER NOT NULL,
            forwarded_at    TEXT NOT NULL,
            content_preview TEXT
        );",
    )
}
