//! Archive-side persistence: users, media, topics, messages, mentions and
//! the timeline/dayline/paged readers the site reader consumes.

use chrono::{DateTime, Utc};
use rusqlite::Row;

use crate::error::Result;
use crate::store::Store;
use crate::types::{
    format_message_date, parse_message_date, DayBucket, MentionSource, MonthBucket, StoredMedia,
    StoredMessage, StoredTopic, StoredUser,
};

/// Column set for inserting a message; readers return [`StoredMessage`]
/// with user and media joined in.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageInsert {
    pub id: i64,
    pub msg_type: String,
    pub date: DateTime<Utc>,
    pub edit_date: Option<DateTime<Utc>>,
    pub content: Option<String>,
    pub reply_to: Option<i64>,
    pub user_id: Option<i64>,
    pub media_id: Option<i64>,
    pub topic_id: Option<i64>,
    pub checksum: Option<String>,
}

impl Store {
    /// Insert a user, updating every field on conflict.
    pub fn upsert_user(&self, user: &StoredUser) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tags = user.tags.join(" ");
        self.with_retry("upsert_user", |conn| {
            conn.execute(
                "INSERT INTO users (id, username, first_name, last_name, tags, avatar, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (id) DO UPDATE SET
                    username = excluded.username,
                    first_name = excluded.first_name,
                    last_name = excluded.last_name,
                    tags = excluded.tags,
                    avatar = COALESCE(excluded.avatar, avatar),
                    last_updated = excluded.last_updated",
                rusqlite::params![
                    user.id,
                    user.username,
                    user.first_name,
                    user.last_name,
                    tags,
                    user.avatar,
                    now
                ],
            )
        })?;
        Ok(())
    }

    pub fn upsert_media(&self, media: &StoredMedia) -> Result<()> {
        self.with_retry("upsert_media", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO media
                 (id, type, url, title, description, thumb, mime, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    media.id,
                    media.kind,
                    media.url,
                    media.title,
                    media.description,
                    media.thumb,
                    media.mime,
                    media.checksum
                ],
            )
        })?;
        Ok(())
    }

    pub fn upsert_topic(&self, topic: &StoredTopic) -> Result<()> {
        self.with_retry("upsert_topic", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO topics (id, entity_id, title, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    topic.id,
                    topic.entity_id,
                    topic.title,
                    topic.created_at.to_rfc3339()
                ],
            )
        })?;
        Ok(())
    }

    /// Insert a message; re-inserting the same id refreshes the mutable
    /// columns (edit date, content, checksum).
    pub fn upsert_message(&self, msg: &MessageInsert) -> Result<()> {
        let date = format_message_date(&msg.date);
        let edit_date = msg.edit_date.as_ref().map(format_message_date);
        self.with_retry("upsert_message", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO messages
                 (id, type, date, edit_date, content, reply_to, user_id, media_id, topic_id, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    msg.id,
                    msg.msg_type,
                    date,
                    edit_date,
                    msg.content,
                    msg.reply_to,
                    msg.user_id,
                    msg.media_id,
                    msg.topic_id,
                    msg.checksum
                ],
            )
        })?;
        Ok(())
    }

    /// Append-only record of a username seen inside a message.
    pub fn insert_mention(
        &self,
        username: &str,
        message_id: i64,
        date: &DateTime<Utc>,
        source: MentionSource,
    ) -> Result<()> {
        let date = date.to_rfc3339();
        self.with_retry("insert_mention", |conn| {
            conn.execute(
                "INSERT INTO username_mentions (username, message_id, date, source_type)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![username, message_id, date, source.as_str()],
            )
        })?;
        Ok(())
    }

    /// Message ids that mention `username`, oldest first.
    pub fn mentions(&self, username: &str) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT message_id FROM username_mentions WHERE username = ?1 ORDER BY id",
        )?;
        let ids = stmt
            .query_map([username], |row| row.get::<_, i64>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Newest message id, or `None` for an empty archive.
    pub fn last_message_id(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row("SELECT id FROM messages ORDER BY id DESC LIMIT 1", [], |r| {
            r.get::<_, i64>(0)
        }) {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All unique year-month groups with message counts, chronological.
    pub fn timeline(&self) -> Result<Vec<MonthBucket>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT strftime('%Y-%m-01 00:00:00', MIN(date)), COUNT(*)
             FROM messages GROUP BY strftime('%Y-%m', date) ORDER BY 1",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);

        rows.into_iter()
            .map(|(date_str, count)| {
                let date = parse_message_date(&date_str)?;
                let (slug, label) = self.month_labels(&date);
                Ok(MonthBucket {
                    date,
                    slug,
                    label,
                    count,
                })
            })
            .collect()
    }

    /// Days within one month with counts and the page of each day's first
    /// message for the given page size.
    pub fn dayline(&self, year: i32, month: u32, page_size: i64) -> Result<Vec<DayBucket>> {
        let month_key = format!("{year}{month:02}");
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT strftime('%Y-%m-%d 00:00:00', date), COUNT(*), PAGE(MIN(rank), ?1)
             FROM (
                SELECT ROW_NUMBER() OVER (ORDER BY id) AS rank, date FROM messages
                WHERE strftime('%Y%m', date) = ?2 ORDER BY id
             )
             GROUP BY strftime('%Y-%m-%d', date) ORDER BY 1",
        )?;
        let rows: Vec<(String, i64, i64)> = stmt
            .query_map(rusqlite::params![page_size, month_key], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);

        rows.into_iter()
            .map(|(date_str, count, page)| {
                let date = parse_message_date(&date_str)?;
                let (slug, label) = self.day_labels(&date);
                Ok(DayBucket {
                    date,
                    slug,
                    label,
                    count,
                    page,
                })
            })
            .collect()
    }

    /// Number of messages in one month.
    pub fn message_count(&self, year: i32, month: u32) -> Result<i64> {
        let month_key = format!("{year}{month:02}");
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE strftime('%Y%m', date) = ?1",
            [month_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// One page of a month's messages (ids above `last_id`), with user and
    /// media joined in, chronological.
    pub fn messages_page(
        &self,
        year: i32,
        month: u32,
        last_id: i64,
        limit: i64,
    ) -> Result<Vec<StoredMessage>> {
        let month_key = format!("{year}{month:02}");
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT messages.id, messages.type, messages.date, messages.edit_date,
                    messages.content, messages.reply_to, messages.topic_id, messages.checksum,
                    messages.user_id, users.username, users.first_name, users.last_name,
                    users.tags, users.avatar,
                    media.id, media.type, media.url, media.title, media.description,
                    media.thumb, media.mime, media.checksum
             FROM messages
             LEFT JOIN users ON (users.id = messages.user_id)
             LEFT JOIN media ON (media.id = messages.media_id)
             WHERE strftime('%Y%m', messages.date) = ?1 AND messages.id > ?2
             ORDER BY messages.id LIMIT ?3",
        )?;
        let messages = stmt
            .query_map(rusqlite::params![month_key, last_id, limit], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(messages)
    }

    fn month_labels(&self, date: &DateTime<Utc>) -> (String, String) {
        match self.display_tz {
            Some(tz) => {
                let local = date.with_timezone(&tz);
                (local.format("%Y-%m").to_string(), local.format("%b %Y").to_string())
            }
            None => (date.format("%Y-%m").to_string(), date.format("%b %Y").to_string()),
        }
    }

    fn day_labels(&self, date: &DateTime<Utc>) -> (String, String) {
        match self.display_tz {
            Some(tz) => {
                let local = date.with_timezone(&tz);
                (
                    local.format("%Y-%m-%d").to_string(),
                    local.format("%d %b %Y").to_string(),
                )
            }
            None => (
                date.format("%Y-%m-%d").to_string(),
                date.format("%d %b %Y").to_string(),
            ),
        }
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let date_str: String = row.get(2)?;
    let edit_str: Option<String> = row.get(3)?;
    let date = parse_message_date(&date_str).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let edit_date = edit_str.as_deref().and_then(|s| parse_message_date(s).ok());

    let user = row
        .get::<_, Option<i64>>(8)?
        .map(|user_id| -> rusqlite::Result<StoredUser> {
            let tags: Option<String> = row.get(12)?;
            Ok(StoredUser {
                id: user_id,
                username: row.get(9)?,
                first_name: row.get(10)?,
                last_name: row.get(11)?,
                tags: tags
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
                avatar: row.get(13)?,
            })
        })
        .transpose()?;

    let media = row
        .get::<_, Option<i64>>(14)?
        .map(|media_id| -> rusqlite::Result<StoredMedia> {
            Ok(StoredMedia {
                id: media_id,
                kind: row.get(15)?,
                url: row.get(16)?,
                title: row.get(17)?,
                description: row.get(18)?,
                thumb: row.get(19)?,
                mime: row.get(20)?,
                checksum: row.get(21)?,
            })
        })
        .transpose()?;

    Ok(StoredMessage {
        id: row.get(0)?,
        msg_type: row.get(1)?,
        date,
        edit_date,
        content: row.get(4)?,
        reply_to: row.get(5)?,
        user,
        media,
        topic_id: row.get(6)?,
        checksum: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message_checksum;
    use crate::ChecksumTable;
    use chrono::TimeZone;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn user(id: i64) -> StoredUser {
        StoredUser {
            id,
            username: Some(format!("user{id}")),
            first_name: Some("F".into()),
            last_name: None,
            tags: vec!["verified".into()],
            avatar: None,
        }
    }

    fn msg(id: i64, y: i32, m: u32, d: u32, content: &str) -> MessageInsert {
        let date = Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap();
        MessageInsert {
            id,
            msg_type: "message".into(),
            date,
            edit_date: None,
            content: Some(content.into()),
            reply_to: None,
            user_id: None,
            media_id: None,
            topic_id: None,
            checksum: Some(message_checksum(id, &date, Some(content))),
        }
    }

    #[test]
    fn message_round_trip_preserves_fields() {
        let s = store();
        s.upsert_user(&user(7)).unwrap();
        let mut m = msg(1, 2024, 3, 9, "hello");
        m.user_id = Some(7);
        m.reply_to = Some(99);
        s.upsert_message(&m).unwrap();

        let page = s.messages_page(2024, 3, 0, 10).unwrap();
        assert_eq!(page.len(), 1);
        let got = &page[0];
        assert_eq!(got.id, 1);
        assert_eq!(got.date, m.date);
        assert_eq!(got.content.as_deref(), Some("hello"));
        assert_eq!(got.reply_to, Some(99));
        assert_eq!(got.user.as_ref().unwrap().id, 7);
        assert_eq!(got.user.as_ref().unwrap().tags, vec!["verified".to_string()]);
    }

    #[test]
    fn timeline_groups_by_month_chronologically() {
        let s = store();
        s.upsert_message(&msg(1, 2024, 1, 5, "a")).unwrap();
        s.upsert_message(&msg(2, 2024, 1, 20, "b")).unwrap();
        s.upsert_message(&msg(3, 2024, 3, 1, "c")).unwrap();

        let months = s.timeline().unwrap();
        assert_eq!(months.len(), 2);
        assert_eq!(months[0].slug, "2024-01");
        assert_eq!(months[0].count, 2);
        assert_eq!(months[0].label, "Jan 2024");
        assert_eq!(months[1].slug, "2024-03");
        assert_eq!(months[1].count, 1);
    }

    #[test]
    fn dayline_pages_first_occurrence() {
        let s = store();
        // 3 messages on day 1, 2 on day 2; page size 2.
        for (i, day) in [(1, 1), (2, 1), (3, 1), (4, 2), (5, 2)] {
            s.upsert_message(&msg(i, 2024, 6, day, "x")).unwrap();
        }
        let days = s.dayline(2024, 6, 2).unwrap();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].slug, "2024-06-01");
        assert_eq!(days[0].count, 3);
        assert_eq!(days[0].page, 1); // rank 1 → page 1
        assert_eq!(days[1].slug, "2024-06-02");
        assert_eq!(days[1].count, 2);
        assert_eq!(days[1].page, 2); // rank 4 → page 2
    }

    #[test]
    fn messages_page_respects_last_id_and_limit() {
        let s = store();
        for i in 1..=5 {
            s.upsert_message(&msg(i, 2024, 2, 10, "x")).unwrap();
        }
        let page = s.messages_page(2024, 2, 2, 2).unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(s.message_count(2024, 2).unwrap(), 5);
    }

    #[test]
    fn edit_upsert_replaces_row() {
        let s = store();
        s.upsert_message(&msg(1, 2024, 2, 10, "before")).unwrap();
        let mut edited = msg(1, 2024, 2, 10, "after");
        edited.edit_date = Some(Utc.with_ymd_and_hms(2024, 2, 11, 0, 0, 0).unwrap());
        s.upsert_message(&edited).unwrap();

        let page = s.messages_page(2024, 2, 0, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content.as_deref(), Some("after"));
        assert!(page[0].edit_date.is_some());
    }

    #[test]
    fn mentions_are_append_only_and_queryable() {
        let s = store();
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        s.insert_mention("alpha_group", 1, &date, MentionSource::Text)
            .unwrap();
        s.insert_mention("alpha_group", 2, &date, MentionSource::Entity)
            .unwrap();
        assert_eq!(s.mentions("alpha_group").unwrap(), vec![1, 2]);
        assert!(s.mentions("absent").unwrap().is_empty());
    }

    #[test]
    fn verify_checksums_flags_missing_only() {
        let s = store();
        s.upsert_message(&msg(1, 2024, 2, 1, "ok")).unwrap();
        let mut bad = msg(2, 2024, 2, 1, "bad");
        bad.checksum = None;
        s.upsert_message(&bad).unwrap();

        let issues = s.verify_checksums(ChecksumTable::Messages, None).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, 2);

        let bounded = s
            .verify_checksums(ChecksumTable::Messages, Some((3, 10)))
            .unwrap();
        assert!(bounded.is_empty());
    }
}
