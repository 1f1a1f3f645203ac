use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

/// Format used by `messages.date`/`edit_date` so the SQL strftime readers
/// can group by month and day.
pub const MESSAGE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn format_message_date(dt: &DateTime<Utc>) -> String {
    dt.format(MESSAGE_DATE_FORMAT).to_string()
}

pub(crate) fn parse_message_date(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, MESSAGE_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| StoreError::BadTimestamp(s.to_string()))
}

pub(crate) fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::BadTimestamp(s.to_string()))
}

/// Content digest recorded on a message row at insert time. Stable for a
/// given payload; used by the integrity scan, distinct from the forward
/// dedup hash.
pub fn message_checksum(id: i64, date: &DateTime<Utc>, content: Option<&str>) -> String {
    let input = format!(
        "{}|{}|{}",
        id,
        format_message_date(date),
        content.unwrap_or_default()
    );
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUser {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub tags: Vec<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMedia {
    pub id: i64,
    pub kind: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub thumb: Option<String>,
    pub mime: Option<String>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub msg_type: String,
    pub date: DateTime<Utc>,
    pub edit_date: Option<DateTime<Utc>>,
    pub content: Option<String>,
    pub reply_to: Option<i64>,
    pub user: Option<StoredUser>,
    pub media: Option<StoredMedia>,
    pub topic_id: Option<i64>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTopic {
    pub id: i64,
    pub entity_id: i64,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Where a username mention was seen inside a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionSource {
    Text,
    Entity,
    Forward,
}

impl MentionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MentionSource::Text => "text",
            MentionSource::Entity => "entity",
            MentionSource::Forward => "forward",
        }
    }
}

/// One month of the timeline with its message count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthBucket {
    pub date: DateTime<Utc>,
    pub slug: String,
    pub label: String,
    pub count: i64,
}

/// One day within a month, with the page its first message lands on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayBucket {
    pub date: DateTime<Utc>,
    pub slug: String,
    pub label: String,
    pub count: i64,
    pub page: i64,
}

/// Persistent health record of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountHealth {
    pub session_handle: String,
    pub usage_count: i64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub is_banned: bool,
    pub flood_wait_count: i64,
    pub success_count: i64,
}

impl AccountHealth {
    /// Selectable right now: not banned and out of cooldown.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.is_banned && self.cooldown_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: i64,
    pub kind: String,
    pub title: Option<String>,
    pub username: Option<String>,
    pub access_hash: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredGroup {
    pub link: String,
    pub kind: String,
    pub discovered_at: DateTime<Utc>,
    pub source: String,
    pub priority: f64,
    pub status: String,
    pub last_checked: Option<DateTime<Utc>>,
    pub title: Option<String>,
}

/// One mention edge of the group graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEdge {
    pub source: String,
    pub target: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub kind: String,
    pub target: String,
    pub session_handle: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub result: Option<String>,
}

impl TaskRecord {
    pub fn is_in_flight(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// A row flagged by the integrity scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub id: i64,
    pub issue: String,
}
