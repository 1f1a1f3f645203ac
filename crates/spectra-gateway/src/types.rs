use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a resolved Telegram entity turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Channel,
    Supergroup,
    Chat,
    Bot,
    User,
    Unknown,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Channel => "channel",
            EntityKind::Supergroup => "supergroup",
            EntityKind::Chat => "chat",
            EntityKind::Bot => "bot",
            EntityKind::User => "user",
            EntityKind::Unknown => "unknown",
        }
    }

    /// Entities the indexer records in the access table.
    pub fn is_channel_like(&self) -> bool {
        matches!(self, EntityKind::Channel | EntityKind::Supergroup)
    }
}

impl std::str::FromStr for EntityKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "channel" => EntityKind::Channel,
            "supergroup" => EntityKind::Supergroup,
            "chat" => EntityKind::Chat,
            "bot" => EntityKind::Bot,
            "user" => EntityKind::User,
            _ => EntityKind::Unknown,
        })
    }
}

/// Channel metadata as resolved by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub id: i64,
    pub kind: EntityKind,
    pub title: String,
    pub username: Option<String>,
    pub access_hash: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Poll,
    Webpage,
    Contact,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Audio => "audio",
            MediaKind::Poll => "poll",
            MediaKind::Webpage => "webpage",
            MediaKind::Contact => "contact",
        }
    }
}

/// Media attached to a message. `id`/`access_hash` are the platform's
/// identifiers and feed the forward dedup hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayMedia {
    pub id: Option<i64>,
    pub access_hash: Option<i64>,
    pub kind: Option<MediaKind>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub thumb: Option<String>,
    pub mime: Option<String>,
}

/// Downloadable-file view of a message's media, when there is one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayFile {
    pub id: Option<i64>,
    pub size: Option<i64>,
    pub name: Option<String>,
    pub mime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySender {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Platform flags worth keeping: "bot", "verified", "scam", ...
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One message as produced by the transport's history iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub edit_date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub reply_to: Option<i64>,
    pub sender: Option<GatewaySender>,
    pub media: Option<GatewayMedia>,
    pub file: Option<GatewayFile>,
    pub topic_id: Option<i64>,
    /// URLs carried in structured message entities (text_url / url).
    #[serde(default)]
    pub entity_urls: Vec<String>,
    /// Username of the original author when this is itself a forward.
    pub forwarded_from: Option<String>,
    /// Service messages (joins, pins, ...) have no forwardable content.
    #[serde(default)]
    pub is_service: bool,
}

impl GatewayMessage {
    /// Minimal constructor used by tests and the scripted gateway.
    pub fn text_message(id: i64, date: DateTime<Utc>, text: &str) -> Self {
        Self {
            id,
            date,
            edit_date: None,
            text: Some(text.to_string()),
            reply_to: None,
            sender: None,
            media: None,
            file: None,
            topic_id: None,
            entity_urls: Vec::new(),
            forwarded_from: None,
            is_service: false,
        }
    }
}

/// One entry of the account's dialog list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogEntry {
    pub entity: EntityInfo,
}

/// Paged history request. Default iteration order is newest-first, matching
/// the platform; `reverse` walks oldest-first from `offset_id` upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuery {
    /// Exclusive boundary: newest-first returns ids below it (0 = from the
    /// top), oldest-first returns ids above it.
    pub offset_id: i64,
    pub limit: u32,
    pub reverse: bool,
    pub topic_id: Option<i64>,
}

impl MessageQuery {
    pub fn newest(limit: u32) -> Self {
        Self {
            offset_id: 0,
            limit,
            reverse: false,
            topic_id: None,
        }
    }

    pub fn resume_after(offset_id: i64, limit: u32) -> Self {
        Self {
            offset_id,
            limit,
            reverse: true,
            topic_id: None,
        }
    }
}
