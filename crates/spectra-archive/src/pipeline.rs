//! The archive pass itself: checkpoint-resumed batch iteration feeding the
//! store and the media sink.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use spectra_core::config::ArchiveConfig;
use spectra_core::Clock;
use spectra_discovery::extract::extract_mentions;
use spectra_fleet::{ArchiveRunner, FleetError};
use spectra_gateway::{
    EntityInfo, GatewayError, GatewayMessage, MessageQuery, TelegramGateway,
};
use spectra_store::{
    message_checksum, MessageInsert, Store, StoredMedia, StoredTopic, StoredUser,
};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Result;
use crate::media::MediaSink;

/// Extra sleep on top of a flood-wait, in seconds.
const FLOOD_BUFFER_SECS: u64 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub messages: usize,
    pub media_downloads: usize,
    pub mentions: usize,
}

pub struct Archiver {
    store: Arc<Store>,
    config: ArchiveConfig,
    sink: MediaSink,
    clock: Arc<dyn Clock>,
}

impl Archiver {
    pub fn new(
        store: Arc<Store>,
        config: ArchiveConfig,
        sink: MediaSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            sink,
            clock,
        }
    }

    /// Run one archive pass over `target`, resuming from the last
    /// checkpoint. Batches are paced by `fetch_wait` and capped by
    /// `fetch_limit` (0 = no cap); a checkpoint lands after every
    /// persisted batch.
    pub async fn archive(
        &self,
        gateway: &dyn TelegramGateway,
        target: &str,
    ) -> Result<ArchiveReport> {
        let entity = gateway.get_entity(target).await?;
        let context = format!("archive:{}", entity.id);
        let mut offset = self.store.latest_checkpoint(&context)?.unwrap_or(0);

        info!(target, entity_id = entity.id, resume_from = offset, "archive pass started");

        let mut report = ArchiveReport::default();
        let mut seen_topics: HashSet<i64> = HashSet::new();
        let batch = self.config.fetch_batch_size.max(1);

        loop {
            let page = match gateway
                .fetch_messages(
                    entity.id,
                    MessageQuery {
                        offset_id: offset,
                        limit: batch,
                        reverse: true,
                        topic_id: None,
                    },
                )
                .await
            {
                Ok(page) => page,
                Err(GatewayError::FloodWait { seconds }) => {
                    warn!(seconds, "flood wait while fetching history");
                    sleep(Duration::from_secs(seconds + FLOOD_BUFFER_SECS)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if page.is_empty() {
                break;
            }
            let short = (page.len() as u32) < batch;

            for message in &page {
                self.persist_message(gateway, &entity, message, &mut seen_topics, &mut report)
                    .await?;
                report.messages += 1;
            }

            offset = page.last().map(|m| m.id).unwrap_or(offset);
            self.store.save_checkpoint(&context, offset)?;

            let capped =
                self.config.fetch_limit > 0 && report.messages as u32 >= self.config.fetch_limit;
            if short || capped {
                break;
            }
            if self.config.fetch_wait > 0 {
                sleep(Duration::from_secs(self.config.fetch_wait)).await;
            }
        }

        info!(
            target,
            messages = report.messages,
            media = report.media_downloads,
            mentions = report.mentions,
            "archive pass finished"
        );
        Ok(report)
    }

    async fn persist_message(
        &self,
        gateway: &dyn TelegramGateway,
        entity: &EntityInfo,
        message: &GatewayMessage,
        seen_topics: &mut HashSet<i64>,
        report: &mut ArchiveReport,
    ) -> Result<()> {
        let user_id = match &message.sender {
            Some(sender) => {
                let avatar = if self.config.download_avatars {
                    self.sink
                        .store_avatar(gateway, sender.id)
                        .await
                        .map(|p| p.to_string_lossy().into_owned())
                } else {
                    None
                };
                self.store.upsert_user(&StoredUser {
                    id: sender.id,
                    username: sender.username.clone(),
                    first_name: sender.first_name.clone(),
                    last_name: sender.last_name.clone(),
                    tags: sender.tags.clone(),
                    avatar,
                })?;
                Some(sender.id)
            }
            None => None,
        };

        let media = map_media(message);
        if let Some(media) = &media {
            self.store.upsert_media(media)?;
        }

        if self.config.archive_topics {
            if let Some(topic_id) = message.topic_id {
                if seen_topics.insert(topic_id) {
                    self.store.upsert_topic(&StoredTopic {
                        id: topic_id,
                        entity_id: entity.id,
                        title: None,
                        created_at: message.date,
                    })?;
                }
            }
        }

        let content = message.text.clone().filter(|t| !t.is_empty());
        self.store.upsert_message(&MessageInsert {
            id: message.id,
            msg_type: if message.is_service {
                "service".to_string()
            } else {
                "message".to_string()
            },
            date: message.date,
            edit_date: message.edit_date,
            content: content.clone(),
            reply_to: message.reply_to,
            user_id,
            media_id: media.as_ref().map(|m| m.id),
            topic_id: message.topic_id,
            checksum: Some(message_checksum(message.id, &message.date, content.as_deref())),
        })?;

        for (username, source) in extract_mentions(message) {
            self.store
                .insert_mention(&username, message.id, &message.date, source)?;
            report.mentions += 1;
        }

        if self.config.download_media && message.media.is_some() {
            self.download_media(gateway, entity, message, report).await;
        }
        Ok(())
    }

    /// Download hop; failures never abort the pass.
    async fn download_media(
        &self,
        gateway: &dyn TelegramGateway,
        entity: &EntityInfo,
        message: &GatewayMessage,
        report: &mut ArchiveReport,
    ) {
        let mime = message
            .file
            .as_ref()
            .and_then(|f| f.mime.clone())
            .or_else(|| message.media.as_ref().and_then(|m| m.mime.clone()));
        if !self.config.media_mime_whitelist.is_empty() {
            let allowed = mime
                .as_deref()
                .is_some_and(|m| self.config.media_mime_whitelist.iter().any(|w| w == m));
            if !allowed {
                return;
            }
        }

        let source = entity
            .username
            .clone()
            .unwrap_or_else(|| entity.id.to_string());
        match self
            .sink
            .store_media(gateway, message, &source, self.clock.now())
            .await
        {
            Ok(_) => report.media_downloads += 1,
            Err(crate::error::ArchiveError::Gateway(GatewayError::FloodWait { seconds })) => {
                warn!(message_id = message.id, seconds, "flood wait during download");
                sleep(Duration::from_secs(seconds + FLOOD_BUFFER_SECS)).await;
            }
            Err(e) => {
                warn!(message_id = message.id, error = %e, "media download failed");
            }
        }
    }
}

/// Stable content digest for a media row.
fn media_checksum(id: i64, kind: Option<&str>, url: Option<&str>, mime: Option<&str>) -> String {
    let input = format!(
        "{id}|{}|{}|{}",
        kind.unwrap_or_default(),
        url.unwrap_or_default(),
        mime.unwrap_or_default()
    );
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Map gateway media to a store row. Media without any stable id (some
/// polls, geo points) is not persisted as a row; the message itself still
/// records that media existed through its type.
fn map_media(message: &GatewayMessage) -> Option<StoredMedia> {
    let media = message.media.as_ref()?;
    let id = media
        .id
        .or_else(|| message.file.as_ref().and_then(|f| f.id))?;
    let kind = media.kind.map(|k| k.as_str().to_string());
    let mime = media
        .mime
        .clone()
        .or_else(|| message.file.as_ref().and_then(|f| f.mime.clone()));

    Some(StoredMedia {
        id,
        checksum: Some(media_checksum(
            id,
            kind.as_deref(),
            media.url.as_deref(),
            mime.as_deref(),
        )),
        kind,
        url: media.url.clone(),
        title: media.title.clone(),
        description: media.description.clone(),
        thumb: media.thumb.clone(),
        mime,
    })
}

#[async_trait]
impl ArchiveRunner for Archiver {
    async fn archive(
        &self,
        gateway: Arc<dyn TelegramGateway>,
        target: &str,
    ) -> spectra_fleet::Result<serde_json::Value> {
        let report = Archiver::archive(self, gateway.as_ref(), target)
            .await
            .map_err(|e| match e {
                crate::error::ArchiveError::Gateway(g) => FleetError::Gateway(g),
                other => FleetError::Task(other.to_string()),
            })?;
        Ok(serde_json::json!({
            "messages": report.messages,
            "media": report.media_downloads,
            "mentions": report.mentions,
        }))
    }
}
