//! Media persistence on disk: per-topic subfolders, avatar folder, JSON
//! sidecars next to each download, and the append-only CSV download log.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use spectra_gateway::{GatewayMessage, TelegramGateway};
use tracing::{debug, warn};

use crate::error::Result;

const LOG_FILE: &str = "download_log.csv";
const LOG_HEADER: [&str; 7] = [
    "timestamp",
    "relative_file_path",
    "original_file_name",
    "channel_source_id",
    "message_id",
    "file_size_bytes",
    "mime_type",
];

/// Per-message metadata written next to each downloaded file.
#[derive(Debug, Serialize)]
struct Sidecar<'a> {
    msg_id: i64,
    date: String,
    sender_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic_id: Option<i64>,
}

/// Filesystem half of the archive pipeline.
pub struct MediaSink {
    base_dir: PathBuf,
}

impl MediaSink {
    /// Prepare the media directory and the download log (header written on
    /// first creation).
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;

        let log_path = base_dir.join(LOG_FILE);
        if !log_path.exists() {
            let mut writer = csv::Writer::from_path(&log_path)?;
            writer.write_record(LOG_HEADER)?;
            writer.flush()?;
        }
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Destination folder for a message's media: `topic_<id>/` inside the
    /// base dir when topic-scoped.
    pub fn dest_dir(&self, topic_id: Option<i64>) -> PathBuf {
        match topic_id {
            Some(id) => self.base_dir.join(format!("topic_{id}")),
            None => self.base_dir.clone(),
        }
    }

    pub fn avatars_dir(&self) -> PathBuf {
        self.base_dir.join("avatars")
    }

    /// Download one message's media, write its sidecar and log the
    /// download. Returns the stored path.
    pub async fn store_media(
        &self,
        gateway: &dyn TelegramGateway,
        message: &GatewayMessage,
        channel_source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let dest = self.dest_dir(message.topic_id);
        let path = gateway.download_media(message, &dest).await?;

        self.write_sidecar(message, &path)?;
        self.append_log(message, &path, channel_source_id, now)?;
        debug!(message_id = message.id, path = %path.display(), "media stored");
        Ok(path)
    }

    /// `<file>.<ext>.json` next to the download.
    fn write_sidecar(&self, message: &GatewayMessage, file_path: &Path) -> Result<()> {
        let sidecar = Sidecar {
            msg_id: message.id,
            date: message.date.to_rfc3339(),
            sender_id: message.sender.as_ref().map(|s| s.id),
            sender_username: message
                .sender
                .as_ref()
                .and_then(|s| s.username.as_deref()),
            reply_to: message.reply_to,
            text: message.text.as_deref().filter(|t| !t.is_empty()),
            mime: message.file.as_ref().and_then(|f| f.mime.as_deref()),
            topic_id: message.topic_id,
        };

        let mut name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("msg_{}", message.id));
        name.push_str(".json");
        let sidecar_path = file_path.with_file_name(name);

        std::fs::write(&sidecar_path, serde_json::to_vec_pretty(&sidecar)?)?;
        Ok(())
    }

    fn append_log(
        &self,
        message: &GatewayMessage,
        file_path: &Path,
        channel_source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let relative = file_path
            .strip_prefix(&self.base_dir)
            .unwrap_or(file_path)
            .to_string_lossy()
            .into_owned();
        let original = message
            .file
            .as_ref()
            .and_then(|f| f.name.clone())
            .unwrap_or_else(|| relative.clone());
        let size = message
            .file
            .as_ref()
            .and_then(|f| f.size)
            .map(|s| s.to_string())
            .unwrap_or_default();
        let mime = message
            .file
            .as_ref()
            .and_then(|f| f.mime.clone())
            .unwrap_or_default();

        let file = OpenOptions::new()
            .append(true)
            .open(self.base_dir.join(LOG_FILE))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record([
            now.to_rfc3339().as_str(),
            relative.as_str(),
            original.as_str(),
            channel_source_id,
            message.id.to_string().as_str(),
            size.as_str(),
            mime.as_str(),
        ])?;
        writer.flush()?;
        Ok(())
    }

    /// Best-effort avatar download into `avatars/`.
    pub async fn store_avatar(
        &self,
        gateway: &dyn TelegramGateway,
        user_id: i64,
    ) -> Option<PathBuf> {
        match gateway.download_avatar(user_id, &self.avatars_dir()).await {
            Ok(path) => path,
            Err(e) => {
                warn!(user_id, error = %e, "avatar download failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spectra_gateway::mock::ScriptedGateway;
    use spectra_gateway::GatewayFile;

    fn file_message(id: i64, topic: Option<i64>) -> GatewayMessage {
        let mut m = GatewayMessage::text_message(
            id,
            Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap(),
            "payload",
        );
        m.topic_id = topic;
        m.file = Some(GatewayFile {
            id: Some(id * 10),
            size: Some(512),
            name: Some(format!("doc_{id}.zip")),
            mime: Some("application/zip".into()),
        });
        m
    }

    #[tokio::test]
    async fn stores_media_with_sidecar_and_log_row() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MediaSink::new(dir.path().join("media")).unwrap();
        let gw = ScriptedGateway::new("a");

        let msg = file_message(5, None);
        let path = sink
            .store_media(gw.as_ref(), &msg, "src_chan", Utc::now())
            .await
            .unwrap();

        assert!(path.exists());
        let sidecar_path = path.with_file_name("doc_5.zip.json");
        assert!(sidecar_path.exists());
        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&sidecar_path).unwrap()).unwrap();
        assert_eq!(sidecar["msg_id"], 5);
        assert_eq!(sidecar["mime"], "application/zip");

        let log = std::fs::read_to_string(sink.base_dir().join("download_log.csv")).unwrap();
        let mut lines = log.lines();
        assert!(lines.next().unwrap().starts_with("timestamp,"));
        let row = lines.next().unwrap();
        assert!(row.contains("doc_5.zip"));
        assert!(row.contains("src_chan"));
        assert!(row.contains("512"));
    }

    #[tokio::test]
    async fn topic_media_lands_in_topic_folder() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MediaSink::new(dir.path().join("media")).unwrap();
        let gw = ScriptedGateway::new("a");

        let msg = file_message(6, Some(42));
        let path = sink
            .store_media(gw.as_ref(), &msg, "src_chan", Utc::now())
            .await
            .unwrap();
        assert!(path.parent().unwrap().ends_with("topic_42"));
    }

    #[tokio::test]
    async fn avatar_goes_to_avatars_folder() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MediaSink::new(dir.path().join("media")).unwrap();
        let gw = ScriptedGateway::new("a");
        gw.set_avatar(7);

        let path = sink.store_avatar(gw.as_ref(), 7).await.unwrap();
        assert!(path.parent().unwrap().ends_with("avatars"));
        assert!(sink.store_avatar(gw.as_ref(), 8).await.is_none());
    }

    #[test]
    fn log_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("media");
        MediaSink::new(&base).unwrap();
        MediaSink::new(&base).unwrap();

        let log = std::fs::read_to_string(base.join("download_log.csv")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }
}
