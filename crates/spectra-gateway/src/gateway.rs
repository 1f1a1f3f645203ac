use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use spectra_core::config::AccountConfig;

use crate::error::Result;
use crate::proxy::ProxyEndpoint;
use crate::types::{DialogEntry, EntityInfo, GatewayMessage, MessageQuery};

/// A connected, authorised Telegram client bound to one account.
///
/// This is the entire surface the core consumes; the production adapter
/// wraps whichever MTProto client library is in use. History iteration is
/// paged: callers repeat `fetch_messages` with a moving `offset_id` until a
/// short page comes back.
#[async_trait]
pub trait TelegramGateway: Send + Sync {
    /// Canonical account identifier this gateway is bound to.
    fn session_handle(&self) -> &str;

    async fn is_authorized(&self) -> Result<bool>;

    /// Resolve a link, `@username` or numeric id to channel metadata.
    async fn get_entity(&self, target: &str) -> Result<EntityInfo>;

    /// Fetch one page of message history for an entity.
    async fn fetch_messages(&self, entity_id: i64, query: MessageQuery)
        -> Result<Vec<GatewayMessage>>;

    async fn join_by_username(&self, username: &str) -> Result<EntityInfo>;

    /// Validate an invite hash without joining.
    async fn check_invite(&self, hash: &str) -> Result<()>;

    async fn import_invite(&self, hash: &str) -> Result<EntityInfo>;

    async fn leave(&self, entity_id: i64) -> Result<()>;

    /// Native forward preserving the "forwarded from" header. `to` accepts
    /// an entity id string, `@username`, or `"me"` for Saved Messages.
    async fn forward_message(
        &self,
        from_entity: i64,
        to: &str,
        message_id: i64,
        reply_to: Option<i64>,
    ) -> Result<()>;

    /// Fresh send; `media` re-attaches the source message's media by id.
    async fn send_message(
        &self,
        to: &str,
        text: &str,
        media_from: Option<&GatewayMessage>,
        reply_to: Option<i64>,
    ) -> Result<()>;

    async fn dialogs(&self) -> Result<Vec<DialogEntry>>;

    /// Download the message's media into `dest_dir`, returning the path of
    /// the written file.
    async fn download_media(&self, message: &GatewayMessage, dest_dir: &Path) -> Result<PathBuf>;

    /// Download a user's profile photo into `dest_dir`; `None` when the
    /// user has no avatar.
    async fn download_avatar(&self, user_id: i64, dest_dir: &Path) -> Result<Option<PathBuf>>;

    /// Release the underlying session. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Opens gateways. The fleet owns one connector and calls it lazily per
/// account; failures surface as typed gateway errors so the registry can
/// classify them.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn connect(
        &self,
        account: &AccountConfig,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Arc<dyn TelegramGateway>>;
}

/// Hands out pooled gateways by session handle. Implemented by the fleet's
/// group manager; the forwarder uses it for the saved-messages fan-out
/// without depending on fleet internals.
#[async_trait]
pub trait GatewayProvider: Send + Sync {
    async fn gateway(&self, session_handle: &str) -> Result<Arc<dyn TelegramGateway>>;

    /// All session handles the pool can serve, in registration order.
    fn session_handles(&self) -> Vec<String>;
}
