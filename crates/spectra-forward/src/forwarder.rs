//! The forward pipeline: hash, dedup-check, primary send, durable record,
//! then the optional secondary and saved-messages hops.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spectra_accounts::AccountRegistry;
use spectra_core::config::{AccountConfig, ForwardingConfig};
use spectra_core::Clock;
use spectra_gateway::{
    GatewayError, GatewayMessage, GatewayProvider, MessageQuery, TelegramGateway,
};
use spectra_store::Store;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{ForwardError, Result};
use crate::hash::content_hash;

/// Extra sleep on top of a flood-wait, in seconds.
const FLOOD_BUFFER_SECS: u64 = 1;
/// Pause between saved-messages hops across accounts.
const SAVED_MESSAGES_PAUSE: Duration = Duration::from_secs(1);
/// History page size while iterating the origin.
const FETCH_PAGE: u32 = 500;

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub forward_to_all_saved_messages: bool,
    pub prepend_origin_info: bool,
    pub destination_topic_id: Option<i64>,
    pub secondary_unique_destination: Option<String>,
    pub enable_deduplication: bool,
    /// Skip messages without media before hashing.
    pub attachments_only: bool,
    /// Destination used when an operation supplies none.
    pub default_destination: Option<String>,
}

impl From<&ForwardingConfig> for ForwardOptions {
    fn from(cfg: &ForwardingConfig) -> Self {
        Self {
            forward_to_all_saved_messages: cfg.forward_to_all_saved_messages,
            prepend_origin_info: cfg.prepend_origin_info,
            destination_topic_id: cfg.destination_topic_id,
            secondary_unique_destination: cfg.secondary_unique_destination.clone(),
            enable_deduplication: cfg.enable_deduplication,
            attachments_only: cfg.attachments_only,
            default_destination: cfg.default_destination_id.clone(),
        }
    }
}

/// Counters for one forwarding pass over an origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReport {
    pub forwarded: usize,
    pub skipped_duplicates: usize,
    pub skipped_filtered: usize,
    pub failed: usize,
}

/// Per-channel outcome of total-forward mode.
#[derive(Debug, Clone)]
pub struct ChannelOutcome {
    pub account: String,
    pub result: std::result::Result<ForwardReport, String>,
}

pub struct Forwarder {
    store: Arc<Store>,
    provider: Arc<dyn GatewayProvider>,
    registry: Arc<AccountRegistry>,
    accounts: Vec<AccountConfig>,
    options: ForwardOptions,
    clock: Arc<dyn Clock>,
    /// In-memory dedup cache, warmed from the store at construction.
    seen: Mutex<HashSet<String>>,
}

impl Forwarder {
    pub fn new(
        store: Arc<Store>,
        provider: Arc<dyn GatewayProvider>,
        registry: Arc<AccountRegistry>,
        accounts: Vec<AccountConfig>,
        options: ForwardOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Warming the cache is best-effort; a failed read only costs extra
        // DB lookups later.
        let seen = match store.forwarded_hashes() {
            Ok(hashes) => hashes.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "could not preload forwarded hashes");
                HashSet::new()
            }
        };
        Self {
            store,
            provider,
            registry,
            accounts,
            options,
            clock,
            seen: Mutex::new(seen),
        }
    }

    /// Map an account hint (phone or session handle) to a session handle;
    /// without a hint the first configured account is used.
    fn resolve_account(&self, hint: Option<&str>) -> Result<String> {
        match hint {
            Some(h) => Ok(self
                .accounts
                .iter()
                .find(|a| a.session_handle == h || a.phone_or_handle() == h)
                .map(|a| a.session_handle.clone())
                .unwrap_or_else(|| h.to_string())),
            None => self
                .accounts
                .first()
                .map(|a| a.session_handle.clone())
                .ok_or(ForwardError::NoAccounts),
        }
    }

    /// Duplicate check: memory set first, then the store. A failed store
    /// lookup counts as not-duplicate so forwards are never blocked by a
    /// read error.
    fn is_duplicate(&self, hash: &str) -> bool {
        if self.seen.lock().unwrap().contains(hash) {
            return true;
        }
        match self.store.is_forwarded(hash) {
            Ok(true) => {
                self.seen.lock().unwrap().insert(hash.to_string());
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "dedup lookup failed, treating as unique");
                false
            }
        }
    }

    fn preview(message: &GatewayMessage) -> String {
        if let Some(text) = &message.text {
            if !text.is_empty() {
                let mut p: String = text.chars().take(100).collect();
                if text.chars().count() > 100 {
                    p.push_str("...");
                }
                return p;
            }
        }
        if let Some(name) = message.file.as_ref().and_then(|f| f.name.as_deref()) {
            return format!("File: {name}");
        }
        "Media Message".to_string()
    }

    /// Forward `origin` into the configured default destination.
    pub async fn forward_to_default(
        &self,
        origin: &str,
        account_hint: Option<&str>,
    ) -> Result<ForwardReport> {
        let destination = self
            .options
            .default_destination
            .clone()
            .ok_or_else(|| ForwardError::DestinationUnresolved("no default destination".into()))?;
        self.forward_messages(origin, &destination, account_hint).await
    }

    /// Forward the whole history of `origin` to `destination`, oldest
    /// first. Flood waits skip the affected message after the cooperative
    /// sleep; permission errors skip the message; auth errors abort the
    /// operation.
    pub async fn forward_messages(
        &self,
        origin: &str,
        destination: &str,
        account_hint: Option<&str>,
    ) -> Result<ForwardReport> {
        let handle = self.resolve_account(account_hint)?;
        let gateway = self.provider.gateway(&handle).await?;

        let origin_entity = gateway.get_entity(origin).await?;
        let dest_entity = gateway
            .get_entity(destination)
            .await
            .map_err(|_| ForwardError::DestinationUnresolved(destination.to_string()))?;
        let dest_addr = dest_entity.id.to_string();

        info!(
            origin = %origin,
            destination = %destination,
            account = %handle,
            "forwarding pass started"
        );

        let mut report = ForwardReport::default();
        let mut offset_id = 0i64;

        loop {
            let page = gateway
                .fetch_messages(
                    origin_entity.id,
                    MessageQuery {
                        offset_id,
                        limit: FETCH_PAGE,
                        reverse: true,
                        topic_id: None,
                    },
                )
                .await?;
            if page.is_empty() {
                break;
            }
            offset_id = page.last().map(|m| m.id).unwrap_or(offset_id);
            let short = (page.len() as u32) < FETCH_PAGE;

            for message in &page {
                self.forward_one(
                    gateway.as_ref(),
                    &origin_entity,
                    &dest_addr,
                    message,
                    &mut report,
                )
                .await?;
            }
            if short {
                break;
            }
        }

        info!(
            origin = %origin,
            forwarded = report.forwarded,
            duplicates = report.skipped_duplicates,
            filtered = report.skipped_filtered,
            failed = report.failed,
            "forwarding pass finished"
        );
        Ok(report)
    }

    async fn forward_one(
        &self,
        gateway: &dyn TelegramGateway,
        origin: &spectra_gateway::EntityInfo,
        dest_addr: &str,
        message: &GatewayMessage,
        report: &mut ForwardReport,
    ) -> Result<()> {
        if self.options.attachments_only && message.media.is_none() {
            report.skipped_filtered += 1;
            return Ok(());
        }

        let hash = content_hash(message);
        if self.options.enable_deduplication && self.is_duplicate(&hash) {
            info!(message_id = message.id, "duplicate, skipping");
            report.skipped_duplicates += 1;
            return Ok(());
        }

        // Primary destination. Topic routing disables the prepend rewrite.
        let outcome = if self.options.prepend_origin_info
            && self.options.destination_topic_id.is_none()
        {
            let header = format!("[Forwarded from {} (ID: {})]\n", origin.title, origin.id);
            let content = format!("{header}{}", message.text.as_deref().unwrap_or_default());
            gateway
                .send_message(dest_addr, &content, Some(message), None)
                .await
        } else {
            gateway
                .forward_message(
                    origin.id,
                    dest_addr,
                    message.id,
                    self.options.destination_topic_id,
                )
                .await
        };

        match outcome {
            Ok(()) => {}
            Err(GatewayError::FloodWait { seconds }) => {
                warn!(message_id = message.id, seconds, "flood wait on primary hop");
                sleep(Duration::from_secs(seconds + FLOOD_BUFFER_SECS)).await;
                report.failed += 1;
                return Ok(());
            }
            Err(e) if e.is_account_fatal() => return Err(e.into()),
            Err(e) if e.is_target_specific() || matches!(e, GatewayError::PermissionDenied(_)) => {
                warn!(message_id = message.id, error = %e, "permission error, skipping message");
                report.failed += 1;
                return Ok(());
            }
            Err(e) => {
                warn!(message_id = message.id, error = %e, "forward failed, skipping message");
                report.failed += 1;
                return Ok(());
            }
        }

        report.forwarded += 1;
        if self.options.enable_deduplication {
            self.store.record_forwarded(
                &hash,
                &origin.id.to_string(),
                dest_addr,
                message.id,
                &Self::preview(message),
                self.clock.now(),
            )?;
            self.seen.lock().unwrap().insert(hash);
        }

        if let Some(secondary) = &self.options.secondary_unique_destination {
            self.forward_secondary(gateway, origin.id, secondary, message.id)
                .await;
        }
        if self.options.forward_to_all_saved_messages {
            self.fanout_saved_messages(origin.id, message.id).await;
        }
        Ok(())
    }

    /// Secondary hop for first-seen messages. Failures here never touch
    /// dedup state.
    async fn forward_secondary(
        &self,
        gateway: &dyn TelegramGateway,
        origin_id: i64,
        secondary: &str,
        message_id: i64,
    ) {
        match gateway
            .forward_message(origin_id, secondary, message_id, None)
            .await
        {
            Ok(()) => {}
            Err(GatewayError::FloodWait { seconds }) => {
                warn!(message_id, seconds, "flood wait on secondary hop, skipping");
                sleep(Duration::from_secs(seconds + FLOOD_BUFFER_SECS)).await;
            }
            Err(e) => {
                warn!(message_id, error = %e, "secondary forward failed");
            }
        }
    }

    /// Forward into every configured account's Saved Messages, switching
    /// gateways per account with a pause in between.
    async fn fanout_saved_messages(&self, origin_id: i64, message_id: i64) {
        let handles = self.provider.session_handles();
        let count = handles.len();
        for (idx, handle) in handles.into_iter().enumerate() {
            let gateway = match self.provider.gateway(&handle).await {
                Ok(g) => g,
                Err(e) => {
                    warn!(account = %handle, error = %e, "no gateway for saved-messages hop");
                    continue;
                }
            };
            match gateway.forward_message(origin_id, "me", message_id, None).await {
                Ok(()) => {}
                Err(GatewayError::FloodWait { seconds }) => {
                    warn!(account = %handle, seconds, "flood wait on saved-messages hop");
                    if let Err(e) = self.registry.mark_failure(
                        &handle,
                        &GatewayError::FloodWait { seconds },
                        None,
                    ) {
                        warn!(account = %handle, error = %e, "could not record cooldown");
                    }
                    sleep(Duration::from_secs(seconds + FLOOD_BUFFER_SECS)).await;
                }
                Err(e) if e.is_account_fatal() => {
                    warn!(account = %handle, error = %e, "auth error on saved-messages hop, skipping account");
                    let _ = self.registry.mark_failure(&handle, &e, None);
                }
                Err(e) => {
                    warn!(account = %handle, error = %e, "saved-messages forward failed");
                }
            }
            if idx + 1 < count {
                sleep(SAVED_MESSAGES_PAUSE).await;
            }
        }
    }

    /// Total-forward mode: walk every distinct accessible channel with the
    /// account that indexed it. Per-channel errors are isolated.
    pub async fn forward_all_accessible_channels(
        &self,
        destination: &str,
        orchestration_account: Option<&str>,
    ) -> Result<BTreeMap<i64, ChannelOutcome>> {
        let pairs = self.store.channel_access_pairs()?;
        if pairs.is_empty() {
            warn!("channel access table is empty, nothing to forward");
            return Ok(BTreeMap::new());
        }

        info!(channels = pairs.len(), destination = %destination, "total forward mode started");
        let mut outcomes = BTreeMap::new();

        for (channel_id, accessing_account) in pairs {
            // The indexed account is preferred; the orchestration account
            // only covers rows with no designated accessor.
            let hint = if accessing_account.is_empty() {
                orchestration_account
            } else {
                Some(accessing_account.as_str())
            };
            let result = self
                .forward_messages(&channel_id.to_string(), destination, hint)
                .await;
            let outcome = match result {
                Ok(report) => ChannelOutcome {
                    account: accessing_account,
                    result: Ok(report),
                },
                Err(e) => {
                    warn!(channel_id, error = %e, "channel failed, continuing");
                    ChannelOutcome {
                        account: accessing_account,
                        result: Err(e.to_string()),
                    }
                }
            };
            outcomes.insert(channel_id, outcome);
        }

        let ok = outcomes.values().filter(|o| o.result.is_ok()).count();
        info!(success = ok, total = outcomes.len(), "total forward mode finished");
        Ok(outcomes)
    }
}
