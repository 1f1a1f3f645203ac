//! Per-account gateway pool and the join/leave/archive orchestration flows.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use spectra_accounts::{AccountRegistry, AccountRotator};
use spectra_core::config::{AccountConfig, RotationPolicy};
use spectra_gateway::{
    GatewayConnector, GatewayError, GatewayProvider, GroupLink, ProxyCycler, TelegramGateway,
};
use spectra_store::{ChannelRow, Store};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::{FleetError, Result};

/// Usage counters are reset after this many batch items.
const USAGE_RESET_EVERY: usize = 5;

/// Drives a full archive pass for one joined entity. Implemented by the
/// archive pipeline; injected so the fleet stays transport-and-policy only.
#[async_trait]
pub trait ArchiveRunner: Send + Sync {
    /// Archive `target` through `gateway`, returning a small JSON report
    /// (message and media counts) for the task record.
    async fn archive(
        &self,
        gateway: Arc<dyn TelegramGateway>,
        target: &str,
    ) -> Result<serde_json::Value>;
}

/// Lazy map of session handle → connected gateway, plus the account
/// selection machinery around it.
pub struct GroupManager {
    accounts: Vec<AccountConfig>,
    connector: Arc<dyn GatewayConnector>,
    gateways: DashMap<String, Arc<dyn TelegramGateway>>,
    registry: Arc<AccountRegistry>,
    rotator: Arc<AccountRotator>,
    proxies: ProxyCycler,
    policy: RotationPolicy,
    store: Arc<Store>,
    active: Mutex<Option<String>>,
}

impl GroupManager {
    pub fn new(
        accounts: Vec<AccountConfig>,
        connector: Arc<dyn GatewayConnector>,
        registry: Arc<AccountRegistry>,
        rotator: Arc<AccountRotator>,
        proxies: ProxyCycler,
        policy: RotationPolicy,
        store: Arc<Store>,
    ) -> Self {
        Self {
            accounts,
            connector,
            gateways: DashMap::new(),
            registry,
            rotator,
            proxies,
            policy,
            store,
            active: Mutex::new(None),
        }
    }

    /// Open and authorise every non-banned account. Failed accounts are
    /// marked in the registry and skipped; returns the connected count.
    pub async fn init_fleet(&self) -> Result<usize> {
        let mut connected = 0usize;
        for account in &self.accounts {
            let handle = account.session_handle.clone();
            self.registry.register(account)?;

            if self
                .registry
                .health(&handle)?
                .is_some_and(|h| h.is_banned)
            {
                info!(account = %handle, "skipping banned account");
                continue;
            }

            match self.open_gateway(account).await {
                Ok(gateway) => {
                    self.gateways.insert(handle.clone(), gateway);
                    connected += 1;
                    info!(account = %handle, "gateway connected");
                }
                Err(e) => {
                    error!(account = %handle, error = %e, "failed to open gateway");
                    self.registry.mark_failure(&handle, &e, None)?;
                }
            }
        }
        info!(connected, total = self.accounts.len(), "fleet initialised");
        Ok(connected)
    }

    async fn open_gateway(
        &self,
        account: &AccountConfig,
    ) -> spectra_gateway::Result<Arc<dyn TelegramGateway>> {
        let proxy = self.proxies.next();
        let gateway = self.connector.connect(account, proxy.as_ref()).await?;
        if !gateway.is_authorized().await? {
            return Err(GatewayError::SessionPasswordNeeded);
        }
        Ok(gateway)
    }

    /// Session handles with a live gateway, in registration order.
    pub fn connected_handles(&self) -> Vec<String> {
        self.accounts
            .iter()
            .map(|a| a.session_handle.clone())
            .filter(|h| self.gateways.contains_key(h))
            .collect()
    }

    /// Pooled gateway for `session_handle`, connecting lazily on first use.
    pub async fn gateway_for(&self, session_handle: &str) -> Result<Arc<dyn TelegramGateway>> {
        if let Some(gateway) = self.gateways.get(session_handle) {
            return Ok(gateway.clone());
        }
        let account = self
            .accounts
            .iter()
            .find(|a| a.session_handle == session_handle)
            .ok_or_else(|| FleetError::NoGateway(session_handle.to_string()))?;

        match self.open_gateway(account).await {
            Ok(gateway) => {
                self.gateways
                    .insert(session_handle.to_string(), gateway.clone());
                Ok(gateway)
            }
            Err(e) => {
                self.registry.mark_failure(session_handle, &e, None)?;
                Err(e.into())
            }
        }
    }

    /// Select the gateway for the next operation: sticky reuses the active
    /// account until it fails, per-operation rotates every time.
    async fn select_gateway(&self) -> Result<(String, Arc<dyn TelegramGateway>)> {
        if self.policy == RotationPolicy::Sticky {
            let active = self.active.lock().unwrap().clone();
            if let Some(handle) = active {
                if let Ok(gateway) = self.gateway_for(&handle).await {
                    return Ok((handle, gateway));
                }
            }
        }

        let account = self.rotator.next()?;
        let handle = account.session_handle;
        let gateway = self.gateway_for(&handle).await?;
        *self.active.lock().unwrap() = Some(handle.clone());
        Ok((handle, gateway))
    }

    fn clear_active(&self) {
        *self.active.lock().unwrap() = None;
    }

    fn drop_gateway(&self, session_handle: &str) {
        self.gateways.remove(session_handle);
        self.clear_active();
    }

    /// Join a group by username, invite link or numeric id. Flood-wait and
    /// channel-capacity errors cool the current account and retry once with
    /// the next one; auth errors propagate.
    pub async fn join_group(&self, link: &str) -> Result<i64> {
        let parsed = GroupLink::parse(link);
        let mut rotated = false;

        loop {
            let (handle, gateway) = self.select_gateway().await?;

            match join_with_gateway(gateway.as_ref(), &parsed).await {
                Ok(entity) => {
                    self.registry.mark_success(&handle)?;
                    self.store.upsert_channel(
                        &ChannelRow {
                            id: entity.id,
                            kind: entity.kind.as_str().to_string(),
                            title: Some(entity.title.clone()),
                            username: entity.username.clone(),
                            access_hash: entity.access_hash,
                        },
                        chrono::Utc::now(),
                    )?;
                    info!(link, entity_id = entity.id, account = %handle, "joined group");
                    return Ok(entity.id);
                }
                Err(e) => {
                    let retryable = e.flood_wait_seconds().is_some()
                        || matches!(e, GatewayError::ChannelsTooMuch);
                    if retryable && !rotated {
                        warn!(link, account = %handle, error = %e, "join failed, rotating account");
                        self.registry.mark_failure(&handle, &e, None)?;
                        self.clear_active();
                        rotated = true;
                        continue;
                    }
                    if e.is_account_fatal() {
                        self.registry.mark_failure(&handle, &e, None)?;
                        self.drop_gateway(&handle);
                        return Err(e.into());
                    }
                    if e.is_target_specific() {
                        warn!(link, error = %e, "target not joinable");
                        return Err(e.into());
                    }
                    self.registry.mark_failure(&handle, &e, None)?;
                    return Err(e.into());
                }
            }
        }
    }

    /// Leave a channel using the active account (or the next selected one).
    pub async fn leave_group(&self, entity_id: i64) -> Result<()> {
        let (_, gateway) = self.select_gateway().await?;
        gateway.leave(entity_id).await?;
        info!(entity_id, "left group");
        Ok(())
    }

    /// The gateway of the account that served the last successful
    /// selection (e.g. the one that just joined a group).
    pub async fn active_gateway(&self) -> Result<(String, Arc<dyn TelegramGateway>)> {
        let handle = self
            .active
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| FleetError::NoGateway("no active account".to_string()))?;
        let gateway = self.gateway_for(&handle).await?;
        Ok((handle, gateway))
    }

    /// Join, run a full archive pass, then optionally leave.
    pub async fn join_and_archive(
        &self,
        link: &str,
        runner: &dyn ArchiveRunner,
        leave_after: bool,
    ) -> Result<serde_json::Value> {
        let entity_id = self.join_group(link).await?;
        let (_, gateway) = self.active_gateway().await?;

        let report = runner.archive(gateway.clone(), link).await?;

        if leave_after {
            if let Err(e) = gateway.leave(entity_id).await {
                warn!(entity_id, error = %e, "failed to leave after archive");
            }
        }
        Ok(report)
    }

    /// Sequentially join-and-archive a list with pacing between items and a
    /// usage-counter reset every few items. Per-link failures are isolated.
    pub async fn batch_join_archive(
        &self,
        links: &[String],
        delay_secs: u64,
        leave_after: bool,
        runner: &dyn ArchiveRunner,
    ) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();

        for (idx, link) in links.iter().enumerate() {
            info!(item = idx + 1, total = links.len(), link = %link, "batch archive item");

            let ok = match self.join_and_archive(link, runner, leave_after).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(link = %link, error = %e, "batch item failed");
                    false
                }
            };
            results.insert(link.clone(), ok);

            if (idx + 1) % USAGE_RESET_EVERY == 0 {
                if let Err(e) = self.registry.reset_usage_counts() {
                    warn!(error = %e, "usage reset failed");
                }
            }
            if idx + 1 < links.len() && delay_secs > 0 {
                sleep(Duration::from_secs(delay_secs)).await;
            }
        }

        let ok_count = results.values().filter(|v| **v).count();
        info!(success = ok_count, total = results.len(), "batch archive complete");
        results
    }

    /// Close every pooled gateway. Idempotent.
    pub async fn close(&self) {
        let handles: Vec<String> = self.gateways.iter().map(|e| e.key().clone()).collect();
        for handle in handles {
            if let Some((_, gateway)) = self.gateways.remove(&handle) {
                if let Err(e) = gateway.close().await {
                    warn!(account = %handle, error = %e, "error closing gateway");
                }
            }
        }
        self.clear_active();
    }
}

#[async_trait]
impl GatewayProvider for GroupManager {
    async fn gateway(
        &self,
        session_handle: &str,
    ) -> spectra_gateway::Result<Arc<dyn TelegramGateway>> {
        self.gateway_for(session_handle).await.map_err(|e| match e {
            FleetError::Gateway(g) => g,
            other => GatewayError::Connect(other.to_string()),
        })
    }

    fn session_handles(&self) -> Vec<String> {
        self.accounts
            .iter()
            .map(|a| a.session_handle.clone())
            .collect()
    }
}

/// The raw join flow against a single gateway, shared by the manager and
/// the scheduler's parallel join tasks. Invite links are checked before
/// import; being already a participant resolves to the existing entity.
pub async fn join_with_gateway(
    gateway: &dyn TelegramGateway,
    link: &GroupLink,
) -> spectra_gateway::Result<spectra_gateway::EntityInfo> {
    match link {
        GroupLink::Username(name) => gateway.join_by_username(name).await,
        GroupLink::Invite(hash) => {
            if let Err(e) = gateway.check_invite(hash).await {
                if matches!(e, GatewayError::AlreadyParticipant) {
                    return gateway.get_entity(hash).await;
                }
                return Err(e);
            }
            match gateway.import_invite(hash).await {
                Err(GatewayError::AlreadyParticipant) => gateway.get_entity(hash).await,
                other => other,
            }
        }
        GroupLink::Id(id) => gateway.get_entity(&id.to_string()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use spectra_core::config::RotationMode;
    use spectra_core::{Clock, ManualClock};
    use spectra_gateway::mock::{ScriptedConnector, ScriptedGateway};
    use spectra_gateway::{EntityInfo, EntityKind};

    fn account(handle: &str) -> AccountConfig {
        AccountConfig {
            api_id: 1,
            api_hash: "h".into(),
            session_handle: handle.into(),
            phone: None,
            password: None,
        }
    }

    fn entity(id: i64, name: &str) -> EntityInfo {
        EntityInfo {
            id,
            kind: EntityKind::Supergroup,
            title: name.to_string(),
            username: Some(name.to_string()),
            access_hash: Some(id),
        }
    }

    struct Fixture {
        manager: GroupManager,
        registry: Arc<AccountRegistry>,
        gateways: Vec<Arc<ScriptedGateway>>,
        clock: Arc<ManualClock>,
    }

    fn fixture(handles: &[&str]) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(AccountRegistry::new(store.clone(), clock.clone()));
        let rotator = Arc::new(AccountRotator::new(
            registry.clone(),
            RotationMode::Sequential,
            clock.clone(),
        ));
        let connector = ScriptedConnector::new();
        let mut gateways = Vec::new();
        for h in handles {
            let gw = ScriptedGateway::new(h);
            connector.register(gw.clone());
            gateways.push(gw);
        }
        let manager = GroupManager::new(
            handles.iter().map(|h| account(h)).collect(),
            connector,
            registry.clone(),
            rotator,
            ProxyCycler::from_config(None),
            RotationPolicy::PerOperation,
            store,
        );
        Fixture {
            manager,
            registry,
            gateways,
            clock,
        }
    }

    #[tokio::test]
    async fn init_fleet_marks_failed_auth() {
        let fx = fixture(&["a", "b"]);
        // Account "b" refuses to connect with an account-fatal error.
        let connector = ScriptedConnector::new();
        connector.register(fx.gateways[0].clone());
        connector.fail_connect("b", GatewayError::AuthDeactivated);
        connector.register(ScriptedGateway::new("b"));

        let manager = GroupManager::new(
            vec![account("a"), account("b")],
            connector,
            fx.registry.clone(),
            Arc::new(AccountRotator::new(
                fx.registry.clone(),
                RotationMode::Sequential,
                fx.clock.clone(),
            )),
            ProxyCycler::from_config(None),
            RotationPolicy::PerOperation,
            Arc::new(Store::open_in_memory().unwrap()),
        );

        let connected = manager.init_fleet().await.unwrap();
        assert_eq!(connected, 1);
        assert!(fx.registry.health("b").unwrap().unwrap().is_banned);
        assert_eq!(manager.connected_handles(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn join_rotates_on_flood_wait() {
        let fx = fixture(&["a", "b"]);
        fx.manager.init_fleet().await.unwrap();

        for gw in &fx.gateways {
            gw.add_entity(entity(42, "target_group"));
        }
        // Account "a" (selected first) hits a 30 s flood wait.
        fx.gateways[0].fail_next("join", GatewayError::FloodWait { seconds: 30 });

        let id = fx.manager.join_group("@target_group").await.unwrap();
        assert_eq!(id, 42);
        assert!(fx.gateways[1].joins().contains(&"@target_group".to_string()));

        let health_a = fx.registry.health("a").unwrap().unwrap();
        assert_eq!(health_a.flood_wait_count, 1);
        let until = health_a.cooldown_until.unwrap();
        assert_eq!(until, fx.clock.now() + chrono::Duration::seconds(30));

        let health_b = fx.registry.health("b").unwrap().unwrap();
        assert_eq!(health_b.success_count, 1);
    }

    #[tokio::test]
    async fn join_gives_up_after_one_rotation() {
        let fx = fixture(&["a", "b"]);
        fx.manager.init_fleet().await.unwrap();
        for gw in &fx.gateways {
            gw.add_entity(entity(42, "target_group"));
            gw.fail_next("join", GatewayError::FloodWait { seconds: 10 });
        }

        let err = fx.manager.join_group("@target_group").await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::Gateway(GatewayError::FloodWait { .. })
        ));
    }

    #[tokio::test]
    async fn channels_too_much_cools_a_day_and_rotates() {
        let fx = fixture(&["a", "b"]);
        fx.manager.init_fleet().await.unwrap();
        for gw in &fx.gateways {
            gw.add_entity(entity(7, "busy_group"));
        }
        fx.gateways[0].fail_next("join", GatewayError::ChannelsTooMuch);

        let id = fx.manager.join_group("@busy_group").await.unwrap();
        assert_eq!(id, 7);

        let health_a = fx.registry.health("a").unwrap().unwrap();
        assert_eq!(
            health_a.cooldown_until.unwrap(),
            fx.clock.now() + chrono::Duration::hours(24)
        );
    }

    #[tokio::test]
    async fn invite_link_checked_then_imported() {
        let fx = fixture(&["a"]);
        fx.manager.init_fleet().await.unwrap();
        let gw = &fx.gateways[0];
        gw.add_entity(entity(9, "private_group"));
        gw.alias_entity("SecretHash", 9);

        let id = fx
            .manager
            .join_group("https://t.me/joinchat/SecretHash")
            .await
            .unwrap();
        assert_eq!(id, 9);
        assert_eq!(gw.joins(), vec!["SecretHash".to_string()]);
    }

    #[tokio::test]
    async fn already_participant_resolves_entity() {
        let fx = fixture(&["a"]);
        fx.manager.init_fleet().await.unwrap();
        let gw = &fx.gateways[0];
        gw.add_entity(entity(9, "private_group"));
        gw.alias_entity("SecretHash", 9);
        gw.fail_next("invite", GatewayError::AlreadyParticipant);

        let id = fx.manager.join_group("t.me/+SecretHash").await.unwrap();
        assert_eq!(id, 9);
    }

    #[tokio::test]
    async fn auth_error_propagates_and_drops_gateway() {
        let fx = fixture(&["a"]);
        fx.manager.init_fleet().await.unwrap();
        fx.gateways[0].add_entity(entity(1, "g_one"));
        fx.gateways[0].fail_next("join", GatewayError::AuthKeyInvalid);

        let err = fx.manager.join_group("@g_one").await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::Gateway(GatewayError::AuthKeyInvalid)
        ));
        assert!(fx.registry.health("a").unwrap().unwrap().is_banned);
        assert!(fx.manager.connected_handles().is_empty());
    }

    #[tokio::test]
    async fn sticky_policy_reuses_account_until_failure() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(AccountRegistry::new(store.clone(), clock.clone()));
        let rotator = Arc::new(AccountRotator::new(
            registry.clone(),
            RotationMode::Sequential,
            clock.clone(),
        ));
        let connector = ScriptedConnector::new();
        let gw_a = ScriptedGateway::new("a");
        let gw_b = ScriptedGateway::new("b");
        for gw in [&gw_a, &gw_b] {
            gw.add_entity(entity(1, "g_one"));
            gw.add_entity(entity(2, "g_two"));
            gw.add_entity(entity(3, "g_three"));
        }
        connector.register(gw_a.clone());
        connector.register(gw_b.clone());
        let manager = GroupManager::new(
            vec![account("a"), account("b")],
            connector,
            registry,
            rotator,
            ProxyCycler::from_config(None),
            RotationPolicy::Sticky,
            store,
        );
        manager.init_fleet().await.unwrap();

        manager.join_group("@g_one").await.unwrap();
        manager.join_group("@g_two").await.unwrap();
        // Both joins ran on the first selected account.
        assert_eq!(gw_a.joins().len(), 2);
        assert!(gw_b.joins().is_empty());

        // A flood on "a" rotates; later operations stick to "b".
        gw_a.fail_next("join", GatewayError::FloodWait { seconds: 30 });
        manager.join_group("@g_three").await.unwrap();
        assert_eq!(gw_b.joins(), vec!["@g_three".to_string()]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let fx = fixture(&["a"]);
        fx.manager.init_fleet().await.unwrap();
        fx.manager.close().await;
        fx.manager.close().await;
        assert!(fx.gateways[0].is_closed());
    }
}
