//! Per-account dialog enumeration feeding the channel access table, which
//! is the working set for total-forward mode.

use std::collections::BTreeMap;
use std::sync::Arc;

use spectra_core::config::AccountConfig;
use spectra_core::Clock;
use spectra_store::{ChannelRow, Store};
use tracing::{info, warn};

use crate::error::Result;
use crate::manager::GroupManager;

pub struct ChannelAccessIndexer {
    manager: Arc<GroupManager>,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    accounts: Vec<AccountConfig>,
}

impl ChannelAccessIndexer {
    pub fn new(
        manager: Arc<GroupManager>,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        accounts: Vec<AccountConfig>,
    ) -> Self {
        Self {
            manager,
            store,
            clock,
            accounts,
        }
    }

    /// Enumerate every account's dialogs and replace the access rows for
    /// channel-like entities. Per-account errors are isolated; the returned
    /// map carries the indexed channel count per account identifier.
    pub async fn run(&self) -> Result<BTreeMap<String, usize>> {
        let mut report = BTreeMap::new();

        for account in &self.accounts {
            let ident = account.phone_or_handle().to_string();
            match self.index_account(account).await {
                Ok(count) => {
                    info!(account = %ident, channels = count, "access index updated");
                    report.insert(ident, count);
                }
                Err(e) => {
                    warn!(account = %ident, error = %e, "access indexing failed for account");
                    report.insert(ident, 0);
                }
            }
        }

        Ok(report)
    }

    async fn index_account(&self, account: &AccountConfig) -> Result<usize> {
        let gateway = self.manager.gateway_for(&account.session_handle).await?;
        let now = self.clock.now();
        let mut count = 0usize;

        for dialog in gateway.dialogs().await? {
            let entity = dialog.entity;
            if !entity.kind.is_channel_like() {
                continue;
            }
            self.store.upsert_channel(
                &ChannelRow {
                    id: entity.id,
                    kind: entity.kind.as_str().to_string(),
                    title: Some(entity.title.clone()),
                    username: entity.username.clone(),
                    access_hash: entity.access_hash,
                },
                now,
            )?;
            self.store.upsert_channel_access(
                account.phone_or_handle(),
                entity.id,
                Some(&entity.title),
                entity.access_hash,
                now,
            )?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use spectra_accounts::{AccountRegistry, AccountRotator};
    use spectra_core::config::{RotationMode, RotationPolicy};
    use spectra_core::ManualClock;
    use spectra_gateway::mock::{ScriptedConnector, ScriptedGateway};
    use spectra_gateway::{DialogEntry, EntityInfo, EntityKind, GatewayError, ProxyCycler};

    fn account(handle: &str, phone: Option<&str>) -> AccountConfig {
        AccountConfig {
            api_id: 1,
            api_hash: "h".into(),
            session_handle: handle.into(),
            phone: phone.map(str::to_string),
            password: None,
        }
    }

    fn dialog(id: i64, kind: EntityKind, title: &str) -> DialogEntry {
        DialogEntry {
            entity: EntityInfo {
                id,
                kind,
                title: title.to_string(),
                username: None,
                access_hash: Some(id * 3),
            },
        }
    }

    #[tokio::test]
    async fn indexes_channel_like_dialogs_and_isolates_errors() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
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
        gw_a.set_dialogs(vec![
            dialog(1, EntityKind::Channel, "News"),
            dialog(2, EntityKind::User, "Some Person"),
            dialog(3, EntityKind::Supergroup, "Chat"),
        ]);
        connector.register(gw_a);

        let gw_b = ScriptedGateway::new("b");
        gw_b.fail_next("dialogs", GatewayError::AuthKeyInvalid);
        connector.register(gw_b);

        let accounts = vec![account("a", Some("+100")), account("b", None)];
        let manager = Arc::new(GroupManager::new(
            accounts.clone(),
            connector,
            registry,
            rotator,
            ProxyCycler::from_config(None),
            RotationPolicy::PerOperation,
            store.clone(),
        ));
        manager.init_fleet().await.unwrap();

        let indexer = ChannelAccessIndexer::new(manager, store.clone(), clock, accounts);
        let report = indexer.run().await.unwrap();

        assert_eq!(report["+100"], 2);
        assert_eq!(report["b"], 0);
        assert_eq!(store.channel_access_count("+100").unwrap(), 2);
        assert_eq!(
            store.channel_access_pairs().unwrap(),
            vec![(1, "+100".to_string()), (3, "+100".to_string())]
        );
    }
}
