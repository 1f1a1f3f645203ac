//! Throttled invitation queue for cloud-mode crawls: other accounts are
//! asked to join channels the crawler has reached, spaced by jittered
//! delays so the fleet's joins never look synchronised. Outcomes persist
//! as `"channelId:sessionHandle"` strings; a flood wait raises the floor
//! of every later delay.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spectra_core::clock::nano_jitter;
use spectra_core::config::InvitationDelays;
use spectra_fleet::manager::join_with_gateway;
use spectra_fleet::GroupManager;
use spectra_gateway::{GatewayError, GroupLink};
use tokio::time::sleep;
use tracing::{info, warn};

pub struct InvitationQueue {
    manager: Arc<GroupManager>,
    state_file: PathBuf,
    delays: InvitationDelays,
    processed: HashSet<String>,
}

impl InvitationQueue {
    /// Load the processed set from `state_file` (missing or corrupt files
    /// start fresh).
    pub fn new(
        manager: Arc<GroupManager>,
        state_file: impl Into<PathBuf>,
        delays: InvitationDelays,
    ) -> Self {
        let state_file = state_file.into();
        let processed = match std::fs::read(&state_file) {
            Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(keys) => keys.into_iter().collect(),
                Err(e) => {
                    warn!(error = %e, "invitation state unreadable, starting fresh");
                    HashSet::new()
                }
            },
            Err(_) => HashSet::new(),
        };
        info!(processed = processed.len(), "invitation state loaded");
        Self {
            manager,
            state_file,
            delays,
            processed,
        }
    }

    pub fn is_processed(&self, channel_id: i64, session_handle: &str) -> bool {
        self.processed
            .contains(&invite_key(channel_id, session_handle))
    }

    pub fn current_delays(&self) -> &InvitationDelays {
        &self.delays
    }

    /// One pass over the candidate pairs. Returns the number of successful
    /// joins. Pairs that flood-wait stay queued for the next pass.
    pub async fn process(&mut self, candidates: Vec<(i64, String)>) -> usize {
        let mut joined = 0usize;

        for (channel_id, handle) in candidates {
            let key = invite_key(channel_id, &handle);
            if self.processed.contains(&key) {
                continue;
            }

            let delay = self.next_delay();
            info!(channel_id, account = %handle, delay_secs = delay.as_secs(), "invitation scheduled");
            sleep(delay).await;

            let gateway = match self.manager.gateway_for(&handle).await {
                Ok(g) => g,
                Err(e) => {
                    warn!(account = %handle, error = %e, "no gateway for invitation, marking processed");
                    self.mark_processed(key);
                    continue;
                }
            };

            match join_with_gateway(gateway.as_ref(), &GroupLink::Id(channel_id)).await {
                Ok(_) => {
                    info!(channel_id, account = %handle, "invitation join succeeded");
                    joined += 1;
                    self.mark_processed(key);
                }
                Err(GatewayError::AlreadyParticipant) => {
                    self.mark_processed(key);
                }
                Err(GatewayError::FloodWait { seconds }) => {
                    // Stay conservative from here on; the pair retries on a
                    // later pass.
                    self.delays.min_seconds = self.delays.min_seconds.max(seconds + 60);
                    self.delays.max_seconds = self.delays.max_seconds.max(seconds + 120);
                    warn!(
                        channel_id,
                        account = %handle,
                        seconds,
                        new_min = self.delays.min_seconds,
                        new_max = self.delays.max_seconds,
                        "flood wait on invitation, delays raised"
                    );
                }
                Err(e) => {
                    warn!(channel_id, account = %handle, error = %e, "invitation failed, marking processed");
                    self.mark_processed(key);
                }
            }
        }
        joined
    }

    /// `uniform(min, max) · uniform(1 − variance, 1 + variance)` seconds.
    fn next_delay(&self) -> Duration {
        let min = self.delays.min_seconds;
        let max = self.delays.max_seconds.max(min);
        let base = (min + nano_jitter(max - min + 1)) as f64;

        let v = self.delays.variance.clamp(0.0, 1.0);
        let factor = (1.0 - v) + (nano_jitter(1001) as f64 / 1000.0) * 2.0 * v;
        Duration::from_secs_f64((base * factor).max(0.0))
    }

    fn mark_processed(&mut self, key: String) {
        self.processed.insert(key);
        let mut keys: Vec<&String> = self.processed.iter().collect();
        keys.sort();
        match serde_json::to_vec_pretty(&keys) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.state_file, bytes) {
                    warn!(error = %e, "could not persist invitation state");
                }
            }
            Err(e) => warn!(error = %e, "could not serialise invitation state"),
        }
    }
}

fn invite_key(channel_id: i64, session_handle: &str) -> String {
    format!("{channel_id}:{session_handle}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use spectra_accounts::{AccountRegistry, AccountRotator};
    use spectra_core::config::{AccountConfig, RotationMode, RotationPolicy};
    use spectra_core::ManualClock;
    use spectra_gateway::mock::{ScriptedConnector, ScriptedGateway};
    use spectra_gateway::{EntityInfo, EntityKind, ProxyCycler, TelegramGateway};
    use spectra_store::Store;

    fn zero_delays() -> InvitationDelays {
        InvitationDelays {
            min_seconds: 0,
            max_seconds: 0,
            variance: 0.0,
        }
    }

    async fn manager_with(gateways: Vec<Arc<ScriptedGateway>>) -> Arc<GroupManager> {
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
        let accounts: Vec<AccountConfig> = gateways
            .iter()
            .map(|g| {
                connector.register(g.clone());
                AccountConfig {
                    api_id: 1,
                    api_hash: "h".into(),
                    session_handle: g.session_handle().to_string(),
                    phone: None,
                    password: None,
                }
            })
            .collect();
        let manager = Arc::new(GroupManager::new(
            accounts,
            connector,
            registry,
            rotator,
            ProxyCycler::from_config(None),
            RotationPolicy::PerOperation,
            store,
        ));
        manager.init_fleet().await.unwrap();
        manager
    }

    fn channel_entity(id: i64) -> EntityInfo {
        EntityInfo {
            id,
            kind: EntityKind::Channel,
            title: format!("chan_{id}"),
            username: None,
            access_hash: None,
        }
    }

    #[tokio::test]
    async fn processes_pairs_once_and_persists() {
        let gw = ScriptedGateway::new("a");
        gw.add_entity(channel_entity(500));
        let manager = manager_with(vec![gw]).await;

        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("invitation_state.json");
        let mut queue = InvitationQueue::new(manager.clone(), &state, zero_delays());

        let joined = queue.process(vec![(500, "a".to_string())]).await;
        assert_eq!(joined, 1);
        assert!(queue.is_processed(500, "a"));

        // Reload from disk: the pair stays terminal.
        let mut queue2 = InvitationQueue::new(manager, &state, zero_delays());
        assert!(queue2.is_processed(500, "a"));
        assert_eq!(queue2.process(vec![(500, "a".to_string())]).await, 0);
    }

    #[tokio::test]
    async fn flood_wait_raises_delay_floor_and_keeps_pair_queued() {
        let gw = ScriptedGateway::new("a");
        gw.add_entity(channel_entity(500));
        gw.fail_next("entity", GatewayError::FloodWait { seconds: 300 });
        let manager = manager_with(vec![gw]).await;

        let dir = tempfile::tempdir().unwrap();
        let mut queue = InvitationQueue::new(
            manager,
            dir.path().join("state.json"),
            zero_delays(),
        );

        let joined = queue.process(vec![(500, "a".to_string())]).await;
        assert_eq!(joined, 0);
        assert!(!queue.is_processed(500, "a"));
        assert_eq!(queue.current_delays().min_seconds, 360);
        assert_eq!(queue.current_delays().max_seconds, 420);
    }

    #[tokio::test]
    async fn target_errors_are_terminal() {
        let gw = ScriptedGateway::new("a");
        // Entity 500 unknown: NotFound is a target-specific failure.
        let manager = manager_with(vec![gw]).await;

        let dir = tempfile::tempdir().unwrap();
        let mut queue = InvitationQueue::new(
            manager,
            dir.path().join("state.json"),
            zero_delays(),
        );
        assert_eq!(queue.process(vec![(500, "a".to_string())]).await, 0);
        assert!(queue.is_processed(500, "a"));
    }

    #[test]
    fn delay_window_respects_variance_bounds() {
        // Construction only needs the manager for processing; use the
        // arithmetic directly through a throwaway queue.
        let delays = InvitationDelays {
            min_seconds: 100,
            max_seconds: 200,
            variance: 0.3,
        };
        // uniform(100,200) * uniform(0.7,1.3) stays within [70, 260].
        for _ in 0..50 {
            let min = delays.min_seconds;
            let max = delays.max_seconds;
            let base = (min + nano_jitter(max - min + 1)) as f64;
            let v = delays.variance;
            let factor = (1.0 - v) + (nano_jitter(1001) as f64 / 1000.0) * 2.0 * v;
            let secs = base * factor;
            assert!((70.0..=260.0).contains(&secs), "{secs}");
        }
    }
}
