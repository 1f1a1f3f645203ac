//! Long-lived supervisor: periodic archive passes over the configured or
//! priority-ranked channel list, a slower priority-refresh cadence, and
//! the invitation queue for cloud-mode crawls.

use std::sync::Arc;
use std::time::Duration;

use spectra_fleet::ArchiveRunner;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::invites::InvitationQueue;
use crate::runtime::Runtime;

pub struct Orchestrator {
    runtime: Arc<Runtime>,
    invites: InvitationQueue,
}

impl Orchestrator {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let invites = InvitationQueue::new(
            runtime.manager.clone(),
            &runtime.config.paths.invitation_state_file,
            runtime.config.cloud.invitation_delays.clone(),
        );
        Self { runtime, invites }
    }

    /// Main loop. Runs until `shutdown` broadcasts `true`, then releases
    /// the fleet.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let cfg = &self.runtime.config.orchestrator;
        let mut archive_tick = interval(Duration::from_secs(cfg.archive_interval_secs.max(1)));
        let mut network_tick =
            interval(Duration::from_secs(cfg.network_refresh_interval_secs.max(1)));

        info!(
            archive_interval = cfg.archive_interval_secs,
            network_interval = cfg.network_refresh_interval_secs,
            "orchestrator started"
        );

        loop {
            tokio::select! {
                _ = archive_tick.tick() => {
                    if let Err(e) = self.archive_pass().await {
                        error!(error = %e, "archive pass failed");
                    }
                    if self.runtime.config.cloud.auto_invite_accounts {
                        self.invitation_pass().await;
                    }
                }
                _ = network_tick.tick() => {
                    match self.runtime.discovery.analyzer().recompute() {
                        Ok(nodes) => info!(nodes, "priorities refreshed"),
                        Err(e) => error!(error = %e, "priority refresh failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("orchestrator shutting down");
                        break;
                    }
                }
            }
        }

        self.runtime.shutdown().await;
    }

    /// Archive either the static channel list or the current priority
    /// targets, then mark archived discovered groups.
    pub async fn archive_pass(&self) -> anyhow::Result<()> {
        let cfg = &self.runtime.config.orchestrator;
        let targets: Vec<String> = if cfg.channels.is_empty() {
            self.runtime
                .discovery
                .analyzer()
                .top_priority_targets(cfg.max_priority_targets, cfg.priority_threshold)?
                .into_iter()
                .map(|g| g.link)
                .collect()
        } else {
            cfg.channels.clone()
        };

        if targets.is_empty() {
            info!("no archive targets this pass");
            return Ok(());
        }

        let runner: Arc<dyn ArchiveRunner> = self.runtime.archiver.clone();
        let results = self
            .runtime
            .scheduler
            .parallel_archive(targets.clone(), runner, None)
            .await?;

        let now = self.runtime.clock.now();
        let mut ok = 0usize;
        for (target, outcome) in &results {
            if outcome.is_ok() {
                ok += 1;
                if self.runtime.store.discovered_group(target)?.is_some() {
                    self.runtime.store.set_group_status(target, "archived", now)?;
                }
            }
        }
        info!(success = ok, total = results.len(), "archive pass complete");
        Ok(())
    }

    /// Offer every known channel to every connected account, throttled.
    async fn invitation_pass(&mut self) {
        let channels = match self.runtime.store.channels() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "could not list channels for invitations");
                return;
            }
        };
        let handles = self.runtime.manager.connected_handles();

        let candidates: Vec<(i64, String)> = channels
            .iter()
            .flat_map(|chan| handles.iter().map(move |h| (chan.id, h.clone())))
            .filter(|(id, h)| !self.invites.is_processed(*id, h))
            .collect();

        if candidates.is_empty() {
            return;
        }
        let joined = self.invites.process(candidates).await;
        info!(joined, "invitation pass complete");
    }
}
