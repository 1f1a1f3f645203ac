//! The explicit runtime context: one place that owns the store, account
//! machinery, fleet, pipelines and the shutdown channel, handed to every
//! component instead of global state.

use std::sync::Arc;

use anyhow::Context;
use spectra_accounts::{AccountRegistry, AccountRotator};
use spectra_archive::{Archiver, MediaSink};
use spectra_core::{Clock, SpectraConfig};
use spectra_discovery::Discovery;
use spectra_fleet::{ChannelAccessIndexer, GroupManager, TaskScheduler};
use spectra_forward::{ForwardOptions, Forwarder};
use spectra_gateway::{GatewayConnector, ProxyCycler};
use spectra_store::Store;
use tokio::sync::watch;

pub struct Runtime {
    pub config: SpectraConfig,
    pub store: Arc<Store>,
    pub registry: Arc<AccountRegistry>,
    pub rotator: Arc<AccountRotator>,
    pub manager: Arc<GroupManager>,
    pub scheduler: Arc<TaskScheduler>,
    pub discovery: Arc<Discovery>,
    pub archiver: Arc<Archiver>,
    pub forwarder: Arc<Forwarder>,
    pub indexer: Arc<ChannelAccessIndexer>,
    pub clock: Arc<dyn Clock>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Wire every component against `connector`. The transport adapter is
    /// the only piece not owned by this repository.
    pub fn build(
        config: SpectraConfig,
        connector: Arc<dyn GatewayConnector>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Runtime> {
        let store = Arc::new(
            Store::open(
                &config.paths.db_path,
                config.paths.display_timezone.as_deref(),
            )
            .with_context(|| format!("opening store at {}", config.paths.db_path))?,
        );

        let registry = Arc::new(AccountRegistry::new(store.clone(), clock.clone()));
        let rotator = Arc::new(AccountRotator::new(
            registry.clone(),
            config.rotation.mode,
            clock.clone(),
        ));

        let accounts: Vec<_> = config.usable_accounts().cloned().collect();
        let manager = Arc::new(GroupManager::new(
            accounts.clone(),
            connector,
            registry.clone(),
            rotator.clone(),
            ProxyCycler::from_config(config.proxy.as_ref()),
            config.rotation.policy,
            store.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::new(TaskScheduler::new(
            manager.clone(),
            store.clone(),
            registry.clone(),
            clock.clone(),
            shutdown_rx.clone(),
        ));

        let discovery = Arc::new(Discovery::new(
            store.clone(),
            manager.clone(),
            clock.clone(),
        ));

        let sink = MediaSink::new(&config.paths.media_dir)
            .with_context(|| format!("preparing media dir {}", config.paths.media_dir))?;
        let archiver = Arc::new(Archiver::new(
            store.clone(),
            config.archive.clone(),
            sink,
            clock.clone(),
        ));

        let forwarder = Arc::new(Forwarder::new(
            store.clone(),
            manager.clone(),
            registry.clone(),
            accounts.clone(),
            ForwardOptions::from(&config.forwarding),
            clock.clone(),
        ));

        let indexer = Arc::new(ChannelAccessIndexer::new(
            manager.clone(),
            store.clone(),
            clock.clone(),
            accounts,
        ));

        Ok(Runtime {
            config,
            store,
            registry,
            rotator,
            manager,
            scheduler,
            discovery,
            archiver,
            forwarder,
            indexer,
            clock,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Signal every loop to stop and release the gateway pool.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.manager.close().await;
    }
}
