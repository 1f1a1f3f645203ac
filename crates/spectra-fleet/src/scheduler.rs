//! Bounded, account-aware parallel dispatcher. Binds each task to exactly
//! one account, records start and completion rows durably, and feeds
//! outcomes back into the account registry.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use spectra_accounts::AccountRegistry;
use spectra_core::Clock;
use spectra_gateway::{GroupLink, TelegramGateway};
use spectra_store::Store;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::manager::{join_with_gateway, ArchiveRunner, GroupManager};

/// Pause before re-checking for a free account when targets remain but
/// every account is busy.
const BACKPRESSURE_WAIT: Duration = Duration::from_millis(500);
/// Cooldown hours applied to an account whose task failed with a
/// flood-class error.
const FLOOD_TASK_COOLDOWN_HOURS: f64 = 1.0;

/// One task: gets the bound account's gateway and the target string.
pub type TaskFn = Arc<
    dyn Fn(Arc<dyn TelegramGateway>, String) -> BoxFuture<'static, Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// Per-target result collected by `execute_parallel`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Ok(serde_json::Value),
    Err { kind: String, detail: String },
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskOutcome::Ok(_))
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            TaskOutcome::Ok(v) => Some(v),
            TaskOutcome::Err { .. } => None,
        }
    }
}

pub struct TaskScheduler {
    manager: Arc<GroupManager>,
    store: Arc<Store>,
    registry: Arc<AccountRegistry>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
}

impl TaskScheduler {
    pub fn new(
        manager: Arc<GroupManager>,
        store: Arc<Store>,
        registry: Arc<AccountRegistry>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            store,
            registry,
            clock,
            shutdown,
        }
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run `task_fn` over `targets` with at most one in-flight task per
    /// account and at most `max_concurrent` in flight globally. Returns the
    /// per-target outcome map; cancellation stops new dispatch and lets
    /// in-flight tasks drain.
    pub async fn execute_parallel(
        &self,
        kind: &str,
        targets: Vec<String>,
        task_fn: TaskFn,
        max_concurrent: Option<usize>,
    ) -> Result<BTreeMap<String, TaskOutcome>> {
        let mut available: Vec<String> = self.manager.connected_handles();
        if available.is_empty() {
            warn!(kind, "no connected accounts, nothing dispatched");
            return Ok(BTreeMap::new());
        }
        let max_concurrent = max_concurrent.unwrap_or(available.len()).max(1);

        let mut pending: VecDeque<String> = targets.into();
        let mut results: BTreeMap<String, TaskOutcome> = BTreeMap::new();
        let mut in_flight: JoinSet<(String, String, String, Result<serde_json::Value>)> =
            JoinSet::new();

        while !pending.is_empty() || !in_flight.is_empty() {
            while in_flight.len() < max_concurrent
                && !pending.is_empty()
                && !available.is_empty()
                && !self.cancelled()
            {
                let Some(target) = pending.pop_front() else {
                    break;
                };
                let session = available.remove(0);
                let task_id = Uuid::new_v4().to_string();

                // Start row lands before the task is launched.
                self.store
                    .task_started(&task_id, kind, &target, &session, self.clock.now())?;

                let gateway = match self.manager.gateway_for(&session).await {
                    Ok(g) => g,
                    Err(e) => {
                        // The account cannot serve: complete the row as
                        // failed and keep the account out of the pool.
                        self.store.task_completed(
                            &task_id,
                            false,
                            Some(e.kind()),
                            None,
                            self.clock.now(),
                        )?;
                        results.insert(
                            target,
                            TaskOutcome::Err {
                                kind: e.kind().to_string(),
                                detail: e.to_string(),
                            },
                        );
                        continue;
                    }
                };

                info!(kind, target = %target, account = %session, "task dispatched");
                let f = task_fn.clone();
                let t = target.clone();
                in_flight.spawn(async move {
                    let outcome = f(gateway, t.clone()).await;
                    (task_id, t, session, outcome)
                });
            }

            if in_flight.is_empty() {
                // Accounts that failed to serve a gateway never return to
                // the pool; with nothing in flight and none available the
                // remaining targets are undispatchable.
                if pending.is_empty() || available.is_empty() || self.cancelled() {
                    break;
                }
                // Targets remain but every account is busy elsewhere.
                sleep(BACKPRESSURE_WAIT).await;
                continue;
            }

            if let Some(joined) = in_flight.join_next().await {
                match joined {
                    Ok((task_id, target, session, outcome)) => {
                        self.finish_task(&task_id, &target, &session, outcome, &mut results)?;
                        available.push(session);
                    }
                    Err(join_err) => {
                        warn!(kind, error = %join_err, "task panicked");
                    }
                }
            }
        }

        let ok = results.values().filter(|o| o.is_ok()).count();
        if self.cancelled() && !pending.is_empty() {
            info!(kind, skipped = pending.len(), "cancelled before full dispatch");
        }
        info!(kind, success = ok, total = results.len(), "parallel run complete");
        Ok(results)
    }

    /// Record completion durably, update account health, stash the outcome.
    fn finish_task(
        &self,
        task_id: &str,
        target: &str,
        session: &str,
        outcome: Result<serde_json::Value>,
        results: &mut BTreeMap<String, TaskOutcome>,
    ) -> Result<()> {
        match outcome {
            Ok(value) => {
                self.store.task_completed(
                    task_id,
                    true,
                    None,
                    Some(&value.to_string()),
                    self.clock.now(),
                )?;
                self.registry.mark_success(session)?;
                results.insert(target.to_string(), TaskOutcome::Ok(value));
            }
            Err(e) => {
                self.store
                    .task_completed(task_id, false, Some(e.kind()), None, self.clock.now())?;
                match e.as_gateway() {
                    Some(gw_err) => {
                        let cooldown = e
                            .is_flood_class()
                            .then_some(FLOOD_TASK_COOLDOWN_HOURS);
                        self.registry.mark_failure(session, gw_err, cooldown)?;
                    }
                    None => self.registry.note_failure(session, e.kind())?,
                }
                warn!(target, account = %session, error = %e, "task failed");
                results.insert(
                    target.to_string(),
                    TaskOutcome::Err {
                        kind: e.kind().to_string(),
                        detail: e.to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Join many groups in parallel; the outcome value carries the joined
    /// entity id.
    pub async fn parallel_join(
        &self,
        links: Vec<String>,
        max_concurrent: Option<usize>,
    ) -> Result<BTreeMap<String, TaskOutcome>> {
        let task: TaskFn = Arc::new(|gateway, target| {
            Box::pin(async move {
                let link = GroupLink::parse(&target);
                let entity = join_with_gateway(gateway.as_ref(), &link).await?;
                Ok(serde_json::json!({ "entity_id": entity.id }))
            })
        });
        self.execute_parallel("join", links, task, max_concurrent).await
    }

    /// Archive many entities in parallel through the injected runner.
    pub async fn parallel_archive(
        &self,
        targets: Vec<String>,
        runner: Arc<dyn ArchiveRunner>,
        max_concurrent: Option<usize>,
    ) -> Result<BTreeMap<String, TaskOutcome>> {
        let task: TaskFn = Arc::new(move |gateway, target| {
            let runner = runner.clone();
            Box::pin(async move { runner.archive(gateway, &target).await })
        });
        self.execute_parallel("archive", targets, task, max_concurrent)
            .await
    }
}
