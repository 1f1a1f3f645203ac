//! Recursive crawl: join a seed, harvest links from its recent history,
//! then fan out depth layer by depth layer. Everything found lands in the
//! store as discovered groups, mention edges and audit rows.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use spectra_core::Clock;
use spectra_fleet::{FleetError, GroupManager, TaskFn, TaskScheduler};
use spectra_gateway::{GatewayMessage, GroupLink, MessageQuery, TelegramGateway};
use spectra_store::Store;
use tracing::{info, warn};

use crate::error::Result;
use crate::extract::extract_from_message;
use crate::network::NetworkAnalyzer;

/// Page size used when walking an entity's recent history.
const FETCH_PAGE: u32 = 500;
/// New links per crawled entity admitted into the next parallel BFS layer.
const PARALLEL_FANOUT_CAP: usize = 5;

pub struct Discovery {
    store: Arc<Store>,
    manager: Arc<GroupManager>,
    analyzer: NetworkAnalyzer,
    clock: Arc<dyn Clock>,
}

impl Discovery {
    pub fn new(
        store: Arc<Store>,
        manager: Arc<GroupManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let analyzer = NetworkAnalyzer::new(store.clone());
        Self {
            store,
            manager,
            analyzer,
            clock,
        }
    }

    pub fn analyzer(&self) -> &NetworkAnalyzer {
        &self.analyzer
    }

    /// Crawl outward from `seed`. Entities at layers `0..depth` are joined
    /// and scanned; their links form the next layer. The visited set keeps
    /// any entity from being crawled twice within the call. Finishes with a
    /// priority recompute over the grown edge set.
    pub async fn discover_from_seed(
        &self,
        seed: &str,
        depth: u32,
        msg_limit: u32,
    ) -> Result<BTreeSet<String>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut all_found: BTreeSet<String> = BTreeSet::new();
        let mut layer: BTreeSet<String> = BTreeSet::from([seed.to_string()]);

        for d in 0..depth {
            let mut next_layer = BTreeSet::new();

            for entity_link in layer {
                if !visited.insert(entity_link.clone()) {
                    continue;
                }
                let found = match self.crawl_entity(&entity_link, d, msg_limit).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(entity = %entity_link, error = %e, "crawl of entity failed");
                        continue;
                    }
                };

                all_found.extend(found.iter().cloned());
                next_layer.extend(
                    found
                        .into_iter()
                        .filter(|link| !visited.contains(link)),
                );
            }

            if next_layer.is_empty() {
                info!(depth = d, "no more links to follow");
                break;
            }
            layer = next_layer;
        }

        self.analyzer.recompute()?;
        info!(seed, found = all_found.len(), "discovery complete");
        Ok(all_found)
    }

    /// Join one entity, scan its recent history and persist what it links
    /// to.
    async fn crawl_entity(
        &self,
        entity_link: &str,
        depth: u32,
        msg_limit: u32,
    ) -> Result<BTreeSet<String>> {
        let entity_id = self.manager.join_group(entity_link).await?;
        let (_, gateway) = self.manager.active_gateway().await?;

        let messages = fetch_recent_messages(gateway.as_ref(), entity_id, msg_limit).await?;
        let mut found = BTreeSet::new();
        for message in &messages {
            found.extend(extract_from_message(message));
        }
        found.remove(entity_link);

        let now = self.clock.now();
        let source = format!("discovery_depth_{depth}");
        for link in &found {
            let parsed = GroupLink::parse(link);
            self.store
                .record_discovered_group(link, parsed.kind_str(), &source, now)?;
            self.store
                .add_group_relationship(entity_link, link, "mention", 1.0)?;
        }
        self.store
            .record_discovery_source(entity_link, found.len(), depth, now)?;

        info!(
            entity = %entity_link,
            depth,
            scanned = messages.len(),
            found = found.len(),
            "entity crawled"
        );
        Ok(found)
    }

    /// BFS variant dispatched through the parallel scheduler: each layer's
    /// links are joined in parallel, then scanned in parallel; the next
    /// layer takes at most [`PARALLEL_FANOUT_CAP`] new links per entity.
    /// Layers run strictly in order.
    pub async fn parallel_discover(
        &self,
        scheduler: &TaskScheduler,
        seeds: Vec<String>,
        depth: u32,
        msg_limit: u32,
        max_concurrent: Option<usize>,
    ) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut per_entity: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut layer: Vec<String> = seeds;

        for d in 0..depth {
            layer.retain(|link| visited.insert(link.clone()));
            if layer.is_empty() {
                break;
            }

            let join_results = scheduler.parallel_join(layer.clone(), max_concurrent).await?;
            let joined: Vec<(String, i64)> = layer
                .iter()
                .filter_map(|link| {
                    join_results
                        .get(link)
                        .and_then(|o| o.value())
                        .and_then(|v| v["entity_id"].as_i64())
                        .map(|id| (link.clone(), id))
                })
                .collect();
            if joined.is_empty() {
                warn!(depth = d, "no layer entity could be joined");
                break;
            }

            let kind = format!("discovery_depth_{d}");
            let task: TaskFn = Arc::new(move |gateway, target| {
                Box::pin(async move {
                    let entity_id: i64 = target
                        .parse()
                        .map_err(|_| FleetError::Task(format!("bad entity id: {target}")))?;
                    let messages =
                        fetch_recent_messages(gateway.as_ref(), entity_id, msg_limit)
                            .await
                            .map_err(FleetError::Gateway)?;
                    let mut links = BTreeSet::new();
                    for message in &messages {
                        links.extend(extract_from_message(message));
                    }
                    Ok(serde_json::json!(links.into_iter().collect::<Vec<String>>()))
                })
            });
            let scan_results = scheduler
                .execute_parallel(
                    &kind,
                    joined.iter().map(|(_, id)| id.to_string()).collect(),
                    task,
                    max_concurrent,
                )
                .await?;

            let now = self.clock.now();
            let mut next_layer = Vec::new();
            for (link, entity_id) in joined {
                let Some(value) = scan_results.get(&entity_id.to_string()).and_then(|o| o.value())
                else {
                    continue;
                };
                let mut found: Vec<String> =
                    serde_json::from_value(value.clone()).unwrap_or_default();
                found.retain(|f| f != &link);

                for f in &found {
                    let parsed = GroupLink::parse(f);
                    self.store
                        .record_discovered_group(f, parsed.kind_str(), &kind, now)?;
                    self.store
                        .add_group_relationship(&link, f, "mention", 1.0)?;
                }
                self.store
                    .record_discovery_source(&link, found.len(), d, now)?;

                next_layer.extend(
                    found
                        .iter()
                        .filter(|f| !visited.contains(*f))
                        .take(PARALLEL_FANOUT_CAP)
                        .cloned(),
                );
                per_entity.entry(link).or_default().extend(found);
            }

            layer = next_layer;
        }

        self.analyzer.recompute()?;
        Ok(per_entity)
    }
}

/// Walk an entity's history newest-first up to `limit` messages.
pub async fn fetch_recent_messages(
    gateway: &dyn TelegramGateway,
    entity_id: i64,
    limit: u32,
) -> spectra_gateway::Result<Vec<GatewayMessage>> {
    let mut out: Vec<GatewayMessage> = Vec::new();
    let mut offset_id = 0i64;

    while (out.len() as u32) < limit {
        let want = FETCH_PAGE.min(limit - out.len() as u32);
        let page = gateway
            .fetch_messages(
                entity_id,
                MessageQuery {
                    offset_id,
                    limit: want,
                    reverse: false,
                    topic_id: None,
                },
            )
            .await?;
        if page.is_empty() {
            break;
        }
        let short = (page.len() as u32) < want;
        offset_id = page.last().map(|m| m.id).unwrap_or(offset_id);
        out.extend(page);
        if short {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use spectra_accounts::{AccountRegistry, AccountRotator};
    use spectra_core::config::{AccountConfig, RotationMode, RotationPolicy};
    use spectra_core::ManualClock;
    use spectra_gateway::mock::{ScriptedConnector, ScriptedGateway};
    use spectra_gateway::{EntityInfo, EntityKind, ProxyCycler};
    use tokio::sync::watch;

    fn entity(id: i64, name: &str) -> EntityInfo {
        EntityInfo {
            id,
            kind: EntityKind::Supergroup,
            title: name.to_string(),
            username: Some(name.to_string()),
            access_hash: None,
        }
    }

    /// Seed @seed_a mentions @group_b and @group_c; @group_b mentions
    /// @group_d (and the seed again); @group_d mentions @group_e, which
    /// must stay unreached at depth 2.
    fn script_graph(gw: &ScriptedGateway) {
        for (id, name) in [
            (1, "seed_a"),
            (2, "group_b"),
            (3, "group_c"),
            (4, "group_d"),
            (5, "group_e"),
        ] {
            gw.add_entity(entity(id, name));
        }
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        gw.set_messages(
            1,
            vec![
                GatewayMessage::text_message(10, at, "check @group_b today"),
                GatewayMessage::text_message(11, at, "also @group_c is nice"),
            ],
        );
        gw.set_messages(
            2,
            vec![GatewayMessage::text_message(
                20,
                at,
                "back to @seed_a, onward to @group_d",
            )],
        );
        gw.set_messages(3, vec![]);
        gw.set_messages(
            4,
            vec![GatewayMessage::text_message(40, at, "deep cut @group_e")],
        );
    }

    struct Fixture {
        discovery: Discovery,
        scheduler: TaskScheduler,
        store: Arc<Store>,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn fixture(handles: &[&str]) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(AccountRegistry::new(store.clone(), clock.clone()));
        let rotator = Arc::new(AccountRotator::new(
            registry.clone(),
            RotationMode::Sequential,
            clock.clone(),
        ));
        let connector = ScriptedConnector::new();
        for h in handles {
            let gw = ScriptedGateway::new(h);
            script_graph(&gw);
            connector.register(gw);
        }
        let accounts: Vec<AccountConfig> = handles
            .iter()
            .map(|h| AccountConfig {
                api_id: 1,
                api_hash: "h".into(),
                session_handle: (*h).into(),
                phone: None,
                password: None,
            })
            .collect();
        let manager = Arc::new(GroupManager::new(
            accounts,
            connector,
            registry.clone(),
            rotator,
            ProxyCycler::from_config(None),
            RotationPolicy::PerOperation,
            store.clone(),
        ));
        manager.init_fleet().await.unwrap();

        let (tx, rx) = watch::channel(false);
        Fixture {
            discovery: Discovery::new(store.clone(), manager.clone(), clock.clone()),
            scheduler: TaskScheduler::new(manager, store.clone(), registry, clock, rx),
            store,
            _shutdown_tx: tx,
        }
    }

    #[tokio::test]
    async fn bfs_reaches_exactly_two_layers() {
        let fx = fixture(&["a"]).await;
        let found = fx
            .discovery
            .discover_from_seed("@seed_a", 2, 100)
            .await
            .unwrap();

        assert!(found.contains("@group_b"));
        assert!(found.contains("@group_c"));
        assert!(found.contains("@group_d"));
        // Depth-2 entities are not crawled, so their links stay unseen.
        assert!(!found.contains("@group_e"));

        let edges = fx.store.group_relationships().unwrap();
        let has = |s: &str, t: &str| edges.iter().any(|e| e.source == s && e.target == t);
        assert!(has("@seed_a", "@group_b"));
        assert!(has("@seed_a", "@group_c"));
        assert!(has("@group_b", "@group_d"));
        assert!(!has("@group_d", "@group_e"));
    }

    #[tokio::test]
    async fn seed_is_not_revisited() {
        let fx = fixture(&["a"]).await;
        fx.discovery
            .discover_from_seed("@seed_a", 3, 100)
            .await
            .unwrap();

        // @group_b mentions the seed; a revisit would add seed-sourced
        // duplicate edges with weight 2.
        let edges = fx.store.group_relationships().unwrap();
        let seed_to_b = edges
            .iter()
            .find(|e| e.source == "@seed_a" && e.target == "@group_b")
            .unwrap();
        assert_eq!(seed_to_b.weight, 1.0);
    }

    #[tokio::test]
    async fn discovery_tags_sources_by_depth() {
        let fx = fixture(&["a"]).await;
        fx.discovery
            .discover_from_seed("@seed_a", 2, 100)
            .await
            .unwrap();

        let b = fx.store.discovered_group("@group_b").unwrap().unwrap();
        assert_eq!(b.source, "discovery_depth_0");
        let d = fx.store.discovered_group("@group_d").unwrap().unwrap();
        assert_eq!(d.source, "discovery_depth_1");
    }

    #[tokio::test]
    async fn priorities_refresh_after_crawl() {
        let fx = fixture(&["a"]).await;
        fx.discovery
            .discover_from_seed("@seed_a", 2, 100)
            .await
            .unwrap();

        let b = fx.store.discovered_group("@group_b").unwrap().unwrap();
        assert!(b.priority > 0.0);
        assert!(b.priority <= 1.0);
    }

    #[tokio::test]
    async fn parallel_discover_matches_sequential_reach() {
        let fx = fixture(&["a", "b"]).await;
        let per_entity = fx
            .discovery
            .parallel_discover(&fx.scheduler, vec!["@seed_a".into()], 2, 100, None)
            .await
            .unwrap();

        let all: BTreeSet<String> = per_entity.values().flatten().cloned().collect();
        assert!(all.contains("@group_b"));
        assert!(all.contains("@group_c"));
        assert!(all.contains("@group_d"));
        assert!(!all.contains("@group_e"));

        // Seed scan results keyed by the crawled link.
        assert!(per_entity.contains_key("@seed_a"));
        assert!(per_entity.contains_key("@group_b"));
    }

    #[tokio::test]
    async fn message_fetch_respects_limit() {
        let fx = fixture(&["a"]).await;
        let gw = ScriptedGateway::new("probe");
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        gw.set_messages(
            9,
            (1..=900)
                .map(|i| GatewayMessage::text_message(i, at, "x"))
                .collect(),
        );
        let msgs = fetch_recent_messages(gw.as_ref(), 9, 600).await.unwrap();
        assert_eq!(msgs.len(), 600);
        assert_eq!(msgs.first().unwrap().id, 900);
        assert_eq!(msgs.last().unwrap().id, 301);
        drop(fx);
    }
}
