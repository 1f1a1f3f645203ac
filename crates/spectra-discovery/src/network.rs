//! Mention-graph analysis: weighted PageRank plus in-degree centrality,
//! blended into the per-group priority score.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use spectra_store::{DiscoveredGroup, Store};
use tracing::{debug, info};

use crate::error::Result;

/// PageRank damping factor.
const DAMPING: f64 = 0.85;
/// Stop when the L1 delta between iterations drops below this.
const CONVERGENCE_EPS: f64 = 1e-6;
/// Iteration cap when convergence is slow.
const MAX_ITERATIONS: usize = 100;

/// Recomputes `DiscoveredGroup.priority` from the current relationship
/// edge set: `0.7 · pagerank + 0.3 · in-degree centrality`, clamped to
/// `[0, 1]`.
pub struct NetworkAnalyzer {
    store: Arc<Store>,
}

impl NetworkAnalyzer {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Rebuild the graph from persisted edges and write fresh priorities.
    /// Returns the number of nodes scored.
    pub fn recompute(&self) -> Result<usize> {
        let edges = self.store.group_relationships()?;
        let known_links = self.store.discovered_links()?;

        let mut graph: DiGraph<String, f64> = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();

        let mut node = |graph: &mut DiGraph<String, f64>,
                        index: &mut HashMap<String, NodeIndex>,
                        name: &str| {
            *index
                .entry(name.to_string())
                .or_insert_with(|| graph.add_node(name.to_string()))
        };

        for link in &known_links {
            node(&mut graph, &mut index, link);
        }
        for edge in &edges {
            let s = node(&mut graph, &mut index, &edge.source);
            let t = node(&mut graph, &mut index, &edge.target);
            graph.add_edge(s, t, edge.weight);
        }

        let n = graph.node_count();
        if n == 0 {
            debug!("no nodes, skipping priority recompute");
            return Ok(0);
        }

        let pagerank = pagerank(&graph);
        let in_degree = in_degree_centrality(&graph);

        for idx in graph.node_indices() {
            let combined =
                (0.7 * pagerank[idx.index()] + 0.3 * in_degree[idx.index()]).clamp(0.0, 1.0);
            self.store.set_group_priority(&graph[idx], combined)?;
        }

        info!(nodes = n, edges = edges.len(), "group priorities recomputed");
        Ok(n)
    }

    /// The `n` highest-priority non-archived groups at or above
    /// `min_priority`.
    pub fn top_priority_targets(
        &self,
        n: usize,
        min_priority: f64,
    ) -> Result<Vec<DiscoveredGroup>> {
        Ok(self.store.priority_targets(n, min_priority)?)
    }
}

/// Weighted PageRank with uniform redistribution of dangling mass.
fn pagerank(graph: &DiGraph<String, f64>) -> Vec<f64> {
    let n = graph.node_count();
    if n == 0 {
        return Vec::new();
    }
    let uniform = 1.0 / n as f64;
    let mut rank = vec![uniform; n];

    // Total outgoing weight per node; zero marks a dangling node.
    let out_weight: Vec<f64> = graph
        .node_indices()
        .map(|i| {
            graph
                .edges(i)
                .map(|e| *e.weight())
                .sum::<f64>()
        })
        .collect();

    for _ in 0..MAX_ITERATIONS {
        let dangling_mass: f64 = graph
            .node_indices()
            .filter(|i| out_weight[i.index()] == 0.0)
            .map(|i| rank[i.index()])
            .sum();

        let mut next = vec![(1.0 - DAMPING) * uniform + DAMPING * dangling_mass * uniform; n];
        for edge in graph.edge_indices() {
            let (src, dst) = graph.edge_endpoints(edge).expect("edge exists");
            let share = *graph.edge_weight(edge).expect("edge weight") / out_weight[src.index()];
            next[dst.index()] += DAMPING * rank[src.index()] * share;
        }

        let delta: f64 = rank
            .iter()
            .zip(&next)
            .map(|(a, b)| (a - b).abs())
            .sum();
        rank = next;
        if delta < CONVERGENCE_EPS {
            break;
        }
    }
    rank
}

/// Incoming-edge count normalised by `n - 1`, networkx-style.
fn in_degree_centrality(graph: &DiGraph<String, f64>) -> Vec<f64> {
    let n = graph.node_count();
    if n <= 1 {
        return vec![0.0; n];
    }
    let denom = (n - 1) as f64;
    graph
        .node_indices()
        .map(|i| {
            graph
                .edges_directed(i, petgraph::Direction::Incoming)
                .count() as f64
                / denom
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn seeded_store(edges: &[(&str, &str)]) -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = Utc::now();
        for (s, t) in edges {
            store
                .record_discovered_group(s, "username", "seed", now)
                .unwrap();
            store
                .record_discovered_group(t, "username", "seed", now)
                .unwrap();
            store.add_group_relationship(s, t, "mention", 1.0).unwrap();
        }
        store
    }

    #[test]
    fn priorities_land_in_unit_interval() {
        let store = seeded_store(&[("@a_grp", "@x_grp"), ("@b_grp", "@x_grp"), ("@a_grp", "@y_grp")]);
        let analyzer = NetworkAnalyzer::new(store.clone());
        let scored = analyzer.recompute().unwrap();
        assert_eq!(scored, 4);

        for link in store.discovered_links().unwrap() {
            let g = store.discovered_group(&link).unwrap().unwrap();
            assert!((0.0..=1.0).contains(&g.priority), "{link}: {}", g.priority);
        }
    }

    #[test]
    fn hub_outranks_leaf() {
        let store = seeded_store(&[("@a_grp", "@x_grp"), ("@b_grp", "@x_grp"), ("@a_grp", "@y_grp")]);
        NetworkAnalyzer::new(store.clone()).recompute().unwrap();

        let x = store.discovered_group("@x_grp").unwrap().unwrap().priority;
        let y = store.discovered_group("@y_grp").unwrap().unwrap().priority;
        assert!(x > y, "x={x} y={y}");
    }

    #[test]
    fn new_inbound_edge_is_monotone() {
        let store = seeded_store(&[("@a_grp", "@x_grp"), ("@b_grp", "@x_grp"), ("@a_grp", "@y_grp")]);
        let analyzer = NetworkAnalyzer::new(store.clone());
        analyzer.recompute().unwrap();
        let x_before = store.discovered_group("@x_grp").unwrap().unwrap().priority;
        let y_before = store.discovered_group("@y_grp").unwrap().unwrap().priority;

        let now = Utc::now();
        store
            .record_discovered_group("@c_grp", "username", "seed", now)
            .unwrap();
        store
            .add_group_relationship("@c_grp", "@x_grp", "mention", 1.0)
            .unwrap();
        analyzer.recompute().unwrap();

        let x_after = store.discovered_group("@x_grp").unwrap().unwrap().priority;
        let y_after = store.discovered_group("@y_grp").unwrap().unwrap().priority;
        assert!(x_after >= x_before, "x {x_before} -> {x_after}");
        assert!(y_after <= y_before, "y {y_before} -> {y_after}");
    }

    #[test]
    fn pagerank_mass_sums_to_one() {
        let store = seeded_store(&[("@a_grp", "@b_grp"), ("@b_grp", "@c_grp"), ("@c_grp", "@a_grp")]);
        let edges = store.group_relationships().unwrap();
        let mut graph: DiGraph<String, f64> = DiGraph::new();
        let mut index = HashMap::new();
        for e in &edges {
            let s = *index
                .entry(e.source.clone())
                .or_insert_with(|| graph.add_node(e.source.clone()));
            let t = *index
                .entry(e.target.clone())
                .or_insert_with(|| graph.add_node(e.target.clone()));
            graph.add_edge(s, t, e.weight);
        }

        let pr = pagerank(&graph);
        let total: f64 = pr.iter().sum();
        assert!((total - 1.0).abs() < 1e-6, "total={total}");
        // Symmetric ring: equal ranks.
        assert!((pr[0] - pr[1]).abs() < 1e-6);
        assert!((pr[1] - pr[2]).abs() < 1e-6);
    }

    #[test]
    fn top_targets_exclude_archived() {
        let store = seeded_store(&[("@a_grp", "@x_grp"), ("@a_grp", "@y_grp")]);
        let analyzer = NetworkAnalyzer::new(store.clone());
        analyzer.recompute().unwrap();
        store
            .set_group_status("@x_grp", "archived", Utc::now())
            .unwrap();

        let targets = analyzer.top_priority_targets(10, 0.0).unwrap();
        assert!(targets.iter().all(|g| g.link != "@x_grp"));
    }
}
