//! Per-tab navigation graph: a lightweight map of "where has this tab been"
//! built entirely from observed navigations, used to give agents a sense of
//! place without replaying full history through CDP on every step.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::util::{now_ms, redact_url, short_hash10};

pub const MAX_NODES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Nav,
    Link,
}

#[derive(Debug, Clone, Serialize)]
pub struct NavNode {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub first_seen_at: u64,
    pub last_seen_at: u64,
    pub visits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NavEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub aff_ref: Option<String>,
    pub count: u64,
    pub first_seen_at: u64,
    pub last_seen_at: u64,
}

#[must_use]
pub fn node_id_for(url: &str) -> String {
    format!("nav:{}", short_hash10(&redact_url(url)))
}

/// Per-tab navigation graph. One instance per tab, owned by the session
/// manager and never shared across tabs.
pub struct NavGraph {
    inner: Mutex<Inner>,
}

struct Inner {
    nodes: HashMap<String, NavNode>,
    edges: HashMap<String, NavEdge>,
    current: Option<String>,
}

impl Default for NavGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl NavGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { nodes: HashMap::new(), edges: HashMap::new(), current: None }),
        }
    }

    /// Record a navigation from the current node to `url`, labeling the
    /// traversing edge `kind`. Updates visit/seen counters and advances
    /// `current`. Returns the new current node id.
    pub fn record(&self, url: &str, title: Option<String>, kind: EdgeKind, label: Option<String>, aff_ref: Option<String>) -> String {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = now_ms();
        let to_id = node_id_for(url);
        let redacted = redact_url(url);

        let from_id = inner.current.clone();

        let node = inner.nodes.entry(to_id.clone()).or_insert_with(|| NavNode {
            url: redacted.clone(),
            title: None,
            first_seen_at: now,
            last_seen_at: now,
            visits: 0,
        });
        node.visits += 1;
        node.last_seen_at = now;
        if title.is_some() {
            node.title = title;
        }

        if let Some(from) = from_id.filter(|f| *f != to_id) {
            let edge_id = format!("{from}->{to_id}");
            let edge = inner.edges.entry(edge_id).or_insert_with(|| NavEdge {
                from: from.clone(),
                to: to_id.clone(),
                kind,
                label: label.clone(),
                aff_ref: aff_ref.clone(),
                count: 0,
                first_seen_at: now,
                last_seen_at: now,
            });
            edge.count += 1;
            edge.last_seen_at = now;
            if label.is_some() {
                edge.label = label;
            }
            if aff_ref.is_some() {
                edge.aff_ref = aff_ref;
            }
        }

        inner.current = Some(to_id.clone());
        self.prune_locked(&mut inner);
        to_id
    }

    fn prune_locked(&self, inner: &mut Inner) {
        if inner.nodes.len() <= MAX_NODES {
            return;
        }
        let mut by_recency: Vec<(String, u64)> =
            inner.nodes.iter().map(|(id, n)| (id.clone(), n.last_seen_at)).collect();
        by_recency.sort_by_key(|(_, last_seen)| std::cmp::Reverse(*last_seen));
        let keep: std::collections::HashSet<String> =
            by_recency.into_iter().take(MAX_NODES).map(|(id, _)| id).collect();
        inner.nodes.retain(|id, _| keep.contains(id));
        inner.edges.retain(|_, e| keep.contains(&e.from) && keep.contains(&e.to));
    }

    #[must_use]
    pub fn current(&self) -> Option<String> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).current.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        serde_json::json!({
            "current": inner.current,
            "nodes": inner.nodes,
            "edges": inner.edges,
        })
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_derived_from_the_redacted_url() {
        let a = node_id_for("https://example.com/a?x=1");
        let b = node_id_for("https://example.com/a?y=2");
        assert_eq!(a, b, "query string must not affect node identity");
    }

    #[test]
    fn record_first_navigation_has_no_edge() {
        let graph = NavGraph::new();
        graph.record("https://example.com/", None, EdgeKind::Nav, None, None);
        let snap = graph.snapshot();
        assert_eq!(snap["edges"].as_object().unwrap().len(), 0);
        assert_eq!(snap["nodes"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn record_second_navigation_creates_an_edge_from_current() {
        let graph = NavGraph::new();
        graph.record("https://example.com/", None, EdgeKind::Nav, None, None);
        graph.record("https://example.com/about", None, EdgeKind::Link, Some("About".into()), None);
        let snap = graph.snapshot();
        assert_eq!(snap["edges"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn revisiting_the_same_url_increments_visits_not_node_count() {
        let graph = NavGraph::new();
        graph.record("https://example.com/", None, EdgeKind::Nav, None, None);
        graph.record("https://example.com/other", None, EdgeKind::Nav, None, None);
        graph.record("https://example.com/", None, EdgeKind::Nav, None, None);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn pruning_keeps_the_most_recently_seen_nodes() {
        let graph = NavGraph::new();
        for i in 0..(MAX_NODES + 10) {
            graph.record(&format!("https://example.com/{i}"), None, EdgeKind::Nav, None, None);
        }
        assert_eq!(graph.node_count(), MAX_NODES);
        // the very first node should have been pruned, the most recent kept
        let first_id = node_id_for("https://example.com/0");
        let snap = graph.snapshot();
        assert!(snap["nodes"].get(&first_id).is_none());
    }
}
