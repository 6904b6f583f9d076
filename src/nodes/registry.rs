//! Registry of nodes discovered on the multicast group

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::types::NodeInfo;
use crate::protocol::Attributes;

/// Thread-safe map of node id to [`NodeInfo`]
///
/// The listener task writes, callers read. Data only leaves the lock as
/// independent copies via [`NodeRegistry::snapshot`] and [`NodeRegistry::get`].
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, NodeInfo>>,
    timeout: Duration,
}

impl NodeRegistry {
    /// Create an empty registry that evicts nodes silent for longer than `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Eviction timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, NodeInfo>> {
        // A panic elsewhere cannot leave an entry half-written, so keep serving
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a `pong` from `node_id` seen at `now`
    ///
    /// Returns true if the node was not previously known
    pub fn update(&self, node_id: &str, attributes: Attributes, now: Instant) -> bool {
        let mut nodes = self.lock();
        let wall_clock = chrono::Utc::now();

        if let Some(node) = nodes.get_mut(node_id) {
            node.last_seen = now;
            node.last_seen_at = wall_clock;
            node.attributes = attributes;
            return false;
        }

        nodes.insert(
            node_id.to_string(),
            NodeInfo {
                node_id: node_id.to_string(),
                last_seen: now,
                discovered_at: wall_clock,
                last_seen_at: wall_clock,
                attributes,
            },
        );
        drop(nodes);

        tracing::info!(node_id, "remote node discovered");
        true
    }

    /// Remove every node not seen for longer than the timeout as of `now`
    ///
    /// Returns the ids of the evicted nodes
    pub fn sweep_timeouts(&self, now: Instant) -> Vec<String> {
        let mut lost = Vec::new();
        self.lock().retain(|node_id, node| {
            let alive = now.saturating_duration_since(node.last_seen) <= self.timeout;
            if !alive {
                lost.push(node_id.clone());
            }
            alive
        });

        for node_id in &lost {
            tracing::info!(node_id = %node_id, "remote node timed out");
        }
        lost
    }

    /// Copies of every known node
    #[must_use]
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.lock().values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Copy of a single node
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.lock().get(node_id).cloned()
    }

    /// Whether `node_id` is currently known
    #[must_use]
    pub fn contains(&self, node_id: &str) -> bool {
        self.lock().contains_key(node_id)
    }

    /// Number of known nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no nodes are known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
