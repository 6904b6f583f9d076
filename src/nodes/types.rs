//! Discovered node types

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::Attributes;

/// A remote node seen through its `pong` replies
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    /// Monotonic time of the latest `pong`, used for eviction
    #[serde(skip)]
    pub last_seen: Instant,
    pub discovered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Fields the node advertised in its latest `pong`
    pub attributes: Attributes,
}

impl NodeInfo {
    /// Look up an advertised attribute as text
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(serde_json::Value::as_str)
    }
}
