//! Registry of remote nodes discovered through heartbeats
//!
//! Nodes announce themselves by answering `ping` with `pong` and are
//! forgotten once they stay silent past the node timeout

pub mod registry;
pub mod types;

pub use registry::NodeRegistry;
pub use types::NodeInfo;
