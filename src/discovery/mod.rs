//! Node discovery over UDP multicast
//!
//! The local session pings the group every heartbeat interval; remote nodes
//! answer with `pong` and are tracked until they go silent. The same group
//! carries the directed `open_connection` / `close_connection` handshake.

pub mod broadcast;
pub mod socket;

pub use broadcast::BroadcastChannel;
pub use socket::bind_multicast;
