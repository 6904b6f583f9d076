//! Multicast UDP socket setup

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::BroadcastConfig;

/// Create a UDP socket joined to the configured multicast group
///
/// Address and port reuse let several processes on one host share the group.
/// `bind_address` selects the interface used to join and send; the socket
/// itself binds the wildcard address so group traffic is delivered on every
/// platform. Loopback delivery is enabled so nodes on this host see each other.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns error if any socket option or the group membership is refused
pub fn bind_multicast(config: &BroadcastConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;

    let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.group.port());
    socket.bind(&SockAddr::from(local))?;

    socket.join_multicast_v4(config.group.ip(), &config.bind_address)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    if !config.bind_address.is_unspecified() {
        socket.set_multicast_if_v4(&config.bind_address)?;
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}
