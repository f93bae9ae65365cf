//! Network module for turn-relay
//!
//! This module provides the datagram transport abstraction consumed by the
//! allocation core, and its implementations (native UDP sockets and an
//! in-memory virtual network).

mod udp;
mod virtual_net;

pub use udp::{NativeNet, UdpConn};
pub use virtual_net::{VirtualConn, VirtualNet};

use crate::config::UdpConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Maximum UDP datagram size
pub const MAX_UDP_PACKET: usize = 65535;

/// Transport protocol of a client flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// UDP
    #[default]
    Udp,
    /// TCP
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Tcp => f.write_str("TCP"),
        }
    }
}

/// Socket options applied to natively bound datagram sockets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOpts {
    /// SO_RCVBUF size in bytes
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF size in bytes
    pub send_buffer_size: Option<usize>,
}

impl SocketOpts {
    /// Create socket options from UDP config
    pub fn from_udp_config(config: &UdpConfig) -> Self {
        SocketOpts {
            recv_buffer_size: config.recv_buffer_size,
            send_buffer_size: config.send_buffer_size,
        }
    }

    /// Apply socket options to an unbound socket
    pub fn apply(&self, socket: &socket2::Socket) -> io::Result<()> {
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        Ok(())
    }
}

/// A datagram endpoint
///
/// Closing a conn is the only way to cancel a pending `recv_from`: once
/// `close` returns, every blocked and future receive fails.
#[async_trait]
pub trait PacketConn: Debug + Send + Sync {
    /// Receive a datagram, returning its length and sender
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send a datagram to `target`
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Local address the conn is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Close the conn. Closing an already closed conn is an error.
    fn close(&self) -> io::Result<()>;
}

/// Factory for datagram listeners
///
/// Injected into the allocation manager so it is not tied to a concrete
/// network stack.
#[async_trait]
pub trait Net: Debug + Send + Sync {
    /// Bind a datagram listener on `addr`. Port 0 picks any free port.
    async fn listen_packet(
        &self,
        protocol: Protocol,
        addr: SocketAddr,
    ) -> io::Result<Arc<dyn PacketConn>>;
}

/// Create the native network from configuration
pub fn create_net(config: &UdpConfig) -> Arc<dyn Net> {
    Arc::new(NativeNet::new(SocketOpts::from_udp_config(config)))
}

/// Error returned by operations on a closed conn
pub(crate) fn closed_conn_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "use of closed network connection",
    )
}

fn unsupported_protocol(protocol: Protocol) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} relay conns are not supported", protocol),
    )
}
