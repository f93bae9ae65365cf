//! Native UDP network
//!
//! Binds real UDP sockets through socket2 and exposes them as closable
//! [`PacketConn`]s.

use super::{closed_conn_error, unsupported_protocol, Net, PacketConn, Protocol, SocketOpts};
use async_trait::async_trait;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Network backed by the operating system's UDP stack
#[derive(Debug, Clone, Default)]
pub struct NativeNet {
    /// Socket options applied to every bound socket
    socket_opts: SocketOpts,
}

impl NativeNet {
    /// Create a native network with the given socket options
    pub fn new(socket_opts: SocketOpts) -> Self {
        NativeNet { socket_opts }
    }
}

#[async_trait]
impl Net for NativeNet {
    async fn listen_packet(
        &self,
        protocol: Protocol,
        addr: SocketAddr,
    ) -> io::Result<Arc<dyn PacketConn>> {
        match protocol {
            Protocol::Udp => {
                let conn = UdpConn::bind(addr, &self.socket_opts)?;
                debug!("Bound UDP conn on {}", conn.local_addr()?);
                Ok(Arc::new(conn))
            }
            other => Err(unsupported_protocol(other)),
        }
    }
}

/// A tokio UDP socket that can be closed while other tasks are blocked on it
///
/// Closing drops the socket from its slot, so the port is released as soon
/// as any in-flight receive or send returns.
#[derive(Debug)]
pub struct UdpConn {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl UdpConn {
    /// Bind a new UDP socket, applying socket options before the bind
    pub fn bind(addr: SocketAddr, opts: &SocketOpts) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::for_address(addr),
            Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        opts.apply(&socket)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        UdpConn::from_socket(socket)
    }

    /// Wrap an already bound tokio socket
    pub fn from_socket(socket: UdpSocket) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(UdpConn {
            socket: Mutex::new(Some(Arc::new(socket))),
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<UdpSocket>>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn socket(&self) -> io::Result<Arc<UdpSocket>> {
        self.slot().clone().ok_or_else(closed_conn_error)
    }
}

#[async_trait]
impl PacketConn for UdpConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let socket = self.socket()?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_conn_error()),
            result = socket.recv_from(buf) => result,
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let socket = self.socket()?;
        socket.send_to(buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn close(&self) -> io::Result<()> {
        let socket = self.slot().take().ok_or_else(closed_conn_error)?;
        self.closed.cancel();
        drop(socket);
        debug!("Closed UDP conn on {}", self.local_addr);
        Ok(())
    }
}
