//! In-memory virtual datagram network
//!
//! A [`VirtualNet`] routes datagrams between conns bound on it without
//! touching the operating system, which makes relay behavior deterministic
//! in tests. Datagrams to unknown or closed addresses are dropped, and a full
//! receive queue drops the datagram, as UDP would.

use super::{closed_conn_error, unsupported_protocol, Net, PacketConn, Protocol};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// First port handed out for port 0 binds
const EPHEMERAL_PORT_START: u16 = 49152;

/// Per-conn receive queue size
const RECV_QUEUE_SIZE: usize = 1024;

type Datagram = (Bytes, SocketAddr);

#[derive(Debug)]
struct Endpoint {
    tx: mpsc::Sender<Datagram>,
    closed: CancellationToken,
}

#[derive(Debug)]
struct Router {
    endpoints: HashMap<SocketAddr, Endpoint>,
    next_port: u16,
}

impl Router {
    fn is_bound(&self, addr: &SocketAddr) -> bool {
        self.endpoints
            .get(addr)
            .map_or(false, |endpoint| !endpoint.closed.is_cancelled())
    }

    fn allocate_port(&mut self, ip: IpAddr) -> io::Result<u16> {
        for _ in EPHEMERAL_PORT_START..=u16::MAX {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            if !self.is_bound(&SocketAddr::new(ip, port)) {
                return Ok(port);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no free ports left on virtual net",
        ))
    }
}

/// An in-memory network with a single host IP
#[derive(Debug, Clone)]
pub struct VirtualNet {
    ip: IpAddr,
    router: Arc<Mutex<Router>>,
}

impl VirtualNet {
    /// Create a virtual network whose conns live on `ip`
    pub fn new(ip: IpAddr) -> Self {
        VirtualNet {
            ip,
            router: Arc::new(Mutex::new(Router {
                endpoints: HashMap::new(),
                next_port: EPHEMERAL_PORT_START,
            })),
        }
    }

    /// Host IP of the network
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Number of open conns
    pub async fn open_conns(&self) -> usize {
        self.router
            .lock()
            .await
            .endpoints
            .values()
            .filter(|endpoint| !endpoint.closed.is_cancelled())
            .count()
    }

    /// Bind a conn directly, without going through the [`Net`] trait
    pub async fn bind(&self, addr: SocketAddr) -> io::Result<VirtualConn> {
        // Wildcard binds land on the network's host IP
        let ip = if addr.ip().is_unspecified() {
            self.ip
        } else if addr.ip() == self.ip {
            addr.ip()
        } else {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} is not an address of this virtual net", addr.ip()),
            ));
        };

        let mut router = self.router.lock().await;
        let port = if addr.port() == 0 {
            router.allocate_port(ip)?
        } else {
            addr.port()
        };
        let local_addr = SocketAddr::new(ip, port);
        if router.is_bound(&local_addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is already in use", local_addr),
            ));
        }

        let (tx, rx) = mpsc::channel(RECV_QUEUE_SIZE);
        let closed = CancellationToken::new();
        router.endpoints.insert(
            local_addr,
            Endpoint {
                tx,
                closed: closed.clone(),
            },
        );

        Ok(VirtualConn {
            local_addr,
            rx: Mutex::new(rx),
            router: self.router.clone(),
            is_closed: AtomicBool::new(false),
            closed,
        })
    }
}

impl Default for VirtualNet {
    fn default() -> Self {
        VirtualNet::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
    }
}

#[async_trait]
impl Net for VirtualNet {
    async fn listen_packet(
        &self,
        protocol: Protocol,
        addr: SocketAddr,
    ) -> io::Result<Arc<dyn PacketConn>> {
        match protocol {
            Protocol::Udp => Ok(Arc::new(self.bind(addr).await?)),
            other => Err(unsupported_protocol(other)),
        }
    }
}

/// A conn bound on a [`VirtualNet`]
#[derive(Debug)]
pub struct VirtualConn {
    local_addr: SocketAddr,
    rx: Mutex<mpsc::Receiver<Datagram>>,
    router: Arc<Mutex<Router>>,
    is_closed: AtomicBool,
    closed: CancellationToken,
}

#[async_trait]
impl PacketConn for VirtualConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(closed_conn_error()),
            rx = self.rx.lock() => rx,
        };

        let (data, from) = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(closed_conn_error()),
            datagram = rx.recv() => datagram.ok_or_else(closed_conn_error)?,
        };

        // Oversized datagrams are truncated like a short UDP read
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(closed_conn_error());
        }

        let mut router = self.router.lock().await;
        let target_closed = router
            .endpoints
            .get(&target)
            .map(|endpoint| endpoint.closed.is_cancelled());
        let delivered = match target_closed {
            Some(false) => router.endpoints[&target]
                .tx
                .try_send((Bytes::copy_from_slice(buf), self.local_addr))
                .is_ok(),
            Some(true) => {
                router.endpoints.remove(&target);
                false
            }
            None => false,
        };
        if !delivered {
            trace!("Dropped {} byte datagram to {}", buf.len(), target);
        }

        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn close(&self) -> io::Result<()> {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return Err(closed_conn_error());
        }
        self.closed.cancel();
        Ok(())
    }
}
