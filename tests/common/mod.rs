//! Test utilities and mocks for turn-relay
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use turn_relay::allocation::{FiveTuple, Protocol};
use turn_relay::net::{Net, PacketConn, UdpConn, VirtualConn, VirtualNet};

/// Bind a native UDP socket on an ephemeral localhost port
pub async fn create_test_socket() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

/// Bind the client-facing server conn on an ephemeral localhost port
pub async fn create_server_conn() -> (Arc<dyn PacketConn>, SocketAddr) {
    let (socket, addr) = create_test_socket().await;
    (Arc::new(UdpConn::from_socket(socket).unwrap()), addr)
}

/// UDP five-tuple from a client to a server
pub fn udp_tuple(client: SocketAddr, server: SocketAddr) -> FiveTuple {
    FiveTuple::new(Protocol::Udp, client, server)
}

/// Receive one datagram, or `None` if nothing arrives within `wait`
pub async fn recv_within(socket: &UdpSocket, wait: Duration) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; 2048];
    match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => Some((buf[..len].to_vec(), from)),
        _ => None,
    }
}

/// Virtual network that counts conn closes and can inject close failures
#[derive(Debug, Default)]
pub struct TestNet {
    inner: VirtualNet,
    close_calls: Arc<AtomicUsize>,
    fail_next_close: AtomicBool,
}

impl TestNet {
    /// Create a test network
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying virtual network
    pub fn virtual_net(&self) -> &VirtualNet {
        &self.inner
    }

    /// Make the next conn bound on this network fail to close
    pub fn fail_close_of_next_conn(&self) {
        self.fail_next_close.store(true, Ordering::SeqCst);
    }

    /// Total close calls across every conn
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Net for TestNet {
    async fn listen_packet(
        &self,
        protocol: Protocol,
        addr: SocketAddr,
    ) -> io::Result<Arc<dyn PacketConn>> {
        if protocol != Protocol::Udp {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "udp only"));
        }
        let conn = self.inner.bind(addr).await?;
        Ok(Arc::new(TestConn {
            inner: conn,
            fail_close: self.fail_next_close.swap(false, Ordering::SeqCst),
            close_calls: self.close_calls.clone(),
        }))
    }
}

/// Conn produced by [`TestNet`]
#[derive(Debug)]
pub struct TestConn {
    inner: VirtualConn,
    fail_close: bool,
    close_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl PacketConn for TestConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn close(&self) -> io::Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.close()?;
        if self.fail_close {
            return Err(io::Error::new(io::ErrorKind::Other, "injected close failure"));
        }
        Ok(())
    }
}
