//! A single relay allocation
//!
//! An allocation owns one relay conn and runs two tasks for its lifetime: the
//! [`Forwarder`](super::Forwarder) and a lifetime timer. It closes on the
//! first of lifetime expiry, explicit deletion or manager shutdown, and the
//! close path runs exactly once no matter which trigger wins.

use super::forwarder::{DataEncapsulator, Forwarder};
use super::FiveTuple;
use crate::error::AllocationError;
use crate::net::PacketConn;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

/// Forwarding counters for one allocation
#[derive(Debug, Default)]
pub struct AllocationStats {
    /// Datagrams forwarded from peers to the client
    pub packets_to_client: AtomicU64,
    /// Payload bytes forwarded from peers to the client
    pub bytes_to_client: AtomicU64,
    /// Datagrams sent from the client to peers
    pub packets_to_peer: AtomicU64,
    /// Payload bytes sent from the client to peers
    pub bytes_to_peer: AtomicU64,
}

impl AllocationStats {
    /// Record a datagram delivered to the client
    pub fn record_to_client(&self, bytes: usize) {
        self.packets_to_client.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a datagram sent to a peer
    pub fn record_to_peer(&self, bytes: usize) {
        self.packets_to_peer.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_peer.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get current stats snapshot
    pub fn snapshot(&self) -> AllocationStatsSnapshot {
        AllocationStatsSnapshot {
            packets_to_client: self.packets_to_client.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            packets_to_peer: self.packets_to_peer.load(Ordering::Relaxed),
            bytes_to_peer: self.bytes_to_peer.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of allocation statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStatsSnapshot {
    /// Datagrams forwarded from peers to the client
    pub packets_to_client: u64,
    /// Payload bytes forwarded from peers to the client
    pub bytes_to_client: u64,
    /// Datagrams sent from the client to peers
    pub packets_to_peer: u64,
    /// Payload bytes sent from the client to peers
    pub bytes_to_peer: u64,
}

/// Server-side relay resource for one five-tuple
#[derive(Debug)]
pub struct Allocation {
    five_tuple: FiveTuple,
    /// Validated `five_tuple.src_addr`
    client_addr: SocketAddr,
    /// Client-facing conn, shared with the server
    client_conn: Arc<dyn PacketConn>,
    /// Relay-facing conn, owned by this allocation
    relay_conn: Arc<dyn PacketConn>,
    relay_addr: SocketAddr,
    /// Current expiry deadline; the timer task follows updates
    deadline: watch::Sender<Instant>,
    /// Close-once guard
    is_closed: AtomicBool,
    closed: CancellationToken,
    forwarder_done: CancellationToken,
    stats: AllocationStats,
    created_at: Instant,
}

impl Allocation {
    pub(crate) fn new(
        five_tuple: FiveTuple,
        client_addr: SocketAddr,
        client_conn: Arc<dyn PacketConn>,
        relay_conn: Arc<dyn PacketConn>,
        relay_addr: SocketAddr,
        lifetime: Duration,
    ) -> Arc<Self> {
        let created_at = Instant::now();
        let (deadline, _) = watch::channel(created_at + lifetime);

        Arc::new(Allocation {
            five_tuple,
            client_addr,
            client_conn,
            relay_conn,
            relay_addr,
            deadline,
            is_closed: AtomicBool::new(false),
            closed: CancellationToken::new(),
            forwarder_done: CancellationToken::new(),
            stats: AllocationStats::default(),
            created_at,
        })
    }

    /// Arm the lifetime timer and start forwarding
    pub(crate) fn start(self: &Arc<Self>, encapsulator: Arc<dyn DataEncapsulator>) {
        let allocation = self.clone();
        tokio::spawn(async move {
            allocation.run_lifetime_timer().await;
        });

        let forwarder = Forwarder::new(self.clone(), encapsulator);
        tokio::spawn(async move {
            forwarder.run().await;
        });
    }

    /// Five-tuple identifying this allocation
    pub fn five_tuple(&self) -> &FiveTuple {
        &self.five_tuple
    }

    /// Client address relayed datagrams are sent to
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Client-facing conn
    pub fn client_conn(&self) -> &Arc<dyn PacketConn> {
        &self.client_conn
    }

    /// Relay-facing conn
    pub fn relay_conn(&self) -> &Arc<dyn PacketConn> {
        &self.relay_conn
    }

    /// Transport address peers send to
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Forwarding counters
    pub fn stats(&self) -> AllocationStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> &AllocationStats {
        &self.stats
    }

    /// Time since the allocation was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time left before the lifetime expires, zero once it has
    pub fn expires_in(&self) -> Duration {
        self.deadline
            .borrow()
            .saturating_duration_since(Instant::now())
    }

    /// Whether the allocation has been closed
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// Wait until the allocation is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Whether the forwarder task is still running
    pub fn is_forwarding(&self) -> bool {
        !self.forwarder_done.is_cancelled()
    }

    /// Wait until the forwarder task has exited
    pub async fn forwarder_stopped(&self) {
        self.forwarder_done.cancelled().await
    }

    /// Signals forwarder exit when dropped
    pub(crate) fn forwarder_exit_guard(&self) -> DropGuard {
        self.forwarder_done.clone().drop_guard()
    }

    /// Extend the lifetime to `lifetime` from now
    pub fn refresh(&self, lifetime: Duration) -> Result<(), AllocationError> {
        if lifetime.is_zero() {
            return Err(AllocationError::ZeroLifetime);
        }
        if self.is_closed() {
            return Err(AllocationError::AllocationClosed(self.five_tuple));
        }

        self.deadline.send_replace(Instant::now() + lifetime);
        // The timer may have fired between the check above and the update
        if self.is_closed() {
            return Err(AllocationError::AllocationClosed(self.five_tuple));
        }
        debug!("Refreshed allocation {} for {:?}", self.five_tuple, lifetime);
        Ok(())
    }

    /// Send a client payload to `peer` through the relay conn
    pub async fn send_to_peer(&self, data: &[u8], peer: SocketAddr) -> io::Result<usize> {
        let sent = self.relay_conn.send_to(data, peer).await?;
        self.stats.record_to_peer(sent);
        Ok(sent)
    }

    /// Close the allocation
    ///
    /// Only the first call releases the relay conn; later and concurrent
    /// calls return `Ok(())`.
    pub fn close(&self) -> Result<(), AllocationError> {
        if self
            .is_closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Allocation {} already closed", self.five_tuple);
            return Ok(());
        }

        self.closed.cancel();
        self.relay_conn
            .close()
            .map_err(|source| AllocationError::Close {
                five_tuple: self.five_tuple,
                source,
            })?;

        debug!("Closed allocation {}", self.five_tuple);
        Ok(())
    }

    fn expire(&self) {
        info!("Allocation {} expired", self.five_tuple);
        if let Err(e) = self.close() {
            error!("Failed to close relay conn for {}: {}", self.five_tuple, e);
        }
    }

    async fn run_lifetime_timer(self: Arc<Self>) {
        let mut deadline_rx = self.deadline.subscribe();

        loop {
            let deadline = *deadline_rx.borrow_and_update();
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    self.expire();
                    break;
                }
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
