//! Allocation manager
//!
//! Registry of live allocations keyed by five-tuple. It enforces one
//! allocation per five-tuple and owns every allocation it creates.

use super::forwarder::{DataEncapsulator, RawData};
use super::{Allocation, FiveTuple};
use crate::error::AllocationError;
use crate::net::{NativeNet, Net, PacketConn};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Settings for an [`AllocationManager`]
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Network relay conns are bound on; the native network when `None`
    pub net: Option<Arc<dyn Net>>,
    /// IP relay conns are bound to
    pub relay_ip: IpAddr,
    /// Client message framing for relayed data; raw payloads when `None`
    pub encapsulator: Option<Arc<dyn DataEncapsulator>>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            net: None,
            relay_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            encapsulator: None,
        }
    }
}

/// Holds the active allocations
#[derive(Debug)]
pub struct AllocationManager {
    allocations: RwLock<HashMap<FiveTuple, Arc<Allocation>>>,
    net: Arc<dyn Net>,
    relay_ip: IpAddr,
    encapsulator: Arc<dyn DataEncapsulator>,
}

impl AllocationManager {
    /// Create a new allocation manager
    pub fn new(config: ManagerConfig) -> Self {
        let net: Arc<dyn Net> = match config.net {
            Some(net) => net,
            None => Arc::new(NativeNet::default()),
        };
        let encapsulator: Arc<dyn DataEncapsulator> = match config.encapsulator {
            Some(encapsulator) => encapsulator,
            None => Arc::new(RawData),
        };

        AllocationManager {
            allocations: RwLock::new(HashMap::new()),
            net,
            relay_ip: config.relay_ip,
            encapsulator,
        }
    }

    /// Fetch the allocation for `five_tuple`
    ///
    /// An allocation whose lifetime expired stays visible here until it is
    /// deleted.
    pub async fn get_allocation(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        self.allocations.read().await.get(five_tuple).cloned()
    }

    /// Fetch the allocation whose relay address is `relay_addr`
    pub async fn get_allocation_by_relay_addr(
        &self,
        relay_addr: SocketAddr,
    ) -> Option<Arc<Allocation>> {
        self.allocations
            .read()
            .await
            .values()
            .find(|allocation| allocation.relay_addr() == relay_addr)
            .cloned()
    }

    /// Number of registered allocations
    pub async fn len(&self) -> usize {
        self.allocations.read().await.len()
    }

    /// Whether no allocation is registered
    pub async fn is_empty(&self) -> bool {
        self.allocations.read().await.is_empty()
    }

    /// Snapshot of every registered allocation
    pub async fn allocations(&self) -> Vec<Arc<Allocation>> {
        self.allocations.read().await.values().cloned().collect()
    }

    /// Create a new allocation and start relaying
    ///
    /// Inputs are validated in order: five-tuple, its source and destination
    /// addresses, uniqueness, client conn, lifetime. An expired allocation
    /// that was never deleted does not count as a duplicate and is replaced.
    /// Port 0 binds any free port.
    pub async fn create_allocation(
        &self,
        five_tuple: Option<FiveTuple>,
        client_conn: Option<Arc<dyn PacketConn>>,
        requested_port: u16,
        lifetime: Duration,
    ) -> Result<Arc<Allocation>, AllocationError> {
        let five_tuple = five_tuple.ok_or(AllocationError::MissingFiveTuple)?;
        let client_addr = five_tuple.src_addr.ok_or(AllocationError::MissingSrcAddr)?;
        if five_tuple.dst_addr.is_none() {
            return Err(AllocationError::MissingDstAddr);
        }
        if let Some(existing) = self.get_allocation(&five_tuple).await {
            if !existing.is_closed() {
                return Err(AllocationError::DuplicateFiveTuple(five_tuple));
            }
        }
        let client_conn = client_conn.ok_or(AllocationError::MissingClientConn)?;
        if lifetime.is_zero() {
            return Err(AllocationError::ZeroLifetime);
        }

        // Bind outside the registry lock
        let bind_addr = SocketAddr::new(self.relay_ip, requested_port);
        let relay_conn = self
            .net
            .listen_packet(five_tuple.protocol, bind_addr)
            .await
            .map_err(AllocationError::Bind)?;
        let relay_addr = match relay_conn.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                if let Err(close_err) = relay_conn.close() {
                    warn!("Failed to close unusable relay conn: {}", close_err);
                }
                return Err(AllocationError::Bind(e));
            }
        };

        let allocation = Allocation::new(
            five_tuple,
            client_addr,
            client_conn,
            relay_conn,
            relay_addr,
            lifetime,
        );

        {
            let mut allocations = self.allocations.write().await;
            match allocations.entry(five_tuple) {
                Entry::Occupied(entry) if !entry.get().is_closed() => {
                    // Lost a race with a concurrent create for the same tuple
                    if let Err(e) = allocation.close() {
                        warn!("Failed to release relay conn {}: {}", relay_addr, e);
                    }
                    return Err(AllocationError::DuplicateFiveTuple(five_tuple));
                }
                Entry::Occupied(mut entry) => {
                    debug!("Replacing expired allocation {}", five_tuple);
                    entry.insert(allocation.clone());
                }
                Entry::Vacant(entry) => {
                    entry.insert(allocation.clone());
                }
            }
        }

        allocation.start(self.encapsulator.clone());
        info!(
            "Created allocation {} with relay address {} (lifetime {:?})",
            five_tuple, relay_addr, lifetime
        );

        Ok(allocation)
    }

    /// Remove and close the allocation for `five_tuple`
    ///
    /// Returns whether an allocation was found. A close failure is logged,
    /// not returned.
    pub async fn delete_allocation(&self, five_tuple: &FiveTuple) -> bool {
        let mut allocations = self.allocations.write().await;
        let Some(allocation) = allocations.remove(five_tuple) else {
            return false;
        };

        if let Err(e) = allocation.close() {
            error!("Failed to close allocation: {}", e);
        }
        info!("Deleted allocation {}", five_tuple);
        true
    }

    /// Close every allocation and empty the manager
    ///
    /// Every allocation is closed and removed even when some fail to close;
    /// all failures are returned together.
    pub async fn close(&self) -> Result<(), AllocationError> {
        let mut allocations = self.allocations.write().await;
        let count = allocations.len();

        let failures: Vec<AllocationError> = allocations
            .drain()
            .filter_map(|(_, allocation)| allocation.close().err())
            .collect();

        info!(
            "Closed allocation manager: {} allocation(s), {} failure(s)",
            count,
            failures.len()
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AllocationError::Shutdown { failures })
        }
    }
}
