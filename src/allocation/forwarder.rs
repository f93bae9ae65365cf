//! Relay forwarder
//!
//! Moves datagrams arriving on an allocation's relay conn to the client.

use super::Allocation;
use crate::net::MAX_UDP_PACKET;
use bytes::Bytes;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Turns a relayed payload into the message sent to the client
///
/// The protocol layer implements this to wrap payloads in its data-delivery
/// framing. `peer` is the address the payload arrived from.
pub trait DataEncapsulator: Debug + Send + Sync {
    /// Build the outbound client message for `payload`
    fn encapsulate(&self, payload: &[u8], peer: SocketAddr) -> Bytes;
}

/// Passes payloads through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct RawData;

impl DataEncapsulator for RawData {
    fn encapsulate(&self, payload: &[u8], _peer: SocketAddr) -> Bytes {
        Bytes::copy_from_slice(payload)
    }
}

/// Per-allocation forwarding loop
///
/// Runs until the relay conn's receive fails, which is how closing the
/// allocation stops it.
pub struct Forwarder {
    allocation: Arc<Allocation>,
    encapsulator: Arc<dyn DataEncapsulator>,
}

impl Forwarder {
    /// Create a forwarder for `allocation`
    pub fn new(allocation: Arc<Allocation>, encapsulator: Arc<dyn DataEncapsulator>) -> Self {
        Forwarder {
            allocation,
            encapsulator,
        }
    }

    /// Run the forwarding loop
    pub async fn run(self) {
        let allocation = &self.allocation;
        let _exit = allocation.forwarder_exit_guard();
        let client_addr = allocation.client_addr();
        let mut buf = vec![0u8; MAX_UDP_PACKET];

        loop {
            let (len, peer) = match allocation.relay_conn().recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    if allocation.is_closed() {
                        debug!(
                            "Relay conn for {} closed, stopping forwarder: {}",
                            allocation.five_tuple(),
                            e
                        );
                    } else {
                        warn!(
                            "Relay conn for {} failed, stopping forwarder: {}",
                            allocation.five_tuple(),
                            e
                        );
                    }
                    break;
                }
            };

            let message = self.encapsulator.encapsulate(&buf[..len], peer);
            match allocation.client_conn().send_to(&message, client_addr).await {
                Ok(_) => {
                    allocation.stats_handle().record_to_client(len);
                    trace!("Relayed {} bytes from {} to {}", len, peer, client_addr);
                }
                Err(e) => {
                    warn!(
                        "Failed to relay {} bytes from {} to {}: {}",
                        len, peer, client_addr, e
                    );
                }
            }
        }

        debug!("Forwarder for {} terminated", allocation.five_tuple());
    }
}
