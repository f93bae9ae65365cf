//! Relay server shell
//!
//! Binds the client-facing socket and owns the allocation manager. Protocol
//! message dispatch is layered on top through [`RelayServer::client_conn`]
//! and [`RelayServer::manager`].

use crate::allocation::{AllocationManager, ManagerConfig};
use crate::config::ServerConfig;
use crate::net::{create_net, Net, PacketConn, Protocol};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A bound relay server
#[derive(Debug)]
pub struct RelayServer {
    config: ServerConfig,
    client_conn: Arc<dyn PacketConn>,
    manager: Arc<AllocationManager>,
}

impl RelayServer {
    /// Bind the server on the native network
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let net = create_net(&config.udp);
        RelayServer::bind_on(config, net).await
    }

    /// Bind the server on the given network
    pub async fn bind_on(config: ServerConfig, net: Arc<dyn Net>) -> Result<Self> {
        config.validate()?;

        let client_conn = net
            .listen_packet(Protocol::Udp, config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind listen address {}", config.listen_addr))?;

        let manager = Arc::new(AllocationManager::new(ManagerConfig {
            net: Some(net),
            relay_ip: config.relay_ip,
            encapsulator: None,
        }));

        Ok(RelayServer {
            config,
            client_conn,
            manager,
        })
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the client-facing socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.client_conn
            .local_addr()
            .context("Failed to read listen address")
    }

    /// Client-facing socket, shared with every allocation
    pub fn client_conn(&self) -> Arc<dyn PacketConn> {
        self.client_conn.clone()
    }

    /// Allocation manager
    pub fn manager(&self) -> Arc<AllocationManager> {
        self.manager.clone()
    }

    /// Serve until a shutdown signal arrives, then shut down
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!("Relay server listening on {}", self.local_addr()?);

        let _ = shutdown_rx.recv().await;
        info!("Shutdown requested");

        self.shutdown().await
    }

    /// Close every allocation and the client-facing socket
    pub async fn shutdown(&self) -> Result<()> {
        let result = self
            .manager
            .close()
            .await
            .context("Failed to close allocations");

        if let Err(e) = self.client_conn.close() {
            warn!("Failed to close listen socket: {}", e);
        }

        result
    }
}
