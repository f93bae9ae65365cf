//! # turn-relay - Relay Allocation Core
//!
//! turn-relay implements the allocation side of a TURN-style relay server.
//! A client identified by its five-tuple gets a relay transport address on
//! the server; datagrams peers send to that address are forwarded to the
//! client until the allocation is deleted or its lifetime expires.
//!
//! ## Features
//!
//! - **One Allocation per Five-Tuple**: the manager rejects duplicates
//! - **Bounded Lifetimes**: every allocation expires unless refreshed
//! - **Close-Once Teardown**: expiry, deletion and shutdown may race safely
//! - **Injectable Network**: native UDP in production, an in-memory network in tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use turn_relay::allocation::{AllocationManager, FiveTuple, ManagerConfig, Protocol};
//! use std::time::Duration;
//!
//! let manager = AllocationManager::new(ManagerConfig::default());
//! let tuple = FiveTuple::new(Protocol::Udp, client_addr, server_addr);
//! let allocation = manager
//!     .create_allocation(Some(tuple), Some(server_conn), 0, Duration::from_secs(600))
//!     .await?;
//! println!("relay address: {}", allocation.relay_addr());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Peer -> relay conn -> Forwarder -> client conn -> Client
//! ```
//!
//! Message encoding, authentication and permissions belong to the protocol
//! layer, which calls into the [`allocation::AllocationManager`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod allocation;
pub mod config;
pub mod error;
pub mod net;
pub mod server;

// Re-export commonly used items
pub use allocation::{Allocation, AllocationManager, FiveTuple, ManagerConfig};
pub use config::{load_config, Config};
pub use error::{AllocationError, RelayError};
pub use server::RelayServer;

/// Version of the turn-relay library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
