//! Relay allocation core
//!
//! This module provides the five-tuple key, the per-client [`Allocation`],
//! its [`Forwarder`] loop and the [`AllocationManager`] registry.

mod allocation;
mod five_tuple;
mod forwarder;
mod manager;

pub use allocation::{Allocation, AllocationStats, AllocationStatsSnapshot};
pub use five_tuple::FiveTuple;
pub use forwarder::{DataEncapsulator, Forwarder, RawData};
pub use manager::{AllocationManager, ManagerConfig};

pub use crate::net::Protocol;
