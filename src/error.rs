//! Error types for turn-relay
//!
//! This module defines the error types returned by the allocation core and
//! the crate-level error used by the server shell.

use crate::allocation::FiveTuple;
use std::io;
use thiserror::Error;

/// Main error type for turn-relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Allocation error
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),
}

/// Errors returned by the allocation manager and by allocations themselves
#[derive(Error, Debug)]
pub enum AllocationError {
    /// No five-tuple was supplied
    #[error("allocations must not be created without a five-tuple")]
    MissingFiveTuple,

    /// The five-tuple has no source (client) address
    #[error("allocations must not be created without a five-tuple source address")]
    MissingSrcAddr,

    /// The five-tuple has no destination (server) address
    #[error("allocations must not be created without a five-tuple destination address")]
    MissingDstAddr,

    /// A live allocation already exists for the five-tuple
    #[error("allocation attempt created with duplicate five-tuple {0}")]
    DuplicateFiveTuple(FiveTuple),

    /// No client-facing conn was supplied
    #[error("allocations must not be created without a client conn")]
    MissingClientConn,

    /// The lifetime was zero
    #[error("allocations must not be created or refreshed with a lifetime of 0")]
    ZeroLifetime,

    /// Binding the relay conn failed
    #[error("failed to bind relay conn: {0}")]
    Bind(#[source] io::Error),

    /// Closing an allocation's relay conn failed
    #[error("failed to close allocation {five_tuple}: {source}")]
    Close {
        /// The allocation that failed to close
        five_tuple: FiveTuple,
        /// The underlying error
        #[source]
        source: io::Error,
    },

    /// One or more allocations failed to close during shutdown
    #[error("failed to close {} allocation(s): {}", .failures.len(), join_failures(.failures))]
    Shutdown {
        /// Every close failure, in the order they were observed
        failures: Vec<AllocationError>,
    },

    /// The allocation is already closed
    #[error("allocation {0} is closed")]
    AllocationClosed(FiveTuple),
}

fn join_failures(failures: &[AllocationError]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl AllocationError {
    /// Whether the error was raised by input validation, leaving state untouched
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AllocationError::MissingFiveTuple
                | AllocationError::MissingSrcAddr
                | AllocationError::MissingDstAddr
                | AllocationError::DuplicateFiveTuple(_)
                | AllocationError::MissingClientConn
                | AllocationError::ZeroLifetime
        )
    }
}
