//! Error types for Replog Core

use thiserror::Error;

/// Result type alias using Replog Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replicated log
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from log files and sockets
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Local log errors (framing, offset continuity, corruption)
    #[error("WAL error: {0}")]
    Wal(String),

    /// Replication errors (link or session failures)
    #[error("Replication error: {0}")]
    Replication(String),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Security token mismatch during the replication handshake
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Replica history cannot be reconciled with the master's log
    #[error(
        "Diverged log: replica at offset {replica_offset}, master retains {master_oldest}..={master_current}"
    )]
    DivergedLog {
        /// Highest offset held by the replica
        replica_offset: u64,
        /// Oldest offset still retained by the master
        master_oldest: u64,
        /// Master's current (highest) offset
        master_current: u64,
    },

    /// Write attempted on a node that is not the master
    #[error("Not master: {0}")]
    NotMaster(String),

    /// Operation on a stopped node
    #[error("Stopped: {0}")]
    Stopped(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a WAL error
    pub fn wal(msg: impl Into<String>) -> Self {
        Self::Wal(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a not-master error
    pub fn not_master(msg: impl Into<String>) -> Self {
        Self::NotMaster(msg.into())
    }

    /// Create a stopped error
    pub fn stopped(msg: impl Into<String>) -> Self {
        Self::Stopped(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors that must be surfaced to the operator instead of retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::DivergedLog { .. } | Self::Config(_)
        )
    }
}
