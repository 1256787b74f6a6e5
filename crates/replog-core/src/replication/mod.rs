//! Quorum log replication
//!
//! A single master appends entries to its local log and streams them to any
//! number of replicas over TCP. A write becomes durable once the configured
//! replication factor (master included) holds it:
//! - Catch-up: a connecting replica is first sent everything past its own
//!   highest offset
//! - Streaming: once caught up, new appends are forwarded as they happen
//! - Cumulative acks: a replica acknowledging offset K holds every entry
//!   up to K
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   catch-up / stream   ┌─────────────────┐
//! │     Master      │ ────────────────────► │    Replica 1    │
//! │                 │ ◄──────── acks ────── └─────────────────┘
//! │  QuorumTracker  │   catch-up / stream   ┌─────────────────┐
//! │                 │ ────────────────────► │    Replica 2    │
//! └─────────────────┘ ◄──────── acks ────── └─────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! All messages use bincode serialization with CRC32 validation:
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```

pub mod config;
pub mod durability;
pub mod link;
pub mod master;
pub mod protocol;
pub mod quorum;
pub mod replica;

pub use config::{ReplicationConfig, ReplicationRole};
pub use durability::{Durability, DurabilityFuture, DurabilityPromise};
pub use link::{LinkState, ReplicaIdentity, ReplicaInfo, ReplicaLink};
pub use master::{Master, MasterStats};
pub use protocol::{ReplicationMessage, ReplicationMessageType};
pub use quorum::{AckSource, PendingWrite, QuorumTracker};
pub use replica::{Replica, ReplicaSession, ReplicaState, ReplicaStats};

/// Replication lag threshold for warnings (in entries)
pub const LAG_WARNING_THRESHOLD: u64 = 10_000;

/// Default heartbeat interval in milliseconds
pub const DEFAULT_HEARTBEAT_MS: u64 = 5_000;

/// Number of missed heartbeats before considering a peer dead
pub const MISSED_HEARTBEATS_THRESHOLD: u32 = 3;

/// Default replication port
pub const DEFAULT_REPLICATION_PORT: u16 = 15475;

/// Milliseconds since the Unix epoch, for heartbeat timestamps
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
