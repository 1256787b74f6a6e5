//! Replog Core - Quorum-Replicated Durable Log
//!
//! This crate provides the storage and replication engine behind a
//! replicated message store:
//! - Local append-only log with durable flush (segmented files or memory)
//! - Master/replica log shipping over TCP with catch-up and streaming
//! - Quorum accounting: a write is durable once N copies hold it
//! - Durability futures with bounded waits
//! - Node facade with operator-driven master rotation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Node                         │
//! │     (append, read_all, role, promote)       │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │            Replication                       │
//! │  (Master, Replica, QuorumTracker, Protocol) │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │             Local Log                        │
//! │      (SegmentedLog, MemoryLog)              │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod node;
pub mod replication;
pub mod testing;
pub mod wal;

pub use error::{Error, Result};
pub use node::Node;
