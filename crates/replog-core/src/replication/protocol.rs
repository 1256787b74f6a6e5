//! Replication wire protocol
//!
//! All messages are serialized with bincode and validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]
//!
//! Session shape:
//!
//! ```text
//! replica                         master
//!   | -- Hello(token, last) -------> |
//!   | <------- Welcome | Error ----- |
//!   | <------- Entry(last+1..) ----- |   catch-up
//!   | <------- CatchUpComplete ----- |
//!   | <------- Entry / Ping -------- |   streaming
//!   | -- Ack(cumulative) / Pong ---> |
//! ```

use crate::wal::{LogEntry, LogOffset};
use crate::{Error, Result};
use bytes::Bytes;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame payload
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Error codes carried by [`ReplicationMessage::Error`]
pub mod error_code {
    /// Security token mismatch
    pub const AUTH_FAILED: u32 = 1;
    /// Unsupported protocol version
    pub const PROTOCOL_MISMATCH: u32 = 2;
    /// Replica log cannot be reconciled with the master's
    pub const DIVERGED: u32 = 3;
    /// Master already serves `max_replicas` replicas
    pub const TOO_MANY_REPLICAS: u32 = 4;
}

/// Replication message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMessageType {
    /// Handshake from replica to master
    Hello = 0x01,
    /// Handshake response from master
    Welcome = 0x02,
    /// Heartbeat ping
    Ping = 0x10,
    /// Heartbeat pong
    Pong = 0x11,
    /// Log entry
    Entry = 0x20,
    /// Cumulative acknowledgment
    Ack = 0x21,
    /// End of catch-up, live streaming follows
    CatchUpComplete = 0x30,
    /// Error message
    Error = 0xFF,
}

impl TryFrom<u8> for ReplicationMessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Welcome),
            0x10 => Ok(Self::Ping),
            0x11 => Ok(Self::Pong),
            0x20 => Ok(Self::Entry),
            0x21 => Ok(Self::Ack),
            0x30 => Ok(Self::CatchUpComplete),
            0xFF => Ok(Self::Error),
            _ => Err(Error::protocol(format!("Unknown message type: {}", value))),
        }
    }
}

/// Replication messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Hello from replica - identity, credential and last durable offset
    Hello {
        /// Stable node id of the replica
        replica_id: String,
        /// Shared secret checked against the master's configuration
        security_token: String,
        /// Highest offset durable on the replica, 0 when empty
        last_offset: LogOffset,
        /// [`LogEntry::checksum`] of the replica's entry at `last_offset`,
        /// 0 when the replica is empty
        last_checksum: u32,
        /// Wire protocol version spoken by the replica
        protocol_version: u32,
    },

    /// Welcome from master - the retained range of its log
    Welcome {
        /// Node id of the master
        master_id: String,
        /// Master's highest offset
        current_offset: LogOffset,
        /// Oldest offset the master still retains
        oldest_offset: LogOffset,
    },

    /// Heartbeat ping
    Ping {
        /// Sender's unix time in milliseconds
        timestamp: u64,
    },

    /// Heartbeat pong
    Pong {
        /// Timestamp echoed from the ping
        timestamp: u64,
    },

    /// Log entry to replicate
    Entry {
        /// Offset assigned by the master
        offset: LogOffset,
        /// Record payload
        payload: Bytes,
        /// Optional record metadata
        metadata: Option<Bytes>,
    },

    /// Replica holds every offset up to and including `offset`
    Ack {
        /// Highest offset durable on the replica
        offset: LogOffset,
    },

    /// Catch-up finished at `offset`
    CatchUpComplete {
        /// Last offset shipped during catch-up
        offset: LogOffset,
    },

    /// Error message
    Error {
        /// One of the [`error_code`] constants
        code: u32,
        /// Human readable detail
        message: String,
    },
}

impl From<LogEntry> for ReplicationMessage {
    fn from(entry: LogEntry) -> Self {
        Self::Entry {
            offset: entry.offset,
            payload: entry.payload,
            metadata: entry.metadata,
        }
    }
}

impl ReplicationMessage {
    /// Get message type
    pub fn message_type(&self) -> ReplicationMessageType {
        match self {
            Self::Hello { .. } => ReplicationMessageType::Hello,
            Self::Welcome { .. } => ReplicationMessageType::Welcome,
            Self::Ping { .. } => ReplicationMessageType::Ping,
            Self::Pong { .. } => ReplicationMessageType::Pong,
            Self::Entry { .. } => ReplicationMessageType::Entry,
            Self::Ack { .. } => ReplicationMessageType::Ack,
            Self::CatchUpComplete { .. } => ReplicationMessageType::CatchUpComplete,
            Self::Error { .. } => ReplicationMessageType::Error,
        }
    }

    /// Build an error frame
    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Map a received error frame onto the matching local error
    pub fn into_error(self) -> Error {
        match self {
            Self::Error { code, message } => match code {
                error_code::AUTH_FAILED => Error::authentication(message),
                error_code::DIVERGED => parse_diverged(&message)
                    .unwrap_or_else(|| Error::replication(format!("Master error: {}", message))),
                _ => Error::replication(format!("Master error: {} (code {})", message, code)),
            },
            other => Error::protocol(format!("Unexpected {:?} message", other.message_type())),
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::protocol(format!("Serialization failed: {}", e)))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!(
                "Frame too large: {} bytes",
                payload.len()
            )));
        }

        let mut buf = Vec::with_capacity(1 + 4 + payload.len() + 4);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            // min: type(1) + length(4) + crc(4)
            return Err(Error::protocol("Message too short"));
        }

        let crc_offset = buf.len() - 4;
        let stored_crc = u32::from_le_bytes([
            buf[crc_offset],
            buf[crc_offset + 1],
            buf[crc_offset + 2],
            buf[crc_offset + 3],
        ]);

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(Error::protocol(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let msg_type = ReplicationMessageType::try_from(buf[0])?;
        let length = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if buf.len() != 5 + length + 4 {
            return Err(Error::protocol("Incomplete message"));
        }

        let message: Self = bincode::deserialize(&buf[5..5 + length])
            .map_err(|e| Error::protocol(format!("Deserialization failed: {}", e)))?;
        if message.message_type() != msg_type {
            return Err(Error::protocol(format!(
                "Frame type {:?} does not match payload {:?}",
                msg_type,
                message.message_type()
            )));
        }
        Ok(message)
    }

    /// Write message to async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read message from async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        // Read header: type(1) + length(4)
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).await?;

        let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!("Frame too large: {} bytes", length)));
        }

        // Read payload + CRC
        let mut full_buf = vec![0u8; 5 + length + 4];
        full_buf[..5].copy_from_slice(&header);
        reader.read_exact(&mut full_buf[5..]).await?;

        Self::decode(&full_buf)
    }
}

fn diverged_message(replica_offset: u64, master_oldest: u64, master_current: u64) -> String {
    format!(
        "replica={} oldest={} current={}",
        replica_offset, master_oldest, master_current
    )
}

/// Error frame for a diverged replica
pub fn diverged_frame(
    replica_offset: u64,
    master_oldest: u64,
    master_current: u64,
) -> ReplicationMessage {
    ReplicationMessage::error(
        error_code::DIVERGED,
        diverged_message(replica_offset, master_oldest, master_current),
    )
}

fn parse_diverged(message: &str) -> Option<Error> {
    let mut fields = message.split_whitespace().map(|kv| kv.split_once('='));
    let mut next = |key: &str| -> Option<u64> {
        match fields.next()?? {
            (k, v) if k == key => v.parse().ok(),
            _ => None,
        }
    };
    Some(Error::DivergedLog {
        replica_offset: next("replica")?,
        master_oldest: next("oldest")?,
        master_current: next("current")?,
    })
}
