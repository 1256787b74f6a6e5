//! Master-side state of one replica connection
//!
//! A [`ReplicaLink`] is created once a connecting replica passed the
//! handshake and lives until the master stops. Its state machine:
//!
//! ```text
//! Connecting ──► CatchingUp ──► Streaming
//!      ▲              │             │
//!      │              ▼             ▼
//!      └──────── Disconnected ◄─────┘
//! ```
//!
//! Entries are only forwarded to a link in `Streaming`; a link in any other
//! state never counts toward the replication factor.

use crate::replication::LAG_WARNING_THRESHOLD;
use crate::wal::{LogEntry, LogOffset};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Who a replica claims to be
#[derive(Clone)]
pub struct ReplicaIdentity {
    /// Stable node id
    pub node_id: String,
    /// Remote address of the connection
    pub addr: SocketAddr,
    /// Token presented during the handshake
    pub security_token: String,
}

impl ReplicaIdentity {
    /// Create an identity
    pub fn new(
        node_id: impl Into<String>,
        addr: SocketAddr,
        security_token: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            addr,
            security_token: security_token.into(),
        }
    }
}

// Identity is the node id; the address changes across reconnects
impl PartialEq for ReplicaIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for ReplicaIdentity {}

impl fmt::Debug for ReplicaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaIdentity")
            .field("node_id", &self.node_id)
            .field("addr", &self.addr)
            .field("security_token", &"<redacted>")
            .finish()
    }
}

/// Connection state of a replica link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Handshake accepted, nothing sent yet
    Connecting,
    /// Shipping entries the replica is missing
    CatchingUp,
    /// Receiving new appends as they happen
    Streaming,
    /// Connection gone
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::CatchingUp => "catching-up",
            Self::Streaming => "streaming",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Snapshot of a replica link, for observability
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    /// Replica ID
    pub id: String,
    /// Replica address
    pub addr: SocketAddr,
    /// Link state
    pub state: LinkState,
    /// Highest offset the replica acknowledged
    pub last_ack_offset: LogOffset,
    /// Replication lag (in entries)
    pub lag: u64,
    /// Entries shipped over the current connection
    pub entries_sent: u64,
    /// Number of times the replica reconnected
    pub reconnects: u32,
    /// Last time anything was heard from the replica
    pub last_seen: Instant,
    /// Connection time
    pub connected_at: Instant,
}

/// Master-side handle on one replica
#[derive(Debug)]
pub struct ReplicaLink {
    identity: ReplicaIdentity,
    state: LinkState,
    /// Bumped on every reconnect so tasks of a superseded connection
    /// cannot tear down the current one
    generation: u64,
    last_ack_offset: LogOffset,
    outbox: Option<mpsc::UnboundedSender<LogEntry>>,
    cancel: CancellationToken,
    entries_sent: AtomicU64,
    reconnects: u32,
    last_seen: Instant,
    connected_at: Instant,
}

impl ReplicaLink {
    /// Create a link for a freshly accepted replica reporting `resume_offset`
    /// as its highest durable offset.
    ///
    /// Returns the link and the receiving end of its outbox.
    pub fn new(
        identity: ReplicaIdentity,
        generation: u64,
        resume_offset: LogOffset,
    ) -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let link = Self {
            identity,
            state: LinkState::Connecting,
            generation,
            last_ack_offset: resume_offset,
            outbox: Some(tx),
            cancel: CancellationToken::new(),
            entries_sent: AtomicU64::new(0),
            reconnects: 0,
            last_seen: now,
            connected_at: now,
        };
        (link, rx)
    }

    /// Replace the connection behind this link.
    ///
    /// Any tasks of the previous connection are cancelled. The replica's
    /// reported offset becomes authoritative for the new connection.
    pub fn reconnect(
        &mut self,
        identity: ReplicaIdentity,
        generation: u64,
        resume_offset: LogOffset,
    ) -> mpsc::UnboundedReceiver<LogEntry> {
        self.cancel.cancel();

        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        self.identity = identity;
        self.state = LinkState::Connecting;
        self.generation = generation;
        self.last_ack_offset = resume_offset;
        self.outbox = Some(tx);
        self.cancel = CancellationToken::new();
        self.entries_sent.store(0, Ordering::Relaxed);
        self.reconnects += 1;
        self.last_seen = now;
        self.connected_at = now;
        rx
    }

    /// Replica identity
    pub fn identity(&self) -> &ReplicaIdentity {
        &self.identity
    }

    /// Node id of the replica
    pub fn id(&self) -> &str {
        &self.identity.node_id
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Generation of the current connection
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Highest offset acknowledged by the replica
    pub fn last_ack_offset(&self) -> LogOffset {
        self.last_ack_offset
    }

    /// Token cancelled when the current connection must shut down
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the link is connected (in any state but `Disconnected`)
    pub fn is_connected(&self) -> bool {
        self.state != LinkState::Disconnected
    }

    /// Start shipping missing entries
    pub fn begin_catch_up(&mut self) {
        if self.state == LinkState::Connecting {
            self.state = LinkState::CatchingUp;
        }
    }

    /// Catch-up finished; new appends are forwarded from now on
    pub fn begin_streaming(&mut self) {
        if self.state == LinkState::CatchingUp {
            self.state = LinkState::Streaming;
        }
    }

    /// Forward a new append to a streaming replica.
    ///
    /// Returns false when the entry was not queued.
    pub fn forward(&self, entry: &LogEntry) -> bool {
        if self.state != LinkState::Streaming {
            return false;
        }
        match &self.outbox {
            Some(outbox) => outbox.send(entry.clone()).is_ok(),
            None => false,
        }
    }

    /// Count entries written to the socket
    pub fn record_sent(&self, count: u64) {
        self.entries_sent.fetch_add(count, Ordering::Relaxed);
    }

    /// Record traffic from the replica
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Record an acknowledgment.
    ///
    /// Returns false if the ack was ignored: the link is disconnected or the
    /// offset does not move past what the replica already acknowledged.
    pub fn record_ack(&mut self, offset: LogOffset, master_offset: LogOffset) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.touch();
        if offset <= self.last_ack_offset {
            return false;
        }
        self.last_ack_offset = offset;

        let lag = master_offset.saturating_sub(offset);
        if lag > LAG_WARNING_THRESHOLD {
            tracing::warn!(
                "Replica {} lag warning: {} entries behind",
                self.identity.node_id,
                lag
            );
        }
        true
    }

    /// Tear the connection down. Returns false if already disconnected.
    pub fn disconnect(&mut self) -> bool {
        if self.state == LinkState::Disconnected {
            return false;
        }
        self.state = LinkState::Disconnected;
        self.outbox = None;
        self.cancel.cancel();
        true
    }

    /// Snapshot for observability
    pub fn info(&self, master_offset: LogOffset) -> ReplicaInfo {
        ReplicaInfo {
            id: self.identity.node_id.clone(),
            addr: self.identity.addr,
            state: self.state,
            last_ack_offset: self.last_ack_offset,
            lag: master_offset.saturating_sub(self.last_ack_offset),
            entries_sent: self.entries_sent.load(Ordering::Relaxed),
            reconnects: self.reconnects,
            last_seen: self.last_seen,
            connected_at: self.connected_at,
        }
    }
}
