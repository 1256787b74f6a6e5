//! Replica node implementation for replication
//!
//! The replica node:
//! - Connects to the master and presents its highest durable offset
//! - Appends shipped entries to its local log in strict offset order
//! - Acknowledges each entry once it is durable locally
//! - Monitors master health through heartbeats
//! - Reconnects with exponential backoff after recoverable failures
//!
//! Authentication failures and diverged logs are fatal: the replica stops
//! and reports the error instead of retrying.

use crate::replication::config::{ReplicationConfig, ReplicationRole};
use crate::replication::protocol::{PROTOCOL_VERSION, ReplicationMessage};
use crate::wal::{LocalLog, LogEntry, LogOffset};
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Created, not started
    Idle,
    /// Opening a connection to the master
    Connecting,
    /// Receiving entries it was missing
    CatchingUp,
    /// Caught up, receiving new appends
    Streaming,
    /// Lost the master, waiting to reconnect
    Disconnected,
    /// Stopped on request
    Stopped,
    /// Stopped on a fatal error
    Failed,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::CatchingUp => "catching-up",
            Self::Streaming => "streaming",
            Self::Disconnected => "disconnected",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Replica node statistics
#[derive(Debug, Clone, Default)]
pub struct ReplicaStats {
    /// Total entries received
    pub entries_received: u64,
    /// Entries appended to the local log
    pub entries_applied: u64,
    /// Entries skipped because they were already held
    pub duplicates_skipped: u64,
    /// Acknowledgments sent to the master
    pub acks_sent: u64,
    /// Highest local offset
    pub current_offset: u64,
    /// Master's offset as last reported
    pub master_offset: u64,
    /// Replication lag (in entries)
    pub lag: u64,
    /// Number of reconnects
    pub reconnects: u32,
    /// Last time an entry was applied
    pub last_sync_time: Option<Instant>,
    /// Master ID
    pub master_id: Option<String>,
    /// Is connected to master
    pub connected: bool,
}

/// An accepted connection to the master, before any entry was received
#[derive(Debug)]
pub struct ReplicaSession {
    stream: TcpStream,
    master_id: String,
    master_offset: LogOffset,
    oldest_offset: LogOffset,
    resume_offset: LogOffset,
}

impl ReplicaSession {
    /// Master node id
    pub fn master_id(&self) -> &str {
        &self.master_id
    }

    /// Master's highest offset at handshake time
    pub fn master_offset(&self) -> LogOffset {
        self.master_offset
    }

    /// Oldest offset the master still retains
    pub fn oldest_offset(&self) -> LogOffset {
        self.oldest_offset
    }

    /// Offset the replica reported holding
    pub fn resume_offset(&self) -> LogOffset {
        self.resume_offset
    }
}

/// Replica node for replication
pub struct Replica {
    /// Replica ID
    id: String,
    /// Configuration
    config: ReplicationConfig,
    /// Durable local log
    log: Arc<dyn LocalLog>,
    /// Current state, observable by waiters
    state: watch::Sender<ReplicaState>,
    /// Master's current offset (for lag calculation)
    master_offset: AtomicU64,
    /// Statistics
    stats: Mutex<ReplicaStats>,
    /// Running flag
    running: AtomicBool,
    /// Cancelled by stop()
    shutdown: CancellationToken,
    /// Cancelled by disconnect(); replaced per connection
    session: Mutex<CancellationToken>,
}

impl Replica {
    /// Create a replica over `log`
    pub fn new(config: ReplicationConfig, log: Arc<dyn LocalLog>) -> Result<Self> {
        if config.role != ReplicationRole::Replica {
            return Err(Error::config("Replica requires role = replica"));
        }
        config.validate()?;

        let (state, _) = watch::channel(ReplicaState::Idle);
        Ok(Self {
            id: config.node_id.clone(),
            config,
            log,
            state,
            master_offset: AtomicU64::new(0),
            stats: Mutex::new(ReplicaStats::default()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            session: Mutex::new(CancellationToken::new()),
        })
    }

    /// Get replica ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configuration
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// The local log
    pub fn log(&self) -> Arc<dyn LocalLog> {
        Arc::clone(&self.log)
    }

    /// Highest offset in the local log
    pub fn current_offset(&self) -> LogOffset {
        self.log.highest_offset()
    }

    /// Get replication lag
    pub fn lag(&self) -> u64 {
        self.master_offset
            .load(Ordering::SeqCst)
            .saturating_sub(self.current_offset())
    }

    /// Current state
    pub fn state(&self) -> ReplicaState {
        *self.state.borrow()
    }

    /// Check if connected to master
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ReplicaState::CatchingUp | ReplicaState::Streaming
        )
    }

    /// Check if replica is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for the replica to reach `state`
    pub async fn wait_for_state(&self, state: ReplicaState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, async move {
            rx.wait_for(|s| *s == state).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }

    /// Get statistics
    pub fn stats(&self) -> ReplicaStats {
        let mut stats = self.stats.lock().clone();
        stats.current_offset = self.current_offset();
        stats.master_offset = self.master_offset.load(Ordering::SeqCst);
        stats.lag = self.lag();
        stats.connected = self.is_connected();
        stats
    }

    /// Run the replica on a background task
    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let replica = Arc::clone(self);
        tokio::spawn(async move { replica.run().await })
    }

    /// Replicate until stopped.
    ///
    /// Recoverable failures are retried with exponential backoff. Returns
    /// `Ok` after [`Replica::stop`], or the error that ended replication
    /// for good.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::replication("Replica already running"));
        }

        let mut reconnect_delay = self.config.reconnect_initial_delay;
        let result = loop {
            if self.shutdown.is_cancelled() {
                break Ok(());
            }

            let session = {
                let mut session = self.session.lock();
                *session = CancellationToken::new();
                session.clone()
            };

            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = session.cancelled() => Ok(()),
                result = self.connect_and_sync() => result,
            };

            match attempt {
                Ok(()) => {
                    tracing::info!("Replica {} disconnected from master", self.id);
                    reconnect_delay = self.config.reconnect_initial_delay;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("Replica {} cannot continue: {}", self.id, e);
                    self.set_state(ReplicaState::Failed);
                    break Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "Replication error: {}. Reconnecting in {:?}",
                        e,
                        reconnect_delay
                    );
                }
            }

            self.set_state(ReplicaState::Disconnected);
            self.stats.lock().reconnects += 1;

            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(with_jitter(reconnect_delay)) => {}
            }
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.reconnect_max_delay);
        };

        self.running.store(false, Ordering::SeqCst);
        if result.is_ok() {
            self.set_state(ReplicaState::Stopped);
            tracing::info!("Replica {} stopped at offset {}", self.id, self.current_offset());
        }
        result
    }

    async fn connect_and_sync(&self) -> Result<()> {
        let session = self.connect().await?;
        self.sync(session).await
    }

    /// Open a connection to the master and run the handshake
    pub async fn connect(&self) -> Result<ReplicaSession> {
        let master_addr = self
            .config
            .master_addr
            .ok_or_else(|| Error::config("Master address not configured"))?;

        self.set_state(ReplicaState::Connecting);
        tracing::info!("Connecting to master at {}", master_addr);

        let mut stream =
            tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(master_addr))
                .await
                .map_err(|_| Error::replication("Connection timeout"))??;
        stream.set_nodelay(true)?;

        let last_offset = self.log.highest_offset();
        let last_checksum = match last_offset {
            0 => 0,
            offset => self.log.checksum_at(offset)?.unwrap_or(0),
        };
        let hello = ReplicationMessage::Hello {
            replica_id: self.id.clone(),
            security_token: self.config.security_token.clone(),
            last_offset,
            last_checksum,
            protocol_version: PROTOCOL_VERSION,
        };
        hello.write_to(&mut stream).await?;

        let reply = tokio::time::timeout(
            self.config.connect_timeout,
            ReplicationMessage::read_from(&mut stream),
        )
        .await
        .map_err(|_| Error::replication("Handshake timeout"))??;

        match reply {
            ReplicationMessage::Welcome {
                master_id,
                current_offset,
                oldest_offset,
            } => {
                if last_offset > current_offset || last_offset + 1 < oldest_offset {
                    return Err(Error::DivergedLog {
                        replica_offset: last_offset,
                        master_oldest: oldest_offset,
                        master_current: current_offset,
                    });
                }

                tracing::info!(
                    "Connected to master {} (offset: {}, resuming after {})",
                    master_id,
                    current_offset,
                    last_offset
                );
                self.master_offset.store(current_offset, Ordering::SeqCst);
                self.stats.lock().master_id = Some(master_id.clone());

                Ok(ReplicaSession {
                    stream,
                    master_id,
                    master_offset: current_offset,
                    oldest_offset,
                    resume_offset: last_offset,
                })
            }
            error @ ReplicationMessage::Error { .. } => Err(error.into_error()),
            other => Err(Error::protocol(format!(
                "Expected Welcome, got {:?}",
                other.message_type()
            ))),
        }
    }

    /// Apply entries from an established session until it ends
    pub async fn sync(&self, session: ReplicaSession) -> Result<()> {
        self.set_state(ReplicaState::CatchingUp);
        let mut stream = session.stream;
        let liveness = self.config.liveness_timeout();

        loop {
            let message =
                tokio::time::timeout(liveness, ReplicationMessage::read_from(&mut stream))
                    .await
                    .map_err(|_| {
                        Error::replication(format!("Master silent for {:?}", liveness))
                    })??;

            match message {
                ReplicationMessage::Entry {
                    offset,
                    payload,
                    metadata,
                } => {
                    self.apply(LogEntry {
                        offset,
                        payload,
                        metadata,
                    })?;
                    ReplicationMessage::Ack { offset }
                        .write_to(&mut stream)
                        .await?;
                    self.stats.lock().acks_sent += 1;
                }

                ReplicationMessage::CatchUpComplete { offset } => {
                    tracing::info!("Replica {} caught up at offset {}", self.id, offset);
                    self.master_offset.fetch_max(offset, Ordering::SeqCst);
                    self.set_state(ReplicaState::Streaming);
                }

                ReplicationMessage::Ping { timestamp } => {
                    ReplicationMessage::Pong { timestamp }
                        .write_to(&mut stream)
                        .await?;
                }

                ReplicationMessage::Pong { .. } => {}

                error @ ReplicationMessage::Error { .. } => {
                    return Err(error.into_error());
                }

                other => {
                    tracing::warn!("Unexpected {:?} from master", other.message_type());
                }
            }
        }
    }

    /// Append one shipped entry. Entries already held are skipped; a gap
    /// fails the session.
    fn apply(&self, entry: LogEntry) -> Result<()> {
        let expected = self.log.highest_offset() + 1;
        let mut stats = self.stats.lock();
        stats.entries_received += 1;

        if entry.offset < expected {
            tracing::debug!("Skipping entry {} already held", entry.offset);
            stats.duplicates_skipped += 1;
            return Ok(());
        }
        if entry.offset > expected {
            return Err(Error::replication(format!(
                "Gap in replication stream: expected offset {}, got {}",
                expected, entry.offset
            )));
        }

        self.log.append_entry(&entry)?;
        self.master_offset.fetch_max(entry.offset, Ordering::SeqCst);
        stats.entries_applied += 1;
        stats.last_sync_time = Some(Instant::now());
        Ok(())
    }

    /// Drop the current connection; the replica reconnects and resumes
    /// with a new catch-up
    pub fn disconnect(&self) {
        self.session.lock().cancel();
    }

    /// Stop the replica node
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn set_state(&self, state: ReplicaState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Replica {} state {} -> {}", self.id, previous, state);
        }
    }
}

/// Spread reconnect attempts by up to a quarter of the delay
fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 4) as u64;
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::error_code;
    use crate::wal::MemoryLog;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn create_replica(master_addr: SocketAddr) -> (Arc<Replica>, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let mut config = ReplicationConfig::replica(master_addr)
            .with_node_id("r1")
            .with_token("foo");
        config.reconnect_initial_delay = Duration::from_millis(20);
        config.connect_timeout = Duration::from_secs(2);
        let replica = Replica::new(config, log.clone()).unwrap();
        (Arc::new(replica), log)
    }

    #[test]
    fn test_replica_creation() {
        let (replica, _log) = create_replica("127.0.0.1:15475".parse().unwrap());
        assert_eq!(replica.id(), "r1");
        assert_eq!(replica.current_offset(), 0);
        assert_eq!(replica.state(), ReplicaState::Idle);
        assert!(!replica.is_running());
        assert!(!replica.is_connected());
    }

    #[test]
    fn test_rejects_master_role() {
        let config = ReplicationConfig::master("127.0.0.1:0".parse().unwrap());
        assert!(matches!(
            Replica::new(config, Arc::new(MemoryLog::new())),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_apply_in_order() {
        let (replica, log) = create_replica("127.0.0.1:15475".parse().unwrap());
        replica.apply(LogEntry::new(1, "m1")).unwrap();
        replica.apply(LogEntry::new(2, "m2")).unwrap();

        // Re-shipped entries are skipped
        replica.apply(LogEntry::new(1, "m1")).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(replica.stats().duplicates_skipped, 1);

        assert!(replica.apply(LogEntry::new(4, "m4")).is_err());
        assert_eq!(replica.current_offset(), 2);
    }

    #[test]
    fn test_jitter_bounds() {
        let delay = Duration::from_millis(100);
        for _ in 0..32 {
            let jittered = with_jitter(delay);
            assert!(jittered >= delay && jittered <= Duration::from_millis(125));
        }
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_for_state_times_out() {
        let (replica, _log) = create_replica("127.0.0.1:15475".parse().unwrap());
        assert!(
            !replica
                .wait_for_state(ReplicaState::Streaming, Duration::from_millis(20))
                .await
        );
        assert!(
            replica
                .wait_for_state(ReplicaState::Idle, Duration::from_millis(20))
                .await
        );
    }

    #[tokio::test]
    async fn test_stop_ends_run() {
        // Nothing listens here; the replica keeps retrying until stopped
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (replica, _log) = create_replica(addr);
        let handle = replica.start();
        assert!(
            replica
                .wait_for_state(ReplicaState::Disconnected, Duration::from_secs(2))
                .await
        );

        replica.stop();
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(replica.state(), ReplicaState::Stopped);
        assert!(replica.stats().reconnects >= 1);
    }

    #[tokio::test]
    async fn test_auth_rejection_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello = ReplicationMessage::read_from(&mut stream).await.unwrap();
            assert!(matches!(hello, ReplicationMessage::Hello { .. }));
            ReplicationMessage::error(error_code::AUTH_FAILED, "Invalid security token")
                .write_to(&mut stream)
                .await
                .unwrap();
        });

        let (replica, _log) = create_replica(addr);
        let result = replica.run().await;
        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(replica.state(), ReplicaState::Failed);
    }

    #[tokio::test]
    async fn test_sync_applies_and_acks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let master = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let last_offset = match ReplicationMessage::read_from(&mut stream).await.unwrap() {
                ReplicationMessage::Hello { last_offset, .. } => last_offset,
                other => panic!("unexpected {:?}", other),
            };
            assert_eq!(last_offset, 0);

            ReplicationMessage::Welcome {
                master_id: "m".into(),
                current_offset: 2,
                oldest_offset: 1,
            }
            .write_to(&mut stream)
            .await
            .unwrap();
            for (offset, payload) in [(1, "a"), (2, "b")] {
                ReplicationMessage::from(LogEntry::new(offset, payload))
                    .write_to(&mut stream)
                    .await
                    .unwrap();
            }
            ReplicationMessage::CatchUpComplete { offset: 2 }
                .write_to(&mut stream)
                .await
                .unwrap();

            let mut acks = Vec::new();
            for _ in 0..2 {
                match ReplicationMessage::read_from(&mut stream).await.unwrap() {
                    ReplicationMessage::Ack { offset } => acks.push(offset),
                    other => panic!("unexpected {:?}", other),
                }
            }
            acks
        });

        let (replica, log) = create_replica(addr);
        let handle = replica.start();

        assert_eq!(master.await.unwrap(), vec![1, 2]);
        assert_eq!(
            crate::wal::read_all_payloads(log.as_ref()).unwrap(),
            vec![Bytes::from("a"), Bytes::from("b")]
        );
        let stats = replica.stats();
        assert_eq!(stats.master_id.as_deref(), Some("m"));
        assert_eq!(stats.entries_applied, 2);

        replica.stop();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_replica_ahead_of_master_is_diverged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = ReplicationMessage::read_from(&mut stream).await.unwrap();
            ReplicationMessage::Welcome {
                master_id: "m".into(),
                current_offset: 0,
                oldest_offset: 1,
            }
            .write_to(&mut stream)
            .await
            .unwrap();
        });

        let (replica, log) = create_replica(addr);
        log.append(Bytes::from("local"), None).unwrap();
        let result = replica.connect().await;
        assert!(matches!(
            result,
            Err(Error::DivergedLog {
                replica_offset: 1,
                ..
            })
        ));
    }
}
