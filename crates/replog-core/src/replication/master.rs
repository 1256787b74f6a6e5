//! Master node implementation for replication
//!
//! The master node:
//! - Appends writes to its local log and hands out durability futures
//! - Accepts and authenticates replica connections
//! - Catches replicas up from the local log, then streams new appends
//! - Credits acknowledgments toward the replication factor
//! - Monitors replica liveness
//!
//! Appends and the switch of a link from catch-up to streaming are
//! serialized by one lock, so a replica sees every offset exactly once and
//! in order: entries older than the switch come from the log, newer ones
//! from the link's outbox.

use crate::replication::config::{ReplicationConfig, ReplicationRole};
use crate::replication::durability::{DurabilityFuture, DurabilityPromise};
use crate::replication::link::{LinkState, ReplicaIdentity, ReplicaInfo, ReplicaLink};
use crate::replication::protocol::{self, PROTOCOL_VERSION, ReplicationMessage, error_code};
use crate::replication::quorum::{AckSource, QuorumTracker};
use crate::replication::unix_millis;
use crate::wal::{self, LocalLog, LogEntry, LogOffset};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Master node statistics
#[derive(Debug, Clone, Default)]
pub struct MasterStats {
    /// Writes appended to the local log
    pub appends: u64,
    /// Writes rejected by the local log
    pub append_failures: u64,
    /// Entries written to replica sockets
    pub entries_shipped: u64,
    /// Acknowledgments that advanced a replica
    pub acks_received: u64,
    /// Writes that reached the replication factor
    pub writes_resolved: u64,
    /// Replica handshakes accepted
    pub connections_accepted: u64,
    /// Replica handshakes refused
    pub connections_rejected: u64,
    /// Replicas with a live connection
    pub connected_replicas: u32,
    /// Replicas receiving new appends
    pub streaming_replicas: u32,
    /// Current log offset
    pub current_offset: u64,
    /// Writes waiting for acknowledgments
    pub pending_writes: usize,
}

/// Master node for replication
pub struct Master {
    /// Master ID
    id: String,
    /// Configuration
    config: ReplicationConfig,
    /// Durable local log
    log: Arc<dyn LocalLog>,
    /// Serializes appends with catch-up completion
    append_lock: Mutex<()>,
    /// Replica links by node id
    links: RwLock<HashMap<String, ReplicaLink>>,
    /// Pending writes
    quorum: Mutex<QuorumTracker>,
    /// Statistics
    stats: Mutex<MasterStats>,
    /// Running flag
    running: AtomicBool,
    /// Set once by stop()
    stopped: AtomicBool,
    /// Bound replication address
    local_addr: Mutex<Option<SocketAddr>>,
    /// Cancelled on stop
    shutdown: CancellationToken,
    next_generation: AtomicU64,
}

impl Master {
    /// Create a master over `log`. Writes are accepted immediately;
    /// replicas can connect once [`Master::start`] was called.
    pub fn new(config: ReplicationConfig, log: Arc<dyn LocalLog>) -> Result<Self> {
        if config.role != ReplicationRole::Master {
            return Err(Error::config("Master requires role = master"));
        }
        config.validate()?;

        Ok(Self {
            id: config.node_id.clone(),
            quorum: Mutex::new(QuorumTracker::new(config.replicas)),
            config,
            log,
            append_lock: Mutex::new(()),
            links: RwLock::new(HashMap::new()),
            stats: Mutex::new(MasterStats::default()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
            next_generation: AtomicU64::new(0),
        })
    }

    /// Get master ID
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

    /// Address the replication listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Check if master is accepting replicas
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the replication listener and start accepting replicas.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::stopped("Master was stopped"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::replication("Master already running"));
        }

        let listener = match TcpListener::bind(self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        tracing::info!(
            "Master {} listening on {} (replicas={}, offset={})",
            self.id,
            addr,
            self.config.replicas,
            self.current_offset()
        );

        let master = Arc::clone(self);
        tokio::spawn(async move { master.accept_loop(listener).await });
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let master = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = master.accept_replica(stream, addr).await {
                                    tracing::warn!("Rejected replica connection from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Master {} shutting down", self.id);
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Append a write and return its durability future.
    ///
    /// The entry is durable locally when this returns; the future resolves
    /// once `replicas` nodes (master included) hold it. A local failure is
    /// reported through an already failed future.
    pub fn append(&self, payload: impl Into<Bytes>) -> DurabilityFuture {
        self.append_with_metadata(payload.into(), None)
    }

    /// Append a write carrying caller metadata
    pub fn append_with_metadata(
        &self,
        payload: Bytes,
        metadata: Option<Bytes>,
    ) -> DurabilityFuture {
        if self.stopped.load(Ordering::SeqCst) {
            return DurabilityFuture::failed(None, "master stopped");
        }

        let _guard = self.append_lock.lock();
        let offset = match self.log.append(payload.clone(), metadata.clone()) {
            Ok(offset) => offset,
            Err(e) => {
                tracing::error!("Local append failed: {}", e);
                self.stats.lock().append_failures += 1;
                return DurabilityFuture::failed(None, format!("local append failed: {}", e));
            }
        };

        let (promise, future) = DurabilityPromise::new(Some(offset));
        let resolved = {
            let mut quorum = self.quorum.lock();
            quorum.register(offset, promise);
            quorum.credit(offset, &AckSource::Master).len()
        };

        let entry = LogEntry {
            offset,
            payload,
            metadata,
        };
        for link in self.links.read().values() {
            link.forward(&entry);
        }

        let mut stats = self.stats.lock();
        stats.appends += 1;
        stats.writes_resolved += resolved as u64;
        stats.current_offset = offset;
        future
    }

    /// Run the handshake with a connecting replica and start its link.
    ///
    /// Refuses the replica (without creating a link) on a bad token, a
    /// protocol mismatch, a diverged log, or when `max_replicas` are
    /// already connected.
    pub async fn accept_replica(
        self: &Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<ReplicaInfo> {
        stream.set_nodelay(true)?;

        let hello = tokio::time::timeout(
            self.config.connect_timeout,
            ReplicationMessage::read_from(&mut stream),
        )
        .await
        .map_err(|_| Error::replication(format!("Handshake with {} timed out", addr)))??;

        let (identity, last_offset, last_checksum) = match hello {
            ReplicationMessage::Hello {
                replica_id,
                security_token,
                last_offset,
                last_checksum,
                protocol_version,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    let message = format!(
                        "Protocol version mismatch: expected {}, got {}",
                        PROTOCOL_VERSION, protocol_version
                    );
                    let frame =
                        ReplicationMessage::error(error_code::PROTOCOL_MISMATCH, message.clone());
                    return Err(self
                        .reject(&mut stream, frame, Error::protocol(message))
                        .await);
                }
                (
                    ReplicaIdentity::new(replica_id, addr, security_token),
                    last_offset,
                    last_checksum,
                )
            }
            other => {
                return Err(Error::protocol(format!(
                    "Expected Hello from {}, got {:?}",
                    addr,
                    other.message_type()
                )));
            }
        };

        if !tokens_match(&identity.security_token, &self.config.security_token) {
            let frame = ReplicationMessage::error(error_code::AUTH_FAILED, "Invalid security token");
            let error = Error::authentication(format!(
                "replica {} from {} presented an invalid security token",
                identity.node_id, addr
            ));
            return Err(self.reject(&mut stream, frame, error).await);
        }

        let current = self.log.highest_offset();
        let oldest = self.log.oldest_offset();
        let diverged = last_offset > current
            || last_offset + 1 < oldest
            || self.history_differs(last_offset, last_checksum)?;
        if diverged {
            let frame = protocol::diverged_frame(last_offset, oldest, current);
            let error = Error::DivergedLog {
                replica_offset: last_offset,
                master_oldest: oldest,
                master_current: current,
            };
            return Err(self.reject(&mut stream, frame, error).await);
        }

        // Capacity is checked and the link registered under one write lock
        // so concurrent handshakes cannot both take the last slot
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let replica_id = identity.node_id.clone();
        let registered = {
            let mut links = self.links.write();
            let connected = links
                .values()
                .filter(|l| l.is_connected() && l.id() != replica_id)
                .count();
            if connected >= self.config.max_replicas as usize {
                Err(format!(
                    "Too many replicas: {} of {} connected",
                    connected, self.config.max_replicas
                ))
            } else {
                let outbox = match links.get_mut(&replica_id) {
                    Some(link) => {
                        if link.is_connected() {
                            tracing::warn!(
                                "Replica {} reconnected from {}, superseding previous connection",
                                replica_id,
                                addr
                            );
                        }
                        link.reconnect(identity, generation, last_offset)
                    }
                    None => {
                        let (link, outbox) = ReplicaLink::new(identity, generation, last_offset);
                        links.insert(replica_id.clone(), link);
                        outbox
                    }
                };
                let link = links
                    .get_mut(&replica_id)
                    .ok_or_else(|| Error::internal("replica link vanished during handshake"))?;
                link.begin_catch_up();
                Ok((outbox, link.cancel_token(), link.info(current)))
            }
        };
        let (outbox, cancel, info) = match registered {
            Ok(registered) => registered,
            Err(message) => {
                let frame =
                    ReplicationMessage::error(error_code::TOO_MANY_REPLICAS, message.clone());
                return Err(self
                    .reject(&mut stream, frame, Error::replication(message))
                    .await);
            }
        };

        let welcome = ReplicationMessage::Welcome {
            master_id: self.id.clone(),
            current_offset: current,
            oldest_offset: oldest,
        };
        if let Err(e) = welcome.write_to(&mut stream).await {
            cancel.cancel();
            self.close_link(&replica_id, generation);
            return Err(e);
        }

        // The replica's own report of what it holds is authoritative
        let resolved = self
            .quorum
            .lock()
            .rebase_source(&AckSource::Replica(replica_id.clone()), last_offset);
        {
            let mut stats = self.stats.lock();
            stats.connections_accepted += 1;
            stats.writes_resolved += resolved.len() as u64;
        }
        self.update_replica_count();

        tracing::info!(
            "Replica {} connected from {} at offset {} (master at {})",
            replica_id,
            addr,
            last_offset,
            current
        );

        let (reader, writer) = stream.into_split();
        let master = Arc::clone(self);
        let id = replica_id.clone();
        let token = cancel.clone();
        tokio::spawn(async move { master.read_acks(id, generation, reader, token).await });

        let master = Arc::clone(self);
        tokio::spawn(async move {
            master
                .ship_entries(replica_id, generation, writer, last_offset, outbox, cancel)
                .await
        });

        Ok(info)
    }

    /// Whether the replica's entry at `last_offset` differs from ours.
    ///
    /// An offset we no longer retain cannot be compared and is trusted.
    fn history_differs(&self, last_offset: LogOffset, last_checksum: u32) -> Result<bool> {
        if last_offset == 0 {
            return Ok(false);
        }
        Ok(self
            .log
            .checksum_at(last_offset)?
            .is_some_and(|ours| ours != last_checksum))
    }

    async fn reject(&self, stream: &mut TcpStream, frame: ReplicationMessage, error: Error) -> Error {
        self.stats.lock().connections_rejected += 1;
        if let Err(e) = frame.write_to(stream).await {
            tracing::debug!("Failed to send rejection: {}", e);
        }
        error
    }

    /// Read acknowledgments and heartbeat replies from one replica
    async fn read_acks(
        self: Arc<Self>,
        replica_id: String,
        generation: u64,
        mut reader: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let liveness = self.config.liveness_timeout();
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                result = tokio::time::timeout(liveness, ReplicationMessage::read_from(&mut reader)) => result,
            };

            match result {
                Err(_) => {
                    tracing::warn!(
                        "Replica {} silent for {:?}, dropping link",
                        replica_id,
                        liveness
                    );
                    break;
                }
                Ok(Err(e)) => {
                    tracing::debug!("Replica {} connection closed: {}", replica_id, e);
                    break;
                }
                Ok(Ok(ReplicationMessage::Ack { offset })) => {
                    self.on_replica_ack(&replica_id, offset);
                }
                Ok(Ok(ReplicationMessage::Pong { .. })) => {
                    if let Some(link) = self.links.write().get_mut(&replica_id) {
                        link.touch();
                    }
                }
                Ok(Ok(ReplicationMessage::Error { code, message })) => {
                    tracing::warn!("Replica {} reported error {}: {}", replica_id, code, message);
                    break;
                }
                Ok(Ok(other)) => {
                    tracing::warn!(
                        "Unexpected {:?} from replica {}",
                        other.message_type(),
                        replica_id
                    );
                }
            }
        }

        cancel.cancel();
        self.close_link(&replica_id, generation);
    }

    /// Catch one replica up, then stream new appends to it
    async fn ship_entries(
        self: Arc<Self>,
        replica_id: String,
        generation: u64,
        mut writer: OwnedWriteHalf,
        resume_offset: LogOffset,
        outbox: mpsc::UnboundedReceiver<LogEntry>,
        cancel: CancellationToken,
    ) {
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = self.shutdown.cancelled() => Ok(()),
            result = self.stream_to_replica(&replica_id, generation, &mut writer, resume_offset, outbox) => result,
        };

        if let Err(e) = result {
            tracing::warn!("Streaming to replica {} stopped: {}", replica_id, e);
        }
        cancel.cancel();
        self.close_link(&replica_id, generation);
    }

    async fn stream_to_replica(
        &self,
        replica_id: &str,
        generation: u64,
        writer: &mut OwnedWriteHalf,
        resume_offset: LogOffset,
        mut outbox: mpsc::UnboundedReceiver<LogEntry>,
    ) -> Result<()> {
        let mut next = resume_offset + 1;
        loop {
            let batch = self.log.read_from(next, self.config.catch_up_batch_size)?;
            if batch.is_empty() {
                break;
            }
            next = self.send_entries(replica_id, writer, next, &batch).await?;
        }

        let tail = self.finish_catch_up(replica_id, generation, next)?;
        next = self.send_entries(replica_id, writer, next, &tail).await?;
        ReplicationMessage::CatchUpComplete { offset: next - 1 }
            .write_to(writer)
            .await?;
        tracing::info!("Replica {} caught up at offset {}", replica_id, next - 1);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                entry = outbox.recv() => {
                    match entry {
                        Some(entry) => {
                            next = self
                                .send_entries(replica_id, writer, next, std::slice::from_ref(&entry))
                                .await?;
                        }
                        None => return Ok(()),
                    }
                }
                _ = heartbeat.tick() => {
                    ReplicationMessage::Ping { timestamp: unix_millis() }
                        .write_to(writer)
                        .await?;
                }
            }
        }
    }

    /// Read what was appended during catch-up and flip the link to
    /// streaming, both under the append lock
    fn finish_catch_up(
        &self,
        replica_id: &str,
        generation: u64,
        next: LogOffset,
    ) -> Result<Vec<LogEntry>> {
        let _guard = self.append_lock.lock();
        let tail = self.log.read_from(next, usize::MAX)?;

        let mut links = self.links.write();
        match links.get_mut(replica_id) {
            Some(link)
                if link.generation() == generation && link.state() == LinkState::CatchingUp =>
            {
                link.begin_streaming();
                drop(links);
                self.update_replica_count();
                Ok(tail)
            }
            _ => Err(Error::stopped(format!(
                "Link to replica {} was superseded",
                replica_id
            ))),
        }
    }

    async fn send_entries(
        &self,
        replica_id: &str,
        writer: &mut OwnedWriteHalf,
        mut next: LogOffset,
        entries: &[LogEntry],
    ) -> Result<LogOffset> {
        for entry in entries {
            if entry.offset != next {
                return Err(Error::replication(format!(
                    "Log gap while shipping to {}: expected offset {}, found {}",
                    replica_id, next, entry.offset
                )));
            }
            ReplicationMessage::from(entry.clone())
                .write_to(writer)
                .await?;
            next += 1;
        }

        if !entries.is_empty() {
            if let Some(link) = self.links.read().get(replica_id) {
                link.record_sent(entries.len() as u64);
            }
            self.stats.lock().entries_shipped += entries.len() as u64;
        }
        Ok(next)
    }

    /// Credit a cumulative acknowledgment from a replica.
    ///
    /// Regressed, duplicate, or unknown-replica acks are ignored.
    pub fn on_replica_ack(&self, replica_id: &str, offset: LogOffset) {
        let current = self.current_offset();
        if offset > current {
            tracing::warn!(
                "Replica {} acknowledged offset {} beyond master offset {}",
                replica_id,
                offset,
                current
            );
            return;
        }

        {
            let mut links = self.links.write();
            let Some(link) = links.get_mut(replica_id) else {
                tracing::debug!("Ack from unknown replica {}", replica_id);
                return;
            };
            if !link.record_ack(offset, current) {
                return;
            }
        }

        let resolved = self
            .quorum
            .lock()
            .credit(offset, &AckSource::Replica(replica_id.to_string()));

        let mut stats = self.stats.lock();
        stats.acks_received += 1;
        stats.writes_resolved += resolved.len() as u64;
    }

    /// Drop the connection of a replica. Its earlier credits stand.
    ///
    /// Returns false if the replica was not connected.
    pub fn on_replica_disconnect(&self, replica_id: &str) -> bool {
        let disconnected = self
            .links
            .write()
            .get_mut(replica_id)
            .is_some_and(|link| link.disconnect());
        if disconnected {
            tracing::info!("Replica {} disconnected", replica_id);
            self.update_replica_count();
        }
        disconnected
    }

    fn close_link(&self, replica_id: &str, generation: u64) {
        let closed = {
            let mut links = self.links.write();
            match links.get_mut(replica_id) {
                Some(link) if link.generation() == generation => link.disconnect(),
                _ => false,
            }
        };
        if closed {
            tracing::info!("Replica {} disconnected", replica_id);
            self.update_replica_count();
        }
    }

    /// Stop accepting replicas and close every link.
    ///
    /// Writes still pending stay pending; they never resolve through this
    /// master again. New appends fail.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        {
            let mut links = self.links.write();
            for link in links.values_mut() {
                link.disconnect();
            }
            links.clear();
        }
        self.running.store(false, Ordering::SeqCst);
        self.update_replica_count();

        tracing::info!(
            "Master {} stopped at offset {} with {} writes pending",
            self.id,
            self.current_offset(),
            self.pending_writes()
        );
    }

    /// Replicas currently receiving new appends
    pub fn current_replica_count(&self) -> usize {
        self.links
            .read()
            .values()
            .filter(|l| l.state() == LinkState::Streaming)
            .count()
    }

    /// Writes waiting for acknowledgments
    pub fn pending_writes(&self) -> usize {
        self.quorum.lock().pending_count()
    }

    /// Every payload in the local log, in offset order
    pub fn read_all(&self) -> Result<Vec<Bytes>> {
        wal::read_all_payloads(self.log.as_ref())
    }

    /// Get replica info
    pub fn replica(&self, replica_id: &str) -> Option<ReplicaInfo> {
        let current = self.current_offset();
        self.links.read().get(replica_id).map(|l| l.info(current))
    }

    /// Get list of known replicas
    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        let current = self.current_offset();
        self.links.read().values().map(|l| l.info(current)).collect()
    }

    /// Get statistics
    pub fn stats(&self) -> MasterStats {
        let mut stats = self.stats.lock().clone();
        stats.current_offset = self.current_offset();
        stats.pending_writes = self.pending_writes();
        stats
    }

    fn update_replica_count(&self) {
        let links = self.links.read();
        let mut stats = self.stats.lock();
        stats.connected_replicas = links.values().filter(|l| l.is_connected()).count() as u32;
        stats.streaming_replicas = links
            .values()
            .filter(|l| l.state() == LinkState::Streaming)
            .count() as u32;
    }
}

/// Compare tokens without short-circuiting on the first mismatch
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    let mut diff = presented.len() ^ expected.len();
    for (i, byte) in expected.iter().enumerate() {
        diff |= (presented.get(i).copied().unwrap_or(0) ^ byte) as usize;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::MemoryLog;
    use std::time::Duration;

    fn create_master(replicas: u32) -> (Master, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let config = ReplicationConfig::master("127.0.0.1:0".parse().unwrap())
            .with_token("foo")
            .with_replicas(replicas);
        let master = Master::new(config, log.clone()).unwrap();
        (master, log)
    }

    fn attach_streaming_link(master: &Master, id: &str) -> mpsc::UnboundedReceiver<LogEntry> {
        let identity = ReplicaIdentity::new(id, "127.0.0.1:4000".parse().unwrap(), "foo");
        let (mut link, rx) = ReplicaLink::new(identity, 1, master.current_offset());
        link.begin_catch_up();
        link.begin_streaming();
        master.links.write().insert(id.to_string(), link);
        rx
    }

    #[test]
    fn test_master_creation() {
        let (master, _log) = create_master(2);
        assert_eq!(master.current_offset(), 0);
        assert!(!master.is_running());
        assert_eq!(master.current_replica_count(), 0);
    }

    #[test]
    fn test_rejects_replica_role() {
        let config = ReplicationConfig::replica("127.0.0.1:1".parse().unwrap());
        assert!(matches!(
            Master::new(config, Arc::new(MemoryLog::new())),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_factor_one_is_durable_on_append() {
        let (master, _log) = create_master(1);
        let future = master.append("m1");
        assert_eq!(future.offset(), Some(1));
        assert!(future.wait(Duration::from_millis(10)).await);
        assert_eq!(master.pending_writes(), 0);
        assert_eq!(master.stats().writes_resolved, 1);
    }

    #[tokio::test]
    async fn test_factor_two_waits_for_replica() {
        let (master, _log) = create_master(2);
        let future = master.append("m1");
        assert!(!future.wait(Duration::from_millis(50)).await);
        assert_eq!(master.pending_writes(), 1);
        assert_eq!(master.read_all().unwrap(), vec![Bytes::from("m1")]);
    }

    #[tokio::test]
    async fn test_ack_resolves_pending_writes() {
        let (master, _log) = create_master(2);
        let mut rx = attach_streaming_link(&master, "r1");

        let first = master.append("m1");
        let second = master.append("m2");
        assert_eq!(rx.try_recv().unwrap().offset, 1);
        assert_eq!(rx.try_recv().unwrap().offset, 2);

        master.on_replica_ack("r1", 1);
        assert!(first.is_durable());
        assert!(!second.is_durable());

        // Duplicate and regressed acks change nothing
        master.on_replica_ack("r1", 1);
        master.on_replica_ack("r1", 0);
        assert_eq!(master.stats().acks_received, 1);

        master.on_replica_ack("r1", 2);
        assert!(second.is_durable());
        assert_eq!(master.replica("r1").unwrap().last_ack_offset, 2);
    }

    #[tokio::test]
    async fn test_ack_from_disconnected_replica_is_ignored() {
        let (master, _log) = create_master(2);
        let _rx = attach_streaming_link(&master, "r1");
        let future = master.append("m1");

        assert!(master.on_replica_disconnect("r1"));
        assert!(!master.on_replica_disconnect("r1"));
        master.on_replica_ack("r1", 1);
        master.on_replica_ack("unknown", 1);

        assert!(!future.is_durable());
        assert_eq!(master.current_replica_count(), 0);
    }

    #[tokio::test]
    async fn test_ack_beyond_log_is_ignored() {
        let (master, _log) = create_master(2);
        let _rx = attach_streaming_link(&master, "r1");
        let future = master.append("m1");
        master.on_replica_ack("r1", 5);
        assert!(!future.is_durable());
        assert_eq!(master.replica("r1").unwrap().last_ack_offset, 0);
    }

    #[tokio::test]
    async fn test_local_failure_fails_future() {
        let (master, log) = create_master(1);
        log.set_fail_appends(true);

        let future = master.append("m1");
        assert_eq!(future.offset(), None);
        assert!(!future.wait(Duration::from_millis(10)).await);
        assert!(future.await.is_err());
        assert_eq!(master.stats().append_failures, 1);

        log.set_fail_appends(false);
        assert!(master.append("m2").is_durable());
        assert_eq!(master.current_offset(), 1);
    }

    #[tokio::test]
    async fn test_stop_keeps_pending_writes_pending() {
        let (master, _log) = create_master(2);
        let _rx = attach_streaming_link(&master, "r1");
        let future = master.append("m1");

        master.stop();
        assert!(master.replicas().is_empty());
        assert!(future.state().is_pending());
        assert_eq!(master.pending_writes(), 1);

        let late = master.append("m2");
        assert!(late.await.is_err());
        assert_eq!(master.current_offset(), 1);
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let (master, _log) = create_master(1);
        let master = Arc::new(master);
        let addr = master.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(master.local_addr(), Some(addr));
        assert!(master.is_running());
        assert!(master.start().await.is_err());

        master.stop();
        assert!(!master.is_running());
        assert!(master.start().await.is_err());
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("foo", "foo"));
        assert!(tokens_match("", ""));
        assert!(!tokens_match("bar", "foo"));
        assert!(!tokens_match("fo", "foo"));
        assert!(!tokens_match("fooo", "foo"));
    }
}
