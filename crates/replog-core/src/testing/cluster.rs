//! Helpers for running small replication clusters inside one test process

use crate::node::Node;
use crate::replication::{Master, ReplicationConfig};
use crate::wal::LocalLog;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Heartbeat interval used by test clusters
pub const TEST_HEARTBEAT: Duration = Duration::from_millis(200);

/// A loopback address that was free a moment ago
pub fn free_local_addr() -> Result<SocketAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?)
}

/// Master configuration on an ephemeral loopback port
pub fn master_config(token: &str, replicas: u32) -> ReplicationConfig {
    let mut config = ReplicationConfig::master(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_token(token)
        .with_replicas(replicas)
        .with_heartbeat_interval(TEST_HEARTBEAT);
    config.connect_timeout = Duration::from_secs(2);
    config
}

/// Replica configuration pointed at `master_addr`
pub fn replica_config(master_addr: SocketAddr, node_id: &str, token: &str) -> ReplicationConfig {
    let mut config = ReplicationConfig::replica(master_addr)
        .with_node_id(node_id)
        .with_token(token)
        .with_heartbeat_interval(TEST_HEARTBEAT);
    config.connect_timeout = Duration::from_secs(2);
    config.reconnect_initial_delay = Duration::from_millis(50);
    config.reconnect_max_delay = Duration::from_millis(500);
    config
}

/// Start a master over `log`, returning it with its bound address
pub async fn start_master(
    log: Arc<dyn LocalLog>,
    token: &str,
    replicas: u32,
) -> Result<(Arc<Master>, SocketAddr)> {
    let master = Arc::new(Master::new(master_config(token, replicas), log)?);
    let addr = master.start().await?;
    Ok((master, addr))
}

/// Start a replica node over `log`
pub fn start_replica(
    log: Arc<dyn LocalLog>,
    master_addr: SocketAddr,
    node_id: &str,
    token: &str,
) -> Result<Node> {
    let replica = Arc::new(crate::replication::Replica::new(
        replica_config(master_addr, node_id, token),
        log,
    )?);
    let task = replica.start();
    Ok(Node::Replica { replica, task })
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
