//! Node facade
//!
//! A [`Node`] runs one replication role over a local log and exposes the
//! API the broker layer programs against. Mastership is handed over by
//! operators: stop the master, then [`Node::promote`] a caught-up replica.
//! The promoted node keeps its local log, so history is preserved.

use crate::replication::{
    DurabilityFuture, Master, Replica, ReplicationConfig, ReplicationRole,
};
use crate::wal::{self, LocalLog};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A running replication node
pub enum Node {
    /// Accepts writes and ships them to replicas
    Master(Arc<Master>),
    /// Mirrors a master
    Replica {
        /// The replica agent
        replica: Arc<Replica>,
        /// Task running the agent's supervisor loop
        task: JoinHandle<Result<()>>,
    },
}

impl Node {
    /// Start the role named by `config.role` over `log`
    pub async fn open(config: ReplicationConfig, log: Arc<dyn LocalLog>) -> Result<Self> {
        match config.role {
            ReplicationRole::Master => {
                let master = Arc::new(Master::new(config, log)?);
                master.start().await?;
                Ok(Self::Master(master))
            }
            ReplicationRole::Replica => {
                let replica = Arc::new(Replica::new(config, log)?);
                let task = replica.start();
                Ok(Self::Replica { replica, task })
            }
        }
    }

    /// Role of this node
    pub fn role(&self) -> ReplicationRole {
        match self {
            Self::Master(_) => ReplicationRole::Master,
            Self::Replica { .. } => ReplicationRole::Replica,
        }
    }

    /// Node id
    pub fn id(&self) -> &str {
        match self {
            Self::Master(master) => master.id(),
            Self::Replica { replica, .. } => replica.id(),
        }
    }

    /// The local log
    pub fn log(&self) -> Arc<dyn LocalLog> {
        match self {
            Self::Master(master) => master.log(),
            Self::Replica { replica, .. } => replica.log(),
        }
    }

    /// The master role, if this node is master
    pub fn master(&self) -> Option<&Arc<Master>> {
        match self {
            Self::Master(master) => Some(master),
            Self::Replica { .. } => None,
        }
    }

    /// The replica role, if this node is a replica
    pub fn replica(&self) -> Option<&Arc<Replica>> {
        match self {
            Self::Master(_) => None,
            Self::Replica { replica, .. } => Some(replica),
        }
    }

    /// Append a write. Only the master accepts writes.
    pub fn append(&self, payload: impl Into<Bytes>) -> Result<DurabilityFuture> {
        match self {
            Self::Master(master) => Ok(master.append(payload)),
            Self::Replica { replica, .. } => Err(Error::not_master(format!(
                "node {} is a replica",
                replica.id()
            ))),
        }
    }

    /// Every payload in the local log, in offset order
    pub fn read_all(&self) -> Result<Vec<Bytes>> {
        wal::read_all_payloads(self.log().as_ref())
    }

    /// Replicas streaming from this node (always 0 on a replica)
    pub fn current_replica_count(&self) -> usize {
        match self {
            Self::Master(master) => master.current_replica_count(),
            Self::Replica { .. } => 0,
        }
    }

    /// Stop the node.
    ///
    /// For a replica this waits for its supervisor loop and returns the
    /// error that ended it, if any.
    pub async fn stop(self) -> Result<()> {
        match self {
            Self::Master(master) => {
                master.stop();
                Ok(())
            }
            Self::Replica { replica, task } => {
                replica.stop();
                task.await
                    .map_err(|e| Error::internal(format!("replica task failed: {}", e)))?
            }
        }
    }

    /// Turn a replica into a master over the same local log.
    ///
    /// `config` must have the master role. The replica is stopped first;
    /// whatever ended its loop is logged, not returned, since promotion is
    /// an operator decision.
    pub async fn promote(self, config: ReplicationConfig) -> Result<Self> {
        let replica = match self {
            Self::Master(master) => {
                return Err(Error::config(format!(
                    "node {} is already master",
                    master.id()
                )));
            }
            Self::Replica { replica, task } => {
                replica.stop();
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(
                        "Promoting replica {} after it failed: {}",
                        replica.id(),
                        e
                    ),
                    Err(e) => {
                        return Err(Error::internal(format!("replica task failed: {}", e)));
                    }
                }
                replica
            }
        };

        let log = replica.log();
        let master = Arc::new(Master::new(config, log)?);
        master.start().await?;
        tracing::info!(
            "Replica {} promoted to master {} at offset {}",
            replica.id(),
            master.id(),
            master.current_offset()
        );
        Ok(Self::Master(master))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::MemoryLog;

    fn local() -> std::net::SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_master_node() {
        let node = Node::open(ReplicationConfig::master(local()), Arc::new(MemoryLog::new()))
            .await
            .unwrap();
        assert_eq!(node.role(), ReplicationRole::Master);
        assert!(node.master().is_some());

        let future = node.append("m1").unwrap();
        assert_eq!(future.await.unwrap(), 1);
        assert_eq!(node.read_all().unwrap(), vec![Bytes::from("m1")]);
        assert_eq!(node.current_replica_count(), 0);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_replica_refuses_writes() {
        let log = Arc::new(MemoryLog::new());
        log.append(Bytes::from("held"), None).unwrap();

        // Nothing listens on the master address
        let config = ReplicationConfig::replica("127.0.0.1:1".parse().unwrap());
        let node = Node::open(config, log).await.unwrap();
        assert_eq!(node.role(), ReplicationRole::Replica);
        assert!(matches!(node.append("m1"), Err(Error::NotMaster(_))));
        assert_eq!(node.read_all().unwrap(), vec![Bytes::from("held")]);
        assert_eq!(node.current_replica_count(), 0);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_promote_keeps_log() {
        let log = Arc::new(MemoryLog::new());
        log.append(Bytes::from("a"), None).unwrap();
        let node = Node::open(
            ReplicationConfig::replica("127.0.0.1:1".parse().unwrap()),
            log,
        )
        .await
        .unwrap();

        let node = node
            .promote(ReplicationConfig::master(local()))
            .await
            .unwrap();
        assert_eq!(node.role(), ReplicationRole::Master);
        assert_eq!(node.append("b").unwrap().await.unwrap(), 2);
        assert_eq!(
            node.read_all().unwrap(),
            vec![Bytes::from("a"), Bytes::from("b")]
        );

        assert!(
            node.promote(ReplicationConfig::master(local()))
                .await
                .is_err()
        );
    }
}
