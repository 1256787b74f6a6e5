//! Replication configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Node role in replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationRole {
    /// Primary node - accepts writes
    Master,
    /// Secondary node - mirrors the master's log
    Replica,
}

impl Default for ReplicationRole {
    fn default() -> Self {
        Self::Master
    }
}

impl std::fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Replica => f.write_str("replica"),
        }
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Stable identity of this node, used for link deduplication
    pub node_id: String,

    /// This node's role
    pub role: ReplicationRole,

    /// Address to bind for replication connections (master)
    pub bind_addr: SocketAddr,

    /// Master address (replica)
    pub master_addr: Option<SocketAddr>,

    /// Shared secret presented by replicas during the handshake
    pub security_token: String,

    /// Replication factor: durable copies (master included) required per write
    pub replicas: u32,

    /// Maximum number of concurrently connected replicas
    pub max_replicas: u32,

    /// Heartbeat interval
    #[serde(with = "serde_millis")]
    pub heartbeat_interval: Duration,

    /// Connection timeout
    #[serde(with = "serde_millis")]
    pub connect_timeout: Duration,

    /// Number of silent heartbeat intervals before a peer is considered gone
    pub missed_heartbeats_threshold: u32,

    /// Entries per read during catch-up
    pub catch_up_batch_size: usize,

    /// First reconnect delay after a recoverable replica failure
    #[serde(with = "serde_millis")]
    pub reconnect_initial_delay: Duration,

    /// Upper bound for the exponential reconnect backoff
    #[serde(with = "serde_millis")]
    pub reconnect_max_delay: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            role: ReplicationRole::Master,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], super::DEFAULT_REPLICATION_PORT)),
            master_addr: None,
            security_token: String::new(),
            replicas: 1,
            max_replicas: 8,
            heartbeat_interval: Duration::from_millis(super::DEFAULT_HEARTBEAT_MS),
            connect_timeout: Duration::from_secs(10),
            missed_heartbeats_threshold: super::MISSED_HEARTBEATS_THRESHOLD,
            catch_up_batch_size: 512,
            reconnect_initial_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

impl ReplicationConfig {
    /// Create a master configuration
    pub fn master(bind_addr: SocketAddr) -> Self {
        Self {
            role: ReplicationRole::Master,
            bind_addr,
            ..Default::default()
        }
    }

    /// Create a replica configuration
    pub fn replica(master_addr: SocketAddr) -> Self {
        Self {
            role: ReplicationRole::Replica,
            master_addr: Some(master_addr),
            ..Default::default()
        }
    }

    /// Set the node id
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the security token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.security_token = token.into();
        self
    }

    /// Set the replication factor
    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Timeout after which a silent peer is considered disconnected
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * (self.missed_heartbeats_threshold + 1)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::config("node_id must not be empty"));
        }

        match self.role {
            ReplicationRole::Replica => {
                if self.master_addr.is_none() {
                    return Err(Error::config("Replica requires master_addr"));
                }
            }
            ReplicationRole::Master => {
                if self.replicas < 1 {
                    return Err(Error::config("replicas must be at least 1"));
                }
                if self.replicas > self.max_replicas + 1 {
                    return Err(Error::config(format!(
                        "replicas ({}) cannot exceed max_replicas + 1 ({})",
                        self.replicas,
                        self.max_replicas + 1
                    )));
                }
            }
        }

        if self.missed_heartbeats_threshold == 0 {
            return Err(Error::config(
                "missed_heartbeats_threshold must be at least 1",
            ));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(Error::config("heartbeat_interval must be non-zero"));
        }

        if self.catch_up_batch_size == 0 {
            return Err(Error::config("catch_up_batch_size must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();
        assert_eq!(config.role, ReplicationRole::Master);
        assert_eq!(config.replicas, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_master_config() {
        let addr: SocketAddr = "0.0.0.0:15475".parse().unwrap();
        let config = ReplicationConfig::master(addr)
            .with_token("foo")
            .with_replicas(2);
        assert_eq!(config.role, ReplicationRole::Master);
        assert_eq!(config.replicas, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replica_config() {
        let addr: SocketAddr = "127.0.0.1:15475".parse().unwrap();
        let config = ReplicationConfig::replica(addr);
        assert_eq!(config.role, ReplicationRole::Replica);
        assert_eq!(config.master_addr, Some(addr));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replica_without_master() {
        let config = ReplicationConfig {
            role: ReplicationRole::Replica,
            master_addr: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replication_factor_bounds() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(
            ReplicationConfig::master(addr)
                .with_replicas(0)
                .validate()
                .is_err()
        );

        let mut config = ReplicationConfig::master(addr);
        config.max_replicas = 2;
        assert!(config.clone().with_replicas(3).validate().is_ok());
        assert!(config.with_replicas(4).validate().is_err());
    }

    #[test]
    fn test_liveness_timeout() {
        let config = ReplicationConfig {
            heartbeat_interval: Duration::from_millis(200),
            missed_heartbeats_threshold: 3,
            ..Default::default()
        };
        assert_eq!(config.liveness_timeout(), Duration::from_millis(800));
    }

    #[test]
    fn test_unique_default_node_ids() {
        let a = ReplicationConfig::default();
        let b = ReplicationConfig::default();
        assert_ne!(a.node_id, b.node_id);
    }
}
