//! Node configuration
//!
//! Precedence: defaults < TOML file < `REPLOG_*` environment < CLI flags.
//! CLI flags are applied by `main.rs` after [`NodeConfig::load`].

use anyhow::{Context, Result};
use replog_core::replication::ReplicationConfig;
use replog_core::wal::LogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `[replication]` table
    pub replication: ReplicationConfig,
    /// `[log]` table
    pub log: LogConfig,
}

impl NodeConfig {
    /// Load from `path` if given and present, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {:?}", path))?;
                let config: NodeConfig = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                tracing::info!("Loaded configuration from {:?}", path);
                config
            }
            Some(path) => {
                tracing::debug!("Config file not found: {:?}", path);
                NodeConfig::default()
            }
            None => NodeConfig::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply `REPLOG_*` overrides read through `var`
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(node_id) = var("REPLOG_NODE_ID") {
            self.replication.node_id = node_id;
        }
        if let Some(addr) = var("REPLOG_BIND_ADDR") {
            self.replication.bind_addr = addr
                .parse()
                .with_context(|| format!("Invalid REPLOG_BIND_ADDR: {}", addr))?;
        }
        if let Some(addr) = var("REPLOG_MASTER_ADDR") {
            self.replication.master_addr = Some(
                addr.parse()
                    .with_context(|| format!("Invalid REPLOG_MASTER_ADDR: {}", addr))?,
            );
        }
        if let Some(token) = var("REPLOG_TOKEN") {
            self.replication.security_token = token;
        }
        if let Some(replicas) = var("REPLOG_REPLICAS") {
            self.replication.replicas = replicas
                .parse()
                .with_context(|| format!("Invalid REPLOG_REPLICAS: {}", replicas))?;
        }
        if let Some(dir) = var("REPLOG_DATA_DIR") {
            self.log.dir = dir.into();
        }
        if let Some(size) = var("REPLOG_SEGMENT_SIZE") {
            self.log.segment_size = size
                .parse()
                .with_context(|| format!("Invalid REPLOG_SEGMENT_SIZE: {}", size))?;
        }
        Ok(())
    }
}
