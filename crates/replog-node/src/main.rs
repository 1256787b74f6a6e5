//! Replog Node - runs one member of a replicated log cluster
//!
//! Modes:
//! - `master` - accepts writes (one per stdin line) and ships them to replicas
//! - `replica` - mirrors a master into a local log directory
//! - `dump` - prints a log directory as JSON lines

mod config;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use replog_core::replication::{Master, Replica, ReplicationRole};
use replog_core::wal::{LocalLog, LogIter, SegmentedLog};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::NodeConfig;

/// Replog node CLI arguments
#[derive(Parser, Debug)]
#[command(name = "replog-node")]
#[command(about = "Quorum-replicated durable log node", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, short = 'c', global = true, env = "REPLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Seconds between stats log lines (0 disables)
    #[arg(long, global = true, default_value_t = 30)]
    stats_interval: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run as master
    Master {
        /// Replication bind address
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Replication factor (copies including the master)
        #[arg(long)]
        replicas: Option<u32>,
        /// Security token replicas must present
        #[arg(long)]
        token: Option<String>,
        /// Log directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run as replica
    Replica {
        /// Master replication address
        #[arg(long)]
        master: Option<SocketAddr>,
        /// Stable node id
        #[arg(long)]
        node_id: Option<String>,
        /// Security token
        #[arg(long)]
        token: Option<String>,
        /// Log directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print every record of a log directory
    Dump {
        /// Log directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "replog_core=debug,replog_node=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "replog_core=info,replog_node=info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("replog-worker")
        .enable_all()
        .build()?;

    rt.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let mut config = NodeConfig::load(args.config.as_deref())?;
    let stats_interval = Duration::from_secs(args.stats_interval);

    match args.command {
        Command::Master {
            bind,
            replicas,
            token,
            data_dir,
        } => {
            config.replication.role = ReplicationRole::Master;
            if let Some(bind) = bind {
                config.replication.bind_addr = bind;
            }
            if let Some(replicas) = replicas {
                config.replication.replicas = replicas;
            }
            if let Some(token) = token {
                config.replication.security_token = token;
            }
            if let Some(dir) = data_dir {
                config.log.dir = dir;
            }
            run_master(config, stats_interval).await
        }
        Command::Replica {
            master,
            node_id,
            token,
            data_dir,
        } => {
            config.replication.role = ReplicationRole::Replica;
            if let Some(master) = master {
                config.replication.master_addr = Some(master);
            }
            if let Some(node_id) = node_id {
                config.replication.node_id = node_id;
            }
            if let Some(token) = token {
                config.replication.security_token = token;
            }
            if let Some(dir) = data_dir {
                config.log.dir = dir;
            }
            run_replica(config, stats_interval).await
        }
        Command::Dump { data_dir } => {
            if let Some(dir) = data_dir {
                config.log.dir = dir;
            }
            dump(config)
        }
    }
}

fn open_log(config: &NodeConfig) -> anyhow::Result<Arc<SegmentedLog>> {
    let log = SegmentedLog::open(config.log.clone())
        .with_context(|| format!("Failed to open log at {:?}", config.log.dir))?;
    info!(
        "Opened log at {:?} (offsets {}..={})",
        config.log.dir,
        log.oldest_offset(),
        log.highest_offset()
    );
    Ok(Arc::new(log))
}

/// Interval that never fires when `period` is zero
fn stats_ticker(period: Duration) -> Option<tokio::time::Interval> {
    (!period.is_zero()).then(|| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    })
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_master(config: NodeConfig, stats_interval: Duration) -> anyhow::Result<()> {
    let log = open_log(&config)?;
    let master = Arc::new(Master::new(config.replication, log)?);
    let addr = master.start().await?;
    info!(
        "Master {} listening on {} (replication factor {})",
        master.id(),
        addr,
        master.config().replicas
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = stats_ticker(stats_interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) if line.is_empty() => {}
                    Some(line) => {
                        let write = master.append(line);
                        tokio::spawn(async move {
                            match write.await {
                                Ok(offset) => info!("Write {} is durable", offset),
                                Err(e) => warn!("Write failed: {}", e),
                            }
                        });
                    }
                    None => {
                        info!("stdin closed, no further writes");
                        stdin_open = false;
                    }
                }
            }
            _ = tick(&mut ticker) => {
                let stats = master.stats();
                info!(
                    "offset={} pending={} streaming={}/{} shipped={} acks={}",
                    stats.current_offset,
                    stats.pending_writes,
                    stats.streaming_replicas,
                    stats.connected_replicas,
                    stats.entries_shipped,
                    stats.acks_received
                );
            }
        }
    }

    let pending = master.pending_writes();
    master.stop();
    if pending > 0 {
        warn!("Stopped with {} writes not yet durable", pending);
    }
    Ok(())
}

async fn run_replica(config: NodeConfig, stats_interval: Duration) -> anyhow::Result<()> {
    let log = open_log(&config)?;
    let replica = Arc::new(Replica::new(config.replication, log)?);
    let mut task = replica.start();
    let mut ticker = stats_ticker(stats_interval);

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                replica.stop();
                break (&mut task).await;
            }
            result = &mut task => break result,
            _ = tick(&mut ticker) => {
                let stats = replica.stats();
                info!(
                    "state={} offset={} master_offset={} lag={} reconnects={}",
                    replica.state(),
                    stats.current_offset,
                    stats.master_offset,
                    stats.lag,
                    stats.reconnects
                );
            }
        }
    };

    match result.context("Replica task panicked")? {
        Ok(()) => Ok(()),
        Err(e) => bail!("Replica {} failed: {}", replica.id(), e),
    }
}

fn dump(config: NodeConfig) -> anyhow::Result<()> {
    let log = SegmentedLog::open(config.log.clone())
        .with_context(|| format!("Failed to open log at {:?}", config.log.dir))?;

    for entry in LogIter::new(&log, log.oldest_offset()) {
        let entry = entry?;
        let record = serde_json::json!({
            "offset": entry.offset,
            "payload": String::from_utf8_lossy(&entry.payload),
            "metadata": entry.metadata.as_ref().map(|m| String::from_utf8_lossy(m).into_owned()),
        });
        println!("{}", record);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_master_args() {
        let args = Args::try_parse_from([
            "replog-node",
            "master",
            "--bind",
            "127.0.0.1:7000",
            "--replicas",
            "2",
        ])
        .unwrap();
        match args.command {
            Command::Master { bind, replicas, .. } => {
                assert_eq!(bind, Some("127.0.0.1:7000".parse().unwrap()));
                assert_eq!(replicas, Some(2));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(args.stats_interval, 30);
    }

    #[test]
    fn test_parse_replica_args() {
        let args = Args::try_parse_from([
            "replog-node",
            "--verbose",
            "replica",
            "--master",
            "127.0.0.1:7000",
            "--node-id",
            "r1",
        ])
        .unwrap();
        assert!(args.verbose);
        assert!(matches!(
            args.command,
            Command::Replica { node_id: Some(ref id), .. } if id == "r1"
        ));
    }

    #[test]
    fn test_missing_subcommand_is_rejected() {
        assert!(Args::try_parse_from(["replog-node"]).is_err());
    }
}
