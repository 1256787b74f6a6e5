//! Testing infrastructure for Replog Core
//!
//! Shared helpers for unit and integration tests that need real log
//! directories and real TCP replication between nodes in one process.
//!
//! # Key Features
//!
//! - **TestContext**: Temporary directory per test, removed on drop
//! - **Cluster helpers**: Start masters and replicas on ephemeral ports
//!   with heartbeats and backoff tuned for tests
//!
//! # Usage
//!
//! ```rust,no_run
//! use replog_core::testing::{TestContext, start_master, start_replica};
//!
//! # async fn example() -> replog_core::Result<()> {
//! let ctx = TestContext::new();
//! let (master, addr) = start_master(ctx.open_log("master")?, "foo", 2).await?;
//! let replica = start_replica(ctx.open_log("replica")?, addr, "r1", "foo")?;
//! assert!(master.append("m1").await.is_ok());
//! replica.stop().await?;
//! # Ok(())
//! # }
//! ```

mod cluster;
mod context;

pub use cluster::{
    eventually, free_local_addr, master_config, replica_config, start_master,
    start_replica,
};
pub use context::TestContext;
