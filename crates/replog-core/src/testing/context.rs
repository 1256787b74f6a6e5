//! TestContext - Manages test directories and their cleanup
//!
//! Each context owns one temporary directory. Node logs live in named
//! subdirectories so several nodes of a test cluster can share a context.

use crate::Result;
use crate::wal::{LogConfig, SegmentedLog};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Segment size used by test logs, small enough to exercise rolling
pub const TEST_SEGMENT_SIZE: u64 = 16 * 1024;

/// Context for managing test directories
///
/// The directory and everything below it is removed when the context is
/// dropped.
///
/// # Example
///
/// ```rust,no_run
/// use replog_core::testing::TestContext;
///
/// let ctx = TestContext::new();
/// let log = ctx.open_log("node1").unwrap();
/// // ctx.path().join("node1") now holds the log segments
/// ```
pub struct TestContext {
    /// Temporary directory for this test
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a new TestContext with a unique temporary directory
    ///
    /// The directory is guaranteed to exist before this function returns.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");
        Self { temp_dir }
    }

    /// Get the path to the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path of a named subdirectory, created if missing
    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Log configuration for a named node directory
    pub fn log_config(&self, name: &str) -> Result<LogConfig> {
        Ok(LogConfig::new(self.subdir(name)?).with_segment_size(TEST_SEGMENT_SIZE))
    }

    /// Open (or reopen) the segmented log of a named node
    pub fn open_log(&self, name: &str) -> Result<Arc<SegmentedLog>> {
        Ok(Arc::new(SegmentedLog::open(self.log_config(name)?)?))
    }

    /// Keep the directory alive beyond the context
    pub fn into_temp_dir(self) -> TempDir {
        self.temp_dir
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
