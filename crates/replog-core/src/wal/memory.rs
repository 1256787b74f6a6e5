//! In-memory log, used by unit tests and ephemeral nodes

use super::{LocalLog, LogEntry, LogOffset};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct Inner {
    entries: VecDeque<LogEntry>,
    highest: LogOffset,
}

/// Volatile [`LocalLog`] implementation
///
/// Appends can be made to fail on demand to exercise disk-failure paths.
#[derive(Default)]
pub struct MemoryLog {
    inner: RwLock<Inner>,
    fail_appends: AtomicBool,
}

impl MemoryLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail with an I/O error (or stop doing so)
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True when no entries are retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_fault(&self) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("injected append failure")));
        }
        Ok(())
    }
}

impl LocalLog for MemoryLog {
    fn append(&self, payload: Bytes, metadata: Option<Bytes>) -> Result<LogOffset> {
        self.check_fault()?;
        let mut inner = self.inner.write();
        let offset = inner.highest + 1;
        inner.entries.push_back(LogEntry {
            offset,
            payload,
            metadata,
        });
        inner.highest = offset;
        Ok(offset)
    }

    fn append_entry(&self, entry: &LogEntry) -> Result<()> {
        self.check_fault()?;
        let mut inner = self.inner.write();
        if entry.offset != inner.highest + 1 {
            return Err(Error::wal(format!(
                "Non-contiguous append: expected offset {}, got {}",
                inner.highest + 1,
                entry.offset
            )));
        }
        inner.entries.push_back(entry.clone());
        inner.highest = entry.offset;
        Ok(())
    }

    fn read_from(&self, from: LogOffset, max_entries: usize) -> Result<Vec<LogEntry>> {
        let inner = self.inner.read();
        let Some(first) = inner.entries.front().map(|e| e.offset) else {
            return Ok(Vec::new());
        };
        let skip = from.saturating_sub(first) as usize;
        Ok(inner
            .entries
            .iter()
            .skip(skip)
            .take(max_entries)
            .cloned()
            .collect())
    }

    fn highest_offset(&self) -> LogOffset {
        self.inner.read().highest
    }

    fn oldest_offset(&self) -> LogOffset {
        let inner = self.inner.read();
        inner
            .entries
            .front()
            .map(|e| e.offset)
            .unwrap_or(inner.highest + 1)
    }

    fn purge_before(&self, offset: LogOffset) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut removed = 0;
        while inner.entries.front().is_some_and(|e| e.offset < offset) {
            inner.entries.pop_front();
            removed += 1;
        }
        Ok(removed)
    }
}
