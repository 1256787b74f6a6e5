//! Local Log - the durable, append-only store under every node
//!
//! Both roles write through [`LocalLog`]: the master assigns offsets with
//! [`LocalLog::append`], replicas mirror the master's offsets with
//! [`LocalLog::append_entry`]. An append is durable once it returns.
//!
//! Offsets start at 1. Offset 0 means "nothing stored yet", so a fresh
//! log has `highest_offset() == 0` and `oldest_offset() == 1`.

mod memory;
mod segmented;

pub use memory::MemoryLog;
pub use segmented::{LogConfig, SegmentedLog};

use crate::Result;
use bytes::Bytes;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Position of an entry in a node's log
pub type LogOffset = u64;

/// Default page size used when iterating a log
pub const DEFAULT_READ_BATCH: usize = 256;

/// A single immutable log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Offset assigned by the master
    pub offset: LogOffset,
    /// Record body
    pub payload: Bytes,
    /// Optional caller-supplied metadata (headers, message ids)
    pub metadata: Option<Bytes>,
}

impl LogEntry {
    /// Create an entry without metadata
    pub fn new(offset: LogOffset, payload: impl Into<Bytes>) -> Self {
        Self {
            offset,
            payload: payload.into(),
            metadata: None,
        }
    }

    /// CRC32 over offset, payload and metadata.
    ///
    /// Two logs holding the same record at the same offset agree on it;
    /// the handshake uses it to spot replicas with foreign history.
    pub fn checksum(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&self.offset.to_le_bytes());
        hasher.update(&(self.payload.len() as u64).to_le_bytes());
        hasher.update(&self.payload);
        match &self.metadata {
            Some(metadata) => {
                hasher.update(&[1]);
                hasher.update(metadata);
            }
            None => hasher.update(&[0]),
        }
        hasher.finalize()
    }
}

/// Append-only local store with a durable-flush guarantee
pub trait LocalLog: Send + Sync {
    /// Append a new record at `highest_offset() + 1`, durable before return.
    fn append(&self, payload: Bytes, metadata: Option<Bytes>) -> Result<LogOffset>;

    /// Append a record carrying an offset assigned elsewhere.
    ///
    /// The offset must be exactly `highest_offset() + 1`.
    fn append_entry(&self, entry: &LogEntry) -> Result<()>;

    /// Read up to `max_entries` records with offset >= `from`, ascending.
    ///
    /// Offsets below [`LocalLog::oldest_offset`] are skipped.
    fn read_from(&self, from: LogOffset, max_entries: usize) -> Result<Vec<LogEntry>>;

    /// Highest stored offset, 0 when empty
    fn highest_offset(&self) -> LogOffset;

    /// First retained offset, `highest_offset() + 1` when nothing is retained
    fn oldest_offset(&self) -> LogOffset;

    /// Discard records below `offset` where the storage granularity allows.
    ///
    /// Returns the number of records removed.
    fn purge_before(&self, offset: LogOffset) -> Result<u64>;

    /// [`LogEntry::checksum`] of the record at `offset`, if it is retained
    fn checksum_at(&self, offset: LogOffset) -> Result<Option<u32>> {
        Ok(self
            .read_from(offset, 1)?
            .into_iter()
            .find(|entry| entry.offset == offset)
            .map(|entry| entry.checksum()))
    }
}

/// Lazy, restartable iterator over a log, paging through `read_from`
pub struct LogIter<'a, L: LocalLog + ?Sized> {
    log: &'a L,
    next: LogOffset,
    batch: VecDeque<LogEntry>,
    batch_size: usize,
    done: bool,
}

impl<'a, L: LocalLog + ?Sized> LogIter<'a, L> {
    /// Iterate from `from` (inclusive) to the end of the log as of each page read
    pub fn new(log: &'a L, from: LogOffset) -> Self {
        Self::with_batch_size(log, from, DEFAULT_READ_BATCH)
    }

    /// Same as [`LogIter::new`] with a custom page size
    pub fn with_batch_size(log: &'a L, from: LogOffset, batch_size: usize) -> Self {
        Self {
            log,
            next: from.max(1),
            batch: VecDeque::new(),
            batch_size: batch_size.max(1),
            done: false,
        }
    }
}

impl<L: LocalLog + ?Sized> Iterator for LogIter<'_, L> {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch.is_empty() && !self.done {
            match self.log.read_from(self.next, self.batch_size) {
                Ok(entries) if entries.is_empty() => self.done = true,
                Ok(entries) => self.batch.extend(entries),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        let entry = self.batch.pop_front()?;
        self.next = entry.offset + 1;
        Some(Ok(entry))
    }
}

/// Collect every retained payload in offset order
pub fn read_all_payloads<L: LocalLog + ?Sized>(log: &L) -> Result<Vec<Bytes>> {
    LogIter::new(log, log.oldest_offset())
        .map(|entry| entry.map(|e| e.payload))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iter_pages_through_log() {
        let log = MemoryLog::new();
        for i in 0..10 {
            log.append(Bytes::from(format!("m{i}")), None).unwrap();
        }

        let offsets: Vec<_> = LogIter::with_batch_size(&log, 4, 3)
            .map(|e| e.unwrap().offset)
            .collect();
        assert_eq!(offsets, vec![4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_iter_on_empty_log() {
        let log = MemoryLog::new();
        assert_eq!(LogIter::new(&log, 1).count(), 0);
        assert!(read_all_payloads(&log).unwrap().is_empty());
    }

    #[test]
    fn test_read_all_payloads_skips_purged() {
        let log = MemoryLog::new();
        for i in 0..5 {
            log.append(Bytes::from(format!("m{i}")), None).unwrap();
        }
        log.purge_before(3).unwrap();

        let payloads = read_all_payloads(&log).unwrap();
        assert_eq!(payloads, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_checksum_tracks_content() {
        let entry = LogEntry::new(1, "b1");
        assert_eq!(entry.checksum(), LogEntry::new(1, "b1").checksum());
        assert_ne!(entry.checksum(), LogEntry::new(1, "stale").checksum());
        assert_ne!(entry.checksum(), LogEntry::new(2, "b1").checksum());

        let mut tagged = entry.clone();
        tagged.metadata = Some(Bytes::new());
        assert_ne!(entry.checksum(), tagged.checksum());
    }

    #[test]
    fn test_checksum_at() {
        let log = MemoryLog::new();
        assert_eq!(log.checksum_at(1).unwrap(), None);
        log.append(Bytes::from("a"), None).unwrap();
        log.append(Bytes::from("b"), None).unwrap();

        assert_eq!(
            log.checksum_at(2).unwrap(),
            Some(LogEntry::new(2, "b").checksum())
        );
        log.purge_before(2).unwrap();
        assert_eq!(log.checksum_at(1).unwrap(), None);
        assert_eq!(log.checksum_at(3).unwrap(), None);
    }
}
