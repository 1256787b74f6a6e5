//! Quorum tracker for durable writes
//!
//! Counts distinct crediting sources per pending write (the master's own
//! flush plus one per replica) against the replication factor. Credits are
//! cumulative: crediting offset K from a source credits every pending write
//! at or below K that the source has not credited yet. Each pending write
//! remembers its crediting sources, so a source is counted at most once per
//! write even if its watermark is rebased after a reconnect.
//!
//! Pure bookkeeping; callers provide the locking.

use crate::replication::durability::DurabilityPromise;
use crate::wal::LogOffset;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Who vouches for a copy of an entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AckSource {
    /// The master's own durable append
    Master,
    /// A replica, by node id
    Replica(String),
}

/// A write waiting for its replication factor
#[derive(Debug)]
pub struct PendingWrite {
    /// Offset of the write
    pub offset: LogOffset,
    /// Copies required
    pub required_acks: usize,
    credited: HashSet<AckSource>,
    promise: DurabilityPromise,
}

impl PendingWrite {
    /// Copies counted so far
    pub fn current_acks(&self) -> usize {
        self.credited.len()
    }

    /// Whether `source` already credited this write
    pub fn credited_by(&self, source: &AckSource) -> bool {
        self.credited.contains(source)
    }
}

/// Tracks pending writes until they reach the replication factor
#[derive(Debug)]
pub struct QuorumTracker {
    required_acks: usize,
    pending: BTreeMap<LogOffset, PendingWrite>,
    /// Highest offset credited per source
    watermarks: HashMap<AckSource, LogOffset>,
    resolved: u64,
}

impl QuorumTracker {
    /// Create a tracker requiring `required_acks` copies per write (minimum 1)
    pub fn new(required_acks: u32) -> Self {
        Self {
            required_acks: required_acks.max(1) as usize,
            pending: BTreeMap::new(),
            watermarks: HashMap::new(),
            resolved: 0,
        }
    }

    /// Copies required per write
    pub fn required_acks(&self) -> usize {
        self.required_acks
    }

    /// Start tracking the write at `offset`
    pub fn register(&mut self, offset: LogOffset, promise: DurabilityPromise) {
        self.pending.insert(
            offset,
            PendingWrite {
                offset,
                required_acks: self.required_acks,
                credited: HashSet::new(),
                promise,
            },
        );
    }

    /// Credit every pending write at or below `offset` on behalf of `source`.
    ///
    /// Redundant credits are no-ops. Returns the offsets that became durable.
    pub fn credit(&mut self, offset: LogOffset, source: &AckSource) -> Vec<LogOffset> {
        let watermark = self.watermark(source);
        if offset <= watermark {
            return Vec::new();
        }
        self.watermarks.insert(source.clone(), offset);
        self.credit_range(watermark + 1, offset, source)
    }

    /// Reset the watermark of `source` to the offset it reports holding,
    /// crediting any pending write at or below it.
    ///
    /// Credit already granted is kept; the per-write source sets prevent
    /// the same source from being counted twice when it re-acknowledges.
    pub fn rebase_source(&mut self, source: &AckSource, offset: LogOffset) -> Vec<LogOffset> {
        self.watermarks.insert(source.clone(), offset);
        self.credit_range(1, offset, source)
    }

    fn credit_range(
        &mut self,
        from: LogOffset,
        through: LogOffset,
        source: &AckSource,
    ) -> Vec<LogOffset> {
        if from > through {
            return Vec::new();
        }

        let mut durable = Vec::new();
        for (write_offset, write) in self.pending.range_mut(from..=through) {
            if write.credited.insert(source.clone()) && write.credited.len() >= write.required_acks
            {
                durable.push(*write_offset);
            }
        }

        for write_offset in &durable {
            if let Some(write) = self.pending.remove(write_offset) {
                write.promise.resolve();
                self.resolved += 1;
            }
        }
        durable
    }

    /// Highest offset credited by `source`, 0 if none
    pub fn watermark(&self, source: &AckSource) -> LogOffset {
        self.watermarks.get(source).copied().unwrap_or(0)
    }

    /// Number of writes still waiting
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Offsets still waiting, ascending
    pub fn pending_offsets(&self) -> Vec<LogOffset> {
        self.pending.keys().copied().collect()
    }

    /// Pending write at `offset`, if it is still waiting
    pub fn get(&self, offset: LogOffset) -> Option<&PendingWrite> {
        self.pending.get(&offset)
    }

    /// Writes resolved since creation
    pub fn resolved_count(&self) -> u64 {
        self.resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::durability::{DurabilityFuture, DurabilityPromise};
    use proptest::prelude::*;

    fn track(tracker: &mut QuorumTracker, offset: LogOffset) -> DurabilityFuture {
        let (promise, future) = DurabilityPromise::new(Some(offset));
        tracker.register(offset, promise);
        future
    }

    fn replica(id: &str) -> AckSource {
        AckSource::Replica(id.to_string())
    }

    #[test]
    fn test_factor_one_resolves_on_master_credit() {
        let mut tracker = QuorumTracker::new(1);
        let future = track(&mut tracker, 1);
        assert_eq!(tracker.credit(1, &AckSource::Master), vec![1]);
        assert!(future.is_durable());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_factor_two_needs_replica() {
        let mut tracker = QuorumTracker::new(2);
        let future = track(&mut tracker, 1);
        assert!(tracker.credit(1, &AckSource::Master).is_empty());
        assert_eq!(tracker.get(1).map(|w| w.current_acks()), Some(1));
        assert!(!future.is_durable());

        assert_eq!(tracker.credit(1, &replica("r1")), vec![1]);
        assert!(future.is_durable());
        assert_eq!(tracker.resolved_count(), 1);
    }

    #[test]
    fn test_duplicate_credit_is_ignored() {
        let mut tracker = QuorumTracker::new(3);
        let future = track(&mut tracker, 1);
        tracker.credit(1, &AckSource::Master);
        tracker.credit(1, &replica("r1"));
        tracker.credit(1, &replica("r1"));
        tracker.credit(1, &AckSource::Master);

        assert_eq!(tracker.get(1).map(|w| w.current_acks()), Some(2));
        assert!(!future.is_durable());

        tracker.credit(1, &replica("r2"));
        assert!(future.is_durable());
    }

    #[test]
    fn test_cumulative_credit() {
        let mut tracker = QuorumTracker::new(2);
        let futures: Vec<_> = (1..=5).map(|o| track(&mut tracker, o)).collect();
        for offset in 1..=5 {
            tracker.credit(offset, &AckSource::Master);
        }

        assert_eq!(tracker.credit(3, &replica("r1")), vec![1, 2, 3]);
        assert!(futures[..3].iter().all(|f| f.is_durable()));
        assert!(futures[3..].iter().all(|f| !f.is_durable()));
        assert_eq!(tracker.pending_offsets(), vec![4, 5]);

        // A regressed ack changes nothing
        assert!(tracker.credit(2, &replica("r1")).is_empty());
        assert_eq!(tracker.watermark(&replica("r1")), 3);
    }

    #[test]
    fn test_rebase_does_not_double_count() {
        let mut tracker = QuorumTracker::new(3);
        let future = track(&mut tracker, 1);
        tracker.credit(1, &AckSource::Master);
        tracker.credit(1, &replica("r1"));

        // r1 reconnects reporting an older offset and re-acknowledges
        assert!(tracker.rebase_source(&replica("r1"), 0).is_empty());
        tracker.credit(1, &replica("r1"));
        assert_eq!(tracker.get(1).map(|w| w.current_acks()), Some(2));
        assert!(!future.is_durable());
    }

    #[test]
    fn test_rebase_credits_reported_offset() {
        let mut tracker = QuorumTracker::new(2);
        let first = track(&mut tracker, 1);
        let second = track(&mut tracker, 2);
        tracker.credit(1, &AckSource::Master);
        tracker.credit(2, &AckSource::Master);

        // The replica stored offset 1 but its ack never arrived
        assert_eq!(tracker.rebase_source(&replica("r1"), 1), vec![1]);
        assert!(first.is_durable());
        assert!(!second.is_durable());
        assert_eq!(tracker.watermark(&replica("r1")), 1);
    }

    proptest! {
        #[test]
        fn prop_durable_iff_enough_sources(
            factor in 1u32..5,
            writes in 1u64..12,
            credits in proptest::collection::vec((0usize..4, 0u64..14), 0..40),
        ) {
            let mut tracker = QuorumTracker::new(factor);
            let futures: Vec<_> = (1..=writes).map(|o| track(&mut tracker, o)).collect();
            for offset in 1..=writes {
                tracker.credit(offset, &AckSource::Master);
            }

            let mut highest = [0u64; 4];
            for (source, offset) in credits {
                tracker.credit(offset, &replica(&format!("r{source}")));
                highest[source] = highest[source].max(offset);
            }

            for (i, future) in futures.iter().enumerate() {
                let offset = i as u64 + 1;
                let copies = 1 + highest.iter().filter(|h| **h >= offset).count();
                prop_assert_eq!(future.is_durable(), copies >= factor as usize);
                if let Some(write) = tracker.get(offset) {
                    prop_assert!(write.current_acks() <= copies);
                    prop_assert!(write.current_acks() < write.required_acks);
                }
            }
        }
    }
}
