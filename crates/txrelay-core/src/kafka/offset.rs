//! Offset tracking for relayed partitions.
//!
//! `BatchOffsets` folds one batch into the marks registered with the
//! transaction and the positions to rewind to if it aborts. `OffsetTracker`
//! keeps the consumed, committed and end positions across batches for lag
//! reporting.

use crate::kafka::record::{OffsetMark, Record};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Per-partition offset bounds of a single batch.
#[derive(Debug, Default, Clone)]
pub struct BatchOffsets {
    /// (topic, partition) -> (first offset, last offset)
    bounds: BTreeMap<(String, i32), (i64, i64)>,
}

impl BatchOffsets {
    /// Create an empty fold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold every record of a batch.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut offsets = Self::new();
        for record in records {
            offsets.observe(record);
        }
        offsets
    }

    /// Account for one processed record.
    pub fn observe(&mut self, record: &Record) {
        self.bounds
            .entry((record.topic.clone(), record.partition))
            .and_modify(|(first, last)| {
                *first = (*first).min(record.offset);
                *last = (*last).max(record.offset);
            })
            .or_insert((record.offset, record.offset));
    }

    /// Marks to register with the transaction: last offset + 1 per partition.
    pub fn commit_marks(&self) -> BTreeMap<(String, i32), OffsetMark> {
        self.bounds
            .iter()
            .map(|((topic, partition), (_, last))| {
                (
                    (topic.clone(), *partition),
                    OffsetMark::after(topic, *partition, *last),
                )
            })
            .collect()
    }

    /// Positions that make the next poll redeliver the whole batch.
    pub fn rewind_marks(&self) -> Vec<OffsetMark> {
        self.bounds
            .iter()
            .map(|((topic, partition), (first, _))| OffsetMark::at(topic, *partition, *first))
            .collect()
    }

    /// Whether the batch touches a given partition.
    pub fn touches(&self, topic: &str, partition: i32) -> bool {
        self.bounds.contains_key(&(topic.to_string(), partition))
    }

    /// Whether nothing was observed.
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}

/// Tracks consumed, committed and end offsets for relayed partitions.
pub struct OffsetTracker {
    /// Last consumed offset per partition (topic, partition) -> offset
    current_offsets: DashMap<(String, i32), AtomicI64>,

    /// Last committed next-offset per partition
    committed_offsets: DashMap<(String, i32), AtomicI64>,

    /// Last observed high watermark per partition
    end_offsets: DashMap<(String, i32), AtomicI64>,
}

fn store(map: &DashMap<(String, i32), AtomicI64>, topic: &str, partition: i32, value: i64) {
    map.entry((topic.to_string(), partition))
        .and_modify(|v| v.store(value, Ordering::SeqCst))
        .or_insert_with(|| AtomicI64::new(value));
}

fn load(map: &DashMap<(String, i32), AtomicI64>, topic: &str, partition: i32) -> Option<i64> {
    map.get(&(topic.to_string(), partition))
        .map(|v| v.load(Ordering::SeqCst))
}

impl OffsetTracker {
    /// Create a new offset tracker.
    pub fn new() -> Self {
        Self {
            current_offsets: DashMap::new(),
            committed_offsets: DashMap::new(),
            end_offsets: DashMap::new(),
        }
    }

    /// Update the last consumed offset for a partition.
    pub fn update_current(&self, topic: &str, partition: i32, offset: i64) {
        store(&self.current_offsets, topic, partition, offset);
    }

    /// Get the last consumed offset for a partition.
    pub fn get_current(&self, topic: &str, partition: i32) -> Option<i64> {
        load(&self.current_offsets, topic, partition)
    }

    /// Record a committed offset mark.
    pub fn mark_committed(&self, mark: &OffsetMark) {
        store(
            &self.committed_offsets,
            &mark.topic,
            mark.partition,
            mark.next_offset,
        );
    }

    /// Get the committed next-offset for a partition.
    pub fn get_committed(&self, topic: &str, partition: i32) -> Option<i64> {
        load(&self.committed_offsets, topic, partition)
    }

    /// Record the high watermark of a partition.
    pub fn update_end(&self, topic: &str, partition: i32, end_offset: i64) {
        store(&self.end_offsets, topic, partition, end_offset);
    }

    /// Get the last recorded high watermark of a partition.
    pub fn get_end(&self, topic: &str, partition: i32) -> Option<i64> {
        load(&self.end_offsets, topic, partition)
    }

    /// Records in the partition the group has not committed yet.
    ///
    /// `None` until both a committed position and a high watermark are known.
    pub fn get_lag(&self, topic: &str, partition: i32) -> Option<i64> {
        let end = self.get_end(topic, partition)?;
        let committed = self.get_committed(topic, partition)?;
        Some((end - committed).max(0))
    }

    /// Sum of the lag across all partitions with a known lag.
    pub fn total_lag(&self) -> i64 {
        self.get_all_partitions()
            .iter()
            .filter_map(|(topic, partition)| self.get_lag(topic, *partition))
            .sum()
    }

    /// Get all tracked partitions.
    pub fn get_all_partitions(&self) -> Vec<(String, i32)> {
        self.current_offsets
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Forget partitions that are no longer assigned.
    pub fn forget(&self, topic: &str, partition: i32) {
        let key = (topic.to_string(), partition);
        self.current_offsets.remove(&key);
        self.committed_offsets.remove(&key);
        self.end_offsets.remove(&key);
    }
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(topic: &str, partition: i32, offset: i64) -> Record {
        Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            value: vec![],
            headers: vec![],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_batch_offsets_fold() {
        let batch = vec![
            record("in", 0, 10),
            record("in", 1, 4),
            record("in", 0, 11),
            record("in", 0, 12),
            record("in", 1, 5),
        ];
        let offsets = BatchOffsets::from_records(&batch);

        let marks = offsets.commit_marks();
        assert_eq!(marks.len(), 2);
        assert_eq!(marks[&("in".to_string(), 0)].next_offset, 13);
        assert_eq!(marks[&("in".to_string(), 1)].next_offset, 6);

        let rewind = offsets.rewind_marks();
        assert_eq!(rewind.len(), 2);
        assert!(rewind.contains(&OffsetMark::at("in", 0, 10)));
        assert!(rewind.contains(&OffsetMark::at("in", 1, 4)));

        assert!(offsets.touches("in", 1));
        assert!(!offsets.touches("in", 2));
    }

    #[test]
    fn test_empty_batch_offsets() {
        let offsets = BatchOffsets::new();
        assert!(offsets.is_empty());
        assert!(offsets.commit_marks().is_empty());
        assert!(offsets.rewind_marks().is_empty());
    }

    #[test]
    fn test_offset_tracker() {
        let tracker = OffsetTracker::new();

        tracker.update_current("test", 0, 100);
        assert_eq!(tracker.get_current("test", 0), Some(100));
        assert_eq!(tracker.get_lag("test", 0), None);

        tracker.mark_committed(&OffsetMark::after("test", 0, 49));
        assert_eq!(tracker.get_committed("test", 0), Some(50));
        // no watermark observed yet
        assert_eq!(tracker.get_lag("test", 0), None);

        tracker.update_end("test", 0, 120);
        assert_eq!(tracker.get_lag("test", 0), Some(70));

        tracker.mark_committed(&OffsetMark::after("test", 0, 119));
        assert_eq!(tracker.get_lag("test", 0), Some(0));
    }

    #[test]
    fn test_offset_tracker_multiple_partitions() {
        let tracker = OffsetTracker::new();

        for (topic, partition, last, end) in
            [("test", 0, 100, 150), ("test", 1, 200, 201), ("other", 0, 50, 60)]
        {
            tracker.update_current(topic, partition, last);
            tracker.mark_committed(&OffsetMark::after(topic, partition, last));
            tracker.update_end(topic, partition, end);
        }

        assert_eq!(tracker.get_all_partitions().len(), 3);
        assert_eq!(tracker.total_lag(), 49 + 0 + 9);

        tracker.forget("other", 0);
        assert_eq!(tracker.get_all_partitions().len(), 2);
        assert_eq!(tracker.get_end("other", 0), None);
        assert_eq!(tracker.total_lag(), 49);
    }
}
