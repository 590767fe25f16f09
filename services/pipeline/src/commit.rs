//! Per-partition commit watermark for one channel.

use crate::consumer::PartitionOffset;
use std::collections::BTreeMap;

/// Highest committed next-to-read offset per partition. Never moves back.
#[derive(Debug, Default, Clone)]
pub struct CommitCursor {
    committed: BTreeMap<i32, i64>,
}

impl CommitCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed next-to-read offset of `partition`, if any.
    pub fn position(&self, partition: i32) -> Option<i64> {
        self.committed.get(&partition).copied()
    }

    /// The subset of `offsets` that would move the cursor forward.
    pub fn ahead(&self, offsets: &[PartitionOffset]) -> Vec<PartitionOffset> {
        offsets
            .iter()
            .filter(|po| self.position(po.partition).map_or(true, |c| po.offset > c))
            .copied()
            .collect()
    }

    /// Record offsets the broker acknowledged as committed.
    pub fn record(&mut self, offsets: &[PartitionOffset]) {
        for po in offsets {
            let entry = self.committed.entry(po.partition).or_insert(po.offset);
            *entry = (*entry).max(po.offset);
        }
    }
}
