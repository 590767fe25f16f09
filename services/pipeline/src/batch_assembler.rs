//! Per-channel batch assembly.
//!
//! [`BatchAssembler`] is a pure state machine driven by the channel worker:
//! it owns the accumulating batch and hands a ready one out by value. Time is
//! always passed in, so size and time triggers can be exercised without a
//! clock.

use crate::config::BatchPolicy;
use crate::consumer::PartitionOffset;
use crate::frame::Frame;
use std::collections::BTreeMap;
use tokio::time::Instant;
use uuid::Uuid;

/// A frame together with where it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub frame: Frame,
    pub position: PartitionOffset,
}

/// Why a batch was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTrigger {
    Size,
    Timeout,
    Drain,
}

impl BatchTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchTrigger::Size => "size",
            BatchTrigger::Timeout => "timeout",
            BatchTrigger::Drain => "drain",
        }
    }
}

/// Inclusive range of offsets consumed from one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRange {
    pub first: i64,
    pub last: i64,
}

/// A closed batch, ready for inference.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub channel: String,
    pub stream_id: String,
    pub entries: Vec<BatchEntry>,
    /// Every offset this batch accounts for, including skipped messages
    pub offsets: BTreeMap<i32, OffsetRange>,
    pub trigger: BatchTrigger,
    pub opened_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.entries.iter().map(|e| &e.frame)
    }

    pub fn frame_numbers(&self) -> Vec<u64> {
        self.frames().map(|f| f.frame_number).collect()
    }

    /// Offsets to commit once the batch is stored (last + 1 per partition).
    pub fn commit_offsets(&self) -> Vec<PartitionOffset> {
        self.offsets
            .iter()
            .map(|(&partition, range)| PartitionOffset {
                partition,
                offset: range.last + 1,
            })
            .collect()
    }

    /// Positions to seek back to so the whole batch is delivered again.
    pub fn rewind_positions(&self) -> Vec<PartitionOffset> {
        self.offsets
            .iter()
            .map(|(&partition, range)| PartitionOffset {
                partition,
                offset: range.first,
            })
            .collect()
    }
}

fn extend(ranges: &mut BTreeMap<i32, OffsetRange>, position: PartitionOffset) {
    ranges
        .entry(position.partition)
        .and_modify(|r| {
            r.first = r.first.min(position.offset);
            r.last = r.last.max(position.offset);
        })
        .or_insert(OffsetRange {
            first: position.offset,
            last: position.offset,
        });
}

#[derive(Debug)]
struct Accumulating {
    entries: Vec<BatchEntry>,
    offsets: BTreeMap<i32, OffsetRange>,
    opened_at: Instant,
}

/// Accumulates one channel's frames into size- or time-bounded batches.
#[derive(Debug)]
pub struct BatchAssembler {
    channel: String,
    stream_id: String,
    policy: BatchPolicy,
    current: Option<Accumulating>,
    skipped: BTreeMap<i32, OffsetRange>,
}

impl BatchAssembler {
    pub fn new(channel: impl Into<String>, stream_id: impl Into<String>, policy: BatchPolicy) -> Self {
        Self {
            channel: channel.into(),
            stream_id: stream_id.into(),
            policy,
            current: None,
            skipped: BTreeMap::new(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Frames in the accumulating batch.
    pub fn len(&self) -> usize {
        self.current.as_ref().map_or(0, |c| c.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Add a frame. The clock starts at the first frame of a batch.
    pub fn push(&mut self, entry: BatchEntry, now: Instant) -> Option<Batch> {
        let skipped = &mut self.skipped;
        let current = self.current.get_or_insert_with(|| Accumulating {
            entries: Vec::with_capacity(self.policy.max_size),
            offsets: std::mem::take(skipped),
            opened_at: now,
        });

        extend(&mut current.offsets, entry.position);
        current.entries.push(entry);

        if current.entries.len() >= self.policy.max_size {
            self.close(BatchTrigger::Size)
        } else {
            None
        }
    }

    /// Account for a message that will never be part of a batch; its offset
    /// is committed together with the next batch.
    pub fn skip(&mut self, position: PartitionOffset) {
        match self.current.as_mut() {
            Some(current) => extend(&mut current.offsets, position),
            None => extend(&mut self.skipped, position),
        }
    }

    /// When the accumulating batch times out, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.current
            .as_ref()
            .map(|c| c.opened_at + self.policy.max_wait)
    }

    /// Close the accumulating batch if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.close(BatchTrigger::Timeout),
            _ => None,
        }
    }

    /// Close whatever is accumulating.
    pub fn drain(&mut self) -> Option<Batch> {
        self.close(BatchTrigger::Drain)
    }

    /// Forget everything, including skipped offsets. Used after the consumer
    /// was rewound.
    pub fn reset(&mut self) {
        self.current = None;
        self.skipped.clear();
    }

    fn close(&mut self, trigger: BatchTrigger) -> Option<Batch> {
        let current = self.current.take()?;
        Some(Batch {
            id: Uuid::new_v4(),
            channel: self.channel.clone(),
            stream_id: self.stream_id.clone(),
            entries: current.entries,
            offsets: current.offsets,
            trigger,
            opened_at: current.opened_at,
        })
    }
}
