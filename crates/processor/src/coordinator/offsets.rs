//! Safe commit positions per broker partition
//!
//! Offsets follow the Kafka convention: committing `n` means the group
//! resumes at `n`. The safe position of a partition is the lowest offset
//! still held by any unwritten window, or the next unread offset when
//! nothing is held. A commit is issued only when the safe position moves
//! past where the group would resume anyway.

use std::collections::BTreeMap;

use crate::broker::TopicPartition;

#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    /// Next unread offset per partition
    next_unread: BTreeMap<TopicPartition, i64>,
    /// Last commit, or the first offset read from the partition
    resume_at: BTreeMap<TopicPartition, i64>,
}

impl OffsetTracker {
    pub(crate) fn observe(&mut self, tp: &TopicPartition, offset: i64) {
        self.resume_at.entry(tp.clone()).or_insert(offset);
        self.next_unread
            .entry(tp.clone())
            .and_modify(|next| *next = (*next).max(offset + 1))
            .or_insert(offset + 1);
    }

    /// Positions that are safe to commit and ahead of the last commit
    pub(crate) fn safe_commits(&self, held: &BTreeMap<TopicPartition, i64>) -> Vec<(TopicPartition, i64)> {
        self.next_unread
            .iter()
            .filter_map(|(tp, next)| {
                let safe = held.get(tp).map_or(*next, |h| (*h).min(*next));
                match self.resume_at.get(tp) {
                    Some(resume) if *resume >= safe => None,
                    _ => Some((tp.clone(), safe)),
                }
            })
            .collect()
    }

    pub(crate) fn mark_committed(&mut self, tp: &TopicPartition, offset: i64) {
        self.resume_at.insert(tp.clone(), offset);
    }

    /// Drop a revoked partition; nothing is committed for it until it is read again
    pub(crate) fn forget(&mut self, tp: &TopicPartition) {
        self.next_unread.remove(tp);
        self.resume_at.remove(tp);
    }

    pub(crate) fn resume_at(&self, tp: &TopicPartition) -> Option<i64> {
        self.resume_at.get(tp).copied()
    }
}

/// Merge `other` into `into`, keeping the lower offset per partition
pub(crate) fn merge_min(into: &mut BTreeMap<TopicPartition, i64>, other: &BTreeMap<TopicPartition, i64>) {
    for (tp, offset) in other {
        into.entry(tp.clone())
            .and_modify(|min| *min = (*min).min(*offset))
            .or_insert(*offset);
    }
}
