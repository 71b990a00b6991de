//! Quorum commit tracking.
//!
//! The leader records, per member (itself included), the highest offset
//! that member has durably acked. The commit watermark is the largest
//! offset present on a majority: the (N/2 + 1)-th largest ack. It never
//! moves backward and never passes the leader's own head.

use std::collections::HashMap;

use strata_core::{NodeId, Offset};

/// Tracks per-member acks and computes the majority commit offset.
#[derive(Debug)]
pub struct QuorumTracker {
    acks: HashMap<NodeId, Offset>,
    commit: Offset,
}

impl QuorumTracker {
    /// Creates a tracker over the full member set of a shard.
    #[must_use]
    pub fn new(members: &[NodeId]) -> Self {
        let acks = members
            .iter()
            .map(|node| (node.clone(), Offset::INVALID))
            .collect();
        Self {
            acks,
            commit: Offset::INVALID,
        }
    }

    /// Returns the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.acks.len()
    }

    /// Returns the majority size (N/2 + 1).
    #[must_use]
    pub fn majority(&self) -> usize {
        self.acks.len() / 2 + 1
    }

    /// Adds a member joining the shard after leadership was established.
    /// The commit computation immediately counts it as unacked.
    pub fn add_member(&mut self, node: NodeId) {
        self.acks.entry(node).or_insert(Offset::INVALID);
    }

    /// Records an ack; acks regress only when a member re-syncs lower,
    /// which the tracker ignores.
    pub fn record_ack(&mut self, node: &NodeId, offset: Offset) {
        if let Some(current) = self.acks.get_mut(node) {
            if offset > *current {
                *current = offset;
            }
        }
    }

    /// Returns the recorded ack for a member.
    #[must_use]
    pub fn acked(&self, node: &NodeId) -> Option<Offset> {
        self.acks.get(node).copied()
    }

    /// Recomputes the commit watermark, monotonically non-decreasing and
    /// capped by `head`. Returns the current commit.
    pub fn advance_commit(&mut self, head: Offset) -> Offset {
        let mut offsets: Vec<Offset> = self.acks.values().copied().collect();
        offsets.sort_unstable_by(|a, b| b.cmp(a));

        let majority = self.majority();
        let candidate = offsets[majority - 1];

        let candidate = if candidate > head { head } else { candidate };
        if candidate > self.commit {
            self.commit = candidate;
        }
        self.commit
    }

    /// Returns the current commit watermark.
    #[must_use]
    pub const fn commit_offset(&self) -> Offset {
        self.commit
    }

    /// Returns the lowest ack across all members, `None` with no members.
    /// Everything at or below it is safe to garbage-collect, snapshot
    /// coverage permitting.
    #[must_use]
    pub fn min_ack(&self) -> Option<Offset> {
        self.acks.values().copied().min()
    }
}
