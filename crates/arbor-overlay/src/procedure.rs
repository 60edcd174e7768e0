//! State of multi-message procedures and the acknowledgement barrier.

use std::collections::{HashMap, VecDeque};

use tracing::warn;

use crate::peer::PeerRef;

/// A parent accepting a new child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptChildState {
    pub procedure_id: u64,
    /// Entering peer with its assigned position.
    pub entering: PeerRef,
    pub adjacent_left: PeerRef,
    pub adjacent_right: PeerRef,
    /// Waiting for InformAboutNeighbors before the JoinAccept can go out.
    pub awaiting_neighbors: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeavePhase {
    /// FindReplacement is travelling, waiting for a ReplacementOffer.
    FindingReplacement,
    /// Leaving without replacement, signing off from parent and neighbors.
    SigningOff,
}

/// The peer that wants to leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveState {
    pub procedure_id: u64,
    pub phase: LeavePhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacingPhase {
    /// Signing off from the old position.
    SigningOff,
    /// ReplacementOffer sent, waiting for the ReplacementAck.
    AwaitingAck,
    /// Took over the position, waiting for ReplacementUpdate acks.
    Updating,
}

/// The peer that moves into a leaving peer's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacingState {
    pub procedure_id: u64,
    pub leaving: PeerRef,
    /// Parent of the position the replacement vacates.
    pub old_parent: PeerRef,
    pub phase: ReplacingPhase,
}

/// What to do once every expected acknowledgement has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckContinuation {
    /// Parent finished announcing its new child.
    AcceptChildComplete,
    /// Parent finished removing a signing-off child.
    SignOffParentComplete { child: PeerRef },
    /// A RemoveNeighbor of our child was fanned out.
    ChildRetracted { requester: PeerRef, acknowledge: bool },
    /// Departing peer finished signing off from its neighbors.
    NeighborsSignedOff,
    /// Replacement finished announcing its new position.
    ReplacementUpdated,
    /// A forwarded ReplacementUpdate was acknowledged by our neighbors.
    ReplacementUpdateForwarded { requester: PeerRef, acknowledge: bool },
}

#[derive(Debug)]
struct Barrier {
    remaining: u32,
    continuation: AckContinuation,
}

/// Counting barriers keyed by procedure id.
///
/// Each barrier fires its continuation exactly once, when its count reaches
/// zero. Barriers of the same procedure are served oldest first.
#[derive(Debug, Default)]
pub struct AckBarriers {
    pending: HashMap<u64, VecDeque<Barrier>>,
}

impl AckBarriers {
    /// Wait for `count` acks. With `count == 0` the continuation is returned at once.
    pub fn wait(
        &mut self,
        procedure_id: u64,
        count: u32,
        continuation: AckContinuation,
    ) -> Option<AckContinuation> {
        if count == 0 {
            return Some(continuation);
        }
        let queue = self.pending.entry(procedure_id).or_default();
        if !queue.is_empty() {
            warn!(procedure_id, "stacking a second ack barrier on one procedure");
        }
        queue.push_back(Barrier {
            remaining: count,
            continuation,
        });
        None
    }

    /// Count one ack. Returns the continuation when its barrier completes.
    pub fn ack(&mut self, procedure_id: u64) -> Option<AckContinuation> {
        let queue = self.pending.get_mut(&procedure_id)?;
        let front = queue.front_mut()?;
        front.remaining -= 1;
        if front.remaining > 0 {
            return None;
        }
        let done = queue.pop_front().map(|b| b.continuation);
        if queue.is_empty() {
            self.pending.remove(&procedure_id);
        }
        done
    }

    pub fn is_waiting(&self, procedure_id: u64) -> bool {
        self.pending.contains_key(&procedure_id)
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
