//! Leave: removing a peer while keeping the tree balanced.
//!
//! A peer that holds the last position of the tree simply signs off from its
//! parent and neighbors. Any other peer needs a replacement: a FindReplacement
//! travels with Find-End to the last peer, which signs off from its own
//! position, offers itself to the leaving peer and, once accepted, takes over
//! the leaving peer's position and neighbors.

use arbor_tree::LogicalPosition;
use tracing::{debug, info, warn};

use crate::capability::{Capabilities, TimeoutKind};
use crate::error::{Error, Result};
use crate::find_end::{FindEnd, Purpose, Step};
use crate::message::{MessageBody, MessageHeader, NeighborRelationship, SearchProgress};
use crate::node::{Node, Status};
use crate::peer::PeerRef;
use crate::procedure::{AckContinuation, LeavePhase, LeaveState, ReplacingPhase, ReplacingState};
use crate::routing_table::RoutingTable;

pub trait LeaveProtocol {
    /// Leave the tree, finding a replacement first if needed.
    fn initiate_self_departure(&mut self) -> Result<()>;

    fn process_find_replacement(
        &mut self,
        header: &MessageHeader,
        node_to_replace: PeerRef,
        hop_count: u16,
        progress: SearchProgress,
    ) -> Result<()>;

    fn process_replacement_offer(&mut self, header: &MessageHeader) -> Result<()>;

    fn process_replacement_ack(
        &mut self,
        header: &MessageHeader,
        neighbors: Vec<PeerRef>,
        locked: bool,
    ) -> Result<()>;

    fn process_replacement_nack(&mut self, header: &MessageHeader) -> Result<()>;

    fn process_replacement_update(
        &mut self,
        header: &MessageHeader,
        removed_position: LogicalPosition,
        replacement: PeerRef,
        acknowledge: bool,
    ) -> Result<()>;

    fn process_sign_off_parent_request(&mut self, header: &MessageHeader) -> Result<()>;

    fn process_sign_off_parent_answer(&mut self, header: &MessageHeader, successful: bool)
        -> Result<()>;

    fn process_unlock_neighbor(&mut self, header: &MessageHeader) -> Result<()>;
}

impl<C: Capabilities> LeaveProtocol for Node<C> {
    fn initiate_self_departure(&mut self) -> Result<()> {
        if self.status != Status::Running {
            return Err(Error::NotRunning);
        }
        if self.is_busy() || self.accept_child.is_some() {
            return Err(Error::Busy("cannot leave during another procedure"));
        }
        let own = self.routing.require_position()?;
        let procedure_id = self.new_procedure_id();

        if own.is_root() && self.routing.existing_children().is_empty() {
            info!(node = %self.routing.self_ref(), "last peer left the tree");
            self.reset_to(Status::Left);
            return Ok(());
        }

        if can_leave_without_replacement(&self.routing) {
            info!(node = %self.routing.self_ref(), "leaving without replacement");
            self.leave = Some(LeaveState {
                procedure_id,
                phase: LeavePhase::SigningOff,
            });
            return self.sign_off_from_parent(procedure_id);
        }

        info!(node = %self.routing.self_ref(), "looking for a replacement");
        self.leave = Some(LeaveState {
            procedure_id,
            phase: LeavePhase::FindingReplacement,
        });
        self.arm(TimeoutKind::ReplacementOfferResponse);
        let leaving = self.routing.self_ref();
        let result = self.perform_find_replacement(procedure_id, leaving, 0, SearchProgress::None);
        if result.is_err() {
            self.leave = None;
            self.disarm(TimeoutKind::ReplacementOfferResponse);
        }
        result
    }

    fn process_find_replacement(
        &mut self,
        header: &MessageHeader,
        node_to_replace: PeerRef,
        hop_count: u16,
        progress: SearchProgress,
    ) -> Result<()> {
        if self.status != Status::Running {
            debug!(node = %self.routing.self_ref(), "not running, dropping FindReplacement");
            return Ok(());
        }
        let own = self.routing.require_position()?;
        let procedure_id = header.procedure_id();

        if progress == SearchProgress::ReplacementNode {
            if !header.target.is_at(&own) {
                debug!(node = %self.routing.self_ref(), target = %header.target, "stale replacement target");
                return Ok(());
            }
            if node_to_replace.is_at(&own) {
                // the leaving peer turned out to be the last one
                self.disarm(TimeoutKind::ReplacementOfferResponse);
                let procedure_id = match &mut self.leave {
                    Some(state) => {
                        state.phase = LeavePhase::SigningOff;
                        state.procedure_id
                    }
                    None => return Err(Error::violation("replacement request for a peer not leaving")),
                };
                return self.sign_off_from_parent(procedure_id);
            }
            return self.prepare_leaving_as_successor(procedure_id, node_to_replace);
        }

        let mut progress = progress;
        let sender_right_on_level = header.sender.level() == Some(own.level())
            && header.sender.number().map(|n| n > own.number()).unwrap_or(false);
        let first_child_free = self.routing.child(0).map(|c| !c.exists()).unwrap_or(true);
        if sender_right_on_level && first_child_free && progress == SearchProgress::SearchRight {
            progress = SearchProgress::SearchLeft;
        }

        self.perform_find_replacement(procedure_id, node_to_replace, hop_count, progress)
    }

    fn process_replacement_offer(&mut self, header: &MessageHeader) -> Result<()> {
        match &self.leave {
            Some(state) if state.phase == LeavePhase::FindingReplacement => {}
            _ => return Err(Error::violation("ReplacementOffer while not looking for one")),
        }
        self.disarm(TimeoutKind::ReplacementOfferResponse);

        let neighbors = self.routing.all_known_existing_neighbors();
        let locked = self.locked;
        self.send(
            &header.sender,
            header.procedure_id(),
            MessageBody::ReplacementAck { neighbors, locked },
        )?;
        info!(node = %self.routing.self_ref(), replacement = %header.sender, "replaced, leaving");
        self.reset_to(Status::Left);
        Ok(())
    }

    fn process_replacement_ack(
        &mut self,
        header: &MessageHeader,
        neighbors: Vec<PeerRef>,
        locked: bool,
    ) -> Result<()> {
        let state = match &self.replacing {
            Some(state) if state.phase == ReplacingPhase::AwaitingAck => state.clone(),
            _ => return Err(Error::violation("ReplacementAck while not replacing")),
        };
        if !header.sender.same_position(&state.leaving) {
            return Err(Error::violation(format!(
                "ReplacementAck from {}, expected {}",
                header.sender, state.leaving
            )));
        }
        self.disarm(TimeoutKind::ReplacementAckResponse);

        let removed = self.routing.require_position()?;
        let new_position = state
            .leaving
            .position()
            .ok_or_else(|| Error::violation("leaving peer without position"))?;
        self.replace_myself(removed, new_position, neighbors)?;
        self.locked = locked && !state.old_parent.is_at(&new_position);

        let replacement = self.routing.self_ref();
        let procedure_id = state.procedure_id;
        let mut sent = 0;
        for neighbor in self.routing.all_symmetric_existing_neighbors() {
            if neighbor.is_at(&removed) {
                continue;
            }
            self.send(
                &neighbor,
                procedure_id,
                MessageBody::ReplacementUpdate {
                    removed_position: removed,
                    replacement,
                    acknowledge: true,
                },
            )?;
            sent += 1;
        }
        if let Some(state) = &mut self.replacing {
            state.phase = ReplacingPhase::Updating;
        }
        info!(node = %replacement, vacated = %removed, updates = sent, "took over position");
        self.wait_for_acks(procedure_id, sent, AckContinuation::ReplacementUpdated)
    }

    fn process_replacement_nack(&mut self, header: &MessageHeader) -> Result<()> {
        if self.leave.take().is_some() {
            warn!(node = %self.routing.self_ref(), from = %header.sender, "replacement refused");
            self.disarm(TimeoutKind::ReplacementOfferResponse);
        }
        Ok(())
    }

    fn process_replacement_update(
        &mut self,
        header: &MessageHeader,
        removed_position: LogicalPosition,
        replacement: PeerRef,
        acknowledge: bool,
    ) -> Result<()> {
        let own = self.routing.require_position()?;
        let replaced = replacement
            .position()
            .ok_or_else(|| Error::violation("replacement without position"))?;
        let procedure_id = header.procedure_id();

        if !self.routing.parent().is_at(&removed_position) {
            self.routing.remove_neighbor(&removed_position)?;
        }
        if self
            .routing
            .node_by_position(replaced.level(), replaced.number())
            .is_some()
        {
            self.routing.update_neighbor(replacement)?;
        }

        if replaced.is_child_of(&own) {
            let mut sent = 0;
            for neighbor in self.routing.existing_routing_table_neighbors() {
                self.send(
                    &neighbor,
                    procedure_id,
                    MessageBody::ReplacementUpdate {
                        removed_position,
                        replacement,
                        acknowledge: true,
                    },
                )?;
                sent += 1;
            }
            return self.wait_for_acks(
                procedure_id,
                sent,
                AckContinuation::ReplacementUpdateForwarded {
                    requester: header.sender,
                    acknowledge,
                },
            );
        }

        if acknowledge {
            self.send(&header.sender, procedure_id, MessageBody::RemoveNeighborAck)?;
        }
        Ok(())
    }

    fn process_sign_off_parent_request(&mut self, header: &MessageHeader) -> Result<()> {
        let own = self.routing.require_position()?;
        let procedure_id = header.procedure_id();
        let child = header.sender;
        let position = child
            .position()
            .filter(|p| p.is_child_of(&own))
            .ok_or_else(|| Error::violation(format!("sign-off from {}, not our child", child)))?;

        if self.locked {
            debug!(node = %self.routing.self_ref(), child = %child, "locked, refusing sign-off");
            self.send(
                &child,
                procedure_id,
                MessageBody::SignOffParentAnswer { successful: false },
            )?;
            return Ok(());
        }

        self.locked = true;
        self.routing.reset_child(position.child_index() as usize);
        let sent = self.retract_child(procedure_id, position)?;
        self.wait_for_acks(
            procedure_id,
            sent,
            AckContinuation::SignOffParentComplete { child },
        )
    }

    fn process_sign_off_parent_answer(
        &mut self,
        header: &MessageHeader,
        successful: bool,
    ) -> Result<()> {
        let procedure_id = header.procedure_id();
        if !successful {
            if let Some(state) = self.replacing.take() {
                warn!(node = %self.routing.self_ref(), "parent refused sign-off, cannot replace");
                self.send(&state.leaving, state.procedure_id, MessageBody::ReplacementNack)?;
            } else if self.leave.take().is_some() {
                warn!(node = %self.routing.self_ref(), "parent refused sign-off, staying");
            }
            return Ok(());
        }
        if self.leave.is_none() && self.replacing.is_none() {
            return Err(Error::violation("SignOffParentAnswer without sign-off"));
        }
        self.sign_off_from_neighbors(procedure_id)
    }

    fn process_unlock_neighbor(&mut self, header: &MessageHeader) -> Result<()> {
        if !self.locked {
            debug!(node = %self.routing.self_ref(), from = %header.sender, "unlock while not locked");
        }
        self.locked = false;
        Ok(())
    }
}

impl<C: Capabilities> Node<C> {
    fn perform_find_replacement(
        &mut self,
        procedure_id: u64,
        node_to_replace: PeerRef,
        hop_count: u16,
        progress: SearchProgress,
    ) -> Result<()> {
        let step = {
            let find_end = FindEnd::new(&self.routing, Purpose::Leave);
            match progress {
                SearchProgress::None => {
                    if self.routing.children_full() {
                        find_end.forward_to_adjacent()?
                    } else {
                        find_end.decide_next_step()?
                    }
                }
                SearchProgress::SearchLeft | SearchProgress::SearchRight => {
                    if find_end.is_correct_parent() {
                        Step::Accept
                    } else {
                        find_end.search_end_on_level(progress == SearchProgress::SearchLeft)?
                    }
                }
                SearchProgress::CheckRight => find_end.check_right()?,
                SearchProgress::ReplacementNode => {
                    return Err(Error::violation("replacement-node progress in Find-End"))
                }
            }
        };

        let (to, progress) = match step {
            Step::Accept => {
                let last_child = self
                    .routing
                    .existing_children()
                    .last()
                    .copied()
                    .ok_or_else(|| Error::violation("replacement parent without children"))?;
                (last_child, SearchProgress::ReplacementNode)
            }
            Step::Forward { to, progress } => (to, progress),
            Step::Drop => {
                debug!(node = %self.routing.self_ref(), leaving = %node_to_replace, "FindReplacement dropped");
                return Ok(());
            }
        };
        let hop_count = self.forward_hop(hop_count)?;
        self.send(
            &to,
            procedure_id,
            MessageBody::FindReplacement {
                node_to_replace,
                hop_count,
                progress,
            },
        )?;
        Ok(())
    }

    fn prepare_leaving_as_successor(&mut self, procedure_id: u64, leaving: PeerRef) -> Result<()> {
        if self.is_busy() || self.accept_child.is_some() {
            debug!(node = %self.routing.self_ref(), leaving = %leaving, "busy, refusing to replace");
            self.send(&leaving, procedure_id, MessageBody::ReplacementNack)?;
            return Ok(());
        }
        info!(node = %self.routing.self_ref(), leaving = %leaving, "replacing");
        self.replacing = Some(ReplacingState {
            procedure_id,
            leaving,
            old_parent: self.routing.parent(),
            phase: ReplacingPhase::SigningOff,
        });
        self.sign_off_from_parent(procedure_id)
    }

    fn sign_off_from_parent(&mut self, procedure_id: u64) -> Result<()> {
        let parent = self.routing.parent();
        if !parent.exists() {
            return self.sign_off_from_neighbors(procedure_id);
        }
        self.send(&parent, procedure_id, MessageBody::SignOffParentRequest)?;
        Ok(())
    }

    fn sign_off_from_neighbors(&mut self, procedure_id: u64) -> Result<()> {
        let own = self.routing.require_position()?;
        let parent = self.routing.parent();
        let adjacent_left = self.routing.adjacent_left();
        let adjacent_right = self.routing.adjacent_right();
        let mut sent = 0;

        for neighbor in self.routing.all_symmetric_existing_neighbors() {
            if neighbor.same_position(&parent) {
                continue;
            }
            self.send(
                &neighbor,
                procedure_id,
                MessageBody::RemoveNeighbor {
                    position: own,
                    acknowledge: true,
                },
            )?;
            sent += 1;
        }
        for (adjacent, other, relationship) in [
            (adjacent_left, adjacent_right, NeighborRelationship::AdjacentRight),
            (adjacent_right, adjacent_left, NeighborRelationship::AdjacentLeft),
        ] {
            if !adjacent.exists() {
                continue;
            }
            self.send(
                &adjacent,
                procedure_id,
                MessageBody::UpdateNeighbors {
                    neighbors: vec![(other, relationship)],
                    acknowledge: true,
                },
            )?;
            sent += 1;
        }
        debug!(node = %self.routing.self_ref(), updates = sent, "signing off from neighbors");
        self.wait_for_acks(procedure_id, sent, AckContinuation::NeighborsSignedOff)
    }

    pub(crate) fn neighbors_signed_off(&mut self, procedure_id: u64) -> Result<()> {
        if let Some(state) = &mut self.replacing {
            state.phase = ReplacingPhase::AwaitingAck;
            let leaving = state.leaving;
            self.send(&leaving, procedure_id, MessageBody::ReplacementOffer)?;
            self.arm(TimeoutKind::ReplacementAckResponse);
            return Ok(());
        }
        if self.leave.is_some() {
            let parent = self.routing.parent();
            if parent.exists() {
                self.send(&parent, procedure_id, MessageBody::UnlockNeighbor)?;
            }
            info!(node = %self.routing.self_ref(), "left the tree");
            self.reset_to(Status::Left);
            return Ok(());
        }
        warn!(procedure_id, "sign-off finished without a procedure");
        Ok(())
    }

    /// Move into `new_position`, adopting the neighbors the leaving peer reported.
    fn replace_myself(
        &mut self,
        removed: LogicalPosition,
        new_position: LogicalPosition,
        reported: Vec<PeerRef>,
    ) -> Result<()> {
        self.routing.set_position(new_position)?;
        let reported: Vec<PeerRef> = reported
            .into_iter()
            .filter(|p| p.exists() && !p.is_at(&removed) && !p.is_at(&new_position))
            .collect();
        for peer in &reported {
            self.routing.update_neighbor(*peer)?;
        }

        let value = new_position.horizontal_value();
        let left = reported
            .iter()
            .filter(|p| p.horizontal_value().map(|v| v < value).unwrap_or(false))
            .max_by_key(|p| p.horizontal_value());
        let right = reported
            .iter()
            .filter(|p| p.horizontal_value().map(|v| v > value).unwrap_or(false))
            .min_by_key(|p| p.horizontal_value());
        if let Some(left) = left {
            self.routing.set_adjacent_left(*left)?;
        }
        if let Some(right) = right {
            self.routing.set_adjacent_right(*right)?;
        }
        Ok(())
    }

    pub(crate) fn replacement_updated(&mut self, procedure_id: u64) -> Result<()> {
        let Some(state) = self.replacing.take() else {
            warn!(procedure_id, "replacement update finished without a procedure");
            return Ok(());
        };
        let own = self.routing.require_position()?;
        if state.old_parent.exists() && !state.old_parent.is_at(&own) {
            self.send(&state.old_parent, procedure_id, MessageBody::UnlockNeighbor)?;
        }
        info!(node = %self.routing.self_ref(), "replacement complete");
        Ok(())
    }

    pub(crate) fn on_replacement_offer_timeout(&mut self) -> Result<()> {
        if let Some(state) = self.leave.take() {
            warn!(
                node = %self.routing.self_ref(),
                procedure_id = state.procedure_id,
                "no replacement offered, staying"
            );
        }
        Ok(())
    }

    pub(crate) fn on_replacement_ack_timeout(&mut self) -> Result<()> {
        let Some(state) = self.replacing.clone() else {
            return Ok(());
        };
        warn!(node = %self.routing.self_ref(), leaving = %state.leaving, "no ReplacementAck, leaving");
        if state.old_parent.exists() {
            self.send(&state.old_parent, state.procedure_id, MessageBody::UnlockNeighbor)?;
        }
        self.reset_to(Status::Left);
        Ok(())
    }
}

/// Whether the owner of `routing` holds the last position of the tree.
pub fn can_leave_without_replacement(routing: &RoutingTable) -> bool {
    if !routing.existing_children().is_empty() {
        return false;
    }
    if let Some(right) = routing.direct_right_neighbor() {
        return !right.exists();
    }
    match routing.leftmost_neighbor_child() {
        Some(child) if child.number() == Some(0) => !child.exists(),
        _ => false,
    }
}
