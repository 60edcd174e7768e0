//! Join: placing an entering peer as the child of the correct parent.
//!
//! The entering peer sends a Join to any contact. Find-End forwards it to the
//! parent of the first free slot of the last level. That parent locks itself,
//! computes the new child's position and adjacents, sends a JoinAccept and,
//! once the child acknowledges, announces the child to every peer that has to
//! hold it.

use arbor_tree::{level_capacity, routing_positions, HorizontalValue, LogicalPosition, ROOT_VALUE};
use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapProtocol;
use crate::capability::{Capabilities, TimeoutKind};
use crate::error::{Error, Result};
use crate::find_end::{FindEnd, Purpose, Step};
use crate::message::{MessageBody, MessageHeader, NeighborRelationship, SearchProgress};
use crate::node::{BootstrapState, Node, Status};
use crate::peer::{PeerRef, PhysicalEndpoint};
use crate::procedure::{AcceptChildState, AckContinuation};
use crate::routing_table::RoutingTable;

pub trait JoinProtocol {
    /// Ask the peer at `contact` to place us in its tree.
    fn initiate_join(&mut self, contact: PhysicalEndpoint) -> Result<()>;

    fn process_join(
        &mut self,
        header: &MessageHeader,
        entering: PeerRef,
        hop_count: u16,
        progress: SearchProgress,
    ) -> Result<()>;

    /// Take `entering` as a child. Locks the node until the child is announced.
    fn perform_accept_child(&mut self, procedure_id: u64, entering: PeerRef) -> Result<()>;

    /// Resume an accept-child that asked for a missing adjacent.
    fn continue_accept_child(&mut self, reported: Vec<PeerRef>) -> Result<()>;

    fn send_join_accept(&mut self) -> Result<()>;

    fn process_join_accept(
        &mut self,
        header: &MessageHeader,
        fanout: u32,
        adjacent_left: PeerRef,
        adjacent_right: PeerRef,
        routing_neighbors: Vec<PeerRef>,
    ) -> Result<()>;

    fn process_join_accept_ack(&mut self, header: &MessageHeader) -> Result<()>;
}

impl<C: Capabilities> JoinProtocol for Node<C> {
    fn initiate_join(&mut self, contact: PhysicalEndpoint) -> Result<()> {
        match self.status {
            Status::Uninitialized | Status::AwaitingBootstrap | Status::Left => {}
            Status::AwaitingJoinAccept => return Err(Error::Busy("join already in progress")),
            Status::Running => return Err(Error::Busy("already part of a tree")),
        }

        self.disarm(TimeoutKind::BootstrapResponse);
        let entering = self.routing.self_ref();
        self.send(
            &PeerRef::unpositioned(contact),
            0,
            MessageBody::Join {
                entering,
                hop_count: 0,
                progress: SearchProgress::None,
            },
        )?;
        self.status = Status::AwaitingJoinAccept;
        self.arm(TimeoutKind::JoinAcceptResponse);
        info!(node = %entering, contact = %contact, "joining");
        Ok(())
    }

    fn process_join(
        &mut self,
        header: &MessageHeader,
        entering: PeerRef,
        hop_count: u16,
        progress: SearchProgress,
    ) -> Result<()> {
        if self.status != Status::Running || self.is_busy() {
            debug!(node = %self.routing.self_ref(), entering = %entering, "busy, dropping join");
            return Ok(());
        }
        if entering.endpoint().is_none() {
            return Err(Error::violation("join without entering endpoint"));
        }

        let procedure_id = header.procedure_id();
        let step = {
            let find_end = FindEnd::new(&self.routing, Purpose::Join);
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
                    return Err(Error::violation("join with replacement-node progress"))
                }
            }
        };

        match step {
            Step::Accept => self.perform_accept_child(procedure_id, entering),
            Step::Forward { to, progress } => {
                let hop_count = self.forward_hop(hop_count)?;
                self.send(
                    &to,
                    procedure_id,
                    MessageBody::Join {
                        entering,
                        hop_count,
                        progress,
                    },
                )?;
                Ok(())
            }
            Step::Drop => {
                debug!(node = %self.routing.self_ref(), "join dropped");
                Ok(())
            }
        }
    }

    fn perform_accept_child(&mut self, procedure_id: u64, entering: PeerRef) -> Result<()> {
        if self.locked || self.accept_child.is_some() {
            return Err(Error::Busy("accept child"));
        }

        let position = calc_new_child_position(&self.routing, self.config.complete_balancing)
            .ok_or_else(|| Error::violation("accepting a child without a free slot"))?;
        let entering = entering.with_position(position);

        let adjacent_left = adjacent_left_of_new_child(&self.routing, &position).unwrap_or_default();
        let adjacent_right =
            adjacent_right_of_new_child(&self.routing, &position).unwrap_or_default();
        let left_wrong = closer_adjacent(&self.routing, &position, &adjacent_left).is_some();
        let right_wrong = closer_adjacent(&self.routing, &position, &adjacent_right).is_some();
        if left_wrong && right_wrong {
            return Err(Error::violation("both adjacents of the new child are wrong"));
        }

        self.locked = true;
        self.accept_child = Some(AcceptChildState {
            procedure_id,
            entering,
            adjacent_left,
            adjacent_right,
            awaiting_neighbors: left_wrong || right_wrong,
        });
        self.arm(TimeoutKind::JoinAcceptAckResponse);
        info!(node = %self.routing.self_ref(), child = %entering, "accepting child");

        let result = if left_wrong {
            self.request_adjacent(procedure_id, adjacent_left, NeighborRelationship::AdjacentRight)
        } else if right_wrong {
            self.request_adjacent(procedure_id, adjacent_right, NeighborRelationship::AdjacentLeft)
        } else {
            self.send_join_accept()
        };
        if result.is_err() {
            self.abort_accept_child();
        }
        result
    }

    fn continue_accept_child(&mut self, reported: Vec<PeerRef>) -> Result<()> {
        let mut state = self
            .accept_child
            .clone()
            .ok_or_else(|| Error::violation("no accept-child procedure to continue"))?;
        let position = state
            .entering
            .position()
            .ok_or_else(|| Error::violation("accept-child without position"))?;
        let requested = reported
            .into_iter()
            .find(PeerRef::exists)
            .ok_or_else(|| Error::violation("empty adjacent report"))?;

        if let Some(closer) = closer_adjacent(&self.routing, &position, &requested) {
            return Err(Error::violation(format!(
                "{} is still closer to {} than {}",
                closer, position, requested
            )));
        }

        let value = requested
            .horizontal_value()
            .ok_or_else(|| Error::violation("adjacent without position"))?;
        if value < position.horizontal_value() {
            state.adjacent_left = requested;
        } else {
            state.adjacent_right = requested;
        }
        state.awaiting_neighbors = false;
        self.accept_child = Some(state);
        self.send_join_accept()
    }

    fn send_join_accept(&mut self) -> Result<()> {
        let state = self
            .accept_child
            .clone()
            .ok_or_else(|| Error::violation("no accept-child procedure"))?;
        let position = state
            .entering
            .position()
            .ok_or_else(|| Error::violation("accept-child without position"))?;
        let routing_neighbors = routing_neighbors_for_new_child(&self.routing, &position)?;
        self.send(
            &state.entering,
            state.procedure_id,
            MessageBody::JoinAccept {
                fanout: self.routing.fanout(),
                adjacent_left: state.adjacent_left,
                adjacent_right: state.adjacent_right,
                routing_neighbors,
            },
        )?;
        Ok(())
    }

    fn process_join_accept(
        &mut self,
        header: &MessageHeader,
        fanout: u32,
        adjacent_left: PeerRef,
        adjacent_right: PeerRef,
        routing_neighbors: Vec<PeerRef>,
    ) -> Result<()> {
        if self.status != Status::AwaitingJoinAccept {
            return Err(Error::violation("JoinAccept while not joining"));
        }
        let position = header
            .target
            .position()
            .ok_or_else(|| Error::violation("JoinAccept without assigned position"))?;
        let endpoint = self.endpoint().ok_or(Error::NotRunning)?;

        let mut table = RoutingTable::new(fanout, endpoint);
        table.set_position(position)?;
        table.set_parent(header.sender)?;
        if adjacent_left.exists() {
            table.set_adjacent_left(adjacent_left)?;
        }
        if adjacent_right.exists() {
            table.set_adjacent_right(adjacent_right)?;
        }
        for neighbor in routing_neighbors.into_iter().filter(PeerRef::exists) {
            table.update_routing_table_neighbor(neighbor);
        }

        self.disarm(TimeoutKind::JoinAcceptResponse);
        self.config.fanout = fanout;
        self.routing = table;
        self.status = Status::Running;
        self.bootstrap = BootstrapState::default();
        info!(node = %self.routing.self_ref(), parent = %header.sender, "joined");

        self.send(&header.sender, header.procedure_id(), MessageBody::JoinAcceptAck)?;
        Ok(())
    }

    fn process_join_accept_ack(&mut self, header: &MessageHeader) -> Result<()> {
        let state = self
            .accept_child
            .clone()
            .ok_or_else(|| Error::violation("JoinAcceptAck without accept-child procedure"))?;
        if state.awaiting_neighbors {
            return Err(Error::violation("JoinAcceptAck before JoinAccept was sent"));
        }
        if !header.sender.exists() || !header.sender.same_position(&state.entering) {
            return Err(Error::violation(format!(
                "JoinAcceptAck from {}, expected {}",
                header.sender, state.entering
            )));
        }

        self.disarm(TimeoutKind::JoinAcceptAckResponse);
        let procedure_id = state.procedure_id;
        let child = header.sender;
        let mut required = 0;

        if must_send_update_right(&self.routing, &state.adjacent_left) {
            required += self.announce(
                &state.adjacent_left,
                procedure_id,
                child,
                NeighborRelationship::AdjacentRight,
            );
        }
        if must_send_update_left(&self.routing, &state.adjacent_right) {
            required += self.announce(
                &state.adjacent_right,
                procedure_id,
                child,
                NeighborRelationship::AdjacentLeft,
            );
        }

        let our_left = our_new_adjacent_left(&self.routing, &child, &state.adjacent_right);
        let our_right = our_new_adjacent_right(&self.routing, &child, &state.adjacent_left);
        self.routing.set_child(child)?;
        if our_left.exists() {
            self.routing.set_adjacent_left(our_left)?;
        }
        if our_right.exists() {
            self.routing.set_adjacent_right(our_right)?;
        }

        required += self.announce_new_child(procedure_id, child)?;
        info!(node = %self.routing.self_ref(), child = %child, updates = required, "child accepted");
        self.wait_for_acks(procedure_id, required, AckContinuation::AcceptChildComplete)
    }
}

impl<C: Capabilities> Node<C> {
    fn request_adjacent(
        &mut self,
        procedure_id: u64,
        alleged: PeerRef,
        relationship: NeighborRelationship,
    ) -> Result<()> {
        debug!(alleged = %alleged, relationship = ?relationship, "asking for a closer adjacent");
        let send_back_to = self.routing.self_ref();
        self.send(
            &alleged,
            procedure_id,
            MessageBody::GetNeighbors {
                send_back_to,
                relationships: vec![relationship],
            },
        )?;
        Ok(())
    }

    /// Tell routing neighbors about the new child, and the child's own
    /// routing neighbors about it. Returns the number of acks to wait for.
    fn announce_new_child(&mut self, procedure_id: u64, child: PeerRef) -> Result<u32> {
        let position = child
            .position()
            .ok_or_else(|| Error::violation("child without position"))?;
        let mut sent = 0;

        for neighbor in self.routing.existing_routing_table_neighbors() {
            sent += self.announce(
                &neighbor,
                procedure_id,
                child,
                NeighborRelationship::RoutingTableNeighborChild,
            );
        }

        let (positions, _) = routing_positions(&position);
        for p in positions {
            if let Some(target) = self.routing.node_by_position(p.level(), p.number()) {
                sent += self.announce(
                    &target,
                    procedure_id,
                    child,
                    NeighborRelationship::RoutingTableNeighbor,
                );
            }
        }
        Ok(sent)
    }

    /// Acknowledged UpdateNeighbors about `child`. A failed send is logged and
    /// not waited for, so one bad peer cannot hold the lock.
    fn announce(
        &mut self,
        to: &PeerRef,
        procedure_id: u64,
        child: PeerRef,
        relationship: NeighborRelationship,
    ) -> u32 {
        let body = MessageBody::UpdateNeighbors {
            neighbors: vec![(child, relationship)],
            acknowledge: true,
        };
        match self.send(to, procedure_id, body) {
            Ok(_) => 1,
            Err(error) => {
                warn!(
                    node = %self.routing.self_ref(),
                    to = %to,
                    relationship = ?relationship,
                    error = %error,
                    "announcement not sent"
                );
                0
            }
        }
    }

    pub(crate) fn accept_child_complete(&mut self) {
        self.locked = false;
        if let Some(state) = self.accept_child.take() {
            debug!(child = %state.entering, "accept-child complete");
        }
    }

    fn abort_accept_child(&mut self) {
        self.locked = false;
        self.accept_child = None;
        self.disarm(TimeoutKind::JoinAcceptAckResponse);
    }

    pub(crate) fn on_join_accept_timeout(&mut self) -> Result<()> {
        if self.status != Status::AwaitingJoinAccept {
            return Ok(());
        }
        self.status = Status::Uninitialized;
        if self.bootstrap.join_retries >= self.config.bootstrap_retries {
            warn!(node = %self.routing.self_ref(), "no JoinAccept, giving up");
            return Ok(());
        }
        self.bootstrap.join_retries += 1;
        self.bootstrap.rounds = 0;
        self.bootstrap.candidates.clear();
        warn!(
            node = %self.routing.self_ref(),
            retry = self.bootstrap.join_retries,
            "no JoinAccept, bootstrapping again"
        );
        self.initiate_bootstrap()
    }

    pub(crate) fn on_join_accept_ack_timeout(&mut self) -> Result<()> {
        if let Some(state) = &self.accept_child {
            warn!(child = %state.entering, "no JoinAcceptAck, releasing lock");
        }
        self.abort_accept_child();
        Ok(())
    }
}

/// Free child slot for a new child.
///
/// Complete balancing takes the first free slot. Otherwise the free slot
/// whose horizontal value is closest to the root's.
pub fn calc_new_child_position(
    routing: &RoutingTable,
    complete_balancing: bool,
) -> Option<LogicalPosition> {
    let mut free = routing
        .children()
        .iter()
        .filter(|c| !c.exists())
        .filter_map(PeerRef::position);
    if complete_balancing {
        return free.next();
    }
    let root = HorizontalValue::new(ROOT_VALUE);
    free.min_by(|a, b| {
        a.horizontal_value()
            .distance(&root)
            .total_cmp(&b.horizontal_value().distance(&root))
    })
}

/// Closest known peer (or ourselves) left of the new child.
pub fn adjacent_left_of_new_child(
    routing: &RoutingTable,
    child: &LogicalPosition,
) -> Option<PeerRef> {
    routing.closest_known_left_of(child.horizontal_value())
}

/// Closest known peer (or ourselves) right of the new child.
pub fn adjacent_right_of_new_child(
    routing: &RoutingTable,
    child: &LogicalPosition,
) -> Option<PeerRef> {
    routing.closest_known_right_of(child.horizontal_value())
}

fn is_other_existing(routing: &RoutingTable, peer: &PeerRef) -> bool {
    peer.exists() && !peer.same_position(&routing.self_ref())
}

/// Whether the child's adjacent-right must learn its new adjacent-left.
pub fn must_send_update_left(routing: &RoutingTable, child_adjacent_right: &PeerRef) -> bool {
    is_other_existing(routing, child_adjacent_right)
}

/// Whether the child's adjacent-left must learn its new adjacent-right.
pub fn must_send_update_right(routing: &RoutingTable, child_adjacent_left: &PeerRef) -> bool {
    is_other_existing(routing, child_adjacent_left)
}

/// Our adjacent-left after accepting `child`.
pub fn our_new_adjacent_left(
    routing: &RoutingTable,
    child: &PeerRef,
    child_adjacent_right: &PeerRef,
) -> PeerRef {
    if child_adjacent_right.exists() && child_adjacent_right.same_position(&routing.self_ref()) {
        *child
    } else {
        routing.adjacent_left()
    }
}

/// Our adjacent-right after accepting `child`.
pub fn our_new_adjacent_right(
    routing: &RoutingTable,
    child: &PeerRef,
    child_adjacent_left: &PeerRef,
) -> PeerRef {
    if child_adjacent_left.exists() && child_adjacent_left.same_position(&routing.self_ref()) {
        *child
    } else {
        routing.adjacent_right()
    }
}

/// Known peers at the routing-table positions of our new child.
pub fn routing_neighbors_for_new_child(
    routing: &RoutingTable,
    child: &LogicalPosition,
) -> Result<Vec<PeerRef>> {
    let own = routing.require_position()?;
    if !child.is_child_of(&own) {
        return Err(Error::violation(format!("{} is not a child of {}", child, own)));
    }
    let (positions, _) = routing_positions(child);
    Ok(positions
        .iter()
        .filter_map(|p| routing.node_by_position(p.level(), p.number()))
        .collect())
}

/// A conceptual position strictly between `entering` and `alleged`, if any.
///
/// Our own free child slots do not count. An unknown `alleged` yields `None`.
/// Walks every position down to the deeper of the two levels, so the cost
/// grows with the size of the whole tree.
pub fn closer_adjacent(
    routing: &RoutingTable,
    entering: &LogicalPosition,
    alleged: &PeerRef,
) -> Option<LogicalPosition> {
    if !alleged.exists() {
        return None;
    }
    let alleged_position = alleged.position()?;
    let entering_value = entering.horizontal_value();
    let alleged_value = alleged_position.horizontal_value();
    let (low, high) = if alleged_value < entering_value {
        (alleged_value, entering_value)
    } else {
        (entering_value, alleged_value)
    };

    let fanout = routing.fanout();
    let deepest = entering.level().max(alleged_position.level());
    for level in 0..=deepest {
        let capacity = level_capacity(level, fanout).min(u64::from(u32::MAX) + 1);
        for number in 0..capacity {
            let Ok(candidate) = LogicalPosition::new(level, number as u32, fanout) else {
                break;
            };
            let value = candidate.horizontal_value();
            if low < value && value < high && !is_free_child(routing, &candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

fn is_free_child(routing: &RoutingTable, position: &LogicalPosition) -> bool {
    routing
        .children()
        .iter()
        .any(|c| !c.exists() && c.is_at(position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::node::tests::{incoming, running_at, Recorder};
    use crate::node::Phase;
    use crate::routing_table::tests::{ep, peer, pos, table_at};
    use crate::OverlayConfig;

    fn entering(port: u16) -> PeerRef {
        PeerRef::unpositioned(ep(port))
    }

    #[test]
    fn fanout_two_root_takes_second_child() {
        let mut t = table_at(0, 0, 2);
        t.set_child(peer(1, 0, 2)).unwrap();
        t.set_adjacent_left(peer(1, 0, 2)).unwrap();

        let child = calc_new_child_position(&t, true).unwrap();
        assert_eq!(child, pos(1, 1, 2));
        let b = PeerRef::resolved(child, ep(9000));

        let left = adjacent_left_of_new_child(&t, &child).unwrap();
        assert!(left.is_at(&pos(0, 0, 2)));
        let right = adjacent_right_of_new_child(&t, &child).unwrap_or_default();
        assert!(!right.exists());

        assert!(closer_adjacent(&t, &child, &left).is_none());
        assert!(closer_adjacent(&t, &child, &right).is_none());
        assert!(!must_send_update_left(&t, &right));
        assert!(!must_send_update_right(&t, &left));
        assert_eq!(our_new_adjacent_right(&t, &b, &left), b);
        assert!(our_new_adjacent_left(&t, &b, &right).is_at(&pos(1, 0, 2)));
    }

    #[test]
    fn fanout_two_inner_node_takes_left_child() {
        let mut t = table_at(2, 1, 2);
        t.update_neighbor(peer(1, 0, 2)).unwrap();
        t.set_adjacent_left(peer(1, 0, 2)).unwrap();
        t.set_child(peer(3, 3, 2)).unwrap();
        t.set_adjacent_right(peer(3, 3, 2)).unwrap();

        let child = calc_new_child_position(&t, true).unwrap();
        assert_eq!(child, pos(3, 2, 2));
        let c = PeerRef::resolved(child, ep(9000));

        let left = adjacent_left_of_new_child(&t, &child).unwrap();
        let right = adjacent_right_of_new_child(&t, &child).unwrap();
        assert!(left.is_at(&pos(1, 0, 2)));
        assert!(right.is_at(&pos(2, 1, 2)));
        assert!(closer_adjacent(&t, &child, &left).is_none());
        assert!(closer_adjacent(&t, &child, &right).is_none());

        assert!(must_send_update_right(&t, &left));
        assert!(!must_send_update_left(&t, &right));
        assert_eq!(our_new_adjacent_left(&t, &c, &right), c);
        assert!(our_new_adjacent_right(&t, &c, &left).is_at(&pos(3, 3, 2)));
    }

    #[test]
    fn fanout_three_inner_node_takes_left_child() {
        // A = 2:1 under B = 1:0; of A's children 3:3..3:5 only 3:5 is taken
        let mut a = running_at(2, 1, 3);
        a.routing.set_parent(peer(1, 0, 3)).unwrap();
        a.routing.update_neighbor(peer(2, 0, 3)).unwrap();
        a.routing.update_neighbor(peer(2, 2, 3)).unwrap();
        a.routing.update_neighbor(peer(3, 2, 3)).unwrap();
        a.routing.set_child(peer(3, 5, 3)).unwrap();
        a.routing.set_adjacent_left(peer(3, 2, 3)).unwrap();
        a.routing.set_adjacent_right(peer(3, 5, 3)).unwrap();

        a.perform_accept_child(77, entering(9000)).unwrap();
        assert!(a.is_locked());
        let sent = a.io.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ep(9000));
        let accept = &sent[0].1;
        assert!(accept.header.target.is_at(&pos(3, 3, 3)));
        match &accept.body {
            MessageBody::JoinAccept {
                fanout,
                adjacent_left,
                adjacent_right,
                routing_neighbors,
            } => {
                assert_eq!(*fanout, 3);
                assert_eq!(*adjacent_left, peer(3, 2, 3));
                assert_eq!(*adjacent_right, a.self_ref());
                let numbers: Vec<u32> = routing_neighbors.iter().filter_map(PeerRef::number).collect();
                assert_eq!(numbers, vec![2, 5]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let c = PeerRef::resolved(pos(3, 3, 3), ep(9000));
        let ack = incoming(c, &a, 77, MessageBody::JoinAcceptAck);
        a.handle_message(ack).unwrap();

        assert_eq!(a.routing_table().child(0), Some(c));
        assert_eq!(a.routing_table().adjacent_left(), c);
        assert_eq!(a.routing_table().adjacent_right(), peer(3, 5, 3));

        let updates: Vec<(PhysicalEndpoint, NeighborRelationship)> = a
            .io
            .take()
            .into_iter()
            .map(|(to, msg)| match msg.body {
                MessageBody::UpdateNeighbors {
                    neighbors,
                    acknowledge: true,
                } => {
                    assert_eq!(neighbors.len(), 1);
                    assert_eq!(neighbors[0].0, c);
                    assert_eq!(msg.header.ref_event_id, 77);
                    (to, neighbors[0].1)
                }
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        let at = |l, n| peer(l, n, 3).endpoint().unwrap();
        assert_eq!(
            updates,
            vec![
                (at(3, 2), NeighborRelationship::AdjacentRight),
                (at(2, 0), NeighborRelationship::RoutingTableNeighborChild),
                (at(2, 2), NeighborRelationship::RoutingTableNeighborChild),
                (at(3, 2), NeighborRelationship::RoutingTableNeighbor),
                (at(3, 5), NeighborRelationship::RoutingTableNeighbor),
            ]
        );

        for _ in 0..updates.len() {
            assert!(a.is_locked());
            a.receive_ack(77).unwrap();
        }
        assert!(!a.is_locked());
        assert_eq!(a.phase(), Phase::Idle);
    }

    #[test]
    fn unsendable_announcement_is_not_awaited() {
        let mut a = running_at(1, 0, 2);
        let child = PeerRef::resolved(pos(2, 0, 2), ep(9000));
        assert_eq!(
            a.announce(
                &PeerRef::at(pos(1, 1, 2)),
                5,
                child,
                NeighborRelationship::RoutingTableNeighborChild
            ),
            0
        );
        assert!(a.io.sent.is_empty());
        assert_eq!(
            a.announce(
                &peer(1, 1, 2),
                5,
                child,
                NeighborRelationship::RoutingTableNeighborChild
            ),
            1
        );
        assert_eq!(a.io.sent.len(), 1);
    }

    #[test]
    fn fanout_three_root_takes_left_child() {
        let mut t = table_at(0, 0, 3);
        t.set_child(peer(1, 1, 3)).unwrap();
        t.set_child(peer(1, 2, 3)).unwrap();
        t.set_adjacent_left(peer(1, 1, 3)).unwrap();
        t.set_adjacent_right(peer(1, 2, 3)).unwrap();

        let child = calc_new_child_position(&t, true).unwrap();
        assert_eq!(child, pos(1, 0, 3));
        let b = PeerRef::resolved(child, ep(9000));

        assert!(adjacent_left_of_new_child(&t, &child).is_none());
        let right = adjacent_right_of_new_child(&t, &child).unwrap();
        assert!(right.is_at(&pos(1, 1, 3)));
        assert!(closer_adjacent(&t, &child, &right).is_none());

        assert!(must_send_update_left(&t, &right));
        assert!(!must_send_update_right(&t, &PeerRef::unknown()));
        assert!(our_new_adjacent_left(&t, &b, &right).is_at(&pos(1, 1, 3)));
        assert!(our_new_adjacent_right(&t, &b, &PeerRef::unknown()).is_at(&pos(1, 2, 3)));
    }

    #[test]
    fn fanout_three_middle_child() {
        let mut t = table_at(1, 2, 3);
        t.set_child(peer(2, 6, 3)).unwrap();
        t.set_child(peer(2, 8, 3)).unwrap();
        t.set_adjacent_left(peer(2, 6, 3)).unwrap();
        t.set_adjacent_right(peer(2, 8, 3)).unwrap();

        let child = calc_new_child_position(&t, true).unwrap();
        assert_eq!(child, pos(2, 7, 3));
        let b = PeerRef::resolved(child, ep(9000));

        let left = adjacent_left_of_new_child(&t, &child).unwrap();
        let right = adjacent_right_of_new_child(&t, &child).unwrap();
        assert!(left.is_at(&pos(2, 6, 3)));
        assert!(right.is_at(&pos(1, 2, 3)));
        assert!(must_send_update_right(&t, &left));
        assert!(!must_send_update_left(&t, &right));
        assert_eq!(our_new_adjacent_left(&t, &b, &right), b);
        assert!(our_new_adjacent_right(&t, &b, &left).is_at(&pos(2, 8, 3)));
    }

    #[test]
    fn null_balancing_prefers_slot_near_root() {
        let t = table_at(0, 0, 3);
        assert_eq!(calc_new_child_position(&t, false).unwrap(), pos(1, 1, 3));
        assert_eq!(calc_new_child_position(&t, true).unwrap(), pos(1, 0, 3));

        let mut full = table_at(0, 0, 2);
        full.set_child(peer(1, 0, 2)).unwrap();
        full.set_child(peer(1, 1, 2)).unwrap();
        assert!(calc_new_child_position(&full, true).is_none());
    }

    #[test]
    fn closer_adjacent_skips_our_free_children() {
        let mut t = table_at(0, 0, 3);
        let me = t.self_ref();
        // only the free slot 1:1 lies between 1:0 and the root
        assert!(closer_adjacent(&t, &pos(1, 0, 3), &me).is_none());

        t.set_child(peer(1, 1, 3)).unwrap();
        assert_eq!(closer_adjacent(&t, &pos(1, 0, 3), &me), Some(pos(1, 1, 3)));

        assert!(closer_adjacent(&t, &pos(1, 0, 3), &PeerRef::at(pos(1, 1, 3))).is_none());
        let far = table_at(2, 1, 2);
        assert_eq!(
            closer_adjacent(&far, &pos(2, 1, 2), &peer(2, 0, 2)),
            Some(pos(1, 0, 2))
        );
    }

    #[test]
    fn routing_neighbors_of_new_child_come_from_known_peers() {
        let mut t = table_at(1, 0, 2);
        t.set_child(peer(2, 0, 2)).unwrap();
        t.update_neighbor(peer(1, 1, 2)).unwrap();
        t.update_neighbor(peer(2, 2, 2)).unwrap();

        let found = routing_neighbors_for_new_child(&t, &pos(2, 1, 2)).unwrap();
        let numbers: Vec<u32> = found.iter().filter_map(PeerRef::number).collect();
        assert_eq!(numbers, vec![0, 2]);
        assert!(routing_neighbors_for_new_child(&t, &pos(2, 2, 2)).is_err());
    }

    #[test]
    fn root_accepts_first_child() {
        let mut root = running_at(0, 0, 2);
        let join = incoming(
            entering(9000),
            &root,
            0,
            MessageBody::Join {
                entering: entering(9000),
                hop_count: 0,
                progress: SearchProgress::None,
            },
        );
        root.handle_message(join).unwrap();
        assert!(root.is_locked());
        assert_eq!(root.phase(), Phase::AcceptingChild);
        assert!(root.io.timeouts.contains(&TimeoutKind::JoinAcceptAckResponse));

        let sent = root.io.take();
        assert_eq!(sent.len(), 1);
        let (to, accept) = &sent[0];
        assert_eq!(*to, ep(9000));
        assert_eq!(accept.header.ref_event_id, 0xfeed);
        assert!(accept.header.target.is_at(&pos(1, 0, 2)));
        match &accept.body {
            MessageBody::JoinAccept {
                fanout,
                adjacent_left,
                adjacent_right,
                routing_neighbors,
            } => {
                assert_eq!(*fanout, 2);
                assert!(!adjacent_left.exists());
                assert!(adjacent_right.is_at(&pos(0, 0, 2)));
                assert!(routing_neighbors.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        let child = PeerRef::resolved(pos(1, 0, 2), ep(9000));
        let ack = incoming(child, &root, 0xfeed, MessageBody::JoinAcceptAck);
        root.handle_message(ack).unwrap();
        assert!(!root.is_locked());
        assert_eq!(root.phase(), Phase::Idle);
        assert_eq!(root.routing_table().child(0), Some(child));
        assert_eq!(root.routing_table().adjacent_left(), child);
        assert!(root.io.take().is_empty());
    }

    #[test]
    fn entering_peer_adopts_join_accept() {
        let config = OverlayConfig::default().with_fanout(2);
        let mut node = Node::new(config, ep(9000), Recorder::default()).unwrap();
        node.initiate_join(ep(3000)).unwrap();
        assert_eq!(node.status(), Status::AwaitingJoinAccept);
        assert!(node.initiate_join(ep(3000)).is_err());
        let join = node.io.take().remove(0).1;

        let accept = Message::new(
            MessageHeader {
                sender: peer(0, 0, 2),
                target: PeerRef::resolved(pos(1, 1, 2), ep(9000)),
                event_id: 5,
                ref_event_id: join.header.event_id,
            },
            MessageBody::JoinAccept {
                fanout: 2,
                adjacent_left: peer(0, 0, 2),
                adjacent_right: PeerRef::unknown(),
                routing_neighbors: vec![peer(1, 0, 2)],
            },
        );
        node.handle_message(accept).unwrap();

        assert_eq!(node.status(), Status::Running);
        assert_eq!(node.position(), Some(pos(1, 1, 2)));
        assert_eq!(node.routing_table().parent(), peer(0, 0, 2));
        assert_eq!(node.routing_table().adjacent_left(), peer(0, 0, 2));
        assert_eq!(node.routing_table().left_neighbors(), &[peer(1, 0, 2)]);
        assert!(node.io.cancelled.contains(&TimeoutKind::JoinAcceptResponse));

        let sent = node.io.take();
        assert_eq!(sent[0].0, ep(3000));
        assert_eq!(sent[0].1.body, MessageBody::JoinAcceptAck);
        assert_eq!(sent[0].1.header.ref_event_id, join.header.event_id);
    }

    #[test]
    fn busy_parent_drops_join() {
        let mut root = running_at(0, 0, 2);
        root.locked = true;
        let join = incoming(
            entering(9000),
            &root,
            0,
            MessageBody::Join {
                entering: entering(9000),
                hop_count: 0,
                progress: SearchProgress::None,
            },
        );
        root.handle_message(join).unwrap();
        assert!(root.io.sent.is_empty());
        assert!(root.accept_child.is_none());
    }

    #[test]
    fn wrong_adjacent_is_requested_then_corrected() {
        // 2:1 does not know its parent, only its left neighbor 2:0
        let mut node = running_at(2, 1, 2);
        node.routing.update_neighbor(peer(2, 0, 2)).unwrap();
        node.perform_accept_child(77, entering(9000)).unwrap();

        let sent = node.io.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer(2, 0, 2).endpoint().unwrap());
        assert_eq!(
            sent[0].1.body,
            MessageBody::GetNeighbors {
                send_back_to: node.self_ref(),
                relationships: vec![NeighborRelationship::AdjacentRight],
            }
        );

        let inform = incoming(
            peer(2, 0, 2),
            &node,
            77,
            MessageBody::InformAboutNeighbors {
                neighbors: vec![peer(1, 0, 2)],
            },
        );
        node.handle_message(inform).unwrap();
        let sent = node.io.take();
        match &sent[0].1.body {
            MessageBody::JoinAccept { adjacent_left, .. } => {
                assert_eq!(*adjacent_left, peer(1, 0, 2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ack_timeout_releases_lock() {
        let mut root = running_at(0, 0, 2);
        root.perform_accept_child(3, entering(9000)).unwrap();
        assert!(root.is_locked());
        root.handle_timeout(TimeoutKind::JoinAcceptAckResponse).unwrap();
        assert!(!root.is_locked());
        assert!(root.accept_child.is_none());
    }
}
