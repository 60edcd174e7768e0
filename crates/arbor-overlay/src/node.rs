//! The peer actor.
//!
//! A [`Node`] holds one peer's routing table and open procedures and reacts to
//! three kinds of input: decoded messages, fired timeouts and local commands
//! (the `initiate_*` methods of the protocol traits). Everything it emits goes
//! through its [`Capabilities`].
//!
//! Each protocol lives in its own module as a trait implemented for `Node`.
//! This module owns the shared plumbing: message dispatch, sending, timers and
//! the acknowledgement barriers.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::bootstrap::BootstrapProtocol;
use crate::capability::{Capabilities, TimeoutKind};
use crate::config::{OverlayConfig, MAX_HOPS};
use crate::error::{Error, Result};
use crate::join::JoinProtocol;
use crate::leave::LeaveProtocol;
use crate::message::{Message, MessageBody, MessageHeader, Protocol};
use crate::peer::{PeerRef, PhysicalEndpoint};
use crate::procedure::{
    AcceptChildState, AckBarriers, AckContinuation, LeaveState, ReplacingState,
};
use crate::response::ResponseProtocol;
use crate::routing_table::RoutingTable;
use crate::search_exact::SearchExactProtocol;
use arbor_tree::LogicalPosition;

/// Lifecycle of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Uninitialized,
    AwaitingBootstrap,
    AwaitingJoinAccept,
    Running,
    Left,
}

/// Lifecycle status refined by the procedure currently open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Uninitialized,
    AwaitingBootstrap,
    AwaitingJoinAccept,
    Idle,
    AcceptingChild,
    Leaving,
    Replacing,
    Left,
}

/// Discovery progress of a peer that has no position yet.
#[derive(Debug, Clone, Default)]
pub(crate) struct BootstrapState {
    pub candidates: Vec<PeerRef>,
    pub rounds: u32,
    pub join_retries: u32,
}

pub struct Node<C: Capabilities> {
    pub(crate) config: OverlayConfig,
    pub(crate) routing: RoutingTable,
    pub(crate) status: Status,
    pub(crate) locked: bool,
    pub(crate) accept_child: Option<AcceptChildState>,
    pub(crate) leave: Option<LeaveState>,
    pub(crate) replacing: Option<ReplacingState>,
    pub(crate) bootstrap: BootstrapState,
    pub(crate) acks: AckBarriers,
    armed: HashSet<TimeoutKind>,
    rng: StdRng,
    pub(crate) io: C,
}

fn endpoint_seed(endpoint: &PhysicalEndpoint) -> u64 {
    let address = match endpoint.address() {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    };
    (address as u64) ^ ((address >> 64) as u64) ^ (u64::from(endpoint.port()) << 48)
}

impl<C: Capabilities> Node<C> {
    /// Create an uninitialized peer listening on `endpoint`.
    pub fn new(config: OverlayConfig, endpoint: PhysicalEndpoint, io: C) -> Result<Self> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed ^ endpoint_seed(&endpoint));
        Ok(Self {
            routing: RoutingTable::new(config.fanout, endpoint),
            config,
            status: Status::Uninitialized,
            locked: false,
            accept_child: None,
            leave: None,
            replacing: None,
            bootstrap: BootstrapState::default(),
            acks: AckBarriers::default(),
            armed: HashSet::new(),
            rng,
            io,
        })
    }

    // --- inspection ---

    pub fn endpoint(&self) -> Option<PhysicalEndpoint> {
        self.routing.self_ref().endpoint()
    }

    pub fn position(&self) -> Option<LogicalPosition> {
        self.routing.position()
    }

    pub fn self_ref(&self) -> PeerRef {
        self.routing.self_ref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn phase(&self) -> Phase {
        match self.status {
            Status::Uninitialized => Phase::Uninitialized,
            Status::AwaitingBootstrap => Phase::AwaitingBootstrap,
            Status::AwaitingJoinAccept => Phase::AwaitingJoinAccept,
            Status::Left => Phase::Left,
            Status::Running if self.replacing.is_some() => Phase::Replacing,
            Status::Running if self.leave.is_some() => Phase::Leaving,
            Status::Running if self.accept_child.is_some() => Phase::AcceptingChild,
            Status::Running => Phase::Idle,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Locked, leaving or replacing. A busy peer drops Join and FindReplacement.
    pub fn is_busy(&self) -> bool {
        self.locked || self.leave.is_some() || self.replacing.is_some()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn io(&self) -> &C {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut C {
        &mut self.io
    }

    /// Timeouts currently armed.
    pub fn armed_timeouts(&self) -> impl Iterator<Item = TimeoutKind> + '_ {
        self.armed.iter().copied()
    }

    // --- inbound ---

    /// Decode `bytes` and handle the message.
    pub fn handle_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let message = Message::decode(bytes)?;
        self.handle_message(message)
    }

    /// Route a message to the protocol that owns its type.
    pub fn handle_message(&mut self, message: Message) -> Result<()> {
        let kind = message.message_type();
        let protocol = kind.protocol();

        if self.status == Status::Left && protocol != Protocol::Bootstrap {
            trace!(kind = ?kind, sender = %message.header.sender, "left, ignoring");
            return Ok(());
        }

        trace!(
            node = %self.routing.self_ref(),
            kind = ?kind,
            sender = %message.header.sender,
            event_id = message.header.event_id,
            ref_event_id = message.header.ref_event_id,
            "recv"
        );

        let Message { header, body } = message;
        match protocol {
            Protocol::Join => self.dispatch_join(header, body),
            Protocol::Leave => self.dispatch_leave(header, body),
            Protocol::SearchExact => self.dispatch_search_exact(header, body),
            Protocol::Response => self.dispatch_response(header, body),
            Protocol::Bootstrap => self.dispatch_bootstrap(header, body),
        }
    }

    fn dispatch_join(&mut self, header: MessageHeader, body: MessageBody) -> Result<()> {
        match body {
            MessageBody::Join {
                entering,
                hop_count,
                progress,
            } => self.process_join(&header, entering, hop_count, progress),
            MessageBody::JoinAccept {
                fanout,
                adjacent_left,
                adjacent_right,
                routing_neighbors,
            } => self.process_join_accept(
                &header,
                fanout,
                adjacent_left,
                adjacent_right,
                routing_neighbors,
            ),
            MessageBody::JoinAcceptAck => self.process_join_accept_ack(&header),
            other => Err(misrouted(Protocol::Join, &other)),
        }
    }

    fn dispatch_leave(&mut self, header: MessageHeader, body: MessageBody) -> Result<()> {
        match body {
            MessageBody::FindReplacement {
                node_to_replace,
                hop_count,
                progress,
            } => self.process_find_replacement(&header, node_to_replace, hop_count, progress),
            MessageBody::ReplacementOffer => self.process_replacement_offer(&header),
            MessageBody::ReplacementAck { neighbors, locked } => {
                self.process_replacement_ack(&header, neighbors, locked)
            }
            MessageBody::ReplacementNack => self.process_replacement_nack(&header),
            MessageBody::ReplacementUpdate {
                removed_position,
                replacement,
                acknowledge,
            } => self.process_replacement_update(&header, removed_position, replacement, acknowledge),
            MessageBody::SignOffParentRequest => self.process_sign_off_parent_request(&header),
            MessageBody::SignOffParentAnswer { successful } => {
                self.process_sign_off_parent_answer(&header, successful)
            }
            MessageBody::UnlockNeighbor => self.process_unlock_neighbor(&header),
            other => Err(misrouted(Protocol::Leave, &other)),
        }
    }

    fn dispatch_search_exact(&mut self, header: MessageHeader, body: MessageBody) -> Result<()> {
        match body {
            MessageBody::SearchExact {
                destination,
                origin,
                hop_count,
                payload,
            } => self.process_search_exact(&header, destination, origin, hop_count, payload),
            MessageBody::SearchExactFailure {
                destination,
                payload,
            } => self.process_search_exact_failure(&header, destination, payload),
            other => Err(misrouted(Protocol::SearchExact, &other)),
        }
    }

    fn dispatch_response(&mut self, header: MessageHeader, body: MessageBody) -> Result<()> {
        match body {
            MessageBody::UpdateNeighbors {
                neighbors,
                acknowledge,
            } => self.process_update_neighbors(&header, neighbors, acknowledge),
            MessageBody::GetNeighbors {
                send_back_to,
                relationships,
            } => self.process_get_neighbors(&header, send_back_to, relationships),
            MessageBody::InformAboutNeighbors { neighbors } => {
                self.process_inform_about_neighbors(&header, neighbors)
            }
            MessageBody::RemoveNeighbor {
                position,
                acknowledge,
            } => self.process_remove_neighbor(&header, position, acknowledge),
            MessageBody::RemoveNeighborAck => self.process_remove_neighbor_ack(&header),
            other => Err(misrouted(Protocol::Response, &other)),
        }
    }

    fn dispatch_bootstrap(&mut self, header: MessageHeader, body: MessageBody) -> Result<()> {
        match body {
            MessageBody::BootstrapDiscover { discovery } => {
                self.process_bootstrap_discover(&header, discovery)
            }
            MessageBody::BootstrapResponse { peer } => {
                self.process_bootstrap_response(&header, peer)
            }
            other => Err(misrouted(Protocol::Bootstrap, &other)),
        }
    }

    /// A timeout fired. Stale kinds (cancelled or never armed) are ignored.
    pub fn handle_timeout(&mut self, kind: TimeoutKind) -> Result<()> {
        if !self.armed.remove(&kind) {
            trace!(kind = ?kind, "stale timeout");
            return Ok(());
        }
        debug!(node = %self.routing.self_ref(), kind = ?kind, "timeout fired");
        match kind {
            TimeoutKind::BootstrapResponse => self.on_bootstrap_timeout(),
            TimeoutKind::JoinAcceptResponse => self.on_join_accept_timeout(),
            TimeoutKind::JoinAcceptAckResponse => self.on_join_accept_ack_timeout(),
            TimeoutKind::ReplacementOfferResponse => self.on_replacement_offer_timeout(),
            TimeoutKind::ReplacementAckResponse => self.on_replacement_ack_timeout(),
        }
    }

    // --- outbound ---

    fn next_event_id(&mut self) -> u64 {
        self.rng.gen_range(1..=u64::MAX)
    }

    /// Fresh id for a procedure started on this node.
    pub(crate) fn new_procedure_id(&mut self) -> u64 {
        self.next_event_id()
    }

    /// Send `body` to `to`. Returns the event id of the sent message.
    pub(crate) fn send(&mut self, to: &PeerRef, ref_event_id: u64, body: MessageBody) -> Result<u64> {
        let endpoint = to.endpoint().ok_or_else(|| {
            Error::violation(format!(
                "{:?} to {} without endpoint",
                body.message_type(),
                to
            ))
        })?;
        let event_id = self.next_event_id();
        let message = Message::new(
            MessageHeader {
                sender: self.routing.self_ref(),
                target: *to,
                event_id,
                ref_event_id,
            },
            body,
        );
        let bytes = message.encode()?;
        debug!(
            node = %self.routing.self_ref(),
            to = %to,
            kind = ?message.message_type(),
            event_id,
            ref_event_id,
            "send"
        );
        self.io.send(&endpoint, bytes);
        Ok(event_id)
    }

    pub(crate) fn multicast(&mut self, body: MessageBody) -> Result<u64> {
        let event_id = self.next_event_id();
        let message = Message::new(
            MessageHeader {
                sender: self.routing.self_ref(),
                target: PeerRef::unknown(),
                event_id,
                ref_event_id: 0,
            },
            body,
        );
        let bytes = message.encode()?;
        debug!(node = %self.routing.self_ref(), kind = ?message.message_type(), "multicast");
        self.io.multicast(bytes);
        Ok(event_id)
    }

    fn timeout_for(&self, kind: TimeoutKind) -> Duration {
        let t = &self.config.timeouts;
        match kind {
            TimeoutKind::BootstrapResponse => t.bootstrap_response,
            TimeoutKind::JoinAcceptResponse => t.join_accept_response,
            TimeoutKind::JoinAcceptAckResponse => t.join_accept_ack_response,
            TimeoutKind::ReplacementOfferResponse => t.replacement_offer_response,
            TimeoutKind::ReplacementAckResponse => t.replacement_ack_response,
        }
    }

    pub(crate) fn arm(&mut self, kind: TimeoutKind) {
        let after = self.timeout_for(kind);
        self.armed.insert(kind);
        self.io.set_timeout(kind, after);
    }

    pub(crate) fn disarm(&mut self, kind: TimeoutKind) {
        if self.armed.remove(&kind) {
            self.io.cancel_timeout(kind);
        }
    }

    pub(crate) fn disarm_all(&mut self) {
        let kinds: Vec<_> = self.armed.drain().collect();
        for kind in kinds {
            self.io.cancel_timeout(kind);
        }
    }

    /// Hop count for a forwarded Find-End request.
    pub(crate) fn forward_hop(&self, hop_count: u16) -> Result<u16> {
        let next = hop_count.saturating_add(1);
        if next > MAX_HOPS {
            return Err(Error::HopLimitExceeded { hops: next });
        }
        Ok(next)
    }

    // --- acknowledgement barriers ---

    pub(crate) fn wait_for_acks(
        &mut self,
        procedure_id: u64,
        count: u32,
        continuation: AckContinuation,
    ) -> Result<()> {
        trace!(procedure_id, count, continuation = ?continuation, "waiting for acks");
        match self.acks.wait(procedure_id, count, continuation) {
            Some(ready) => self.continue_after_acks(procedure_id, ready),
            None => Ok(()),
        }
    }

    pub(crate) fn receive_ack(&mut self, procedure_id: u64) -> Result<()> {
        if !self.acks.is_waiting(procedure_id) {
            warn!(node = %self.routing.self_ref(), procedure_id, "unexpected ack");
            return Ok(());
        }
        match self.acks.ack(procedure_id) {
            Some(ready) => self.continue_after_acks(procedure_id, ready),
            None => Ok(()),
        }
    }

    fn continue_after_acks(&mut self, procedure_id: u64, continuation: AckContinuation) -> Result<()> {
        debug!(procedure_id, continuation = ?continuation, "acks complete");
        match continuation {
            AckContinuation::AcceptChildComplete => {
                self.accept_child_complete();
                Ok(())
            }
            AckContinuation::SignOffParentComplete { child } => {
                self.send(
                    &child,
                    procedure_id,
                    MessageBody::SignOffParentAnswer { successful: true },
                )?;
                Ok(())
            }
            AckContinuation::ChildRetracted {
                requester,
                acknowledge,
            }
            | AckContinuation::ReplacementUpdateForwarded {
                requester,
                acknowledge,
            } => {
                if acknowledge {
                    self.send(&requester, procedure_id, MessageBody::RemoveNeighborAck)?;
                }
                Ok(())
            }
            AckContinuation::NeighborsSignedOff => self.neighbors_signed_off(procedure_id),
            AckContinuation::ReplacementUpdated => self.replacement_updated(procedure_id),
        }
    }

    /// Drop every procedure and timer and forget the position.
    pub(crate) fn reset_to(&mut self, status: Status) {
        self.routing.reset_position();
        self.status = status;
        self.locked = false;
        self.accept_child = None;
        self.leave = None;
        self.replacing = None;
        if !self.acks.is_empty() {
            debug!(
                node = %self.routing.self_ref(),
                pending = self.acks.len(),
                "dropping unfinished ack barriers"
            );
            self.acks.clear();
        }
        self.disarm_all();
    }
}

fn misrouted(protocol: Protocol, body: &MessageBody) -> Error {
    Error::violation(format!(
        "{:?} dispatched to {:?}",
        body.message_type(),
        protocol
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capability::{Delivery, Scheduler, Transport};
    use crate::routing_table::tests::{ep, peer, pos};

    /// Records everything a node emits.
    #[derive(Debug, Default)]
    pub(crate) struct Recorder {
        pub sent: Vec<(PhysicalEndpoint, Message)>,
        pub multicast: Vec<Message>,
        pub timeouts: Vec<TimeoutKind>,
        pub cancelled: Vec<TimeoutKind>,
        pub delivered: Vec<(PeerRef, Vec<u8>)>,
        pub failed: Vec<(LogicalPosition, Vec<u8>)>,
    }

    impl Transport for Recorder {
        fn send(&mut self, to: &PhysicalEndpoint, bytes: Vec<u8>) {
            self.sent.push((*to, Message::decode(&bytes).unwrap()));
        }

        fn multicast(&mut self, bytes: Vec<u8>) {
            self.multicast.push(Message::decode(&bytes).unwrap());
        }
    }

    impl Scheduler for Recorder {
        fn set_timeout(&mut self, kind: TimeoutKind, _after: Duration) {
            self.timeouts.push(kind);
        }

        fn cancel_timeout(&mut self, kind: TimeoutKind) {
            self.cancelled.push(kind);
        }
    }

    impl Delivery for Recorder {
        fn deliver(&mut self, from: PeerRef, payload: Vec<u8>) {
            self.delivered.push((from, payload));
        }

        fn search_failed(&mut self, destination: LogicalPosition, payload: Vec<u8>) {
            self.failed.push((destination, payload));
        }
    }

    impl Recorder {
        /// Drain sent messages.
        pub(crate) fn take(&mut self) -> Vec<(PhysicalEndpoint, Message)> {
            std::mem::take(&mut self.sent)
        }
    }

    /// Running node at `(level, number)` whose port matches `peer(level, number, fanout)`.
    pub(crate) fn running_at(level: u32, number: u32, fanout: u32) -> Node<Recorder> {
        let config = OverlayConfig::default().with_fanout(fanout).with_seed(1);
        let mut node = Node::new(
            config,
            ep(3000 + (level * 100 + number) as u16),
            Recorder::default(),
        )
        .unwrap();
        node.routing.set_position(pos(level, number, fanout)).unwrap();
        node.status = Status::Running;
        node
    }

    /// Message from `sender` to `node` with the given procedure reference.
    pub(crate) fn incoming(
        sender: PeerRef,
        node: &Node<Recorder>,
        ref_event_id: u64,
        body: MessageBody,
    ) -> Message {
        Message::new(
            MessageHeader {
                sender,
                target: node.self_ref(),
                event_id: 0xfeed,
                ref_event_id,
            },
            body,
        )
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = OverlayConfig::default().with_fanout(1);
        assert!(matches!(
            Node::new(config, ep(2000), Recorder::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn left_node_ignores_overlay_traffic() {
        let mut node = running_at(1, 0, 2);
        node.reset_to(Status::Left);
        let msg = incoming(peer(0, 0, 2), &node, 0, MessageBody::UnlockNeighbor);
        node.locked = true;
        node.handle_message(msg).unwrap();
        assert!(node.is_locked());
        assert!(node.io.sent.is_empty());
    }

    #[test]
    fn stale_timeout_is_ignored() {
        let mut node = running_at(0, 0, 2);
        node.handle_timeout(TimeoutKind::JoinAcceptAckResponse).unwrap();
        assert_eq!(node.status(), Status::Running);

        node.arm(TimeoutKind::ReplacementOfferResponse);
        node.disarm(TimeoutKind::ReplacementOfferResponse);
        assert_eq!(node.io.cancelled, vec![TimeoutKind::ReplacementOfferResponse]);
        node.handle_timeout(TimeoutKind::ReplacementOfferResponse).unwrap();
        assert_eq!(node.armed_timeouts().count(), 0);
    }

    #[test]
    fn send_requires_endpoint() {
        let mut node = running_at(0, 0, 2);
        let err = node
            .send(&PeerRef::at(pos(1, 0, 2)), 0, MessageBody::UnlockNeighbor)
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));

        let id = node.send(&peer(1, 0, 2), 9, MessageBody::UnlockNeighbor).unwrap();
        let (to, msg) = &node.io.sent[0];
        assert_eq!(*to, ep(3100));
        assert_eq!(msg.header.event_id, id);
        assert_eq!(msg.header.ref_event_id, 9);
        assert!(msg.header.sender.is_at(&pos(0, 0, 2)));
    }

    #[test]
    fn hop_ceiling() {
        let node = running_at(0, 0, 2);
        assert_eq!(node.forward_hop(0).unwrap(), 1);
        assert_eq!(node.forward_hop(MAX_HOPS - 1).unwrap(), MAX_HOPS);
        assert!(matches!(
            node.forward_hop(MAX_HOPS),
            Err(Error::HopLimitExceeded { hops }) if hops == MAX_HOPS + 1
        ));
    }

    #[test]
    fn event_ids_differ_per_endpoint() {
        let mut a = running_at(1, 0, 2);
        let mut b = running_at(1, 1, 2);
        assert_ne!(a.new_procedure_id(), b.new_procedure_id());
        assert_ne!(a.new_procedure_id(), 0);
    }

    #[test]
    fn reset_drops_pending_barriers() {
        let mut node = running_at(1, 0, 2);
        node.wait_for_acks(4, 2, AckContinuation::NeighborsSignedOff).unwrap();
        node.wait_for_acks(5, 1, AckContinuation::ReplacementUpdated).unwrap();
        assert_eq!(node.acks.len(), 2);

        node.reset_to(Status::Left);
        assert!(node.acks.is_empty());
        // late acks of the dropped procedures change nothing
        node.receive_ack(4).unwrap();
        assert_eq!(node.status(), Status::Left);
        assert!(node.io.sent.is_empty());
    }

    #[test]
    fn phase_reflects_procedures() {
        let mut node = running_at(0, 0, 2);
        assert_eq!(node.phase(), Phase::Idle);
        node.leave = Some(LeaveState {
            procedure_id: 1,
            phase: crate::procedure::LeavePhase::FindingReplacement,
        });
        assert_eq!(node.phase(), Phase::Leaving);
        assert!(node.is_busy());
    }
}
