//! Deterministic in-memory network of overlay peers.
//!
//! Messages travel through one FIFO queue and are handled one at a time, so a
//! run is fully reproducible for a given configuration. Timeouts never fire
//! on their own; the driver fires them with [`Simulation::fire_timeout`].

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use arbor_overlay::{
    BootstrapProtocol, Delivery, JoinProtocol, LeaveProtocol, Message, Node, OverlayConfig,
    PeerRef, PhysicalEndpoint, Scheduler, SearchExactProtocol, Status, TimeoutKind, Transport,
    DEFAULT_PORT,
};
use arbor_tree::{level_capacity, LogicalPosition};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SimError};
use crate::events::{SimEvent, Summary};

/// Capabilities of a simulated peer. Everything is buffered until the
/// simulation collects it.
#[derive(Debug, Default)]
pub struct SimIo {
    outbox: Vec<(PhysicalEndpoint, Vec<u8>)>,
    multicasts: Vec<Vec<u8>>,
    armed: BTreeSet<TimeoutKind>,
    delivered: Vec<(PeerRef, Vec<u8>)>,
    failed: Vec<(LogicalPosition, Vec<u8>)>,
}

impl SimIo {
    /// Timeouts the peer asked for and did not cancel.
    pub fn armed(&self) -> impl Iterator<Item = TimeoutKind> + '_ {
        self.armed.iter().copied()
    }
}

impl Transport for SimIo {
    fn send(&mut self, to: &PhysicalEndpoint, bytes: Vec<u8>) {
        self.outbox.push((*to, bytes));
    }

    fn multicast(&mut self, bytes: Vec<u8>) {
        self.multicasts.push(bytes);
    }
}

impl Scheduler for SimIo {
    fn set_timeout(&mut self, kind: TimeoutKind, _after: Duration) {
        self.armed.insert(kind);
    }

    fn cancel_timeout(&mut self, kind: TimeoutKind) {
        self.armed.remove(&kind);
    }
}

impl Delivery for SimIo {
    fn deliver(&mut self, from: PeerRef, payload: Vec<u8>) {
        self.delivered.push((from, payload));
    }

    fn search_failed(&mut self, destination: LogicalPosition, payload: Vec<u8>) {
        self.failed.push((destination, payload));
    }
}

/// Configuration for the simulation.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Configuration every peer is created with
    pub overlay: OverlayConfig,
    /// Address shared by all simulated peers
    pub address: IpAddr,
    /// Port of the first peer; later peers count up from here
    pub first_port: u16,
    /// Messages handled by one `run_until_quiescent` before giving up
    pub step_budget: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            overlay: OverlayConfig::default(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            first_port: DEFAULT_PORT,
            step_budget: 200_000,
        }
    }
}

impl SimulationConfig {
    #[must_use]
    pub fn with_fanout(mut self, fanout: u32) -> Self {
        self.overlay = self.overlay.with_fanout(fanout);
        self
    }
}

/// A search payload that reached its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub at: PhysicalEndpoint,
    pub position: Option<LogicalPosition>,
    pub origin: PeerRef,
    pub payload: Vec<u8>,
}

/// A search that found nobody at its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchFailure {
    pub origin: PhysicalEndpoint,
    pub destination: LogicalPosition,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct Envelope {
    from: Option<PhysicalEndpoint>,
    to: PhysicalEndpoint,
    bytes: Vec<u8>,
}

/// Output of one peer activation, taken out of its [`SimIo`].
struct Emitted {
    outbox: Vec<(PhysicalEndpoint, Vec<u8>)>,
    multicasts: Vec<Vec<u8>>,
    delivered: Vec<(PeerRef, Vec<u8>)>,
    failed: Vec<(LogicalPosition, Vec<u8>)>,
}

impl Emitted {
    fn take(io: &mut SimIo) -> Self {
        Self {
            outbox: std::mem::take(&mut io.outbox),
            multicasts: std::mem::take(&mut io.multicasts),
            delivered: std::mem::take(&mut io.delivered),
            failed: std::mem::take(&mut io.failed),
        }
    }
}

/// Drives many [`Node`]s over a FIFO in-memory network.
pub struct Simulation {
    config: SimulationConfig,
    nodes: BTreeMap<PhysicalEndpoint, Node<SimIo>>,
    queue: VecDeque<Envelope>,
    next_port: u16,
    step: u64,
    pub delivered: Vec<Delivered>,
    pub failures: Vec<SearchFailure>,
    pub events: Vec<SimEvent>,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            next_port: config.first_port,
            config,
            nodes: BTreeMap::new(),
            queue: VecDeque::new(),
            step: 0,
            delivered: Vec::new(),
            failures: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    // --- peers ---

    /// Create an uninitialized peer on the next free port.
    pub fn spawn_peer(&mut self) -> Result<PhysicalEndpoint> {
        let port = self.next_port;
        self.next_port = port.checked_add(1).ok_or(SimError::PortsExhausted)?;
        let endpoint = PhysicalEndpoint::from_parts(self.config.address, port)?;
        let node = Node::new(self.config.overlay.clone(), endpoint, SimIo::default())?;
        self.nodes.insert(endpoint, node);
        trace!(endpoint = %endpoint, "peer spawned");
        Ok(endpoint)
    }

    /// A new peer that founds a tree.
    pub fn add_root(&mut self) -> Result<PhysicalEndpoint> {
        let endpoint = self.spawn_peer()?;
        self.command(endpoint, |node| node.initiate_as_root())?;
        Ok(endpoint)
    }

    /// A new peer that joins through `contact`. Runs until the network settles.
    pub fn join_via(&mut self, contact: PhysicalEndpoint) -> Result<PhysicalEndpoint> {
        if !self.nodes.contains_key(&contact) {
            return Err(SimError::UnknownPeer(contact));
        }
        let endpoint = self.spawn_peer()?;
        self.command(endpoint, |node| node.initiate_join(contact))?;
        self.run_until_quiescent()?;
        Ok(endpoint)
    }

    /// A new peer that joins through the root, or founds the tree if there is none.
    pub fn join(&mut self) -> Result<PhysicalEndpoint> {
        match self.root() {
            Some(root) => self.join_via(root),
            None => self.add_root(),
        }
    }

    /// A new peer that finds its contact by multicast discovery.
    ///
    /// Fires the bootstrap and join-accept timeouts whenever the network
    /// settles with one of them armed, so a lone peer ends up as root.
    pub fn join_via_bootstrap(&mut self) -> Result<PhysicalEndpoint> {
        let endpoint = self.spawn_peer()?;
        self.command(endpoint, |node| node.initiate_bootstrap())?;

        let rounds = 2 * (self.config.overlay.bootstrap_retries as usize + 2);
        for _ in 0..rounds {
            self.run_until_quiescent()?;
            let pending: Vec<TimeoutKind> = match self.nodes.get(&endpoint) {
                Some(node) if node.status() != Status::Running => node
                    .armed_timeouts()
                    .filter(|kind| {
                        matches!(
                            kind,
                            TimeoutKind::BootstrapResponse | TimeoutKind::JoinAcceptResponse
                        )
                    })
                    .collect(),
                _ => Vec::new(),
            };
            if pending.is_empty() {
                break;
            }
            for kind in pending {
                self.fire_timeout(endpoint, kind)?;
            }
        }
        Ok(endpoint)
    }

    /// Let the peer at `endpoint` leave and run until the network settles.
    /// A peer that completed its departure is removed from the network.
    pub fn leave(&mut self, endpoint: PhysicalEndpoint) -> Result<()> {
        self.command(endpoint, |node| node.initiate_self_departure())?;
        self.run_until_quiescent()?;
        if self
            .nodes
            .get(&endpoint)
            .map(|node| node.status() == Status::Left)
            .unwrap_or(false)
        {
            self.nodes.remove(&endpoint);
            debug!(endpoint = %endpoint, "departed peer removed");
        }
        Ok(())
    }

    /// Route `payload` from `from` to `destination` and run until the network settles.
    pub fn search_exact(
        &mut self,
        from: PhysicalEndpoint,
        destination: LogicalPosition,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.command(from, |node| node.perform_search_exact(destination, payload))?;
        self.run_until_quiescent()?;
        Ok(())
    }

    // --- network ---

    /// Handle queued messages in FIFO order until none are left.
    /// Returns the number of messages handled.
    pub fn run_until_quiescent(&mut self) -> Result<usize> {
        let mut steps = 0;
        while let Some(envelope) = self.queue.pop_front() {
            if steps >= self.config.step_budget {
                self.queue.push_front(envelope);
                return Err(SimError::StepBudgetExhausted(steps));
            }
            steps += 1;
            self.step += 1;
            self.deliver(envelope);
        }
        Ok(steps)
    }

    /// Messages waiting in the network.
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Fire `kind` on the peer at `endpoint`. Stale timeouts are no-ops for the peer.
    pub fn fire_timeout(&mut self, endpoint: PhysicalEndpoint, kind: TimeoutKind) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&endpoint)
            .ok_or(SimError::UnknownPeer(endpoint))?;
        node.io_mut().armed.remove(&kind);
        self.step += 1;
        self.events.push(SimEvent::TimeoutFired {
            endpoint,
            kind,
            step: self.step,
        });
        self.command(endpoint, |node| node.handle_timeout(kind))
    }

    fn deliver(&mut self, envelope: Envelope) {
        let Envelope { from, to, bytes } = envelope;
        if !self.nodes.contains_key(&to) {
            trace!(to = %to, "no peer, message dropped");
            return;
        }

        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(error) => {
                self.reject(to, None, error.to_string());
                return;
            }
        };
        let kind = message.message_type();
        self.events.push(SimEvent::MessageDelivered {
            from,
            to,
            kind,
            step: self.step,
        });

        if let Err(error) = self.command(to, |node| node.handle_message(message)) {
            self.reject(to, Some(kind), error.to_string());
        }
    }

    fn reject(&mut self, to: PhysicalEndpoint, kind: Option<arbor_overlay::MessageType>, error: String) {
        warn!(to = %to, kind = ?kind, error = %error, "message rejected");
        self.events.push(SimEvent::MessageRejected {
            to,
            kind,
            error,
            step: self.step,
        });
    }

    /// Run `f` on one peer and collect whatever it emitted.
    fn command<F>(&mut self, endpoint: PhysicalEndpoint, f: F) -> Result<()>
    where
        F: FnOnce(&mut Node<SimIo>) -> arbor_overlay::Result<()>,
    {
        let node = self
            .nodes
            .get_mut(&endpoint)
            .ok_or(SimError::UnknownPeer(endpoint))?;
        let before = (node.status(), node.position());
        let result = f(node);
        let after = (node.status(), node.position());
        let emitted = Emitted::take(node.io_mut());

        self.record_transition(endpoint, before, after);
        self.collect(endpoint, after.1, emitted);
        result.map_err(SimError::from)
    }

    fn record_transition(
        &mut self,
        endpoint: PhysicalEndpoint,
        before: (Status, Option<LogicalPosition>),
        after: (Status, Option<LogicalPosition>),
    ) {
        let step = self.step;
        match (before, after) {
            ((from, _), (Status::Running, Some(position))) if from != Status::Running => {
                info!(endpoint = %endpoint, position = %position, "peer joined");
                self.events.push(SimEvent::NodeJoined {
                    endpoint,
                    position,
                    step,
                });
            }
            ((Status::Running, Some(from)), (Status::Running, Some(to))) if from != to => {
                info!(endpoint = %endpoint, from = %from, to = %to, "peer moved");
                self.events.push(SimEvent::NodeMoved {
                    endpoint,
                    from,
                    to,
                    step,
                });
            }
            ((from, position), (Status::Left, _)) if from != Status::Left => {
                info!(endpoint = %endpoint, "peer left");
                self.events.push(SimEvent::NodeLeft {
                    endpoint,
                    position,
                    step,
                });
            }
            _ => {}
        }
    }

    fn collect(
        &mut self,
        endpoint: PhysicalEndpoint,
        position: Option<LogicalPosition>,
        emitted: Emitted,
    ) {
        for (to, bytes) in emitted.outbox {
            self.queue.push_back(Envelope {
                from: Some(endpoint),
                to,
                bytes,
            });
        }
        for bytes in emitted.multicasts {
            let others: Vec<PhysicalEndpoint> = self
                .nodes
                .keys()
                .copied()
                .filter(|other| *other != endpoint)
                .collect();
            for to in others {
                self.queue.push_back(Envelope {
                    from: Some(endpoint),
                    to,
                    bytes: bytes.clone(),
                });
            }
        }
        for (origin, payload) in emitted.delivered {
            self.events.push(SimEvent::SearchDelivered {
                at: endpoint,
                origin: origin.position(),
                bytes: payload.len(),
                step: self.step,
            });
            self.delivered.push(Delivered {
                at: endpoint,
                position,
                origin,
                payload,
            });
        }
        for (destination, payload) in emitted.failed {
            self.events.push(SimEvent::SearchFailed {
                origin: endpoint,
                destination,
                step: self.step,
            });
            self.failures.push(SearchFailure {
                origin: endpoint,
                destination,
                payload,
            });
        }
    }

    // --- inspection ---

    pub fn node(&self, endpoint: PhysicalEndpoint) -> Option<&Node<SimIo>> {
        self.nodes.get(&endpoint)
    }

    /// Every peer still in the network, running or not.
    pub fn endpoints(&self) -> impl Iterator<Item = PhysicalEndpoint> + '_ {
        self.nodes.keys().copied()
    }

    pub fn running(&self) -> impl Iterator<Item = &Node<SimIo>> + '_ {
        self.nodes
            .values()
            .filter(|node| node.status() == Status::Running)
    }

    pub fn running_count(&self) -> usize {
        self.running().count()
    }

    /// The running peer at the root position.
    pub fn root(&self) -> Option<PhysicalEndpoint> {
        self.running()
            .find(|node| node.position().map(|p| p.is_root()).unwrap_or(false))
            .and_then(|node| node.endpoint())
    }

    /// The running peer at `position`.
    pub fn endpoint_at(&self, position: &LogicalPosition) -> Option<PhysicalEndpoint> {
        self.running()
            .find(|node| node.position().as_ref() == Some(position))
            .and_then(|node| node.endpoint())
    }

    /// Positions of all running peers, in breadth-first order.
    pub fn positions(&self) -> Vec<(PhysicalEndpoint, LogicalPosition)> {
        let mut out: Vec<_> = self
            .running()
            .filter_map(|node| Some((node.endpoint()?, node.position()?)))
            .collect();
        out.sort_by_key(|(_, p)| (p.level(), p.number()));
        out
    }

    pub fn summary(&self) -> Summary {
        Summary::from_events(&self.events)
    }

    /// Occupied slots by `(level, number)`. Reports duplicates and foreign fanouts.
    fn occupancy(&self, violations: &mut Vec<String>) -> BTreeMap<(u32, u32), PhysicalEndpoint> {
        let fanout = self.config.overlay.fanout;
        let mut occupied = BTreeMap::new();
        for (endpoint, node) in &self.nodes {
            if node.status() != Status::Running {
                continue;
            }
            let Some(position) = node.position() else {
                violations.push(format!("{} is running without a position", endpoint));
                continue;
            };
            if position.fanout() != fanout {
                violations.push(format!("{} has fanout {}, expected {}", position, position.fanout(), fanout));
            }
            if let Some(other) = occupied.insert((position.level(), position.number()), *endpoint) {
                violations.push(format!("{} is held by both {} and {}", position, other, endpoint));
            }
        }
        occupied
    }

    /// Violations of the complete-tree shape and of parent/child links.
    pub fn check_complete_tree(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let occupied = self.occupancy(&mut violations);
        let expected = breadth_first(self.config.overlay.fanout, occupied.len());
        let expected_keys: HashSet<(u32, u32)> =
            expected.iter().map(|p| (p.level(), p.number())).collect();

        for position in &expected {
            if !occupied.contains_key(&(position.level(), position.number())) {
                violations.push(format!("gap at {}", position));
            }
        }
        for (level, number) in occupied.keys() {
            if !expected_keys.contains(&(*level, *number)) {
                violations.push(format!(
                    "{}:{} lies outside a complete tree of {} peers",
                    level,
                    number,
                    occupied.len()
                ));
            }
        }

        for node in self.running() {
            let (Some(endpoint), Some(position)) = (node.endpoint(), node.position()) else {
                continue;
            };
            let table = node.routing_table();

            match position.parent() {
                Some(parent) => {
                    let holder = occupied.get(&(parent.level(), parent.number()));
                    let known = table.parent();
                    match holder {
                        Some(holder) if known.endpoint() == Some(*holder) => {}
                        Some(holder) => violations.push(format!(
                            "{} at {} knows parent {}, expected {}",
                            endpoint, position, known, holder
                        )),
                        None => violations.push(format!("parent of {} is vacant", position)),
                    }
                }
                None if table.parent().exists() => {
                    violations.push(format!("root {} has a parent", endpoint))
                }
                None => {}
            }

            for child in table.children() {
                let Some(slot) = child.position() else {
                    violations.push(format!("{} has a child slot without position", position));
                    continue;
                };
                let holder = occupied.get(&(slot.level(), slot.number()));
                match (holder, child.exists()) {
                    (Some(holder), true) if child.endpoint() == Some(*holder) => {}
                    (None, false) => {}
                    (Some(holder), _) => violations.push(format!(
                        "{} knows child {} as {}, held by {}",
                        position, slot, child, holder
                    )),
                    (None, true) => violations.push(format!(
                        "{} still knows departed child {}",
                        position, child
                    )),
                }
            }
        }
        violations
    }

    /// Violations of the adjacency chain: every peer's adjacents must be its
    /// exact predecessor and successor by horizontal value.
    pub fn check_adjacency(&self) -> Vec<String> {
        let mut peers: Vec<PeerRef> = self.running().map(|node| node.self_ref()).collect();
        peers.sort_by(|a, b| a.horizontal_value().cmp(&b.horizontal_value()));

        let mut violations = Vec::new();
        for (i, peer) in peers.iter().enumerate() {
            let Some(node) = peer.endpoint().and_then(|e| self.nodes.get(&e)) else {
                continue;
            };
            let table = node.routing_table();
            let expected_left = i.checked_sub(1).map(|j| peers[j]);
            let expected_right = peers.get(i + 1).copied();

            for (side, known, expected) in [
                ("left", table.adjacent_left(), expected_left),
                ("right", table.adjacent_right(), expected_right),
            ] {
                match expected {
                    Some(expected) if known.exists() && known == expected => {}
                    None if !known.exists() => {}
                    Some(expected) => violations.push(format!(
                        "{} has adjacent {} {}, expected {}",
                        peer, side, known, expected
                    )),
                    None => violations.push(format!(
                        "{} has adjacent {} {}, expected none",
                        peer, side, known
                    )),
                }
            }
        }
        violations
    }

    /// Routing-table neighbors and neighbor children that point to the wrong
    /// peer or miss an occupied slot.
    pub fn check_routing_tables(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let occupied = self.occupancy(&mut violations);

        for node in self.running() {
            let Some(position) = node.position() else {
                continue;
            };
            let table = node.routing_table();
            let slots = table
                .routing_table_neighbors()
                .iter()
                .chain(table.routing_table_neighbor_children());
            for entry in slots {
                let Some(slot) = entry.position() else {
                    continue;
                };
                let holder = occupied.get(&(slot.level(), slot.number()));
                match (holder, entry.exists()) {
                    (Some(holder), true) if entry.endpoint() == Some(*holder) => {}
                    (None, false) => {}
                    (Some(holder), false) => violations.push(format!(
                        "{} does not know {} at {}",
                        position, holder, slot
                    )),
                    (Some(holder), true) => violations.push(format!(
                        "{} knows {} at {}, held by {}",
                        position, entry, slot, holder
                    )),
                    (None, true) => violations.push(format!(
                        "{} knows {} at vacant {}",
                        position, entry, slot
                    )),
                }
            }
        }
        violations
    }
}

/// The first `count` positions of a complete tree in breadth-first order.
pub fn breadth_first(fanout: u32, count: usize) -> Vec<LogicalPosition> {
    let mut out = Vec::with_capacity(count);
    let mut level = 0;
    while out.len() < count {
        for number in 0..level_capacity(level, fanout) {
            if out.len() == count {
                break;
            }
            let Ok(number) = u32::try_from(number) else {
                return out;
            };
            match LogicalPosition::new(level, number, fanout) {
                Ok(position) => out.push(position),
                Err(_) => return out,
            }
        }
        level += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim(fanout: u32) -> Simulation {
        Simulation::new(SimulationConfig::default().with_fanout(fanout))
    }

    #[test]
    fn simulation_starts_empty() {
        let sim = sim(2);
        assert_eq!(sim.running_count(), 0);
        assert!(sim.events.is_empty());
        assert!(sim.check_complete_tree().is_empty());
    }

    #[test]
    fn first_peer_is_root() {
        let mut sim = sim(2);
        let root = sim.add_root().unwrap();
        assert_eq!(sim.root(), Some(root));
        assert_eq!(sim.positions(), vec![(root, LogicalPosition::root(2).unwrap())]);
        assert!(matches!(sim.events[0], SimEvent::NodeJoined { .. }));
    }

    #[test]
    fn ports_count_up() {
        let mut sim = sim(2);
        let a = sim.spawn_peer().unwrap();
        let b = sim.spawn_peer().unwrap();
        assert_eq!(a.port(), DEFAULT_PORT);
        assert_eq!(b.port(), DEFAULT_PORT + 1);
    }

    #[test]
    fn unknown_contact_is_refused() {
        let mut sim = sim(2);
        let nowhere = PhysicalEndpoint::new("127.0.0.1", 9).unwrap();
        assert!(matches!(sim.join_via(nowhere), Err(SimError::UnknownPeer(_))));
    }

    #[test]
    fn three_peers_fill_the_first_two_levels() {
        let mut sim = sim(2);
        let root = sim.add_root().unwrap();
        let left = sim.join_via(root).unwrap();
        let right = sim.join_via(root).unwrap();

        assert_eq!(
            sim.positions(),
            vec![
                (root, LogicalPosition::new(0, 0, 2).unwrap()),
                (left, LogicalPosition::new(1, 0, 2).unwrap()),
                (right, LogicalPosition::new(1, 1, 2).unwrap()),
            ]
        );
        assert!(sim.check_complete_tree().is_empty());
        assert!(sim.check_adjacency().is_empty());
        assert_eq!(sim.in_flight(), 0);
    }

    #[test]
    fn step_budget_stops_the_run() {
        let mut sim = Simulation::new(SimulationConfig {
            step_budget: 1,
            ..SimulationConfig::default()
        });
        let root = sim.add_root().unwrap();
        // the Join and the JoinAccept alone already take two steps
        assert!(matches!(
            sim.join_via(root),
            Err(SimError::StepBudgetExhausted(1))
        ));
        assert!(sim.in_flight() > 0);
    }

    #[test]
    fn breadth_first_order() {
        assert_eq!(breadth_first(3, 6).len(), 6);
        assert_eq!(breadth_first(3, 6)[5], LogicalPosition::new(2, 1, 3).unwrap());
        assert_eq!(
            breadth_first(2, 4),
            vec![
                LogicalPosition::new(0, 0, 2).unwrap(),
                LogicalPosition::new(1, 0, 2).unwrap(),
                LogicalPosition::new(1, 1, 2).unwrap(),
                LogicalPosition::new(2, 0, 2).unwrap(),
            ]
        );
    }

    #[test]
    fn stale_timeout_is_recorded_but_harmless() {
        let mut sim = sim(2);
        let root = sim.add_root().unwrap();
        sim.fire_timeout(root, TimeoutKind::JoinAcceptAckResponse).unwrap();
        assert!(matches!(sim.events.last(), Some(SimEvent::TimeoutFired { .. })));
        assert_eq!(sim.running_count(), 1);
    }
}
