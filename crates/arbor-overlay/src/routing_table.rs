//! Per-node routing state.
//!
//! The table knows, for its owner's position:
//!
//! - the parent and the `fanout` child slots,
//! - the two adjacents (nearest existing peers by horizontal value),
//! - the routing-table neighbors on the owner's level, stored left to right,
//! - the children of those neighbors, also left to right.
//!
//! Setting a position pre-populates every slot with its position only. A slot
//! becomes an existing peer once an endpoint for it is learned.

use arbor_tree::{routing_positions, HorizontalValue, LogicalPosition};

use crate::error::{Error, Result};
use crate::peer::{PeerRef, PhysicalEndpoint};

#[derive(Debug, Clone)]
pub struct RoutingTable {
    fanout: u32,
    self_ref: PeerRef,
    parent: PeerRef,
    children: Vec<PeerRef>,
    adjacent_left: PeerRef,
    adjacent_right: PeerRef,
    neighbors: Vec<PeerRef>,
    right_start: usize,
    neighbor_children: Vec<PeerRef>,
    right_children_start: usize,
}

impl RoutingTable {
    /// Empty table for a peer that has no position yet.
    pub fn new(fanout: u32, endpoint: PhysicalEndpoint) -> Self {
        Self {
            fanout,
            self_ref: PeerRef::unpositioned(endpoint),
            parent: PeerRef::unknown(),
            children: Vec::new(),
            adjacent_left: PeerRef::unknown(),
            adjacent_right: PeerRef::unknown(),
            neighbors: Vec::new(),
            right_start: 0,
            neighbor_children: Vec::new(),
            right_children_start: 0,
        }
    }

    pub fn fanout(&self) -> u32 {
        self.fanout
    }

    pub fn self_ref(&self) -> PeerRef {
        self.self_ref
    }

    pub fn position(&self) -> Option<LogicalPosition> {
        self.self_ref.position()
    }

    /// Own position, or `NotRunning` if none is set.
    pub fn require_position(&self) -> Result<LogicalPosition> {
        self.self_ref.position().ok_or(Error::NotRunning)
    }

    fn self_value(&self) -> Result<HorizontalValue> {
        Ok(self.require_position()?.horizontal_value())
    }

    /// Take `position` and rebuild every slot from it.
    pub fn set_position(&mut self, position: LogicalPosition) -> Result<()> {
        if position.fanout() != self.fanout {
            return Err(Error::violation(format!(
                "position {} has fanout {}, table has {}",
                position,
                position.fanout(),
                self.fanout
            )));
        }

        let endpoint = self.self_ref.endpoint();
        self.self_ref = PeerRef::at(position);
        if let Some(endpoint) = endpoint {
            self.self_ref = self.self_ref.with_endpoint(endpoint);
        }

        self.parent = position.parent().map(PeerRef::at).unwrap_or_default();
        self.children = position.children().into_iter().map(PeerRef::at).collect();
        self.adjacent_left = PeerRef::unknown();
        self.adjacent_right = PeerRef::unknown();

        let (positions, split) = routing_positions(&position);
        self.neighbors = positions.iter().copied().map(PeerRef::at).collect();
        self.right_start = split;

        self.neighbor_children.clear();
        self.right_children_start = 0;
        for (i, pos) in positions.iter().enumerate() {
            if i == split {
                self.right_children_start = self.neighbor_children.len();
            }
            self.neighbor_children
                .extend(pos.children().into_iter().map(PeerRef::at));
        }
        if split == positions.len() {
            self.right_children_start = self.neighbor_children.len();
        }
        Ok(())
    }

    /// Forget the position and everything derived from it.
    pub fn reset_position(&mut self) {
        let endpoint = self.self_ref.endpoint();
        self.self_ref = endpoint.map(PeerRef::unpositioned).unwrap_or_default();
        self.parent = PeerRef::unknown();
        self.children.clear();
        self.adjacent_left = PeerRef::unknown();
        self.adjacent_right = PeerRef::unknown();
        self.neighbors.clear();
        self.right_start = 0;
        self.neighbor_children.clear();
        self.right_children_start = 0;
    }

    // --- parent / children ---

    pub fn parent(&self) -> PeerRef {
        self.parent
    }

    pub fn set_parent(&mut self, peer: PeerRef) -> Result<()> {
        if !self.parent.has_position() || !peer.same_position(&self.parent) {
            return Err(Error::violation(format!("{} is not our parent slot", peer)));
        }
        self.parent = peer;
        Ok(())
    }

    pub fn children(&self) -> &[PeerRef] {
        &self.children
    }

    pub fn child(&self, index: usize) -> Option<PeerRef> {
        self.children.get(index).copied()
    }

    pub fn set_child(&mut self, peer: PeerRef) -> Result<()> {
        let own = self.require_position()?;
        let pos = peer
            .position()
            .ok_or_else(|| Error::violation("child without position"))?;
        if !pos.is_child_of(&own) {
            return Err(Error::violation(format!("{} is not a child of {}", pos, own)));
        }
        let index = pos.child_index() as usize;
        match self.children.get_mut(index) {
            Some(slot) => {
                *slot = peer;
                Ok(())
            }
            None => Err(Error::violation(format!("child slot {} out of range", index))),
        }
    }

    pub fn reset_child(&mut self, index: usize) {
        if let Some(slot) = self.children.get_mut(index) {
            *slot = slot.vacated();
        }
    }

    pub fn existing_children(&self) -> Vec<PeerRef> {
        self.children.iter().filter(|c| c.exists()).copied().collect()
    }

    pub fn children_full(&self) -> bool {
        self.children.iter().all(|c| c.exists())
    }

    // --- adjacents ---

    pub fn adjacent_left(&self) -> PeerRef {
        self.adjacent_left
    }

    pub fn adjacent_right(&self) -> PeerRef {
        self.adjacent_right
    }

    pub fn set_adjacent_left(&mut self, peer: PeerRef) -> Result<()> {
        let value = peer
            .horizontal_value()
            .ok_or_else(|| Error::violation("adjacent without position"))?;
        if value >= self.self_value()? {
            return Err(Error::violation(format!(
                "adjacent left {} is not left of us",
                peer
            )));
        }
        self.adjacent_left = peer;
        Ok(())
    }

    pub fn set_adjacent_right(&mut self, peer: PeerRef) -> Result<()> {
        let value = peer
            .horizontal_value()
            .ok_or_else(|| Error::violation("adjacent without position"))?;
        if value <= self.self_value()? {
            return Err(Error::violation(format!(
                "adjacent right {} is not right of us",
                peer
            )));
        }
        self.adjacent_right = peer;
        Ok(())
    }

    pub fn reset_adjacent_left(&mut self) {
        self.adjacent_left = PeerRef::unknown();
    }

    pub fn reset_adjacent_right(&mut self) {
        self.adjacent_right = PeerRef::unknown();
    }

    // --- routing-table neighbors ---

    pub fn routing_table_neighbors(&self) -> &[PeerRef] {
        &self.neighbors
    }

    pub fn left_neighbors(&self) -> &[PeerRef] {
        &self.neighbors[..self.right_start]
    }

    pub fn right_neighbors(&self) -> &[PeerRef] {
        &self.neighbors[self.right_start..]
    }

    pub fn routing_table_neighbor_children(&self) -> &[PeerRef] {
        &self.neighbor_children
    }

    pub fn left_neighbor_children(&self) -> &[PeerRef] {
        &self.neighbor_children[..self.right_children_start]
    }

    pub fn right_neighbor_children(&self) -> &[PeerRef] {
        &self.neighbor_children[self.right_children_start..]
    }

    pub fn direct_left_neighbor(&self) -> Option<PeerRef> {
        self.left_neighbors().last().copied()
    }

    pub fn direct_right_neighbor(&self) -> Option<PeerRef> {
        self.right_neighbors().first().copied()
    }

    pub fn leftmost_neighbor(&self) -> Option<PeerRef> {
        self.left_neighbors().first().copied()
    }

    pub fn rightmost_neighbor(&self) -> Option<PeerRef> {
        self.right_neighbors().last().copied()
    }

    pub fn leftmost_neighbor_child(&self) -> Option<PeerRef> {
        self.left_neighbor_children().first().copied()
    }

    pub fn existing_routing_table_neighbors(&self) -> Vec<PeerRef> {
        self.neighbors.iter().filter(|n| n.exists()).copied().collect()
    }

    pub fn existing_routing_table_neighbor_children(&self) -> Vec<PeerRef> {
        self.neighbor_children
            .iter()
            .filter(|n| n.exists())
            .copied()
            .collect()
    }

    /// Existing left neighbors followed by existing left neighbor children.
    pub fn existing_left_neighbors_and_children(&self) -> Vec<PeerRef> {
        self.left_neighbors()
            .iter()
            .chain(self.left_neighbor_children())
            .filter(|n| n.exists())
            .copied()
            .collect()
    }

    /// Existing right neighbors followed by existing right neighbor children.
    pub fn existing_right_neighbors_and_children(&self) -> Vec<PeerRef> {
        self.right_neighbors()
            .iter()
            .chain(self.right_neighbor_children())
            .filter(|n| n.exists())
            .copied()
            .collect()
    }

    /// Resolve the neighbor slot at `peer`'s position. Returns whether a slot matched.
    pub fn update_routing_table_neighbor(&mut self, peer: PeerRef) -> bool {
        update_slot(&mut self.neighbors, peer)
    }

    pub fn update_routing_table_neighbor_child(&mut self, peer: PeerRef) -> bool {
        update_slot(&mut self.neighbor_children, peer)
    }

    pub fn reset_routing_table_neighbor(&mut self, position: &LogicalPosition) -> bool {
        vacate_slot(&mut self.neighbors, position)
    }

    pub fn reset_routing_table_neighbor_child(&mut self, position: &LogicalPosition) -> bool {
        vacate_slot(&mut self.neighbor_children, position)
    }

    // --- classification ---

    /// Put `peer` into every slot its position occupies.
    pub fn update_neighbor(&mut self, peer: PeerRef) -> Result<()> {
        let own = self.require_position()?;
        let pos = peer
            .position()
            .ok_or_else(|| Error::violation("neighbor update without position"))?;
        if !peer.exists() {
            return Err(Error::violation(format!("{} does not exist", peer)));
        }
        if pos == own {
            return Ok(());
        }

        if self.adjacent_left.is_at(&pos) {
            self.adjacent_left = peer;
        } else if self.adjacent_right.is_at(&pos) {
            self.adjacent_right = peer;
        }

        if self.parent.is_at(&pos) {
            self.parent = peer;
        }

        if pos.level() == own.level() {
            self.update_routing_table_neighbor(peer);
        } else if pos.level() == own.level() + 1 {
            if pos.is_child_of(&own) {
                self.set_child(peer)?;
            } else {
                self.update_routing_table_neighbor_child(peer);
            }
        }
        Ok(())
    }

    /// Vacate every slot at `position`. The parent can only be replaced, never removed.
    pub fn remove_neighbor(&mut self, position: &LogicalPosition) -> Result<()> {
        let own = self.require_position()?;
        if self.parent.is_at(position) {
            return Err(Error::violation("parent cannot be removed"));
        }

        if self.adjacent_left.is_at(position) {
            self.reset_adjacent_left();
        } else if self.adjacent_right.is_at(position) {
            self.reset_adjacent_right();
        }

        if position.level() == own.level() {
            self.reset_routing_table_neighbor(position);
        } else if position.level() == own.level() + 1 {
            if position.is_child_of(&own) {
                self.reset_child(position.child_index() as usize);
            } else {
                self.reset_routing_table_neighbor_child(position);
            }
        }
        Ok(())
    }

    // --- aggregate views ---

    /// Peers that also hold us: parent, children, neighbors and adjacents. Unique by position.
    pub fn all_symmetric_existing_neighbors(&self) -> Vec<PeerRef> {
        let mut out = Vec::new();
        if self.parent.exists() {
            out.push(self.parent);
        }
        out.extend(self.existing_children());
        out.extend(self.existing_routing_table_neighbors());
        for adj in [self.adjacent_left, self.adjacent_right] {
            if adj.exists() && !out.iter().any(|n| n.same_position(&adj)) {
                out.push(adj);
            }
        }
        out
    }

    /// Symmetric neighbors plus existing neighbor children.
    pub fn all_known_existing_neighbors(&self) -> Vec<PeerRef> {
        let mut out = self.all_symmetric_existing_neighbors();
        for child in self.existing_routing_table_neighbor_children() {
            if !out.iter().any(|n| n.same_position(&child)) {
                out.push(child);
            }
        }
        out
    }

    /// Known existing peer at `(level, number)`, never ourselves.
    pub fn node_by_position(&self, level: u32, number: u32) -> Option<PeerRef> {
        self.all_known_existing_neighbors().into_iter().find(|n| {
            n.position()
                .map(|p| p.level() == level && p.number() == number)
                .unwrap_or(false)
        })
    }

    /// Closest known existing peer (or self) strictly left of `value`.
    pub fn closest_known_left_of(&self, value: HorizontalValue) -> Option<PeerRef> {
        let mut candidates = self.all_known_existing_neighbors();
        candidates.push(self.self_ref);
        candidates
            .into_iter()
            .filter_map(|n| n.horizontal_value().map(|v| (v, n)))
            .filter(|(v, _)| *v < value)
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, n)| n)
    }

    /// Closest known existing peer (or self) strictly right of `value`.
    pub fn closest_known_right_of(&self, value: HorizontalValue) -> Option<PeerRef> {
        let mut candidates = self.all_known_existing_neighbors();
        candidates.push(self.self_ref);
        candidates
            .into_iter()
            .filter_map(|n| n.horizontal_value().map(|v| (v, n)))
            .filter(|(v, _)| *v > value)
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, n)| n)
    }
}

fn update_slot(slots: &mut [PeerRef], peer: PeerRef) -> bool {
    match slots.iter_mut().find(|s| s.same_position(&peer)) {
        Some(slot) => {
            *slot = peer;
            true
        }
        None => false,
    }
}

fn vacate_slot(slots: &mut [PeerRef], position: &LogicalPosition) -> bool {
    match slots.iter_mut().find(|s| s.is_at(position)) {
        Some(slot) => {
            *slot = slot.vacated();
            true
        }
        None => false,
    }
}

impl std::fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "self: {}", self.self_ref)?;
        writeln!(f, "parent: {}", self.parent)?;
        write!(f, "children:")?;
        for c in &self.children {
            write!(f, " {}", c)?;
        }
        writeln!(f)?;
        writeln!(f, "adjacent: {} | {}", self.adjacent_left, self.adjacent_right)?;
        write!(f, "neighbors:")?;
        for (i, n) in self.neighbors.iter().enumerate() {
            if i == self.right_start {
                write!(f, " |")?;
            }
            write!(f, " {}", n)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ep(port: u16) -> PhysicalEndpoint {
        PhysicalEndpoint::new("127.0.0.1", port).unwrap()
    }

    pub(crate) fn pos(level: u32, number: u32, fanout: u32) -> LogicalPosition {
        LogicalPosition::new(level, number, fanout).unwrap()
    }

    /// Existing peer at `(level, number)`; the port encodes the position.
    pub(crate) fn peer(level: u32, number: u32, fanout: u32) -> PeerRef {
        PeerRef::resolved(
            pos(level, number, fanout),
            ep(3000 + (level * 100 + number) as u16),
        )
    }

    pub(crate) fn table_at(level: u32, number: u32, fanout: u32) -> RoutingTable {
        let mut t = RoutingTable::new(fanout, ep(3000 + (level * 100 + number) as u16));
        t.set_position(pos(level, number, fanout)).unwrap();
        t
    }

    #[test]
    fn set_position_prepopulates_slots() {
        let t = table_at(2, 1, 2);
        assert!(t.parent().is_at(&pos(1, 0, 2)));
        assert!(!t.parent().exists());
        assert_eq!(t.children().len(), 2);
        assert!(t.children()[1].is_at(&pos(3, 3, 2)));

        let left: Vec<u32> = t.left_neighbors().iter().filter_map(|n| n.number()).collect();
        let right: Vec<u32> = t.right_neighbors().iter().filter_map(|n| n.number()).collect();
        assert_eq!(left, vec![0]);
        assert_eq!(right, vec![2, 3]);

        let lc: Vec<u32> = t
            .left_neighbor_children()
            .iter()
            .filter_map(|n| n.number())
            .collect();
        let rc: Vec<u32> = t
            .right_neighbor_children()
            .iter()
            .filter_map(|n| n.number())
            .collect();
        assert_eq!(lc, vec![0, 1]);
        assert_eq!(rc, vec![4, 5, 6, 7]);
        assert!(t.all_known_existing_neighbors().is_empty());
    }

    #[test]
    fn root_has_no_parent_slot() {
        let t = table_at(0, 0, 3);
        assert!(!t.parent().has_position());
        assert!(t.routing_table_neighbors().is_empty());
        assert!(t.direct_left_neighbor().is_none());
        assert!(t.leftmost_neighbor_child().is_none());
    }

    #[test]
    fn adjacent_side_is_validated() {
        let mut t = table_at(1, 0, 2);
        assert!(t.set_adjacent_left(peer(2, 0, 2)).is_ok());
        assert!(t.set_adjacent_left(peer(0, 0, 2)).is_err());
        assert!(t.set_adjacent_right(peer(0, 0, 2)).is_ok());
        assert!(t.set_adjacent_right(peer(2, 0, 2)).is_err());
    }

    #[test]
    fn update_neighbor_classifies() {
        let mut t = table_at(1, 1, 2);
        t.update_neighbor(peer(0, 0, 2)).unwrap();
        t.update_neighbor(peer(1, 0, 2)).unwrap();
        t.update_neighbor(peer(2, 3, 2)).unwrap();
        t.update_neighbor(peer(2, 0, 2)).unwrap();

        assert!(t.parent().exists());
        assert!(t.direct_left_neighbor().unwrap().exists());
        assert!(t.children()[1].exists());
        assert!(t.leftmost_neighbor_child().unwrap().exists());
        assert_eq!(t.all_symmetric_existing_neighbors().len(), 3);
        assert_eq!(t.all_known_existing_neighbors().len(), 4);
        assert_eq!(t.node_by_position(2, 0), Some(peer(2, 0, 2)));
        assert_eq!(t.node_by_position(1, 1), None);
    }

    #[test]
    fn remove_neighbor_vacates() {
        let mut t = table_at(1, 0, 2);
        t.update_neighbor(peer(0, 0, 2)).unwrap();
        t.update_neighbor(peer(1, 1, 2)).unwrap();
        t.update_neighbor(peer(2, 1, 2)).unwrap();
        t.update_neighbor(peer(2, 2, 2)).unwrap();
        t.set_adjacent_right(peer(2, 1, 2)).unwrap();

        t.remove_neighbor(&pos(2, 1, 2)).unwrap();
        assert!(!t.children()[1].exists());
        assert!(t.children()[1].has_position());
        assert!(!t.adjacent_right().has_position());

        t.remove_neighbor(&pos(2, 2, 2)).unwrap();
        assert!(t.existing_routing_table_neighbor_children().is_empty());

        t.remove_neighbor(&pos(1, 1, 2)).unwrap();
        assert!(t.existing_routing_table_neighbors().is_empty());

        assert!(matches!(
            t.remove_neighbor(&pos(0, 0, 2)),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn symmetric_neighbors_are_unique() {
        let mut t = table_at(1, 0, 2);
        t.update_neighbor(peer(0, 0, 2)).unwrap();
        t.set_adjacent_right(peer(0, 0, 2)).unwrap();
        t.update_neighbor(peer(2, 0, 2)).unwrap();
        t.set_adjacent_left(peer(2, 0, 2)).unwrap();
        assert_eq!(t.all_symmetric_existing_neighbors().len(), 2);
    }

    #[test]
    fn closest_known_includes_self() {
        let mut t = table_at(1, 0, 2);
        t.update_neighbor(peer(0, 0, 2)).unwrap();
        let target = pos(2, 1, 2).horizontal_value();
        assert!(t.closest_known_left_of(target).unwrap().is_at(&pos(1, 0, 2)));
        assert!(t.closest_known_right_of(target).unwrap().is_at(&pos(0, 0, 2)));
    }

    #[test]
    fn reset_position_keeps_endpoint() {
        let mut t = table_at(2, 2, 2);
        t.reset_position();
        assert!(t.position().is_none());
        assert!(t.self_ref().endpoint().is_some());
        assert!(t.children().is_empty());
        assert!(matches!(t.require_position(), Err(Error::NotRunning)));
    }
}
