//! Find-End: locating the end of the tree.
//!
//! A Join looks for the first free slot of the last level (the parent that
//! accepts the entering peer). A Leave looks for the last occupied position
//! (the replacement). Both walk the same levels with the same rules and only
//! differ in what makes a node the "correct parent" and in a few edge cases.
//!
//! [`FindEnd`] only decides. The node turns a [`Step::Forward`] into a Join or
//! FindReplacement message.

use arbor_tree::LogicalPosition;

use crate::error::{Error, Result};
use crate::message::SearchProgress;
use crate::peer::PeerRef;
use crate::routing_table::RoutingTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Join,
    Leave,
}

/// Outcome of one Find-End decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// This node is the one being searched for.
    Accept,
    Forward { to: PeerRef, progress: SearchProgress },
    /// The request cannot make progress here.
    Drop,
}

impl Step {
    fn forward(to: PeerRef, progress: SearchProgress) -> Result<Self> {
        if !to.exists() {
            return Err(Error::violation(format!("find-end forward to unknown peer {}", to)));
        }
        Ok(Step::Forward { to, progress })
    }
}

/// Whether `peer` exists and sits on the last position of its level.
pub fn is_rightmost_possible(peer: &PeerRef) -> bool {
    peer.exists()
        && peer
            .position()
            .map(|p| p.is_rightmost_on_level())
            .unwrap_or(false)
}

pub struct FindEnd<'a> {
    routing: &'a RoutingTable,
    purpose: Purpose,
}

impl<'a> FindEnd<'a> {
    pub fn new(routing: &'a RoutingTable, purpose: Purpose) -> Self {
        Self { routing, purpose }
    }

    fn own(&self) -> Result<LogicalPosition> {
        self.routing.require_position()
    }

    fn to_parent(&self) -> Result<Step> {
        Step::forward(self.routing.parent(), SearchProgress::SearchRight)
    }

    /// Jump across the tree: left half goes right, the rest goes left.
    pub fn forward_to_adjacent(&self) -> Result<Step> {
        let own = self.own()?;
        let in_left_half = (own.number() as f64 + 1.0) < own.capacity() as f64 / 2.0;
        let target = if in_left_half {
            self.routing.adjacent_right()
        } else {
            self.routing.adjacent_left()
        };
        if !target.exists() {
            return Err(Error::violation("adjacent jump without adjacent"));
        }
        Step::forward(target, SearchProgress::None)
    }

    pub fn is_correct_parent(&self) -> bool {
        let own_criterion = match self.purpose {
            Purpose::Join => !self.routing.children_full(),
            Purpose::Leave => {
                let has_children = !self.routing.existing_children().is_empty();
                let right_children_empty = self
                    .routing
                    .right_neighbor_children()
                    .first()
                    .map(|c| !c.exists())
                    .unwrap_or(true);
                has_children && right_children_empty
            }
        };

        if self.routing.left_neighbors().is_empty() {
            return own_criterion;
        }
        match self.routing.left_neighbor_children().last() {
            Some(last) if last.exists() => own_criterion,
            _ => false,
        }
    }

    pub fn search_end_on_level(&self, left: bool) -> Result<Step> {
        let own = self.own()?;
        let side = if left {
            self.routing.existing_left_neighbors_and_children()
        } else {
            self.routing.existing_right_neighbors_and_children()
        };

        let (first, last) = match (side.first(), side.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => {
                return match (self.purpose, left) {
                    (Purpose::Join, _) => {
                        Err(Error::violation("join search reached the edge of its level"))
                    }
                    (Purpose::Leave, false) => Ok(Step::Drop),
                    (Purpose::Leave, true) => self.to_parent(),
                };
            }
        };

        if last.level() == Some(own.level()) {
            if self.purpose == Purpose::Leave && !left {
                return Ok(Step::Drop);
            }
            let progress = if left {
                SearchProgress::SearchLeft
            } else {
                SearchProgress::SearchRight
            };
            return Step::forward(first, progress);
        }

        let target = self.find_reachable_node_closest_to_parent(&last)?;
        Step::forward(target, SearchProgress::SearchRight)
    }

    /// Known peer closest to the parent of `child`, walking left one parent at a time.
    pub fn find_reachable_node_closest_to_parent(&self, child: &PeerRef) -> Result<PeerRef> {
        let child = child
            .position()
            .ok_or_else(|| Error::violation("closest-to-parent without position"))?;
        let fanout = child.fanout() as i64;
        let target_is_right =
            self.purpose == Purpose::Join && (child.number() as i64 + 1) % fanout == 0;
        let mut number = child.number() as i64 + i64::from(target_is_right);

        while number >= 0 {
            let parent_number = number / fanout;
            if let Some(found) = child
                .level()
                .checked_sub(1)
                .and_then(|level| self.routing.node_by_position(level, parent_number as u32))
            {
                return Ok(found);
            }
            number -= fanout;
        }
        Err(Error::violation(format!("no reachable parent near {}", child)))
    }

    pub fn check_right(&self) -> Result<Step> {
        let rightmost = self
            .routing
            .rightmost_neighbor()
            .ok_or_else(|| Error::violation("check-right at the right edge"))?;

        if rightmost.exists() {
            if is_rightmost_possible(&rightmost) {
                self.search_end_on_level(true)
            } else {
                Step::forward(rightmost, SearchProgress::CheckRight)
            }
        } else {
            self.to_parent()
        }
    }

    pub fn decide_next_step(&self) -> Result<Step> {
        if let Some(leftmost_child) = self.routing.leftmost_neighbor_child() {
            if self.is_correct_parent() {
                return Ok(Step::Accept);
            }
            if leftmost_child.exists() {
                return self.search_end_on_level(true);
            }
        }

        if let Some(rightmost) = self.routing.rightmost_neighbor() {
            if !rightmost.exists() {
                return self.to_parent();
            }
            if is_rightmost_possible(&rightmost) {
                if self.is_correct_parent() {
                    return Ok(Step::Accept);
                }
                return self.search_end_on_level(!self.routing.children_full());
            }
            return Step::forward(rightmost, SearchProgress::CheckRight);
        }

        if self.is_correct_parent() {
            return Ok(Step::Accept);
        }
        self.search_end_on_level(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing_table::tests::{peer, pos, table_at};

    /// Table at `(level, number)` that knows every occupied position among the
    /// first `occupied` nodes of a breadth-first filled tree.
    fn filled(level: u32, number: u32, fanout: u32, occupied: u32) -> RoutingTable {
        let mut t = table_at(level, number, fanout);
        let mut seen = 0;
        let mut l = 0;
        while seen < occupied {
            let cap = fanout.pow(l);
            for n in 0..cap {
                if seen == occupied {
                    break;
                }
                seen += 1;
                if (l, n) != (level, number) {
                    let _ = t.update_neighbor(peer(l, n, fanout));
                }
            }
            l += 1;
        }
        t
    }

    #[test]
    fn lone_child_accepts() {
        // 0:0, 1:0, 1:1 exist; 1:0 has free slots and no left neighbors
        let t = filled(1, 0, 2, 3);
        let fe = FindEnd::new(&t, Purpose::Join);
        assert!(fe.is_correct_parent());
        assert_eq!(fe.decide_next_step().unwrap(), Step::Accept);
    }

    #[test]
    fn full_level_searches_left() {
        // 0:0, 1:0, 1:1, 2:0, 2:1 exist; 1:0 is full so 1:1 takes the next child
        let t = filled(1, 1, 2, 5);
        let fe = FindEnd::new(&t, Purpose::Join);
        assert!(fe.is_correct_parent());
        assert_eq!(fe.decide_next_step().unwrap(), Step::Accept);

        // 1:1 asked while 1:0 still has a free slot
        let t = filled(1, 1, 2, 4);
        let fe = FindEnd::new(&t, Purpose::Join);
        assert!(!fe.is_correct_parent());
        match fe.decide_next_step().unwrap() {
            Step::Forward { to, progress } => {
                assert!(to.is_at(&pos(1, 0, 2)));
                assert_eq!(progress, SearchProgress::SearchRight);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn adjacent_jump_direction() {
        let mut t = filled(1, 0, 2, 3);
        t.set_adjacent_left(peer(2, 0, 2)).unwrap();
        t.set_adjacent_right(peer(0, 0, 2)).unwrap();
        let fe = FindEnd::new(&t, Purpose::Join);
        // level 1 of a binary tree has no left half
        assert_eq!(
            fe.forward_to_adjacent().unwrap(),
            Step::Forward {
                to: peer(2, 0, 2),
                progress: SearchProgress::None
            }
        );

        let mut t = filled(2, 0, 2, 4);
        t.set_adjacent_right(peer(1, 0, 2)).unwrap();
        assert_eq!(
            FindEnd::new(&t, Purpose::Join).forward_to_adjacent().unwrap(),
            Step::Forward {
                to: peer(1, 0, 2),
                progress: SearchProgress::None
            }
        );

        let root = table_at(0, 0, 2);
        assert!(FindEnd::new(&root, Purpose::Join)
            .forward_to_adjacent()
            .is_err());
    }

    #[test]
    fn rightmost_neighbor_missing_goes_to_parent() {
        // 0:0, 1:0, 1:1, 2:0 exist; the rightmost neighbor 2:2 is free
        let t = filled(2, 0, 2, 4);
        match FindEnd::new(&t, Purpose::Join).decide_next_step().unwrap() {
            Step::Forward { to, progress } => {
                assert!(to.is_at(&pos(1, 0, 2)));
                assert_eq!(progress, SearchProgress::SearchRight);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn leave_looks_for_last_child() {
        // 0:0, 1:0, 1:1, 2:0 exist; 1:0 holds the last occupied position
        let t = filled(1, 0, 2, 4);
        let fe = FindEnd::new(&t, Purpose::Leave);
        assert!(fe.is_correct_parent());

        // 1:1 has no children, right search drops
        let t = filled(1, 1, 2, 4);
        let fe = FindEnd::new(&t, Purpose::Leave);
        assert!(!fe.is_correct_parent());
        assert_eq!(fe.search_end_on_level(false).unwrap(), Step::Drop);
    }

    #[test]
    fn closest_to_parent_shifts_for_join() {
        // 2:1 is the last child of 1:0, so a join continues at 1:1
        let t = filled(1, 1, 2, 5);
        let fe = FindEnd::new(&t, Purpose::Join);
        // 1:1 is ourselves, which is never a known neighbor
        let found = fe
            .find_reachable_node_closest_to_parent(&peer(2, 1, 2))
            .unwrap();
        assert!(found.is_at(&pos(1, 0, 2)));

        let t = filled(2, 0, 2, 6);
        let fe = FindEnd::new(&t, Purpose::Join);
        let found = fe
            .find_reachable_node_closest_to_parent(&peer(3, 1, 2))
            .unwrap();
        assert!(found.is_at(&pos(2, 1, 2)));
    }

    #[test]
    fn rightmost_possible_requires_existence() {
        assert!(is_rightmost_possible(&peer(1, 1, 2)));
        assert!(!is_rightmost_possible(&PeerRef::at(pos(1, 1, 2))));
        assert!(!is_rightmost_possible(&peer(1, 0, 2)));
    }
}
