//! Logical coordinates in the conceptual complete m-ary tree.
//!
//! Level `l` holds `m^l` positions. A position `(l, n)` has the parent
//! `(l - 1, n / m)` and the children `(l + 1, n * m + i)` for `i < m`.

use std::cmp::Ordering;

use crate::error::{Result, TreeError};
use crate::mapper::{tree_mapper, HorizontalValue};
use crate::routing::{left_routing_positions, right_routing_positions};
use crate::is_fanout_valid;

/// Number of positions on `level` for a tree of `fanout`, saturating at `u64::MAX`.
pub fn level_capacity(level: u32, fanout: u32) -> u64 {
    (fanout as u64).checked_pow(level).unwrap_or(u64::MAX)
}

/// A position in the tree: `(level, number)` for a fixed fanout.
///
/// Equality and hashing cover all three fields. Horizontal ordering is
/// available through [`LogicalPosition::cmp_horizontal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogicalPosition {
    level: u32,
    number: u32,
    fanout: u32,
}

impl LogicalPosition {
    /// Create a position, validating fanout and that `number` fits on `level`.
    pub fn new(level: u32, number: u32, fanout: u32) -> Result<Self> {
        if !is_fanout_valid(fanout) {
            return Err(TreeError::InvalidFanout(fanout));
        }
        if (number as u64) >= level_capacity(level, fanout) {
            return Err(TreeError::InvalidPosition {
                level,
                number,
                fanout,
            });
        }
        Ok(Self {
            level,
            number,
            fanout,
        })
    }

    /// The root `(0, 0)`.
    pub fn root(fanout: u32) -> Result<Self> {
        Self::new(0, 0, fanout)
    }

    #[inline]
    pub const fn level(&self) -> u32 {
        self.level
    }

    #[inline]
    pub const fn number(&self) -> u32 {
        self.number
    }

    #[inline]
    pub const fn fanout(&self) -> u32 {
        self.fanout
    }

    #[inline]
    pub const fn is_root(&self) -> bool {
        self.level == 0
    }

    /// Slot of this position in its parent's children array.
    #[inline]
    pub const fn child_index(&self) -> u32 {
        self.number % self.fanout
    }

    /// Number of positions on this position's level.
    pub fn capacity(&self) -> u64 {
        level_capacity(self.level, self.fanout)
    }

    /// Whether this is the last possible position on its level.
    pub fn is_rightmost_on_level(&self) -> bool {
        self.number as u64 + 1 == self.capacity()
    }

    /// Same position on the same level with a different number, if valid.
    pub fn on_level(&self, number: u32) -> Option<Self> {
        Self::new(self.level, number, self.fanout).ok()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            level: self.level - 1,
            number: self.number / self.fanout,
            fanout: self.fanout,
        })
    }

    /// Child at slot `index`, `None` if the slot or the numbering is out of range.
    pub fn child(&self, index: u32) -> Option<Self> {
        if index >= self.fanout {
            return None;
        }
        let number = (self.number as u64) * (self.fanout as u64) + index as u64;
        let number = u32::try_from(number).ok()?;
        Some(Self {
            level: self.level.checked_add(1)?,
            number,
            fanout: self.fanout,
        })
    }

    /// All `fanout` children, left to right.
    ///
    /// Empty when the next level cannot be numbered with `u32`.
    pub fn children(&self) -> Vec<Self> {
        (0..self.fanout).filter_map(|i| self.child(i)).collect()
    }

    /// Whether `self` is a direct child of `other`.
    pub fn is_child_of(&self, other: &Self) -> bool {
        self.parent().as_ref() == Some(other)
    }

    pub fn horizontal_value(&self) -> HorizontalValue {
        HorizontalValue::new(tree_mapper(self.level, self.number, self.fanout))
    }

    /// Compare two positions by their place in the in-order walk.
    pub fn cmp_horizontal(&self, other: &Self) -> Ordering {
        self.horizontal_value().cmp(&other.horizontal_value())
    }

    /// Left routing-table positions, nearest first.
    pub fn left_routing_table(&self) -> Vec<Self> {
        left_routing_positions(self)
    }

    /// Right routing-table positions, nearest first.
    pub fn right_routing_table(&self) -> Vec<Self> {
        right_routing_positions(self)
    }

    /// Whether `other` is in this position's left or right routing table.
    pub fn is_routing_table_neighbor(&self, other: &Self) -> bool {
        other.level == self.level
            && other.fanout == self.fanout
            && (self.left_routing_table().contains(other)
                || self.right_routing_table().contains(other))
    }
}

impl std::fmt::Display for LogicalPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.level, self.number)
    }
}
