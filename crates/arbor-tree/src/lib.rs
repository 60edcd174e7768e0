//! Arbor Tree Geometry
//!
//! Coordinates and pure arithmetic of the conceptual complete m-ary tree that
//! the Arbor overlay arranges its peers into.
//!
//! # Positions
//!
//! A [`LogicalPosition`] is a `(level, number)` pair in a tree of fixed fanout
//! `m`. The root is `(0, 0)`; level `l` holds `m^l` positions numbered from the
//! left. Parent and children follow from integer division and multiplication
//! by `m`.
//!
//! # Horizontal Order
//!
//! The [tree mapper](tree_mapper) assigns every position a [`HorizontalValue`]
//! so that an in-order walk of the full tree is strictly increasing. The value
//! is the single ordering key the overlay uses for adjacency and greedy
//! routing. The root always maps to [`ROOT_VALUE`].
//!
//! # Routing Tables
//!
//! Each position has left and right routing-table positions on its own level at
//! offsets `d * m^i` (see [`routing_sequence`]). They give every peer a
//! logarithmic number of shortcuts across its level.

mod error;
mod mapper;
mod position;
mod routing;

pub use error::{Result, TreeError};
pub use mapper::{tree_mapper, tree_mapper_bounds, HorizontalValue, MapperBounds};
pub use position::{level_capacity, LogicalPosition};
pub use routing::{
    left_routing_positions, right_routing_positions, routing_positions, routing_sequence,
};

/// Smallest fanout a tree may be created with.
pub const MIN_FANOUT: u32 = 2;

/// Largest fanout a tree may be created with.
pub const MAX_FANOUT: u32 = 255;

/// Fanout used when nothing else is configured.
pub const DEFAULT_FANOUT: u32 = 2;

/// Horizontal value of the root position.
pub const ROOT_VALUE: f64 = 100.0;

/// Whether `fanout` is allowed for a tree.
#[inline]
pub const fn is_fanout_valid(fanout: u32) -> bool {
    fanout >= MIN_FANOUT && fanout <= MAX_FANOUT
}

const _: () = assert!(is_fanout_valid(DEFAULT_FANOUT));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_bounds() {
        assert!(!is_fanout_valid(0));
        assert!(!is_fanout_valid(1));
        assert!(is_fanout_valid(2));
        assert!(is_fanout_valid(255));
        assert!(!is_fanout_valid(256));
    }

    #[test]
    fn root_maps_to_root_value() {
        for fanout in [2, 3, 4, 7, 255] {
            let root = LogicalPosition::root(fanout).unwrap();
            assert_eq!(root.horizontal_value().get(), ROOT_VALUE);
        }
    }
}
