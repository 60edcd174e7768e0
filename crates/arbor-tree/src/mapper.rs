//! Tree mapper: a total left-to-right order over all positions.
//!
//! Every position owns an interval `[lower, upper)`. The root's interval is
//! `[0, (K / ceil(m/2)) * m)`; a child receives the `number mod m`-th of `m`
//! equal slices of its parent's interval. The horizontal value is the point
//! `ceil(m/2)` slices into the node's own interval, which places the first
//! `ceil(m/2)` subtrees to its left and the rest to its right.

use std::cmp::Ordering;

use crate::ROOT_VALUE;

/// Interval and center computed by the tree mapper.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapperBounds {
    pub lower: f64,
    pub upper: f64,
    pub center: f64,
}

/// Position of a node in the global in-order walk.
///
/// Values produced by [`tree_mapper`] are finite, so the order is total.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HorizontalValue(f64);

impl HorizontalValue {
    #[inline]
    pub const fn new(value: f64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn get(&self) -> f64 {
        self.0
    }

    /// Absolute distance between two values.
    #[inline]
    pub fn distance(&self, other: &Self) -> f64 {
        (self.0 - other.0).abs()
    }
}

impl PartialEq for HorizontalValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HorizontalValue {}

impl PartialOrd for HorizontalValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HorizontalValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::fmt::Display for HorizontalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

fn center_of(lower: f64, upper: f64, fanout: f64, half: f64) -> f64 {
    lower + ((upper - lower) / fanout) * half
}

/// Interval and center of `(level, number)`.
///
/// Computed top-down from the root along the path of child slots, so the cost
/// is linear in `level`.
pub fn tree_mapper_bounds(level: u32, number: u32, fanout: u32) -> MapperBounds {
    let m = fanout as f64;
    let half = (fanout as f64 / 2.0).ceil();

    let mut slots = Vec::with_capacity(level as usize);
    let mut n = number as u64;
    for _ in 0..level {
        slots.push(n % fanout as u64);
        n /= fanout as u64;
    }

    let mut lower = 0.0;
    let mut upper = (ROOT_VALUE / half) * m;
    for slot in slots.into_iter().rev() {
        let width = (upper - lower) / m;
        lower += width * slot as f64;
        upper = lower + width;
    }

    MapperBounds {
        lower,
        upper,
        center: center_of(lower, upper, m, half),
    }
}

/// Horizontal value of `(level, number)` in a tree of `fanout`.
pub fn tree_mapper(level: u32, number: u32, fanout: u32) -> f64 {
    tree_mapper_bounds(level, number, fanout).center
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogicalPosition;
    use proptest::prelude::*;

    /// In-order walk of the full tree down to `depth`.
    fn in_order(pos: LogicalPosition, depth: u32, out: &mut Vec<LogicalPosition>) {
        let half = ((pos.fanout() + 1) / 2) as usize;
        let children = if pos.level() < depth { pos.children() } else { Vec::new() };
        for c in &children[..half.min(children.len())] {
            in_order(*c, depth, out);
        }
        out.push(pos);
        for c in children.iter().skip(half) {
            in_order(*c, depth, out);
        }
    }

    #[test]
    fn fanout_two_values() {
        assert_eq!(tree_mapper(0, 0, 2), 100.0);
        assert_eq!(tree_mapper(1, 0, 2), 50.0);
        assert_eq!(tree_mapper(1, 1, 2), 150.0);
        assert_eq!(tree_mapper(2, 1, 2), 75.0);
        assert_eq!(tree_mapper(3, 2, 2), 62.5);
    }

    #[test]
    fn fanout_three_values() {
        // root interval [0, 150), slices of 50
        assert_eq!(tree_mapper(0, 0, 3), 100.0);
        let b = tree_mapper_bounds(1, 1, 3);
        assert_eq!(b.lower, 50.0);
        assert_eq!(b.upper, 100.0);
        assert!((b.center - (50.0 + 50.0 / 3.0 * 2.0)).abs() < 1e-9);
    }

    #[test]
    fn in_order_walk_strictly_increasing() {
        for fanout in [2, 3, 4, 5] {
            let mut walk = Vec::new();
            in_order(LogicalPosition::root(fanout).unwrap(), 4, &mut walk);
            for pair in walk.windows(2) {
                assert!(
                    pair[0].horizontal_value() < pair[1].horizontal_value(),
                    "{} !< {} (fanout {})",
                    pair[0],
                    pair[1],
                    fanout
                );
            }
        }
    }

    proptest! {
        #[test]
        fn same_level_order_follows_number(fanout in 2u32..9, level in 1u32..6, a in any::<u32>(), b in any::<u32>()) {
            let cap = crate::level_capacity(level, fanout) as u32;
            let (a, b) = (a % cap, b % cap);
            prop_assume!(a != b);
            let va = HorizontalValue::new(tree_mapper(level, a, fanout));
            let vb = HorizontalValue::new(tree_mapper(level, b, fanout));
            prop_assert_eq!(a < b, va < vb);
        }

        #[test]
        fn values_inside_bounds(fanout in 2u32..9, level in 0u32..6, n in any::<u32>()) {
            let n = n % (crate::level_capacity(level, fanout) as u32);
            let b = tree_mapper_bounds(level, n, fanout);
            prop_assert!(b.lower < b.center && b.center < b.upper);
        }
    }
}
