//! Routing-table positions.
//!
//! A position on level `l` links to positions on the same level at offsets
//! from the routing sequence `d * m^i` (`1 <= d < m`). The left table subtracts
//! the offsets, the right table adds them.

use crate::position::{level_capacity, LogicalPosition};

/// Offsets `d * m^i` for `i < (m - 1) * level`, `1 <= d < m`, ascending.
///
/// Terms that can no longer name a position on the level are cut off, so the
/// sequence stays logarithmic in the level capacity.
pub fn routing_sequence(level: u32, fanout: u32) -> Vec<u64> {
    let capacity = level_capacity(level, fanout);
    let rounds = (fanout as u64 - 1) * level as u64;
    let mut seq = Vec::new();
    let mut power: u64 = 1;

    for _ in 0..rounds {
        if power >= capacity {
            break;
        }
        for d in 1..fanout as u64 {
            match d.checked_mul(power) {
                Some(step) if step < capacity => seq.push(step),
                _ => break,
            }
        }
        power = match power.checked_mul(fanout as u64) {
            Some(p) => p,
            None => break,
        };
    }
    seq
}

/// Positions `(level, number - s)`, nearest first.
pub fn left_routing_positions(pos: &LogicalPosition) -> Vec<LogicalPosition> {
    let number = pos.number() as u64;
    routing_sequence(pos.level(), pos.fanout())
        .into_iter()
        .take_while(|&s| s <= number)
        .filter_map(|s| pos.on_level((number - s) as u32))
        .collect()
}

/// Positions `(level, number + s)` inside the level, nearest first.
pub fn right_routing_positions(pos: &LogicalPosition) -> Vec<LogicalPosition> {
    let number = pos.number() as u64;
    let capacity = pos.capacity();
    routing_sequence(pos.level(), pos.fanout())
        .into_iter()
        .map(|s| number + s)
        .take_while(|&k| k < capacity)
        .filter_map(|k| u32::try_from(k).ok().and_then(|k| pos.on_level(k)))
        .collect()
}

/// Left and right routing positions, sorted left to right, plus the index of
/// the first right entry.
pub fn routing_positions(pos: &LogicalPosition) -> (Vec<LogicalPosition>, usize) {
    let mut left = left_routing_positions(pos);
    left.reverse();
    let split = left.len();
    left.extend(right_routing_positions(pos));
    (left, split)
}
