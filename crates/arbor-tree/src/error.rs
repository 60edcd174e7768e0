//! Error types for arbor-tree.

use thiserror::Error;

/// Result type for tree arithmetic.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors raised by position construction and routing calculations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// Fanout outside `MIN_FANOUT..=MAX_FANOUT`.
    #[error("invalid fanout {0}: must be between 2 and 255")]
    InvalidFanout(u32),

    /// Number does not fit on the level.
    #[error("invalid position {level}:{number} for fanout {fanout}")]
    InvalidPosition {
        level: u32,
        number: u32,
        fanout: u32,
    },

    /// Arithmetic left the representable range (very deep trees).
    #[error("position {level}:{number} overflows the numbering range")]
    Overflow { level: u32, number: u64 },
}
