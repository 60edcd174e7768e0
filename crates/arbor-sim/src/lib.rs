//! Arbor Simulator
//!
//! Runs many overlay peers in one process.
//!
//! # Architecture
//!
//! - **Simulation**: deterministic FIFO network. Messages are handled one at a
//!   time and timeouts fire only when the driver says so.
//! - **Runtime**: every peer is a tokio task with its own inbox; timeouts are
//!   real sleeps.
//! - **Events**: the simulation records a timeline that serializes to JSON.
//!
//! # Usage
//!
//! ```ignore
//! let mut sim = Simulation::new(SimulationConfig::default().with_fanout(3));
//! let root = sim.add_root()?;
//! for _ in 0..20 {
//!     sim.join_via(root)?;
//! }
//! assert!(sim.check_complete_tree().is_empty());
//! ```

mod error;
mod events;
mod runtime;
mod simulation;

pub use error::{Result, SimError};
pub use events::{SimEvent, Summary};
pub use runtime::{spawn_network, NetworkEvent, NetworkHandle, PeerSnapshot};
pub use simulation::{
    breadth_first, Delivered, SearchFailure, SimIo, Simulation, SimulationConfig,
};
