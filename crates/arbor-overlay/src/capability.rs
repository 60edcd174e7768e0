//! What a [`Node`](crate::Node) needs from its environment.
//!
//! The node performs no I/O itself. Outgoing bytes, timers and application
//! delivery go through these traits, so the same node runs inside the
//! deterministic simulator and inside an async runtime.

use std::time::Duration;

use arbor_tree::LogicalPosition;
use serde::{Deserialize, Serialize};

use crate::peer::{PeerRef, PhysicalEndpoint};

/// Timeouts a node may arm. At most one of each kind is armed at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeoutKind {
    BootstrapResponse,
    JoinAcceptResponse,
    JoinAcceptAckResponse,
    ReplacementOfferResponse,
    ReplacementAckResponse,
}

pub trait Transport {
    /// Send encoded bytes to a single peer.
    fn send(&mut self, to: &PhysicalEndpoint, bytes: Vec<u8>);

    /// Send encoded bytes to the discovery multicast group.
    fn multicast(&mut self, bytes: Vec<u8>);
}

pub trait Scheduler {
    /// Arm `kind`; the environment calls `Node::handle_timeout(kind)` after `after`.
    fn set_timeout(&mut self, kind: TimeoutKind, after: Duration);

    fn cancel_timeout(&mut self, kind: TimeoutKind);
}

pub trait Delivery {
    /// A search-exact payload reached this node.
    fn deliver(&mut self, from: PeerRef, payload: Vec<u8>);

    /// A search this node started could not reach `destination`.
    fn search_failed(&mut self, destination: LogicalPosition, payload: Vec<u8>);
}

/// Everything a node needs.
pub trait Capabilities: Transport + Scheduler + Delivery {}

impl<T: Transport + Scheduler + Delivery> Capabilities for T {}
