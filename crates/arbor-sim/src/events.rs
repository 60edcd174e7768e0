//! Network events for the simulation timeline.

use arbor_overlay::{MessageType, PhysicalEndpoint, TimeoutKind};
use arbor_tree::LogicalPosition;
use serde::{Deserialize, Serialize};

/// Things that happen in a simulated network, in the order they happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SimEvent {
    /// A peer became part of the tree
    NodeJoined {
        endpoint: PhysicalEndpoint,
        position: LogicalPosition,
        step: u64,
    },

    /// A peer moved to another position (it replaced a leaving peer)
    NodeMoved {
        endpoint: PhysicalEndpoint,
        from: LogicalPosition,
        to: LogicalPosition,
        step: u64,
    },

    /// A peer gave up its position
    NodeLeft {
        endpoint: PhysicalEndpoint,
        position: Option<LogicalPosition>,
        step: u64,
    },

    MessageDelivered {
        from: Option<PhysicalEndpoint>,
        to: PhysicalEndpoint,
        kind: MessageType,
        step: u64,
    },

    /// A peer refused a message
    MessageRejected {
        to: PhysicalEndpoint,
        kind: Option<MessageType>,
        error: String,
        step: u64,
    },

    SearchDelivered {
        at: PhysicalEndpoint,
        origin: Option<LogicalPosition>,
        bytes: usize,
        step: u64,
    },

    SearchFailed {
        origin: PhysicalEndpoint,
        destination: LogicalPosition,
        step: u64,
    },

    TimeoutFired {
        endpoint: PhysicalEndpoint,
        kind: TimeoutKind,
        step: u64,
    },
}

impl SimEvent {
    /// Step of the network at which the event happened.
    pub fn step(&self) -> u64 {
        match self {
            SimEvent::NodeJoined { step, .. }
            | SimEvent::NodeMoved { step, .. }
            | SimEvent::NodeLeft { step, .. }
            | SimEvent::MessageDelivered { step, .. }
            | SimEvent::MessageRejected { step, .. }
            | SimEvent::SearchDelivered { step, .. }
            | SimEvent::SearchFailed { step, .. }
            | SimEvent::TimeoutFired { step, .. } => *step,
        }
    }
}

/// Per-kind message counts over a timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub joined: usize,
    pub left: usize,
    pub moved: usize,
    pub messages: usize,
    pub rejected: usize,
    pub searches_delivered: usize,
    pub searches_failed: usize,
    pub timeouts: usize,
}

impl Summary {
    pub fn from_events(events: &[SimEvent]) -> Self {
        let mut summary = Summary::default();
        for event in events {
            match event {
                SimEvent::NodeJoined { .. } => summary.joined += 1,
                SimEvent::NodeMoved { .. } => summary.moved += 1,
                SimEvent::NodeLeft { .. } => summary.left += 1,
                SimEvent::MessageDelivered { .. } => summary.messages += 1,
                SimEvent::MessageRejected { .. } => summary.rejected += 1,
                SimEvent::SearchDelivered { .. } => summary.searches_delivered += 1,
                SimEvent::SearchFailed { .. } => summary.searches_failed += 1,
                SimEvent::TimeoutFired { .. } => summary.timeouts += 1,
            }
        }
        summary
    }
}
