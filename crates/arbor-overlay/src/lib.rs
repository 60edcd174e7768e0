//! Arbor Overlay
//!
//! Peers arranged in a balanced m-ary tree. Every peer holds a position in the
//! conceptual tree of [`arbor_tree`], a parent, up to `m` children, the two
//! adjacents next to it in horizontal order and a logarithmic set of routing
//! neighbors on its own level.
//!
//! # Architecture
//!
//! - **Node**: one peer. Reacts to messages, timeouts and local commands.
//! - **Protocols**: Join, Leave, Search-Exact, Neighbor Response and Bootstrap,
//!   each a trait implemented for [`Node`].
//! - **Find-End**: shared search for the end of the tree used by Join and Leave.
//! - **Capabilities**: the node does no I/O. Sending, timers and delivery go
//!   through [`Capabilities`], supplied by the caller.
//!
//! # Usage
//!
//! ```ignore
//! let mut node = Node::new(OverlayConfig::default(), endpoint, io)?;
//! node.initiate_join(contact)?;
//!
//! // feed the node from the transport
//! node.handle_bytes(&bytes)?;
//! node.handle_timeout(TimeoutKind::JoinAcceptResponse)?;
//! ```

mod bootstrap;
mod capability;
mod config;
mod error;
mod find_end;
mod join;
mod leave;
mod message;
mod node;
mod peer;
mod procedure;
mod response;
mod routing_table;
mod search_exact;

pub use bootstrap::{BootstrapProtocol, DISCOVERY_MESSAGE};
pub use capability::{Capabilities, Delivery, Scheduler, TimeoutKind, Transport};
pub use config::{OverlayConfig, TimeoutConfig, DEFAULT_PORT, MAX_HOPS, MULTICAST_GROUP};
pub use error::{Error, Result};
pub use find_end::{FindEnd, Purpose, Step};
pub use join::{calc_new_child_position, closer_adjacent, JoinProtocol};
pub use leave::{can_leave_without_replacement, LeaveProtocol};
pub use message::{
    Message, MessageBody, MessageHeader, MessageType, NeighborRelationship, Protocol,
    SearchProgress,
};
pub use node::{Node, Phase, Status};
pub use peer::{PeerRef, PhysicalEndpoint};
pub use response::ResponseProtocol;
pub use routing_table::RoutingTable;
pub use search_exact::{closest_redirect, SearchExactProtocol};
