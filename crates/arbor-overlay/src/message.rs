//! Wire messages exchanged between overlay peers.
//!
//! Every message is a [`MessageHeader`] plus one [`MessageBody`]. Messages are
//! serde-derived and travel as `bincode`.

use arbor_tree::LogicalPosition;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::peer::PeerRef;

/// Progress marker carried by Find-End requests (Join and FindReplacement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SearchProgress {
    SearchRight = 0,
    SearchLeft = 1,
    CheckRight = 2,
    ReplacementNode = 3,
    None = 4,
}

/// How a peer reported in UpdateNeighbors / GetNeighbors relates to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NeighborRelationship {
    Parent = 0,
    Child = 1,
    AdjacentLeft = 2,
    AdjacentRight = 3,
    RoutingTableNeighbor = 4,
    RoutingTableNeighborChild = 5,
    Unknown = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHeader {
    pub sender: PeerRef,
    pub target: PeerRef,
    pub event_id: u64,
    /// Id of the procedure this message belongs to, 0 when it opens one.
    pub ref_event_id: u64,
}

impl MessageHeader {
    /// `ref_event_id` if set, otherwise this message's own id.
    pub fn procedure_id(&self) -> u64 {
        if self.ref_event_id != 0 {
            self.ref_event_id
        } else {
            self.event_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Join {
        entering: PeerRef,
        hop_count: u16,
        progress: SearchProgress,
    },
    JoinAccept {
        fanout: u32,
        adjacent_left: PeerRef,
        adjacent_right: PeerRef,
        routing_neighbors: Vec<PeerRef>,
    },
    JoinAcceptAck,
    FindReplacement {
        node_to_replace: PeerRef,
        hop_count: u16,
        progress: SearchProgress,
    },
    ReplacementOffer,
    ReplacementAck {
        neighbors: Vec<PeerRef>,
        locked: bool,
    },
    ReplacementNack,
    ReplacementUpdate {
        /// Position the replacement vacated.
        removed_position: LogicalPosition,
        /// The replacement at the position it now occupies.
        replacement: PeerRef,
        acknowledge: bool,
    },
    SignOffParentRequest,
    SignOffParentAnswer {
        successful: bool,
    },
    UnlockNeighbor,
    SearchExact {
        destination: LogicalPosition,
        origin: PeerRef,
        hop_count: u16,
        payload: Vec<u8>,
    },
    SearchExactFailure {
        destination: LogicalPosition,
        payload: Vec<u8>,
    },
    UpdateNeighbors {
        neighbors: Vec<(PeerRef, NeighborRelationship)>,
        acknowledge: bool,
    },
    GetNeighbors {
        send_back_to: PeerRef,
        relationships: Vec<NeighborRelationship>,
    },
    InformAboutNeighbors {
        neighbors: Vec<PeerRef>,
    },
    RemoveNeighbor {
        position: LogicalPosition,
        acknowledge: bool,
    },
    RemoveNeighborAck,
    BootstrapDiscover {
        discovery: String,
    },
    BootstrapResponse {
        peer: PeerRef,
    },
}

/// Discriminant of a [`MessageBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Join,
    JoinAccept,
    JoinAcceptAck,
    FindReplacement,
    ReplacementOffer,
    ReplacementAck,
    ReplacementNack,
    ReplacementUpdate,
    SignOffParentRequest,
    SignOffParentAnswer,
    UnlockNeighbor,
    SearchExact,
    SearchExactFailure,
    UpdateNeighbors,
    GetNeighbors,
    InformAboutNeighbors,
    RemoveNeighbor,
    RemoveNeighborAck,
    BootstrapDiscover,
    BootstrapResponse,
}

/// Protocol module responsible for a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Join,
    Leave,
    SearchExact,
    Response,
    Bootstrap,
}

impl MessageType {
    pub const COUNT: usize = 20;

    /// Owning protocol, looked up in the dispatch table.
    pub fn protocol(self) -> Protocol {
        PROTOCOL_TABLE[self as usize]
    }
}

/// Dispatch table indexed by [`MessageType`] discriminant.
pub(crate) static PROTOCOL_TABLE: [Protocol; MessageType::COUNT] = [
    Protocol::Join,        // Join
    Protocol::Join,        // JoinAccept
    Protocol::Join,        // JoinAcceptAck
    Protocol::Leave,       // FindReplacement
    Protocol::Leave,       // ReplacementOffer
    Protocol::Leave,       // ReplacementAck
    Protocol::Leave,       // ReplacementNack
    Protocol::Leave,       // ReplacementUpdate
    Protocol::Leave,       // SignOffParentRequest
    Protocol::Leave,       // SignOffParentAnswer
    Protocol::Leave,       // UnlockNeighbor
    Protocol::SearchExact, // SearchExact
    Protocol::SearchExact, // SearchExactFailure
    Protocol::Response,    // UpdateNeighbors
    Protocol::Response,    // GetNeighbors
    Protocol::Response,    // InformAboutNeighbors
    Protocol::Response,    // RemoveNeighbor
    Protocol::Response,    // RemoveNeighborAck
    Protocol::Bootstrap,   // BootstrapDiscover
    Protocol::Bootstrap,   // BootstrapResponse
];

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Join { .. } => MessageType::Join,
            MessageBody::JoinAccept { .. } => MessageType::JoinAccept,
            MessageBody::JoinAcceptAck => MessageType::JoinAcceptAck,
            MessageBody::FindReplacement { .. } => MessageType::FindReplacement,
            MessageBody::ReplacementOffer => MessageType::ReplacementOffer,
            MessageBody::ReplacementAck { .. } => MessageType::ReplacementAck,
            MessageBody::ReplacementNack => MessageType::ReplacementNack,
            MessageBody::ReplacementUpdate { .. } => MessageType::ReplacementUpdate,
            MessageBody::SignOffParentRequest => MessageType::SignOffParentRequest,
            MessageBody::SignOffParentAnswer { .. } => MessageType::SignOffParentAnswer,
            MessageBody::UnlockNeighbor => MessageType::UnlockNeighbor,
            MessageBody::SearchExact { .. } => MessageType::SearchExact,
            MessageBody::SearchExactFailure { .. } => MessageType::SearchExactFailure,
            MessageBody::UpdateNeighbors { .. } => MessageType::UpdateNeighbors,
            MessageBody::GetNeighbors { .. } => MessageType::GetNeighbors,
            MessageBody::InformAboutNeighbors { .. } => MessageType::InformAboutNeighbors,
            MessageBody::RemoveNeighbor { .. } => MessageType::RemoveNeighbor,
            MessageBody::RemoveNeighborAck => MessageType::RemoveNeighborAck,
            MessageBody::BootstrapDiscover { .. } => MessageType::BootstrapDiscover,
            MessageBody::BootstrapResponse { .. } => MessageType::BootstrapResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
