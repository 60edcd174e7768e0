//! Peer identities: logical position plus physical endpoint.
//!
//! A [`PeerRef`] can be in one of three states:
//!
//! - fully unknown (neither part set),
//! - position-only: the slot is known from routing arithmetic but nobody is
//!   known to occupy it,
//! - resolved: a peer occupies the position at a known endpoint.
//!
//! Only resolved peers *exist* from the routing table's point of view.

use std::net::{IpAddr, SocketAddr};

use arbor_tree::{HorizontalValue, LogicalPosition};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Network identity of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalEndpoint {
    address: IpAddr,
    port: u16,
}

impl PhysicalEndpoint {
    /// Parse and validate an endpoint. Port 0 is rejected.
    pub fn new(address: &str, port: u16) -> Result<Self> {
        let address: IpAddr = address
            .parse()
            .map_err(|_| Error::Config(format!("invalid address '{}'", address)))?;
        Self::from_parts(address, port)
    }

    pub fn from_parts(address: IpAddr, port: u16) -> Result<Self> {
        if port == 0 {
            return Err(Error::Config(format!("invalid port 0 for {}", address)));
        }
        Ok(Self { address, port })
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl std::fmt::Display for PhysicalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// A possibly partial reference to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PeerRef {
    position: Option<LogicalPosition>,
    endpoint: Option<PhysicalEndpoint>,
}

impl PeerRef {
    /// Nothing known.
    pub const fn unknown() -> Self {
        Self {
            position: None,
            endpoint: None,
        }
    }

    /// A slot nobody is known to occupy.
    pub const fn at(position: LogicalPosition) -> Self {
        Self {
            position: Some(position),
            endpoint: None,
        }
    }

    /// A peer occupying `position` at `endpoint`.
    pub const fn resolved(position: LogicalPosition, endpoint: PhysicalEndpoint) -> Self {
        Self {
            position: Some(position),
            endpoint: Some(endpoint),
        }
    }

    /// A peer that has no position yet (entering the tree).
    pub const fn unpositioned(endpoint: PhysicalEndpoint) -> Self {
        Self {
            position: None,
            endpoint: Some(endpoint),
        }
    }

    pub fn position(&self) -> Option<LogicalPosition> {
        self.position
    }

    pub fn endpoint(&self) -> Option<PhysicalEndpoint> {
        self.endpoint
    }

    #[inline]
    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    /// Position and endpoint both known: somebody occupies the slot.
    #[inline]
    pub fn exists(&self) -> bool {
        self.position.is_some() && self.endpoint.is_some()
    }

    pub fn is_at(&self, position: &LogicalPosition) -> bool {
        self.position.as_ref() == Some(position)
    }

    /// Whether both refs name the same position.
    pub fn same_position(&self, other: &PeerRef) -> bool {
        self.position.is_some() && self.position == other.position
    }

    pub fn horizontal_value(&self) -> Option<HorizontalValue> {
        self.position.map(|p| p.horizontal_value())
    }

    pub fn level(&self) -> Option<u32> {
        self.position.map(|p| p.level())
    }

    pub fn number(&self) -> Option<u32> {
        self.position.map(|p| p.number())
    }

    /// Same endpoint with a new position.
    pub fn with_position(mut self, position: LogicalPosition) -> Self {
        self.position = Some(position);
        self
    }

    /// Same position with an endpoint.
    pub fn with_endpoint(mut self, endpoint: PhysicalEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Forget the endpoint, keeping the position.
    pub fn vacated(self) -> Self {
        Self {
            position: self.position,
            endpoint: None,
        }
    }
}

impl std::fmt::Display for PeerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.position, self.endpoint) {
            (Some(p), Some(e)) => write!(f, "{}@{}", p, e),
            (Some(p), None) => write!(f, "{}@-", p),
            (None, Some(e)) => write!(f, "?@{}", e),
            (None, None) => write!(f, "?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_validation() {
        assert!(PhysicalEndpoint::new("127.0.0.1", 2000).is_ok());
        assert!(PhysicalEndpoint::new("::1", 2000).is_ok());
        assert!(matches!(
            PhysicalEndpoint::new("127.0.0.1", 0),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PhysicalEndpoint::new("not-an-ip", 2000),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn three_states() {
        let pos = LogicalPosition::new(1, 0, 2).unwrap();
        let ep = PhysicalEndpoint::new("10.0.0.1", 2000).unwrap();

        let unknown = PeerRef::unknown();
        assert!(!unknown.has_position());
        assert!(!unknown.exists());

        let slot = PeerRef::at(pos);
        assert!(slot.has_position());
        assert!(!slot.exists());

        let peer = PeerRef::resolved(pos, ep);
        assert!(peer.exists());
        assert_eq!(peer.vacated(), slot);
        assert_eq!(slot.with_endpoint(ep), peer);
        assert!(peer.same_position(&slot));
        assert!(!unknown.same_position(&PeerRef::unknown()));
    }

    #[test]
    fn display() {
        let pos = LogicalPosition::new(2, 3, 2).unwrap();
        let ep = PhysicalEndpoint::new("10.0.0.1", 2001).unwrap();
        assert_eq!(PeerRef::resolved(pos, ep).to_string(), "2:3@10.0.0.1:2001");
        assert_eq!(PeerRef::at(pos).to_string(), "2:3@-");
        assert_eq!(PeerRef::unknown().to_string(), "?");
    }
}
