use arbor_overlay::PhysicalEndpoint;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("overlay error: {0}")]
    Overlay(#[from] arbor_overlay::Error),

    #[error("no peer at {0}")]
    UnknownPeer(PhysicalEndpoint),

    #[error("network still busy after {0} steps")]
    StepBudgetExhausted(usize),

    #[error("no running peer in the network")]
    EmptyNetwork,

    #[error("port range exhausted")]
    PortsExhausted,

    #[error("peer task for {0} is gone")]
    PeerGone(PhysicalEndpoint),

    #[error("{0} did not reach the expected state in time")]
    Timeout(PhysicalEndpoint),
}

pub type Result<T> = std::result::Result<T, SimError>;
