//! Bootstrap: finding a contact through multicast, or founding a new tree.

use arbor_tree::LogicalPosition;
use tracing::{debug, info};

use crate::capability::{Capabilities, TimeoutKind};
use crate::config::MULTICAST_GROUP;
use crate::error::{Error, Result};
use crate::join::JoinProtocol;
use crate::message::{MessageBody, MessageHeader};
use crate::node::{Node, Status};
use crate::peer::PeerRef;

/// Payload of a discovery multicast.
pub const DISCOVERY_MESSAGE: &str = "arbor-discover";

pub trait BootstrapProtocol {
    /// Multicast a discovery and wait for running peers to answer.
    fn initiate_bootstrap(&mut self) -> Result<()>;

    /// Become the root of a new tree.
    fn initiate_as_root(&mut self) -> Result<()>;

    fn process_bootstrap_discover(&mut self, header: &MessageHeader, discovery: String) -> Result<()>;

    fn process_bootstrap_response(&mut self, header: &MessageHeader, peer: PeerRef) -> Result<()>;
}

impl<C: Capabilities> BootstrapProtocol for Node<C> {
    fn initiate_bootstrap(&mut self) -> Result<()> {
        match self.status {
            Status::Uninitialized | Status::AwaitingBootstrap | Status::Left => {}
            Status::AwaitingJoinAccept | Status::Running => {
                return Err(Error::Busy("bootstrap needs a peer without position"))
            }
        }
        self.bootstrap.candidates.clear();
        self.multicast(MessageBody::BootstrapDiscover {
            discovery: DISCOVERY_MESSAGE.to_string(),
        })?;
        self.arm(TimeoutKind::BootstrapResponse);
        self.status = Status::AwaitingBootstrap;
        debug!(
            node = %self.routing.self_ref(),
            group = %MULTICAST_GROUP,
            round = self.bootstrap.rounds,
            "discovering"
        );
        Ok(())
    }

    fn initiate_as_root(&mut self) -> Result<()> {
        match self.status {
            Status::Running | Status::AwaitingJoinAccept => {
                return Err(Error::Busy("already joining or part of a tree"))
            }
            Status::Uninitialized | Status::AwaitingBootstrap | Status::Left => {}
        }
        self.disarm(TimeoutKind::BootstrapResponse);
        let root = LogicalPosition::root(self.config.fanout)?;
        self.routing.set_position(root)?;
        self.status = Status::Running;
        self.bootstrap = Default::default();
        info!(node = %self.routing.self_ref(), "founded a new tree");
        Ok(())
    }

    fn process_bootstrap_discover(&mut self, header: &MessageHeader, discovery: String) -> Result<()> {
        if discovery != DISCOVERY_MESSAGE {
            debug!(discovery = %discovery, "foreign discovery");
            return Ok(());
        }
        if self.status != Status::Running || self.is_busy() {
            return Ok(());
        }
        if header.sender.endpoint() == self.endpoint() {
            return Ok(());
        }
        let peer = self.routing.self_ref();
        self.send(&header.sender, header.procedure_id(), MessageBody::BootstrapResponse { peer })?;
        Ok(())
    }

    fn process_bootstrap_response(&mut self, _header: &MessageHeader, peer: PeerRef) -> Result<()> {
        if self.status != Status::AwaitingBootstrap {
            return Ok(());
        }
        if peer.endpoint().is_none() {
            return Err(Error::violation("bootstrap response without endpoint"));
        }
        if !self
            .bootstrap
            .candidates
            .iter()
            .any(|c| c.endpoint() == peer.endpoint())
        {
            self.bootstrap.candidates.push(peer);
        }
        Ok(())
    }
}

impl<C: Capabilities> Node<C> {
    pub(crate) fn on_bootstrap_timeout(&mut self) -> Result<()> {
        if self.status != Status::AwaitingBootstrap {
            return Ok(());
        }
        if let Some(contact) = self
            .bootstrap
            .candidates
            .first()
            .and_then(PeerRef::endpoint)
        {
            return self.initiate_join(contact);
        }
        if self.bootstrap.rounds < self.config.bootstrap_retries {
            self.bootstrap.rounds += 1;
            return self.initiate_bootstrap();
        }
        info!(node = %self.routing.self_ref(), rounds = self.bootstrap.rounds, "nobody answered");
        self.initiate_as_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{incoming, running_at, Recorder};
    use crate::routing_table::tests::{ep, peer};
    use crate::OverlayConfig;

    fn fresh(port: u16, retries: u32) -> Node<Recorder> {
        let config = OverlayConfig::default().with_bootstrap_retries(retries);
        Node::new(config, ep(port), Recorder::default()).unwrap()
    }

    fn discover(from: PeerRef, node: &Node<Recorder>) -> crate::Message {
        incoming(
            from,
            node,
            0,
            MessageBody::BootstrapDiscover {
                discovery: DISCOVERY_MESSAGE.into(),
            },
        )
    }

    #[test]
    fn bootstrap_multicasts_and_waits() {
        let mut node = fresh(9000, 1);
        node.initiate_bootstrap().unwrap();
        assert_eq!(node.status(), Status::AwaitingBootstrap);
        assert_eq!(node.io.multicast.len(), 1);
        assert_eq!(node.io.timeouts, vec![TimeoutKind::BootstrapResponse]);
    }

    #[test]
    fn silence_makes_a_root() {
        let mut node = fresh(9000, 1);
        node.initiate_bootstrap().unwrap();
        node.handle_timeout(TimeoutKind::BootstrapResponse).unwrap();
        assert_eq!(node.io.multicast.len(), 2);
        node.handle_timeout(TimeoutKind::BootstrapResponse).unwrap();
        assert_eq!(node.status(), Status::Running);
        assert!(node.self_ref().position().unwrap().is_root());
    }

    #[test]
    fn first_candidate_is_contacted() {
        let mut node = fresh(9000, 3);
        node.initiate_bootstrap().unwrap();
        for p in [peer(1, 0, 2), peer(0, 0, 2), peer(1, 0, 2)] {
            let msg = incoming(p, &node, 0, MessageBody::BootstrapResponse { peer: p });
            node.handle_message(msg).unwrap();
        }
        assert_eq!(node.bootstrap.candidates.len(), 2);

        node.handle_timeout(TimeoutKind::BootstrapResponse).unwrap();
        assert_eq!(node.status(), Status::AwaitingJoinAccept);
        let sent = node.io.take();
        assert_eq!(sent[0].0, ep(3100));
        assert!(matches!(sent[0].1.body, MessageBody::Join { .. }));
    }

    #[test]
    fn only_idle_running_peers_answer() {
        let entering = PeerRef::unpositioned(ep(9000));

        let mut root = running_at(0, 0, 2);
        let msg = discover(entering, &root);
        root.handle_message(msg).unwrap();
        let sent = root.io.take();
        assert_eq!(sent[0].0, ep(9000));
        assert_eq!(
            sent[0].1.body,
            MessageBody::BootstrapResponse {
                peer: peer(0, 0, 2)
            }
        );

        root.locked = true;
        let msg = discover(entering, &root);
        root.handle_message(msg).unwrap();
        assert!(root.io.sent.is_empty());

        let mut waiting = fresh(9001, 1);
        let msg = discover(entering, &waiting);
        waiting.handle_message(msg).unwrap();
        assert!(waiting.io.sent.is_empty());
    }

    #[test]
    fn own_discover_is_ignored() {
        let mut root = running_at(0, 0, 2);
        let me = root.self_ref();
        let msg = discover(me, &root);
        root.handle_message(msg).unwrap();
        assert!(root.io.sent.is_empty());
    }

    #[test]
    fn left_peer_can_bootstrap_again() {
        let mut node = running_at(0, 0, 2);
        node.reset_to(Status::Left);
        node.initiate_bootstrap().unwrap();
        assert_eq!(node.status(), Status::AwaitingBootstrap);
    }
}
