//! Neighbor maintenance requests shared by every other protocol.

use arbor_tree::LogicalPosition;
use tracing::debug;

use crate::capability::Capabilities;
use crate::error::{Error, Result};
use crate::join::JoinProtocol;
use crate::message::{MessageBody, MessageHeader, NeighborRelationship};
use crate::node::Node;
use crate::peer::PeerRef;
use crate::procedure::AckContinuation;

pub trait ResponseProtocol {
    fn process_update_neighbors(
        &mut self,
        header: &MessageHeader,
        neighbors: Vec<(PeerRef, NeighborRelationship)>,
        acknowledge: bool,
    ) -> Result<()>;

    fn process_get_neighbors(
        &mut self,
        header: &MessageHeader,
        send_back_to: PeerRef,
        relationships: Vec<NeighborRelationship>,
    ) -> Result<()>;

    fn process_inform_about_neighbors(
        &mut self,
        header: &MessageHeader,
        neighbors: Vec<PeerRef>,
    ) -> Result<()>;

    fn process_remove_neighbor(
        &mut self,
        header: &MessageHeader,
        position: LogicalPosition,
        acknowledge: bool,
    ) -> Result<()>;

    fn process_remove_neighbor_ack(&mut self, header: &MessageHeader) -> Result<()>;
}

impl<C: Capabilities> ResponseProtocol for Node<C> {
    fn process_update_neighbors(
        &mut self,
        header: &MessageHeader,
        neighbors: Vec<(PeerRef, NeighborRelationship)>,
        acknowledge: bool,
    ) -> Result<()> {
        self.routing.require_position()?;
        for (peer, relationship) in neighbors {
            self.apply_relationship(peer, relationship)?;
        }
        if acknowledge {
            self.send(
                &header.sender,
                header.procedure_id(),
                MessageBody::RemoveNeighborAck,
            )?;
        }
        Ok(())
    }

    fn process_get_neighbors(
        &mut self,
        header: &MessageHeader,
        send_back_to: PeerRef,
        relationships: Vec<NeighborRelationship>,
    ) -> Result<()> {
        let mut found = Vec::new();
        for relationship in relationships {
            match relationship {
                NeighborRelationship::Parent => found.push(self.routing.parent()),
                NeighborRelationship::Child => found.extend(self.routing.existing_children()),
                NeighborRelationship::AdjacentLeft => found.push(self.routing.adjacent_left()),
                NeighborRelationship::AdjacentRight => found.push(self.routing.adjacent_right()),
                NeighborRelationship::RoutingTableNeighbor => {
                    found.extend(self.routing.existing_routing_table_neighbors())
                }
                NeighborRelationship::RoutingTableNeighborChild => {
                    found.extend(self.routing.existing_routing_table_neighbor_children())
                }
                NeighborRelationship::Unknown => {
                    return Err(Error::violation("GetNeighbors for unknown relationship"))
                }
            }
        }
        found.retain(PeerRef::exists);

        if found.is_empty() {
            debug!(requester = %send_back_to, "no neighbors to report");
            return Ok(());
        }
        self.send(
            &send_back_to,
            header.procedure_id(),
            MessageBody::InformAboutNeighbors { neighbors: found },
        )?;
        Ok(())
    }

    fn process_inform_about_neighbors(
        &mut self,
        _header: &MessageHeader,
        neighbors: Vec<PeerRef>,
    ) -> Result<()> {
        if self
            .accept_child
            .as_ref()
            .map(|s| s.awaiting_neighbors)
            .unwrap_or(false)
        {
            return self.continue_accept_child(neighbors);
        }
        for peer in neighbors.into_iter().filter(PeerRef::exists) {
            self.routing.update_neighbor(peer)?;
        }
        Ok(())
    }

    fn process_remove_neighbor(
        &mut self,
        header: &MessageHeader,
        position: LogicalPosition,
        acknowledge: bool,
    ) -> Result<()> {
        let own = self.routing.require_position()?;
        let procedure_id = header.procedure_id();

        if position.is_child_of(&own) {
            self.routing.reset_child(position.child_index() as usize);
            let sent = self.retract_child(procedure_id, position)?;
            return self.wait_for_acks(
                procedure_id,
                sent,
                AckContinuation::ChildRetracted {
                    requester: header.sender,
                    acknowledge,
                },
            );
        }

        self.routing.remove_neighbor(&position)?;
        if acknowledge {
            self.send(&header.sender, procedure_id, MessageBody::RemoveNeighborAck)?;
        }
        Ok(())
    }

    fn process_remove_neighbor_ack(&mut self, header: &MessageHeader) -> Result<()> {
        self.receive_ack(header.procedure_id())
    }
}

impl<C: Capabilities> Node<C> {
    fn apply_relationship(&mut self, peer: PeerRef, relationship: NeighborRelationship) -> Result<()> {
        match relationship {
            NeighborRelationship::Parent => self.routing.set_parent(peer),
            NeighborRelationship::Child => {
                if peer.exists() {
                    self.routing.set_child(peer)
                } else {
                    let number = peer
                        .number()
                        .ok_or_else(|| Error::violation("child update without position"))?;
                    self.routing
                        .reset_child((number % self.routing.fanout()) as usize);
                    Ok(())
                }
            }
            NeighborRelationship::AdjacentLeft => {
                if peer.exists() {
                    self.routing.set_adjacent_left(peer)
                } else {
                    self.routing.reset_adjacent_left();
                    Ok(())
                }
            }
            NeighborRelationship::AdjacentRight => {
                if peer.exists() {
                    self.routing.set_adjacent_right(peer)
                } else {
                    self.routing.reset_adjacent_right();
                    Ok(())
                }
            }
            NeighborRelationship::RoutingTableNeighbor => {
                self.routing.update_routing_table_neighbor(peer);
                Ok(())
            }
            NeighborRelationship::RoutingTableNeighborChild => {
                self.routing.update_routing_table_neighbor_child(peer);
                Ok(())
            }
            NeighborRelationship::Unknown => self.routing.update_neighbor(peer),
        }
    }

    /// Tell our routing neighbors that our child at `position` is gone.
    /// Returns the number of acks to wait for.
    pub(crate) fn retract_child(&mut self, procedure_id: u64, position: LogicalPosition) -> Result<u32> {
        let mut sent = 0;
        for neighbor in self.routing.existing_routing_table_neighbors() {
            self.send(
                &neighbor,
                procedure_id,
                MessageBody::RemoveNeighbor {
                    position,
                    acknowledge: true,
                },
            )?;
            sent += 1;
        }
        Ok(sent)
    }
}
