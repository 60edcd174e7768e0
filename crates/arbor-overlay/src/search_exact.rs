//! Greedy routing to an exact position by horizontal value.

use arbor_tree::{HorizontalValue, LogicalPosition};
use tracing::{debug, info};

use crate::capability::Capabilities;
use crate::error::{Error, Result};
use crate::message::{MessageBody, MessageHeader};
use crate::node::{Node, Status};
use crate::peer::PeerRef;
use crate::routing_table::RoutingTable;

pub trait SearchExactProtocol {
    /// Route `payload` to the peer at `destination`. An empty payload only
    /// traces the route.
    fn perform_search_exact(&mut self, destination: LogicalPosition, payload: Vec<u8>) -> Result<()>;

    fn process_search_exact(
        &mut self,
        header: &MessageHeader,
        destination: LogicalPosition,
        origin: PeerRef,
        hop_count: u16,
        payload: Vec<u8>,
    ) -> Result<()>;

    fn process_search_exact_failure(
        &mut self,
        header: &MessageHeader,
        destination: LogicalPosition,
        payload: Vec<u8>,
    ) -> Result<()>;
}

impl<C: Capabilities> SearchExactProtocol for Node<C> {
    fn perform_search_exact(&mut self, destination: LogicalPosition, payload: Vec<u8>) -> Result<()> {
        if self.status != Status::Running {
            return Err(Error::NotRunning);
        }
        if destination.fanout() != self.routing.fanout() {
            return Err(Error::violation(format!(
                "search for {} in a tree of fanout {}",
                destination,
                self.routing.fanout()
            )));
        }
        let origin = self.routing.self_ref();
        let procedure_id = self.new_procedure_id();
        self.route_search(procedure_id, destination, origin, 0, payload)
    }

    fn process_search_exact(
        &mut self,
        header: &MessageHeader,
        destination: LogicalPosition,
        origin: PeerRef,
        hop_count: u16,
        payload: Vec<u8>,
    ) -> Result<()> {
        if self.status != Status::Running {
            return Err(Error::NotRunning);
        }
        self.route_search(header.procedure_id(), destination, origin, hop_count, payload)
    }

    fn process_search_exact_failure(
        &mut self,
        header: &MessageHeader,
        destination: LogicalPosition,
        payload: Vec<u8>,
    ) -> Result<()> {
        info!(
            node = %self.routing.self_ref(),
            destination = %destination,
            reported_by = %header.sender,
            "search failed"
        );
        self.io.search_failed(destination, payload);
        Ok(())
    }
}

impl<C: Capabilities> Node<C> {
    fn route_search(
        &mut self,
        procedure_id: u64,
        destination: LogicalPosition,
        origin: PeerRef,
        hop_count: u16,
        payload: Vec<u8>,
    ) -> Result<()> {
        let own = self.routing.require_position()?;
        let target = destination.horizontal_value();

        if own.horizontal_value() == target {
            if payload.is_empty() {
                info!(
                    node = %self.routing.self_ref(),
                    origin = %origin,
                    hops = hop_count,
                    procedure_id,
                    "search reached destination"
                );
            } else {
                debug!(
                    node = %self.routing.self_ref(),
                    origin = %origin,
                    hops = hop_count,
                    payload = %hex::encode(&payload),
                    "delivering"
                );
                self.io.deliver(origin, payload);
            }
            return Ok(());
        }

        match closest_redirect(&self.routing, target) {
            Some(next) => {
                let hop_count = self.forward_hop(hop_count)?;
                self.send(
                    &next,
                    procedure_id,
                    MessageBody::SearchExact {
                        destination,
                        origin,
                        hop_count,
                        payload,
                    },
                )?;
                Ok(())
            }
            None if origin.same_position(&self.routing.self_ref()) => {
                info!(node = %self.routing.self_ref(), destination = %destination, "no such peer");
                self.io.search_failed(destination, payload);
                Ok(())
            }
            None => {
                debug!(node = %self.routing.self_ref(), destination = %destination, "no such peer, notifying origin");
                self.send(
                    &origin,
                    procedure_id,
                    MessageBody::SearchExactFailure {
                        destination,
                        payload,
                    },
                )?;
                Ok(())
            }
        }
    }
}

/// Known existing peer on `target`'s side of us that is strictly closer to it
/// than we are. `None` when we are the closest.
pub fn closest_redirect(routing: &RoutingTable, target: HorizontalValue) -> Option<PeerRef> {
    let own = routing.position()?.horizontal_value();
    let own_distance = own.distance(&target);
    routing
        .all_known_existing_neighbors()
        .into_iter()
        .filter_map(|peer| peer.horizontal_value().map(|v| (v, peer)))
        .filter(|(v, _)| if own < target { *v >= own } else { *v <= own })
        .map(|(v, peer)| (v.distance(&target), peer))
        .filter(|(d, _)| *d < own_distance)
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, peer)| peer)
}
