//! Async runtime: every peer is a tokio task.
//!
//! A peer task owns its [`Node`] and an unbounded inbox. Outgoing bytes go to
//! a router task that owns the directory of inboxes. Timeouts are tokio
//! sleeps that post back into the inbox, tagged with a generation so that a
//! re-armed timeout is not fired by an older sleep.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use arbor_overlay::{
    BootstrapProtocol, Delivery, JoinProtocol, LeaveProtocol, Node, OverlayConfig, PeerRef,
    Phase, PhysicalEndpoint, Scheduler, SearchExactProtocol, Status, TimeoutKind, Transport,
    MULTICAST_GROUP,
};
use arbor_tree::LogicalPosition;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Result, SimError};

/// What a peer reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub endpoint: PhysicalEndpoint,
    pub status: Status,
    pub phase: Phase,
    pub locked: bool,
    pub position: Option<LogicalPosition>,
    pub parent: PeerRef,
    pub adjacent_left: PeerRef,
    pub adjacent_right: PeerRef,
    pub children: Vec<PeerRef>,
}

/// Application-level events raised by peers.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    Delivered {
        at: PhysicalEndpoint,
        origin: PeerRef,
        payload: Vec<u8>,
    },
    SearchFailed {
        origin: PhysicalEndpoint,
        destination: LogicalPosition,
        payload: Vec<u8>,
    },
}

type Reply = oneshot::Sender<arbor_overlay::Result<()>>;

enum Command {
    FoundTree(Reply),
    Join(PhysicalEndpoint, Reply),
    Bootstrap(Reply),
    Leave(Reply),
    Search(LogicalPosition, Vec<u8>, Reply),
    Snapshot(oneshot::Sender<PeerSnapshot>),
}

enum Input {
    Bytes(Vec<u8>),
    Timeout(TimeoutKind, u64),
    Command(Command),
    Shutdown,
}

enum Routed {
    Register(PhysicalEndpoint, mpsc::UnboundedSender<Input>),
    Unicast(PhysicalEndpoint, Vec<u8>),
    Multicast(PhysicalEndpoint, Vec<u8>),
}

/// Capabilities of a peer task.
struct ActorIo {
    endpoint: PhysicalEndpoint,
    router: mpsc::UnboundedSender<Routed>,
    inbox: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    generations: HashMap<TimeoutKind, u64>,
    next_generation: u64,
}

impl Transport for ActorIo {
    fn send(&mut self, to: &PhysicalEndpoint, bytes: Vec<u8>) {
        if self.router.send(Routed::Unicast(*to, bytes)).is_err() {
            warn!(from = %self.endpoint, to = %to, "router gone, message lost");
        }
    }

    fn multicast(&mut self, bytes: Vec<u8>) {
        if self.router.send(Routed::Multicast(self.endpoint, bytes)).is_err() {
            warn!(from = %self.endpoint, "router gone, multicast lost");
        }
    }
}

impl Scheduler for ActorIo {
    fn set_timeout(&mut self, kind: TimeoutKind, after: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.generations.insert(kind, generation);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(Input::Timeout(kind, generation));
        });
    }

    fn cancel_timeout(&mut self, kind: TimeoutKind) {
        self.generations.remove(&kind);
    }
}

impl Delivery for ActorIo {
    fn deliver(&mut self, from: PeerRef, payload: Vec<u8>) {
        let _ = self.events.send(NetworkEvent::Delivered {
            at: self.endpoint,
            origin: from,
            payload,
        });
    }

    fn search_failed(&mut self, destination: LogicalPosition, payload: Vec<u8>) {
        let _ = self.events.send(NetworkEvent::SearchFailed {
            origin: self.endpoint,
            destination,
            payload,
        });
    }
}

async fn run_router(mut rx: mpsc::UnboundedReceiver<Routed>) {
    let mut directory: BTreeMap<PhysicalEndpoint, mpsc::UnboundedSender<Input>> = BTreeMap::new();
    while let Some(routed) = rx.recv().await {
        match routed {
            Routed::Register(endpoint, inbox) => {
                directory.insert(endpoint, inbox);
            }
            Routed::Unicast(to, bytes) => match directory.get(&to) {
                Some(inbox) if inbox.send(Input::Bytes(bytes)).is_ok() => {}
                _ => trace!(to = %to, "no such peer, message dropped"),
            },
            Routed::Multicast(from, bytes) => {
                trace!(from = %from, group = %MULTICAST_GROUP, peers = directory.len(), "multicast");
                for (endpoint, inbox) in &directory {
                    if *endpoint != from {
                        let _ = inbox.send(Input::Bytes(bytes.clone()));
                    }
                }
            }
        }
    }
}

async fn run_peer(mut node: Node<ActorIo>, mut inbox: mpsc::UnboundedReceiver<Input>) {
    while let Some(input) = inbox.recv().await {
        match input {
            Input::Bytes(bytes) => {
                if let Err(error) = node.handle_bytes(&bytes) {
                    warn!(node = %node.self_ref(), error = %error, "message rejected");
                }
            }
            Input::Timeout(kind, generation) => {
                if node.io().generations.get(&kind) != Some(&generation) {
                    trace!(node = %node.self_ref(), kind = ?kind, "superseded timeout");
                    continue;
                }
                node.io_mut().generations.remove(&kind);
                if let Err(error) = node.handle_timeout(kind) {
                    warn!(node = %node.self_ref(), kind = ?kind, error = %error, "timeout handling failed");
                }
            }
            Input::Command(command) => run_command(&mut node, command),
            Input::Shutdown => break,
        }
    }
    debug!(node = %node.self_ref(), "peer task stopped");
}

fn run_command(node: &mut Node<ActorIo>, command: Command) {
    match command {
        Command::FoundTree(reply) => {
            let _ = reply.send(node.initiate_as_root());
        }
        Command::Join(contact, reply) => {
            let _ = reply.send(node.initiate_join(contact));
        }
        Command::Bootstrap(reply) => {
            let _ = reply.send(node.initiate_bootstrap());
        }
        Command::Leave(reply) => {
            let _ = reply.send(node.initiate_self_departure());
        }
        Command::Search(destination, payload, reply) => {
            let _ = reply.send(node.perform_search_exact(destination, payload));
        }
        Command::Snapshot(reply) => {
            let table = node.routing_table();
            let snapshot = PeerSnapshot {
                endpoint: node.io().endpoint,
                status: node.status(),
                phase: node.phase(),
                locked: node.is_locked(),
                position: node.position(),
                parent: table.parent(),
                adjacent_left: table.adjacent_left(),
                adjacent_right: table.adjacent_right(),
                children: table.existing_children(),
            };
            let _ = reply.send(snapshot);
        }
    }
}

/// Handle to a running network of peer tasks.
pub struct NetworkHandle {
    config: OverlayConfig,
    router: mpsc::UnboundedSender<Routed>,
    peers: BTreeMap<PhysicalEndpoint, mpsc::UnboundedSender<Input>>,
    events_tx: mpsc::UnboundedSender<NetworkEvent>,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    tasks: Vec<JoinHandle<()>>,
}

/// Start a router and one uninitialized peer task per endpoint.
pub fn spawn_network(config: OverlayConfig, endpoints: &[PhysicalEndpoint]) -> Result<NetworkHandle> {
    config.validate()?;
    let (router, router_rx) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let mut handle = NetworkHandle {
        config,
        router,
        peers: BTreeMap::new(),
        events_tx,
        events,
        tasks: vec![tokio::spawn(run_router(router_rx))],
    };
    for endpoint in endpoints {
        handle.add_peer(*endpoint)?;
    }
    Ok(handle)
}

impl NetworkHandle {
    /// Start another uninitialized peer task.
    pub fn add_peer(&mut self, endpoint: PhysicalEndpoint) -> Result<()> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let io = ActorIo {
            endpoint,
            router: self.router.clone(),
            inbox: inbox_tx.clone(),
            events: self.events_tx.clone(),
            generations: HashMap::new(),
            next_generation: 0,
        };
        let node = Node::new(self.config.clone(), endpoint, io)?;
        self.router
            .send(Routed::Register(endpoint, inbox_tx.clone()))
            .map_err(|_| SimError::PeerGone(endpoint))?;
        self.peers.insert(endpoint, inbox_tx);
        self.tasks.push(tokio::spawn(run_peer(node, inbox_rx)));
        Ok(())
    }

    pub fn endpoints(&self) -> impl Iterator<Item = PhysicalEndpoint> + '_ {
        self.peers.keys().copied()
    }

    async fn request(
        &self,
        endpoint: PhysicalEndpoint,
        make: impl FnOnce(Reply) -> Command,
    ) -> Result<()> {
        let (reply, answer) = oneshot::channel();
        self.inbox(endpoint)?
            .send(Input::Command(make(reply)))
            .map_err(|_| SimError::PeerGone(endpoint))?;
        answer
            .await
            .map_err(|_| SimError::PeerGone(endpoint))?
            .map_err(SimError::from)
    }

    fn inbox(&self, endpoint: PhysicalEndpoint) -> Result<&mpsc::UnboundedSender<Input>> {
        self.peers
            .get(&endpoint)
            .ok_or(SimError::UnknownPeer(endpoint))
    }

    pub async fn found_tree(&self, endpoint: PhysicalEndpoint) -> Result<()> {
        self.request(endpoint, Command::FoundTree).await
    }

    /// Start a join through `contact`. Returns once the join request is sent.
    pub async fn join(&self, endpoint: PhysicalEndpoint, contact: PhysicalEndpoint) -> Result<()> {
        self.request(endpoint, |reply| Command::Join(contact, reply))
            .await
    }

    pub async fn bootstrap(&self, endpoint: PhysicalEndpoint) -> Result<()> {
        self.request(endpoint, Command::Bootstrap).await
    }

    pub async fn leave(&self, endpoint: PhysicalEndpoint) -> Result<()> {
        self.request(endpoint, Command::Leave).await
    }

    pub async fn search(
        &self,
        from: PhysicalEndpoint,
        destination: LogicalPosition,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.request(from, |reply| Command::Search(destination, payload, reply))
            .await
    }

    pub async fn snapshot(&self, endpoint: PhysicalEndpoint) -> Result<PeerSnapshot> {
        let (reply, answer) = oneshot::channel();
        self.inbox(endpoint)?
            .send(Input::Command(Command::Snapshot(reply)))
            .map_err(|_| SimError::PeerGone(endpoint))?;
        answer.await.map_err(|_| SimError::PeerGone(endpoint))
    }

    /// Poll `endpoint` until it reports `status`, for at most `within`.
    pub async fn wait_for_status(
        &self,
        endpoint: PhysicalEndpoint,
        status: Status,
        within: Duration,
    ) -> Result<PeerSnapshot> {
        tokio::time::timeout(within, self.poll_status(endpoint, status))
            .await
            .map_err(|_| SimError::Timeout(endpoint))?
    }

    async fn poll_status(&self, endpoint: PhysicalEndpoint, status: Status) -> Result<PeerSnapshot> {
        loop {
            let snapshot = self.snapshot(endpoint).await?;
            if snapshot.status == status {
                return Ok(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until no running peer has a procedure open or holds a lock.
    pub async fn wait_until_idle(&self, within: Duration) -> Result<()> {
        let first = self.peers.keys().next().copied();
        tokio::time::timeout(within, self.poll_idle())
            .await
            .map_err(|_| match first {
                Some(endpoint) => SimError::Timeout(endpoint),
                None => SimError::EmptyNetwork,
            })?
    }

    async fn poll_idle(&self) -> Result<()> {
        loop {
            let mut idle = true;
            for endpoint in self.peers.keys() {
                let snapshot = self.snapshot(*endpoint).await?;
                if snapshot.status == Status::Running
                    && (snapshot.phase != Phase::Idle || snapshot.locked)
                {
                    idle = false;
                    break;
                }
            }
            if idle {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Next application event, if one arrives within `within`.
    pub async fn next_event(&mut self, within: Duration) -> Option<NetworkEvent> {
        tokio::time::timeout(within, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Stop every peer task and the router.
    pub async fn shutdown(self) {
        for inbox in self.peers.values() {
            let _ = inbox.send(Input::Shutdown);
        }
        drop(self.peers);
        drop(self.router);
        for task in self.tasks {
            if let Err(error) = task.await {
                warn!(error = %error, "task ended abnormally");
            }
        }
    }
}
