//! # High-Level Node API
//!
//! A [`Node`] wires the transport, connection manager, DHT, subscription
//! registry, gossip router and (optionally) local discovery into a single
//! interface.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(NodeConfig::default()).await?;
//!
//! // Wide-area: join through a known peer
//! node.bootstrap(&["/ip4/203.0.113.7/udp/4001/quic/p2p/<hex>".parse()?]).await?;
//!
//! let mut room = node.join("chat-room-test").await?;
//! node.publish("chat-room-test", b"hello".to_vec()).await?;
//! while let Some(delivery) = room.recv().await {
//!     println!("{:?}", delivery.payload);
//! }
//! ```
//!
//! ## Dispatch
//!
//! One task owns the glue between components. It consumes link events,
//! inbound gossip frames, inbound DHT requests and discovery results, and
//! turns each into calls on the router, the DHT or the connection manager.
//! Nothing it calls ever waits on it, so the pipeline cannot deadlock.
//!
//! Discovery and the DHT may both surface the same peer. The PeerID is the
//! dedup key: the first connection wins, later events for a linked peer are
//! no-ops.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dht::{DhtNode, DEFAULT_ALPHA, DEFAULT_K};
use crate::discovery::{DiscoveryConfig, LocalDiscovery, PeerFound};
use crate::identity::{Contact, Identity, Keypair, PeerAddr};
use crate::messages::{DhtRequest, DhtResponse, MessageId};
use crate::protocols::{GossipRpc, PeerFoundHandler};
use crate::router::{GossipRouter, RouterConfig, RouterError, RouterStats};
use crate::rpc::{ConnectOutcome, Inbound, LinkEvent, RpcNode};
use crate::subscription::{Subscription, SubscriptionRegistry, DEFAULT_QUEUE_CAPACITY};
use crate::transport::{Transport, DIAL_TIMEOUT};

const INBOUND_CHANNEL_SIZE: usize = 1024;
const PEER_FOUND_CHANNEL_SIZE: usize = 64;

/// Contacts dialed after a bootstrap lookup, closest first.
const BOOTSTRAP_DIAL_COUNT: usize = 8;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// QUIC listening address. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Gossip mesh parameters.
    pub router: RouterConfig,
    /// Local-network discovery; `None` disables it. A socket error at bind
    /// time only disables discovery, the node still starts.
    pub discovery: Option<DiscoveryConfig>,
    /// Kademlia bucket size, also the number of contacts a lookup returns.
    pub k: usize,
    /// Concurrent queries per lookup round.
    pub alpha: usize,
    /// Pending deliveries per local subscription.
    pub queue_capacity: usize,
    /// Upper bound on one dial including the handshake.
    pub dial_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            router: RouterConfig::default(),
            discovery: Some(DiscoveryConfig::default()),
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

impl NodeConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn without_discovery(mut self) -> Self {
        self.discovery = None;
        self
    }
}

struct DiscoveryForwarder(mpsc::Sender<PeerFound>);

#[async_trait]
impl PeerFoundHandler for DiscoveryForwarder {
    async fn on_peer_found(&self, found: PeerFound) {
        let _ = self.0.send(found).await;
    }
}

pub struct Node {
    keypair: Keypair,
    local_addr: SocketAddr,
    rpc: Arc<RpcNode>,
    dht: DhtNode<RpcNode>,
    router: GossipRouter,
    registry: SubscriptionRegistry,
    discovery: Option<LocalDiscovery>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Create a node with a fresh identity.
    ///
    /// A discovery socket that cannot be set up is logged and the node runs
    /// without local discovery; see [`Node::discovery_addr`].
    ///
    /// # Errors
    /// Fails if the listening address cannot be bound. The error chain then
    /// contains a [`TransportError::Bind`](crate::TransportError::Bind).
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        Self::bind_with_keypair(config, Keypair::generate()).await
    }

    pub async fn bind_with_keypair(config: NodeConfig, keypair: Keypair) -> Result<Self> {
        let identity = keypair.identity();

        let transport = Transport::bind(&keypair, config.bind_addr)
            .context("failed to start QUIC transport")?
            .with_dial_timeout(config.dial_timeout);
        let local_addr = transport.local_addr().context("failed to read listening address")?;

        // Dropping the node cancels this, which stops every background task
        // and releases the listening socket.
        let shutdown = CancellationToken::new();

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let rpc = Arc::new(RpcNode::with_shutdown(
            transport,
            inbound_tx,
            events_tx,
            shutdown.child_token(),
        ));

        let self_contact = Contact::single(identity, local_addr.to_string());
        let dht = DhtNode::with_shutdown(
            self_contact,
            rpc.clone(),
            config.k,
            config.alpha,
            shutdown.child_token(),
        );

        let registry = SubscriptionRegistry::new(config.queue_capacity);
        let router = GossipRouter::spawn(rpc.clone(), identity, registry.clone(), config.router.clone());

        let (found_tx, found_rx) = mpsc::channel(PEER_FOUND_CHANNEL_SIZE);
        let discovery = match config.discovery {
            Some(discovery_config) => {
                let spawned = LocalDiscovery::spawn(
                    discovery_config,
                    identity,
                    vec![local_addr.to_string()],
                    Arc::new(DiscoveryForwarder(found_tx)),
                );
                match spawned {
                    Ok(discovery) => Some(discovery),
                    Err(e) => {
                        warn!(error = %e, "local discovery unavailable, continuing without it");
                        None
                    }
                }
            }
            None => {
                drop(found_tx);
                None
            }
        };

        let accept_loop = rpc.spawn_accept_loop();
        let dispatcher = tokio::spawn(
            Dispatcher {
                rpc: rpc.clone(),
                dht: dht.clone(),
                router: router.clone(),
            }
            .run(events_rx, inbound_rx, found_rx, shutdown.clone()),
        );

        info!("Node {}/{}", local_addr, hex::encode(identity));

        Ok(Self {
            keypair,
            local_addr,
            rpc,
            dht,
            router,
            registry,
            discovery,
            shutdown,
            tasks: vec![accept_loop, dispatcher],
        })
    }

    pub fn peer_id(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Where local discovery listens, or `None` if it is disabled or could
    /// not be started.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.as_ref().map(LocalDiscovery::local_addr)
    }

    /// The bootstrap address of this node as bound.
    pub fn peer_addr(&self) -> PeerAddr {
        PeerAddr::new(self.local_addr, self.peer_id())
    }

    /// Bootstrap addresses other hosts can dial.
    ///
    /// When bound to `0.0.0.0`, the outward-facing interface is probed and
    /// loopback is always included as a fallback.
    pub fn routable_peer_addrs(&self) -> Vec<PeerAddr> {
        let ip = self.local_addr.ip();
        if !ip.is_unspecified() {
            return vec![self.peer_addr()];
        }

        let port = self.local_addr.port();
        let mut ips: Vec<IpAddr> = Vec::new();
        for target in ["8.8.8.8:53", "1.1.1.1:53"] {
            if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0")
                && socket.connect(target).is_ok()
                && let Ok(probed) = socket.local_addr()
            {
                let probed = probed.ip();
                if !probed.is_loopback() && !probed.is_unspecified() && !ips.contains(&probed) {
                    ips.push(probed);
                }
            }
        }
        ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));

        ips.into_iter()
            .map(|ip| PeerAddr::new(SocketAddr::new(ip, port), self.peer_id()))
            .collect()
    }

    /// Subscribe locally to `topic` and join its mesh. Each call returns an
    /// independent queue.
    pub async fn join(&self, topic: &str) -> Result<Subscription, RouterError> {
        let subscription = self.registry.subscribe(topic);
        self.router.join(topic).await?;
        Ok(subscription)
    }

    /// Leave `topic`. Every subscription to it is closed.
    pub async fn leave(&self, topic: &str) -> Result<(), RouterError> {
        self.router.leave(topic).await
    }

    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<MessageId, RouterError> {
        self.router.publish(topic, payload.into()).await
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<Identity> {
        self.router.mesh_peers(topic).await
    }

    pub async fn connected_peers(&self) -> Vec<Identity> {
        self.rpc.connected_peers().await
    }

    /// Dial a peer directly.
    pub async fn connect(&self, peer: &PeerAddr) -> Result<ConnectOutcome> {
        self.rpc.connect(&peer.to_contact()).await
    }

    /// Join the wide-area network through `seeds`: link to each seed, run the
    /// DHT bootstrap lookup, then dial the closest contacts it found.
    ///
    /// Returns the contacts learned. Fails only if no seed answered.
    pub async fn bootstrap(&self, seeds: &[PeerAddr]) -> Result<Vec<Contact>> {
        let seeds: Vec<Contact> = seeds.iter().map(PeerAddr::to_contact).collect();
        for seed in &seeds {
            if let Err(e) = self.rpc.connect(seed).await {
                warn!(
                    peer = %hex::encode(&seed.identity.as_bytes()[..8]),
                    error = %e,
                    "failed to link bootstrap seed"
                );
            }
        }

        let found = self.dht.bootstrap(&seeds).await?;

        let me = self.peer_id();
        let mut dials = JoinSet::new();
        for contact in found
            .iter()
            .filter(|c| c.identity != me)
            .take(BOOTSTRAP_DIAL_COUNT)
            .cloned()
        {
            let rpc = self.rpc.clone();
            dials.spawn(async move { (rpc.connect(&contact).await, contact.identity) });
        }
        while let Some(joined) = dials.join_next().await {
            if let Ok((Err(e), peer)) = joined {
                debug!(peer = %hex::encode(&peer.as_bytes()[..8]), error = %e, "post-bootstrap dial failed");
            }
        }

        info!(seeds = seeds.len(), learned = found.len(), "bootstrap finished");
        Ok(found)
    }

    /// Addresses of `target`, or the closest known contacts if it cannot be
    /// found.
    pub async fn find_peer(&self, target: Identity) -> Result<Vec<Contact>> {
        self.dht.find_peer(target).await
    }

    pub async fn routing_table_size(&self) -> usize {
        self.dht.routing_table_size().await
    }

    pub async fn router_stats(&self) -> RouterStats {
        self.router.stats().await
    }

    /// Deliveries lost to full subscription queues.
    pub fn dropped_deliveries(&self) -> u64 {
        self.registry.dropped()
    }

    pub async fn shutdown(mut self) {
        info!("shutting down node {}", hex::encode(&self.peer_id().as_bytes()[..8]));
        self.shutdown.cancel();
        if let Some(discovery) = self.discovery.take() {
            discovery.shutdown().await;
        }
        self.router.quit().await;
        self.dht.quit().await;
        self.rpc.quit().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Dispatcher {
    rpc: Arc<RpcNode>,
    dht: DhtNode<RpcNode>,
    router: GossipRouter,
}

impl Dispatcher {
    async fn run(
        self,
        mut events_rx: mpsc::UnboundedReceiver<LinkEvent>,
        mut inbound_rx: mpsc::Receiver<Inbound>,
        mut found_rx: mpsc::Receiver<PeerFound>,
        shutdown: CancellationToken,
    ) {
        let mut discovery_open = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => self.on_link_event(event).await,
                    None => break,
                },
                inbound = inbound_rx.recv() => match inbound {
                    Some(inbound) => self.on_inbound(inbound).await,
                    None => break,
                },
                found = found_rx.recv(), if discovery_open => match found {
                    Some(found) => self.on_peer_found(found).await,
                    None => discovery_open = false,
                },
            }
        }
        debug!("dispatcher stopped");
    }

    async fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Up { peer, addr } => {
                self.dht
                    .observe_contact(Contact::single(peer, addr.to_string()))
                    .await;
                self.router.peer_connected(peer).await;
            }
            LinkEvent::Down { peer } => {
                self.router.peer_disconnected(peer).await;
            }
        }
    }

    async fn on_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Gossip { from, bytes } => self.router.handle_inbound(from, bytes).await,
            Inbound::Dht {
                from,
                request,
                reply,
            } => {
                let response = match request {
                    DhtRequest::Ping => {
                        self.dht.observe_contact(from).await;
                        DhtResponse::Ack
                    }
                    DhtRequest::FindNode { target } => {
                        DhtResponse::Nodes(self.dht.handle_find_node_request(&from, target).await)
                    }
                };
                let _ = reply.send(response);
            }
        }
    }

    async fn on_peer_found(&self, found: PeerFound) {
        let peer = found.peer_id;
        if self.rpc.is_connected(&peer).await {
            trace!(peer = %hex::encode(&peer.as_bytes()[..8]), "discovered peer already linked");
            return;
        }

        let rpc = self.rpc.clone();
        let contact = Contact::new(peer, found.addresses);
        tokio::spawn(async move {
            match rpc.connect(&contact).await {
                Ok(outcome) => {
                    debug!(peer = %hex::encode(&peer.as_bytes()[..8]), ?outcome, "connected to discovered peer");
                }
                Err(e) => {
                    debug!(peer = %hex::encode(&peer.as_bytes()[..8]), error = %e, "dial to discovered peer failed");
                }
            }
        });
    }
}
