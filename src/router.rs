//! # Membership Gossip Router
//!
//! Maintains, per joined topic, a bounded-degree mesh of linked peers and
//! floods each accepted message along it with duplicate suppression.
//!
//! ## Control Protocol
//!
//! | Frame | Meaning |
//! |-------|---------|
//! | `Subscribe` | sender joined the topic; sent to every peer on join and on connect |
//! | `Unsubscribe` | sender left the topic |
//! | `Graft` | sender added the receiver to its mesh |
//! | `Prune` | sender removed the receiver from its mesh, or refused a graft |
//! | `Publish` | an application message |
//!
//! ## Inbound Pipeline
//!
//! ```text
//! bytes ─► decode ─► sender == self? ─► seen? ─► joined? ─► record seen
//!           │            │                │         │          │
//!       malformed   self_dropped     duplicates  unjoined   deliver locally
//!                                                              │
//!                                     forward to mesh minus {from, sender}
//! ```
//!
//! ## Mesh Maintenance
//!
//! Every heartbeat: peers whose link is gone are dropped; a mesh below
//! `mesh_n_low` is grafted back up to `mesh_n` from connected peers known to
//! share the topic; a mesh above `mesh_n_high` is pruned down to `mesh_n`.
//! Candidates rank by number of shared joined topics, then by most recent
//! activity.
//!
//! Forwards run as tasks in a per-topic `JoinSet`, so leaving a topic aborts
//! only that topic's in-flight sends.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::identity::Identity;
use crate::messages::{decode, Envelope, GossipRequest, MessageId};
use crate::protocols::GossipRpc;
use crate::subscription::{Delivery, SubscriptionRegistry};

// ============================================================================
// Configuration
// ============================================================================

/// D - target mesh degree per topic.
pub const DEFAULT_MESH_N: usize = 6;
/// D_lo - graft when the mesh falls below this.
pub const DEFAULT_MESH_N_LOW: usize = 5;
/// D_hi - prune when the mesh grows above this.
pub const DEFAULT_MESH_N_HIGH: usize = 12;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// How long a message ID suppresses duplicates.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// Largest application payload accepted for publish or forward.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

pub const MAX_TOPIC_LENGTH: usize = 256;

/// Time a peer that pruned us is not re-grafted by maintenance.
pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

/// Topics remembered per remote peer.
const MAX_TOPICS_PER_PEER: usize = 100;

const COMMAND_CHANNEL_SIZE: usize = 1024;

#[inline]
pub fn is_valid_topic(topic: &str, max_len: usize) -> bool {
    !topic.is_empty() && topic.len() <= max_len && !topic.chars().any(char::is_control)
}

/// Tuning knobs for the gossip router.
///
/// The three degree parameters must satisfy
/// `mesh_n_low <= mesh_n <= mesh_n_high`; [`GossipRouter::spawn`] clamps a
/// config that does not.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Target number of mesh peers per topic (D). Grafting on subscribe
    /// stops here, and an oversized mesh is pruned back down to it.
    pub mesh_n: usize,
    /// Low watermark (D_lo). A heartbeat that finds fewer mesh peers than
    /// this grafts back up to `mesh_n`.
    pub mesh_n_low: usize,
    /// High watermark (D_hi). Inbound grafts beyond it are refused with a
    /// `Prune`, and a heartbeat that finds more prunes down to `mesh_n`.
    pub mesh_n_high: usize,
    /// Period of mesh maintenance and seen-cache eviction.
    pub heartbeat_interval: Duration,
    /// How long a message ID suppresses duplicates after first sight.
    pub seen_ttl: Duration,
    /// Upper bound on remembered message IDs; the least recent is evicted
    /// first when full.
    pub seen_capacity: usize,
    /// Largest application payload accepted for publish or forward, in bytes.
    pub max_payload: usize,
    /// Longest accepted topic name, in bytes.
    pub max_topic_len: usize,
    /// How long a peer that pruned us is skipped by maintenance grafting.
    pub prune_backoff: Duration,
}

impl RouterConfig {
    /// Restore `mesh_n_low <= mesh_n <= mesh_n_high` with `mesh_n >= 1`,
    /// keeping `mesh_n` and moving the watermarks around it.
    pub fn clamped(mut self) -> Self {
        self.mesh_n = self.mesh_n.max(1);
        self.mesh_n_low = self.mesh_n_low.min(self.mesh_n);
        self.mesh_n_high = self.mesh_n_high.max(self.mesh_n);
        self
    }

    fn degree_bounds_hold(&self) -> bool {
        self.mesh_n >= 1 && self.mesh_n_low <= self.mesh_n && self.mesh_n <= self.mesh_n_high
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            seen_ttl: DEFAULT_SEEN_TTL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_topic_len: MAX_TOPIC_LENGTH,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
        }
    }
}

// ============================================================================
// Errors and Counters
// ============================================================================

/// Errors a caller of the router can act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// The local node has not joined the topic.
    NotJoined,
    /// Topic is empty, too long, or contains control characters.
    InvalidTopic,
    PayloadTooLarge { size: usize, max: usize },
    /// The router task has stopped.
    Closed,
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotJoined => write!(f, "topic has not been joined"),
            Self::InvalidTopic => write!(f, "topic name is invalid"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "payload of {} bytes exceeds maximum of {} bytes", size, max)
            }
            Self::Closed => write!(f, "gossip router closed"),
        }
    }
}

impl std::error::Error for RouterError {}

/// Inbound and publish counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Frames that failed to decode or carried an invalid topic or payload.
    pub malformed: u64,
    /// Messages that came back carrying our own PeerID as sender.
    pub self_dropped: u64,
    pub duplicates: u64,
    /// Messages for topics this node has not joined.
    pub unjoined_dropped: u64,
    /// Network messages handed to local subscribers.
    pub delivered: u64,
    /// Per-peer forward sends scheduled, including first hop of own publishes.
    pub forwarded: u64,
    /// Own publishes delivered locally.
    pub published: u64,
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Join(String, oneshot::Sender<Result<(), RouterError>>),
    Leave(String, oneshot::Sender<Result<(), RouterError>>),
    Publish(String, Vec<u8>, oneshot::Sender<Result<MessageId, RouterError>>),
    Inbound(Identity, Vec<u8>),
    PeerConnected(Identity),
    PeerDisconnected(Identity),
    MeshPeers(String, oneshot::Sender<Vec<Identity>>),
    Topics(oneshot::Sender<Vec<String>>),
    Stats(oneshot::Sender<RouterStats>),
    Heartbeat(oneshot::Sender<()>),
    Quit,
}

/// Cheap-to-clone handle on the router task.
#[derive(Clone)]
pub struct GossipRouter {
    cmd_tx: mpsc::Sender<Command>,
}

impl GossipRouter {
    pub fn spawn<N: GossipRpc>(
        network: Arc<N>,
        local: Identity,
        registry: SubscriptionRegistry,
        config: RouterConfig,
    ) -> Self {
        if !config.degree_bounds_hold() {
            warn!(
                mesh_n = config.mesh_n,
                mesh_n_low = config.mesh_n_low,
                mesh_n_high = config.mesh_n_high,
                "inconsistent mesh degree bounds, clamping around mesh_n"
            );
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let actor = RouterActor::new(network, local, registry, config.clamped());
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    /// Join `topic`. Joining an already-joined topic changes nothing.
    pub async fn join(&self, topic: &str) -> Result<MeshHandle, RouterError> {
        self.request(|tx| Command::Join(topic.to_string(), tx)).await??;
        Ok(MeshHandle {
            topic: topic.to_string(),
            router: self.clone(),
        })
    }

    /// Leave `topic`, closing its local subscriptions and cancelling its
    /// in-flight forwards.
    pub async fn leave(&self, topic: &str) -> Result<(), RouterError> {
        self.request(|tx| Command::Leave(topic.to_string(), tx)).await?
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId, RouterError> {
        self.request(|tx| Command::Publish(topic.to_string(), payload, tx))
            .await?
    }

    /// Hand a raw gossip frame received from `from` to the router. Decode
    /// failures are counted, never returned.
    pub async fn handle_inbound(&self, from: Identity, bytes: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::Inbound(from, bytes)).await;
    }

    pub async fn peer_connected(&self, peer: Identity) {
        let _ = self.cmd_tx.send(Command::PeerConnected(peer)).await;
    }

    pub async fn peer_disconnected(&self, peer: Identity) {
        let _ = self.cmd_tx.send(Command::PeerDisconnected(peer)).await;
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<Identity> {
        self.request(|tx| Command::MeshPeers(topic.to_string(), tx))
            .await
            .unwrap_or_default()
    }

    pub async fn topics(&self) -> Vec<String> {
        self.request(Command::Topics).await.unwrap_or_default()
    }

    /// Counters as of every command sent before this call.
    pub async fn stats(&self) -> RouterStats {
        self.request(Command::Stats).await.unwrap_or_default()
    }

    /// Run one maintenance round now instead of waiting for the next tick.
    pub async fn heartbeat(&self) {
        let _ = self.request(Command::Heartbeat).await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

/// A joined topic.
#[derive(Clone)]
pub struct MeshHandle {
    topic: String,
    router: GossipRouter,
}

impl MeshHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, payload: Vec<u8>) -> Result<MessageId, RouterError> {
        self.router.publish(&self.topic, payload).await
    }

    pub async fn mesh_peers(&self) -> Vec<Identity> {
        self.router.mesh_peers(&self.topic).await
    }
}

impl std::fmt::Debug for MeshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshHandle").field("topic", &self.topic).finish()
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Default)]
struct TopicMesh {
    mesh: HashSet<Identity>,
    forwards: JoinSet<()>,
}

struct PeerState {
    topics: HashSet<String>,
    last_seen: Instant,
}

impl PeerState {
    fn new() -> Self {
        Self {
            topics: HashSet::new(),
            last_seen: Instant::now(),
        }
    }
}

struct RouterActor<N: GossipRpc> {
    network: Arc<N>,
    local: Identity,
    registry: SubscriptionRegistry,
    config: RouterConfig,
    joined: HashMap<String, TopicMesh>,
    peers: HashMap<Identity, PeerState>,
    /// Message ID -> first-seen time. Insertion order is LRU order since
    /// lookups use `peek`.
    seen: LruCache<MessageId, Instant>,
    backoff: HashMap<(Identity, String), Instant>,
    seqno: u64,
    stats: RouterStats,
}

impl<N: GossipRpc> RouterActor<N> {
    fn new(
        network: Arc<N>,
        local: Identity,
        registry: SubscriptionRegistry,
        config: RouterConfig,
    ) -> Self {
        let seen_capacity = NonZeroUsize::new(config.seen_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            network,
            local,
            registry,
            config,
            joined: HashMap::new(),
            peers: HashMap::new(),
            seen: LruCache::new(seen_capacity),
            backoff: HashMap::new(),
            seqno: rand::random(),
            stats: RouterStats::default(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut heartbeat_interval = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat_interval.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Join(topic, reply)) => {
                            let _ = reply.send(self.handle_join(&topic).await);
                        }
                        Some(Command::Leave(topic, reply)) => {
                            let _ = reply.send(self.handle_leave(&topic).await);
                        }
                        Some(Command::Publish(topic, payload, reply)) => {
                            let _ = reply.send(self.handle_publish_cmd(&topic, payload));
                        }
                        Some(Command::Inbound(from, bytes)) => {
                            self.handle_inbound(from, &bytes).await;
                        }
                        Some(Command::PeerConnected(peer)) => {
                            self.handle_peer_connected(peer).await;
                        }
                        Some(Command::PeerDisconnected(peer)) => {
                            self.remove_peer(&peer);
                        }
                        Some(Command::MeshPeers(topic, reply)) => {
                            let peers = self
                                .joined
                                .get(&topic)
                                .map(|t| t.mesh.iter().copied().collect())
                                .unwrap_or_default();
                            let _ = reply.send(peers);
                        }
                        Some(Command::Topics(reply)) => {
                            let _ = reply.send(self.joined.keys().cloned().collect());
                        }
                        Some(Command::Stats(reply)) => {
                            let _ = reply.send(self.stats);
                        }
                        Some(Command::Heartbeat(reply)) => {
                            self.heartbeat().await;
                            let _ = reply.send(());
                        }
                        Some(Command::Quit) | None => {
                            debug!("gossip router shutting down");
                            break;
                        }
                    }
                }
                _ = heartbeat_interval.tick() => {
                    self.heartbeat().await;
                }
            }
        }

        for (_, mut topic) in self.joined.drain() {
            topic.forwards.abort_all();
        }
    }

    /// Control frames go out inline; `GossipRpc` implementations only enqueue.
    async fn send_control(&self, to: &Identity, message: GossipRequest) {
        if let Err(e) = self.network.send_gossip(to, message).await {
            trace!(
                peer = %hex::encode(&to.as_bytes()[..8]),
                error = %e,
                "failed to send gossip control frame"
            );
        }
    }

    // ------------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------------

    async fn handle_join(&mut self, topic: &str) -> Result<(), RouterError> {
        if !is_valid_topic(topic, self.config.max_topic_len) {
            return Err(RouterError::InvalidTopic);
        }
        if self.joined.contains_key(topic) {
            return Ok(());
        }
        self.joined.insert(topic.to_string(), TopicMesh::default());

        let peers: Vec<Identity> = self.peers.keys().copied().collect();
        for peer in &peers {
            self.send_control(peer, GossipRequest::Subscribe { topic: topic.to_string() })
                .await;
        }

        let grafted = self.graft_candidates(topic, self.config.mesh_n).await;
        debug!(topic = %topic, peers = peers.len(), grafted = grafted, "joined topic");
        Ok(())
    }

    async fn handle_leave(&mut self, topic: &str) -> Result<(), RouterError> {
        let Some(mut state) = self.joined.remove(topic) else {
            return Err(RouterError::NotJoined);
        };
        state.forwards.abort_all();

        for peer in &state.mesh {
            self.send_control(peer, GossipRequest::Prune { topic: topic.to_string() })
                .await;
        }
        let peers: Vec<Identity> = self.peers.keys().copied().collect();
        for peer in &peers {
            self.send_control(peer, GossipRequest::Unsubscribe { topic: topic.to_string() })
                .await;
        }
        self.backoff.retain(|(_, t), _| t != topic);
        let closed = self.registry.unsubscribe(topic);

        debug!(topic = %topic, mesh = state.mesh.len(), subscribers_closed = closed, "left topic");
        Ok(())
    }

    fn handle_publish_cmd(&mut self, topic: &str, payload: Vec<u8>) -> Result<MessageId, RouterError> {
        if !is_valid_topic(topic, self.config.max_topic_len) {
            return Err(RouterError::InvalidTopic);
        }
        if !self.joined.contains_key(topic) {
            return Err(RouterError::NotJoined);
        }
        if payload.len() > self.config.max_payload {
            return Err(RouterError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload,
            });
        }

        self.seqno = self.seqno.wrapping_add(1);
        let envelope = Envelope::new(self.local, self.seqno, topic, payload);
        let message_id = envelope.message_id;
        self.seen.put(message_id, Instant::now());

        self.registry.deliver(&Delivery {
            message_id,
            sender: self.local,
            topic: envelope.topic.clone(),
            payload: envelope.payload.clone(),
            received_from: None,
        });
        self.stats.published += 1;

        let sent = self.forward(&envelope, &[]);
        debug!(
            topic = %topic,
            msg_id = %hex::encode(&message_id[..8]),
            mesh_peers = sent,
            "published message"
        );
        Ok(message_id)
    }

    /// Schedule sends of `envelope` to the topic mesh, skipping `exclude`.
    fn forward(&mut self, envelope: &Envelope, exclude: &[Identity]) -> usize {
        let Some(state) = self.joined.get_mut(&envelope.topic) else {
            return 0;
        };
        let targets: Vec<Identity> = state
            .mesh
            .iter()
            .filter(|p| !exclude.contains(p))
            .copied()
            .collect();

        for peer in &targets {
            let network = self.network.clone();
            let message = GossipRequest::Publish(envelope.clone());
            let peer = *peer;
            state.forwards.spawn(async move {
                if let Err(e) = network.send_gossip(&peer, message).await {
                    trace!(
                        peer = %hex::encode(&peer.as_bytes()[..8]),
                        error = %e,
                        "forward failed"
                    );
                }
            });
        }
        self.stats.forwarded += targets.len() as u64;
        targets.len()
    }

    // ------------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------------

    async fn handle_peer_connected(&mut self, peer: Identity) {
        if peer == self.local {
            return;
        }
        self.peers.entry(peer).or_insert_with(PeerState::new).last_seen = Instant::now();

        let topics: Vec<String> = self.joined.keys().cloned().collect();
        for topic in topics {
            self.send_control(&peer, GossipRequest::Subscribe { topic }).await;
        }
        trace!(peer = %hex::encode(&peer.as_bytes()[..8]), "peer connected to router");
    }

    fn remove_peer(&mut self, peer: &Identity) {
        if self.peers.remove(peer).is_none() {
            return;
        }
        for (topic, state) in self.joined.iter_mut() {
            if state.mesh.remove(peer) {
                debug!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    topic = %topic,
                    "removed disconnected peer from mesh"
                );
            }
        }
        self.backoff.retain(|(p, _), _| p != peer);
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn handle_inbound(&mut self, from: Identity, bytes: &[u8]) {
        let request: GossipRequest = match decode(bytes) {
            Ok(request) => request,
            Err(e) => {
                self.stats.malformed += 1;
                debug!(
                    peer = %hex::encode(&from.as_bytes()[..8]),
                    error = %e,
                    "dropping malformed gossip frame"
                );
                return;
            }
        };
        if !is_valid_topic(request.topic(), self.config.max_topic_len) {
            self.stats.malformed += 1;
            debug!(peer = %hex::encode(&from.as_bytes()[..8]), "dropping frame with invalid topic");
            return;
        }

        if from != self.local {
            self.peers.entry(from).or_insert_with(PeerState::new).last_seen = Instant::now();
        }

        match request {
            GossipRequest::Subscribe { topic } => self.handle_subscribe(from, topic).await,
            GossipRequest::Unsubscribe { topic } => self.handle_unsubscribe(from, &topic),
            GossipRequest::Graft { topic } => self.handle_graft(from, topic).await,
            GossipRequest::Prune { topic } => self.handle_prune(from, topic),
            GossipRequest::Publish(envelope) => self.handle_publish(from, envelope),
        }
    }

    async fn handle_subscribe(&mut self, from: Identity, topic: String) {
        let Some(peer) = self.peers.get_mut(&from) else {
            return;
        };
        if peer.topics.len() >= MAX_TOPICS_PER_PEER && !peer.topics.contains(&topic) {
            warn!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                "peer exceeded topic limit, ignoring subscribe"
            );
            return;
        }
        peer.topics.insert(topic.clone());
        self.backoff.remove(&(from, topic.clone()));

        let Some(state) = self.joined.get_mut(&topic) else {
            return;
        };
        if state.mesh.contains(&from) || state.mesh.len() >= self.config.mesh_n {
            return;
        }
        state.mesh.insert(from);
        let mesh_size = state.mesh.len();
        self.send_control(&from, GossipRequest::Graft { topic: topic.clone() }).await;

        debug!(
            peer = %hex::encode(&from.as_bytes()[..8]),
            topic = %topic,
            mesh_size = mesh_size,
            "grafted subscribing peer"
        );
    }

    fn handle_unsubscribe(&mut self, from: Identity, topic: &str) {
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.topics.remove(topic);
        }
        if let Some(state) = self.joined.get_mut(topic) {
            state.mesh.remove(&from);
        }
        self.backoff.remove(&(from, topic.to_string()));
        trace!(peer = %hex::encode(&from.as_bytes()[..8]), topic = %topic, "peer unsubscribed");
    }

    async fn handle_graft(&mut self, from: Identity, topic: String) {
        if let Some(peer) = self.peers.get_mut(&from)
            && (peer.topics.len() < MAX_TOPICS_PER_PEER || peer.topics.contains(&topic))
        {
            peer.topics.insert(topic.clone());
        }

        let accepted = match self.joined.get_mut(&topic) {
            Some(state) if state.mesh.contains(&from) => true,
            Some(state) if state.mesh.len() < self.config.mesh_n_high => {
                state.mesh.insert(from);
                true
            }
            _ => false,
        };

        if accepted {
            debug!(peer = %hex::encode(&from.as_bytes()[..8]), topic = %topic, "peer grafted");
        } else {
            trace!(peer = %hex::encode(&from.as_bytes()[..8]), topic = %topic, "refusing graft");
            self.send_control(&from, GossipRequest::Prune { topic }).await;
        }
    }

    fn handle_prune(&mut self, from: Identity, topic: String) {
        if let Some(state) = self.joined.get_mut(&topic)
            && state.mesh.remove(&from)
        {
            debug!(peer = %hex::encode(&from.as_bytes()[..8]), topic = %topic, "pruned by peer");
        }
        if self.joined.contains_key(&topic) {
            self.backoff
                .insert((from, topic), Instant::now() + self.config.prune_backoff);
        }
    }

    fn handle_publish(&mut self, from: Identity, envelope: Envelope) {
        if envelope.sender == self.local {
            self.stats.self_dropped += 1;
            trace!(msg_id = %hex::encode(&envelope.message_id[..8]), "dropping own message");
            return;
        }
        if self.is_seen(&envelope.message_id) {
            self.stats.duplicates += 1;
            trace!(msg_id = %hex::encode(&envelope.message_id[..8]), "dropping duplicate");
            return;
        }
        if !self.joined.contains_key(&envelope.topic) {
            self.stats.unjoined_dropped += 1;
            trace!(topic = %envelope.topic, "dropping message for unjoined topic");
            return;
        }
        if envelope.payload.len() > self.config.max_payload {
            self.stats.malformed += 1;
            debug!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                size = envelope.payload.len(),
                "dropping oversized payload"
            );
            return;
        }

        self.seen.put(envelope.message_id, Instant::now());
        if let Some(peer) = self.peers.get_mut(&from)
            && peer.topics.len() < MAX_TOPICS_PER_PEER
        {
            peer.topics.insert(envelope.topic.clone());
        }

        self.registry.deliver(&Delivery {
            message_id: envelope.message_id,
            sender: envelope.sender,
            topic: envelope.topic.clone(),
            payload: envelope.payload.clone(),
            received_from: Some(from),
        });
        self.stats.delivered += 1;

        let forwarded = self.forward(&envelope, &[from, envelope.sender]);
        trace!(
            topic = %envelope.topic,
            msg_id = %hex::encode(&envelope.message_id[..8]),
            from = %hex::encode(&from.as_bytes()[..8]),
            forwarded = forwarded,
            "accepted message"
        );
    }

    fn is_seen(&mut self, message_id: &MessageId) -> bool {
        match self.seen.peek(message_id) {
            Some(first_seen) if first_seen.elapsed() <= self.config.seen_ttl => true,
            Some(_) => {
                self.seen.pop(message_id);
                false
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    async fn heartbeat(&mut self) {
        let peers: Vec<Identity> = self.peers.keys().copied().collect();
        for peer in peers {
            if !self.network.is_connected(&peer).await {
                debug!(peer = %hex::encode(&peer.as_bytes()[..8]), "link gone, dropping peer");
                self.remove_peer(&peer);
            }
        }

        let now = Instant::now();
        self.backoff.retain(|_, until| *until > now);

        let topics: Vec<String> = self.joined.keys().cloned().collect();
        for topic in &topics {
            self.mesh_maintenance(topic).await;
        }

        self.evict_expired_seen();

        for state in self.joined.values_mut() {
            while state.forwards.try_join_next().is_some() {}
        }
    }

    async fn mesh_maintenance(&mut self, topic: &str) {
        let Some(state) = self.joined.get_mut(topic) else {
            return;
        };
        let peers = &self.peers;
        state
            .mesh
            .retain(|p| peers.get(p).is_some_and(|s| s.topics.contains(topic)));
        let mesh_count = state.mesh.len();

        if mesh_count < self.config.mesh_n_low {
            let needed = self.config.mesh_n.saturating_sub(mesh_count);
            let grafted = self.graft_candidates(topic, needed).await;
            if grafted > 0 {
                debug!(
                    topic = %topic,
                    grafted = grafted,
                    mesh_size = mesh_count + grafted,
                    "mesh maintenance: added peers via GRAFT"
                );
            }
        } else if mesh_count > self.config.mesh_n_high {
            let mut ranked: Vec<Identity> = state.mesh.iter().copied().collect();
            self.rank(&mut ranked);
            let excess = ranked.split_off(self.config.mesh_n.min(ranked.len()));
            if let Some(state) = self.joined.get_mut(topic) {
                for peer in &excess {
                    state.mesh.remove(peer);
                }
            }
            for peer in &excess {
                self.send_control(peer, GossipRequest::Prune { topic: topic.to_string() })
                    .await;
            }
            debug!(
                topic = %topic,
                pruned = excess.len(),
                mesh_size = self.config.mesh_n,
                "mesh maintenance: removed peers via PRUNE"
            );
        }
    }

    /// Graft up to `count` of the best-ranked connected peers that share
    /// `topic` and are not already in its mesh.
    async fn graft_candidates(&mut self, topic: &str, count: usize) -> usize {
        let Some(state) = self.joined.get(topic) else {
            return 0;
        };
        let now = Instant::now();
        let mut candidates: Vec<Identity> = self
            .peers
            .iter()
            .filter(|(id, s)| s.topics.contains(topic) && !state.mesh.contains(*id))
            .filter(|(id, _)| {
                self.backoff
                    .get(&(**id, topic.to_string()))
                    .is_none_or(|until| *until <= now)
            })
            .map(|(id, _)| *id)
            .collect();
        self.rank(&mut candidates);
        candidates.truncate(count);

        if let Some(state) = self.joined.get_mut(topic) {
            state.mesh.extend(candidates.iter().copied());
        }
        for peer in &candidates {
            self.send_control(peer, GossipRequest::Graft { topic: topic.to_string() })
                .await;
        }
        candidates.len()
    }

    /// Best first: most shared joined topics, then most recently seen.
    fn rank(&self, peers: &mut [Identity]) {
        let key = |id: &Identity| {
            self.peers.get(id).map(|s| {
                let shared = s
                    .topics
                    .iter()
                    .filter(|t| self.joined.contains_key(*t))
                    .count();
                (shared, s.last_seen)
            })
        };
        peers.sort_by(|a, b| key(b).cmp(&key(a)).then_with(|| a.cmp(b)));
    }

    fn evict_expired_seen(&mut self) {
        let ttl = self.config.seen_ttl;
        let mut evicted = 0usize;
        while let Some((_, first_seen)) = self.seen.peek_lru() {
            if first_seen.elapsed() <= ttl {
                break;
            }
            self.seen.pop_lru();
            evicted += 1;
        }
        if evicted > 0 {
            trace!(evicted = evicted, remaining = self.seen.len(), "evicted expired seen entries");
        }
    }
}
