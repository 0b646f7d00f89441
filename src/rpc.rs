//! # Connection Manager and RPC
//!
//! Owns every live QUIC connection of the node and exposes them to the
//! protocol layers through [`GossipRpc`] and [`DhtNodeRpc`].
//!
//! ## Architecture
//!
//! The layer uses the **Actor Pattern**:
//! - [`RpcNode`]: public handle (cheap to clone)
//! - `RpcNodeActor`: owns the link map and in-flight dials
//!
//! ## Links
//!
//! A link is the one connection used to *send* to a peer, plus a bounded
//! outbound gossip queue drained in order by a single writer task. The first
//! connection that completes for a PeerID becomes its link. Any later
//! connection to the same PeerID (inbound or outbound) is still read from,
//! but never replaces the link. Concurrent dials to one PeerID share a single
//! attempt.
//!
//! ## Inbound Traffic
//!
//! Every connection runs a serve loop. Gossip substreams surface as
//! [`Inbound::Gossip`]; each DHT substream surfaces as one [`Inbound::Dht`]
//! carrying a reply channel. Link changes surface as [`LinkEvent`]s.
//!
//! The requester identity always comes from the TLS session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::identity::{Contact, Identity};
use crate::messages::{decode, encode, DhtRequest, DhtResponse, GossipRequest};
use crate::protocols::{DhtNodeRpc, GossipRpc};
use crate::transport::{PeerConnection, ProtocolId, SubStream, Transport, TransportError};

/// Pending gossip frames per link. Frames beyond this are dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

/// Deadline for one outbound DHT request, dial included.
const DHT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Contacts accepted from a single FindNode response.
const MAX_CONTACTS_PER_RESPONSE: usize = 100;

/// Connection-level change reported to the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Up { peer: Identity, addr: SocketAddr },
    Down { peer: Identity },
}

/// Traffic received from a remote peer.
#[derive(Debug)]
pub enum Inbound {
    Gossip {
        from: Identity,
        bytes: Vec<u8>,
    },
    Dht {
        from: Contact,
        request: DhtRequest,
        reply: oneshot::Sender<DhtResponse>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new link was established by this call (or the dial it joined).
    Connected,
    /// A link to the peer already existed.
    AlreadyConnected,
}

// ============================================================================
// Actor Commands
// ============================================================================

enum RpcCommand {
    Connect {
        contact: Contact,
        reply: oneshot::Sender<Result<ConnectOutcome>>,
    },
    DialFinished {
        peer: Identity,
        result: Result<PeerConnection, TransportError>,
    },
    /// An inbound connection finished its handshake.
    Adopt(PeerConnection),
    Closed {
        peer: Identity,
        stable_id: usize,
    },
    Send {
        peer: Identity,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    LinkFor {
        peer: Identity,
        reply: oneshot::Sender<Option<PeerConnection>>,
    },
    IsConnected {
        peer: Identity,
        reply: oneshot::Sender<bool>,
    },
    ConnectedPeers(oneshot::Sender<Vec<Identity>>),
    Quit,
}

// ============================================================================
// Actor (owns all mutable state)
// ============================================================================

struct Link {
    connection: PeerConnection,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

struct RpcNodeActor {
    transport: Transport,
    cmd_tx: mpsc::Sender<RpcCommand>,
    inbound_tx: mpsc::Sender<Inbound>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    links: HashMap<Identity, Link>,
    /// Dials in progress and the callers waiting on each.
    in_flight: HashMap<Identity, Vec<oneshot::Sender<Result<ConnectOutcome>>>>,
    shutdown: CancellationToken,
}

impl RpcNodeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = self.shutdown.cancelled() => None,
            };
            match cmd {
                Some(RpcCommand::Connect { contact, reply }) => self.handle_connect(contact, reply),
                Some(RpcCommand::DialFinished { peer, result }) => {
                    self.handle_dial_finished(peer, result);
                }
                Some(RpcCommand::Adopt(connection)) => {
                    self.adopt(connection);
                }
                Some(RpcCommand::Closed { peer, stable_id }) => {
                    self.handle_closed(peer, stable_id);
                }
                Some(RpcCommand::Send { peer, bytes, reply }) => {
                    let _ = reply.send(self.enqueue(&peer, bytes));
                }
                Some(RpcCommand::LinkFor { peer, reply }) => {
                    let _ = reply.send(self.live_link(&peer).map(|l| l.connection.clone()));
                }
                Some(RpcCommand::IsConnected { peer, reply }) => {
                    let _ = reply.send(self.live_link(&peer).is_some());
                }
                Some(RpcCommand::ConnectedPeers(reply)) => {
                    let peers = self
                        .links
                        .iter()
                        .filter(|(_, l)| !l.connection.is_closed())
                        .map(|(id, _)| *id)
                        .collect();
                    let _ = reply.send(peers);
                }
                Some(RpcCommand::Quit) | None => {
                    debug!("RpcNode actor shutting down");
                    break;
                }
            }
        }

        self.shutdown.cancel();
        for (_, link) in self.links.drain() {
            link.cancel.cancel();
            link.connection.close(b"shutdown");
        }
        for (_, waiters) in self.in_flight.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(anyhow!("connection manager shut down")));
            }
        }
        self.transport.close();
    }

    fn live_link(&self, peer: &Identity) -> Option<&Link> {
        self.links.get(peer).filter(|l| !l.connection.is_closed())
    }

    fn handle_connect(&mut self, contact: Contact, reply: oneshot::Sender<Result<ConnectOutcome>>) {
        let peer = contact.identity;
        if peer == self.transport.local_identity() {
            let _ = reply.send(Err(anyhow!("refusing to connect to self")));
            return;
        }
        if self.live_link(&peer).is_some() {
            let _ = reply.send(Ok(ConnectOutcome::AlreadyConnected));
            return;
        }
        if let Some(waiters) = self.in_flight.get_mut(&peer) {
            waiters.push(reply);
            return;
        }
        self.in_flight.insert(peer, vec![reply]);

        let transport = self.transport.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = dial_contact(&transport, &contact).await;
            let _ = cmd_tx.send(RpcCommand::DialFinished { peer, result }).await;
        });
    }

    fn handle_dial_finished(&mut self, peer: Identity, result: Result<PeerConnection, TransportError>) {
        let waiters = self.in_flight.remove(&peer).unwrap_or_default();
        match result {
            Ok(connection) => {
                let outcome = if self.adopt(connection) {
                    ConnectOutcome::Connected
                } else {
                    ConnectOutcome::AlreadyConnected
                };
                for waiter in waiters {
                    let _ = waiter.send(Ok(outcome));
                }
            }
            Err(e) => {
                debug!(peer = %hex::encode(&peer.as_bytes()[..8]), error = %e, "dial failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(anyhow::Error::new(e.clone())));
                }
            }
        }
    }

    /// Serve `connection` and make it the peer's link if there is none.
    /// Returns whether it became the link.
    fn adopt(&mut self, connection: PeerConnection) -> bool {
        let peer = connection.peer_id();
        let addr = connection.remote_addr();

        let cancel = self.shutdown.child_token();
        tokio::spawn(serve_connection(
            connection.clone(),
            self.inbound_tx.clone(),
            self.cmd_tx.clone(),
            cancel.clone(),
        ));

        if self.live_link(&peer).is_some() {
            trace!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                "extra connection to linked peer, serving for reads only"
            );
            return false;
        }
        if let Some(stale) = self.links.remove(&peer) {
            stale.cancel.cancel();
        }

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        tokio::spawn(run_writer(connection.clone(), outbound_rx, cancel.clone()));
        self.links.insert(
            peer,
            Link {
                connection,
                outbound,
                cancel,
            },
        );

        info!(peer = %hex::encode(&peer.as_bytes()[..8]), addr = %addr, "link up");
        let _ = self.events_tx.send(LinkEvent::Up { peer, addr });
        true
    }

    fn handle_closed(&mut self, peer: Identity, stable_id: usize) {
        let is_link = self
            .links
            .get(&peer)
            .is_some_and(|l| l.connection.stable_id() == stable_id);
        if !is_link {
            return;
        }
        if let Some(link) = self.links.remove(&peer) {
            link.cancel.cancel();
        }
        info!(peer = %hex::encode(&peer.as_bytes()[..8]), "link down");
        let _ = self.events_tx.send(LinkEvent::Down { peer });
    }

    fn enqueue(&mut self, peer: &Identity, bytes: Vec<u8>) -> Result<()> {
        let Some(link) = self.live_link(peer) else {
            bail!("no link to peer {}", hex::encode(&peer.as_bytes()[..8]));
        };
        match link.outbound.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    capacity = OUTBOUND_QUEUE_CAPACITY,
                    "outbound gossip queue full, dropping frame"
                );
                bail!("outbound queue full")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => bail!("link writer stopped"),
        }
    }
}

async fn dial_contact(transport: &Transport, contact: &Contact) -> Result<PeerConnection, TransportError> {
    let addrs = contact.socket_addrs();
    let mut last_error = TransportError::Protocol("contact has no dialable address".into());
    for addr in addrs {
        match transport.dial(addr, contact.identity).await {
            Ok(connection) => return Ok(connection),
            Err(e) => {
                trace!(addr = %addr, error = %e, "dial attempt failed");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// Drain the outbound queue onto one long-lived gossip substream.
async fn run_writer(
    connection: PeerConnection,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let peer = connection.peer_id();
    let mut stream: Option<SubStream> = None;

    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            bytes = outbound_rx.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };

        if stream.is_none() {
            match connection.open_substream(ProtocolId::Gossip).await {
                Ok(s) => stream = Some(s),
                Err(e) => {
                    debug!(peer = %hex::encode(&peer.as_bytes()[..8]), error = %e, "cannot open gossip stream");
                    connection.close(b"gossip stream failed");
                    break;
                }
            }
        }
        if let Some(s) = stream.as_mut()
            && let Err(e) = s.write_frame(&bytes).await
        {
            debug!(peer = %hex::encode(&peer.as_bytes()[..8]), error = %e, "gossip write failed");
            connection.close(b"gossip write failed");
            break;
        }
    }

    if let Some(mut s) = stream {
        s.finish();
    }
}

/// Accept substreams on `connection` until it closes.
async fn serve_connection(
    connection: PeerConnection,
    inbound_tx: mpsc::Sender<Inbound>,
    cmd_tx: mpsc::Sender<RpcCommand>,
    cancel: CancellationToken,
) {
    let peer = connection.peer_id();
    let from = Contact::single(peer, connection.remote_addr().to_string());

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            s = connection.accept_incoming() => s,
        };
        let incoming = match accepted {
            Ok(s) => s,
            Err(TransportError::Closed) => {
                debug!(peer = %hex::encode(&peer.as_bytes()[..8]), "connection closed");
                break;
            }
            Err(e) => {
                debug!(peer = %hex::encode(&peer.as_bytes()[..8]), error = %e, "substream accept failed");
                break;
            }
        };

        let inbound_tx = inbound_tx.clone();
        let from = from.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let substream = match incoming.negotiate().await {
                Ok(substream) => substream,
                Err(e) => {
                    trace!(peer = %hex::encode(&peer.as_bytes()[..8]), error = %e, "substream negotiation failed");
                    return;
                }
            };
            let result = match substream.protocol() {
                ProtocolId::Gossip => serve_gossip_stream(substream, peer, inbound_tx, cancel).await,
                ProtocolId::Dht => serve_dht_stream(substream, from, inbound_tx).await,
            };
            if let Err(e) = result {
                debug!(peer = %hex::encode(&peer.as_bytes()[..8]), error = ?e, "stream error");
            }
        });
    }

    let _ = cmd_tx
        .send(RpcCommand::Closed {
            peer,
            stable_id: connection.stable_id(),
        })
        .await;
}

async fn serve_gossip_stream(
    mut stream: SubStream,
    from: Identity,
    inbound_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = stream.read_frame() => frame?,
        };
        let Some(bytes) = frame else {
            return Ok(());
        };
        if inbound_tx.send(Inbound::Gossip { from, bytes }).await.is_err() {
            return Ok(());
        }
    }
}

async fn serve_dht_stream(
    mut stream: SubStream,
    from: Contact,
    inbound_tx: mpsc::Sender<Inbound>,
) -> Result<()> {
    let frame = tokio::time::timeout(REQUEST_READ_TIMEOUT, stream.read_frame())
        .await
        .map_err(|_| anyhow!("request read timed out"))??;
    let Some(frame) = frame else {
        return Ok(());
    };

    let response = match decode::<DhtRequest>(&frame) {
        Err(e) => {
            debug!(remote = ?from.primary_addr(), error = %e, "malformed DHT request");
            DhtResponse::Error {
                message: e.to_string(),
            }
        }
        Ok(request) => {
            let (reply, reply_rx) = oneshot::channel();
            inbound_tx
                .send(Inbound::Dht {
                    from,
                    request,
                    reply,
                })
                .await
                .map_err(|_| anyhow!("DHT handler closed"))?;
            match tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, reply_rx).await {
                Ok(Ok(response)) => response,
                _ => DhtResponse::Error {
                    message: "request handler unavailable".to_string(),
                },
            }
        }
    };

    stream
        .write_frame(&encode(&response)?)
        .await
        .context("failed to write DHT response")?;
    stream.finish();
    Ok(())
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct RpcNode {
    transport: Transport,
    cmd_tx: mpsc::Sender<RpcCommand>,
    shutdown: CancellationToken,
}

impl RpcNode {
    /// Start the connection manager over `transport`. Inbound traffic goes to
    /// `inbound_tx`; link changes go to `events_tx`.
    pub fn new(
        transport: Transport,
        inbound_tx: mpsc::Sender<Inbound>,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self::with_shutdown(transport, inbound_tx, events_tx, CancellationToken::new())
    }

    /// Like [`RpcNode::new`], but the actor, the accept loop and every serve
    /// loop also stop when `shutdown` is cancelled. Cancelling closes all
    /// connections and the endpoint.
    pub fn with_shutdown(
        transport: Transport,
        inbound_tx: mpsc::Sender<Inbound>,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);

        let actor = RpcNodeActor {
            transport: transport.clone(),
            cmd_tx: cmd_tx.clone(),
            inbound_tx,
            events_tx,
            links: HashMap::new(),
            in_flight: HashMap::new(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            transport,
            cmd_tx,
            shutdown,
        }
    }

    pub fn local_identity(&self) -> Identity {
        self.transport.local_identity()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.transport.local_addr()
    }

    /// Accept inbound connections until the node shuts down.
    pub fn spawn_accept_loop(&self) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let cmd_tx = self.cmd_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let incoming = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    incoming = transport.accept() => incoming,
                };
                let Some(incoming) = incoming else {
                    break;
                };

                let transport = transport.clone();
                let cmd_tx = cmd_tx.clone();
                tokio::spawn(async move {
                    match transport.complete(incoming).await {
                        Ok(connection) => {
                            let _ = cmd_tx.send(RpcCommand::Adopt(connection)).await;
                        }
                        Err(e) => debug!(error = %e, "inbound handshake failed"),
                    }
                });
            }
            debug!("accept loop stopped");
        })
    }

    /// Ensure a link to `contact`, dialing if needed.
    pub async fn connect(&self, contact: &Contact) -> Result<ConnectOutcome> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::Connect {
                contact: contact.clone(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("RPC actor closed"))?;
        reply_rx.await.map_err(|_| anyhow!("RPC actor closed"))?
    }

    pub async fn connected_peers(&self) -> Vec<Identity> {
        let (reply, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(RpcCommand::ConnectedPeers(reply)).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Close every connection and stop all serve loops.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RpcCommand::Quit).await;
        self.shutdown.cancel();
    }

    async fn link_for(&self, peer: &Identity) -> Option<PeerConnection> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::LinkFor { peer: *peer, reply })
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    async fn dht_request(&self, to: &Contact, request: DhtRequest) -> Result<DhtResponse> {
        tokio::time::timeout(DHT_REQUEST_TIMEOUT, async {
            let connection = match self.link_for(&to.identity).await {
                Some(connection) => connection,
                None => {
                    self.connect(to).await?;
                    self.link_for(&to.identity)
                        .await
                        .context("link vanished after connect")?
                }
            };

            let mut stream = connection.open_substream(ProtocolId::Dht).await?;
            stream.write_frame(&encode(&request)?).await?;
            stream.finish();
            let frame = stream
                .read_frame()
                .await?
                .context("peer closed DHT stream without responding")?;
            let response: DhtResponse = decode(&frame).context("failed to decode DHT response")?;
            Ok::<_, anyhow::Error>(response)
        })
        .await
        .context("DHT request timed out")?
    }
}

#[async_trait]
impl DhtNodeRpc for RpcNode {
    async fn find_node(&self, to: &Contact, target: Identity) -> Result<Vec<Contact>> {
        match self.dht_request(to, DhtRequest::FindNode { target }).await? {
            DhtResponse::Nodes(mut nodes) => {
                if nodes.len() > MAX_CONTACTS_PER_RESPONSE {
                    warn!(
                        peer = %to.primary_addr().unwrap_or("<no addr>"),
                        count = nodes.len(),
                        max = MAX_CONTACTS_PER_RESPONSE,
                        "peer returned too many contacts, truncating"
                    );
                    nodes.truncate(MAX_CONTACTS_PER_RESPONSE);
                }
                Ok(nodes)
            }
            DhtResponse::Error { message } => bail!("FindNode rejected: {}", message),
            other => bail!("unexpected response to FindNode: {:?}", other),
        }
    }

    async fn ping(&self, to: &Contact) -> Result<()> {
        match self.dht_request(to, DhtRequest::Ping).await? {
            DhtResponse::Ack => Ok(()),
            DhtResponse::Error { message } => bail!("Ping rejected: {}", message),
            other => bail!("unexpected response to Ping: {:?}", other),
        }
    }
}

#[async_trait]
impl GossipRpc for RpcNode {
    async fn send_gossip(&self, to: &Identity, message: GossipRequest) -> Result<()> {
        let bytes = encode(&message)?;
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::Send {
                peer: *to,
                bytes,
                reply,
            })
            .await
            .map_err(|_| anyhow!("RPC actor closed"))?;
        reply_rx.await.map_err(|_| anyhow!("RPC actor closed"))?
    }

    async fn is_connected(&self, peer: &Identity) -> bool {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RpcCommand::IsConnected { peer: *peer, reply })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }
}
