//! Protocol trait definitions for meshcast's networking layer.
//!
//! The router and the DHT depend only on these traits, never on the QUIC
//! connection manager, so both can be driven by in-memory doubles in tests.
//!
//! | Protocol | Trait | Implemented by |
//! |----------|-------|----------------|
//! | Gossip | [`GossipRpc`] | `RpcNode` (per-peer outbound queue) |
//! | DHT | [`DhtNodeRpc`] | `RpcNode` (request/response substream) |
//! | Discovery | [`PeerFoundHandler`] | the node's dispatcher |

use anyhow::Result;
use async_trait::async_trait;

use crate::discovery::PeerFound;
use crate::identity::{Contact, Identity};
use crate::messages::GossipRequest;

/// Kademlia node operations.
#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    /// Ask `to` for the contacts it knows closest to `target`.
    async fn find_node(&self, to: &Contact, target: Identity) -> Result<Vec<Contact>>;

    async fn ping(&self, to: &Contact) -> Result<()>;
}

/// One-way gossip delivery to already-linked peers.
#[async_trait]
pub trait GossipRpc: Send + Sync + 'static {
    /// Queue `message` for `to`. Fails if there is no live link to that peer.
    async fn send_gossip(&self, to: &Identity, message: GossipRequest) -> Result<()>;

    /// Whether a live link to `peer` exists right now.
    async fn is_connected(&self, peer: &Identity) -> bool;
}

/// Receives discovery results.
#[async_trait]
pub trait PeerFoundHandler: Send + Sync + 'static {
    async fn on_peer_found(&self, found: PeerFound);
}
