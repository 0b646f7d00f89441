//! # meshcast - Topic Gossip Overlay
//!
//! meshcast lets processes publish and receive messages on named topics over
//! a self-organizing peer-to-peer mesh:
//!
//! - **Identity**: Ed25519 keypairs; the 32-byte public key is the PeerID
//! - **Transport**: QUIC with mutual TLS, one connection per peer, one
//!   substream per protocol
//! - **Discovery**: UDP multicast advertisements on the local segment
//! - **DHT**: Kademlia routing table for wide-area bootstrap
//! - **Gossip**: per-topic meshes with bounded degree and a seen cache
//!
//! ## Architecture
//!
//! Stateful components use the **Actor Pattern**:
//! - Each component (connection manager, DHT, router) has a public handle
//!   and a private actor
//! - Handles are cheap to clone and talk to the actor over async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! ## Delivery Guarantees
//!
//! - A message reaches each local subscriber at most once
//! - A node never receives its own messages back from the network
//! - Subscriber queues are bounded and drop the oldest item when full
//! - Dissemination is best-effort with no cross-peer ordering
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, PeerIDs, contacts and bootstrap addresses |
//! | `crypto` | TLS certificate generation and verification |
//! | `transport` | QUIC endpoint, connections and framed substreams |
//! | `rpc` | Connection manager implementing the protocol traits |
//! | `discovery` | Local-network peer discovery |
//! | `dht` | Kademlia routing table and iterative lookups |
//! | `router` | Per-topic gossip meshes |
//! | `subscription` | Bounded local delivery queues |
//! | `protocols` | Trait seams between components |
//! | `messages` | Wire types and codec |

mod crypto;
mod dht;
mod discovery;
mod identity;
mod messages;
mod node;
mod protocols;
mod router;
mod rpc;
mod subscription;
mod transport;

pub use dht::{DhtNode, RoutingTable, DEFAULT_ALPHA, DEFAULT_K};
pub use discovery::{
    DiscoveryConfig, LocalDiscovery, PeerFound, DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_DISCOVERY_PORT,
    DEFAULT_MULTICAST_GROUP, DEFAULT_SERVICE_TAG,
};
pub use identity::{Contact, Identity, Keypair, PeerAddr, PeerAddrError};
pub use messages::{
    compute_message_id, decode, encode, Advertisement, CodecError, DhtRequest, DhtResponse,
    Envelope, GossipRequest, MessageId, MAX_MESSAGE_SIZE,
};
pub use node::{Node, NodeConfig};
pub use protocols::{DhtNodeRpc, GossipRpc, PeerFoundHandler};
pub use router::{GossipRouter, MeshHandle, RouterConfig, RouterError, RouterStats};
pub use rpc::{ConnectOutcome, Inbound, LinkEvent, RpcNode, OUTBOUND_QUEUE_CAPACITY};
pub use subscription::{Delivery, Subscription, SubscriptionRegistry, DEFAULT_QUEUE_CAPACITY};
pub use transport::{
    IncomingSubStream, PeerConnection, ProtocolId, SubStream, Transport, TransportError, DIAL_TIMEOUT,
    MAX_FRAME_SIZE,
};
