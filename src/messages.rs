//! # Wire Protocol Messages
//!
//! Every serializable type that crosses the network lives here, together with
//! the codec that moves them to and from bytes.
//!
//! | Channel | Type | Carried on |
//! |---------|------|-----------|
//! | Gossip | [`GossipRequest`] (wraps [`Envelope`]) | long-lived `Gossip` substream |
//! | DHT | [`DhtRequest`] / [`DhtResponse`] | one `Dht` substream per request |
//! | Discovery | [`Advertisement`] | UDP datagram |
//!
//! ## Encoding
//!
//! bincode with fixed-width integers and a hard size limit. Strings and byte
//! vectors carry their own length prefix, so an encoded value is
//! self-describing and re-encodes to the same bytes. Trailing garbage after a
//! complete value is an error.
//!
//! ## Message IDs
//!
//! A published message is identified by
//! `blake3(sender || seqno || len(topic) || topic || payload)`. The sequence
//! number is minted per node, so two publishes of identical payloads still
//! get distinct IDs.

use std::fmt;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{Contact, Identity};

/// Upper bound for any single encoded message.
pub const MAX_MESSAGE_SIZE: u64 = 1024 * 1024;

pub type MessageId = [u8; 32];

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

/// Failure to turn bytes into a message or back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The input exceeds [`MAX_MESSAGE_SIZE`].
    TooLarge { size: usize, max: u64 },
    /// The input is not a valid encoding of the expected type.
    Malformed(String),
    Encode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::TooLarge { size, max } => {
                write!(f, "message of {} bytes exceeds limit of {} bytes", size, max)
            }
            CodecError::Malformed(reason) => write!(f, "malformed message: {}", reason),
            CodecError::Encode(reason) => write!(f, "failed to encode message: {}", reason),
        }
    }
}

impl std::error::Error for CodecError {}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode_options()
        .serialize(value)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Deserialize with the size bound enforced before any allocation.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    if bytes.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| CodecError::Malformed(e.to_string()))
}

pub fn compute_message_id(sender: &Identity, seqno: u64, topic: &str, payload: &[u8]) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(sender.as_bytes());
    hasher.update(&seqno.to_be_bytes());
    hasher.update(&(topic.len() as u32).to_be_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

/// An application message as it travels through the mesh. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub sender: Identity,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(sender: Identity, seqno: u64, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        let topic = topic.into();
        let message_id = compute_message_id(&sender, seqno, &topic, &payload);
        Self {
            message_id,
            sender,
            topic,
            payload,
        }
    }
}

/// Frames exchanged on a gossip substream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipRequest {
    /// The sender has joined `topic`.
    Subscribe { topic: String },
    /// The sender has left `topic`.
    Unsubscribe { topic: String },
    /// Request to add the sender to the receiver's mesh for `topic`.
    Graft { topic: String },
    /// The sender removed the receiver from its mesh for `topic`, or refuses a graft.
    Prune { topic: String },
    Publish(Envelope),
}

impl GossipRequest {
    pub fn topic(&self) -> &str {
        match self {
            GossipRequest::Subscribe { topic }
            | GossipRequest::Unsubscribe { topic }
            | GossipRequest::Graft { topic }
            | GossipRequest::Prune { topic } => topic,
            GossipRequest::Publish(envelope) => &envelope.topic,
        }
    }
}

/// DHT requests. The requester's identity comes from the TLS session, never
/// from the message body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    FindNode { target: Identity },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtResponse {
    Ack,
    Nodes(Vec<Contact>),
    Error { message: String },
}

/// Local-network presence announcement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub service_tag: String,
    pub peer_id: Identity,
    pub addresses: Vec<String>,
}
