//! # QUIC Transport
//!
//! A thin layer over a quinn [`Endpoint`] that speaks in PeerIDs:
//!
//! - [`Transport::dial`] connects to an address and proves the remote holds
//!   the expected identity (see `crypto`).
//! - [`Transport::accept`] / [`Transport::complete`] yield inbound
//!   connections with the remote identity read from its client certificate.
//! - [`PeerConnection`] multiplexes logical protocols as QUIC bidirectional
//!   streams. The first byte of every stream is a [`ProtocolId`] tag.
//! - [`SubStream`] carries length-prefixed frames: 4-byte big-endian length,
//!   then the body.
//!
//! ```text
//!   one QUIC connection per peer pair
//!   ├── stream [0x01 Gossip] frame frame frame ...   (long-lived)
//!   ├── stream [0x02 Dht]    request ─► response     (one shot)
//!   └── stream [0x02 Dht]    request ─► response
//! ```
//!
//! Bytes on one stream arrive in send order; nothing is promised across streams.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream};
use tracing::{debug, trace};

use crate::crypto::{sni_for, verified_peer, NodeCertificate};
use crate::identity::{Identity, Keypair};

/// Default deadline for a dial, including the TLS handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest frame body accepted on read or write.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// How long a freshly accepted stream may take to send its protocol tag.
const SUBSTREAM_TAG_TIMEOUT: Duration = Duration::from_secs(5);

/// Application close code used for orderly shutdown.
const CLOSE_CODE_NORMAL: u32 = 0;
/// Stream reset code for unknown protocol tags.
const RESET_CODE_UNKNOWN_PROTOCOL: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// Long-lived stream carrying gossip frames in one direction.
    Gossip = 0x01,
    /// One request frame followed by one response frame.
    Dht = 0x02,
}

impl ProtocolId {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(ProtocolId::Gossip),
            0x02 => Some(ProtocolId::Dht),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The local socket could not be bound. Fatal at startup.
    Bind { addr: SocketAddr, reason: String },
    /// The peer did not complete a handshake in time, or no route exists.
    Unreachable { addr: SocketAddr, reason: String },
    /// TLS failed, or the remote presented a different identity.
    HandshakeFailed(String),
    /// The connection or stream is gone.
    Closed,
    /// The remote violated framing rules.
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Bind { addr, reason } => {
                write!(f, "cannot bind listening address {}: {}", addr, reason)
            }
            TransportError::Unreachable { addr, reason } => {
                write!(f, "peer at {} unreachable: {}", addr, reason)
            }
            TransportError::HandshakeFailed(reason) => write!(f, "handshake failed: {}", reason),
            TransportError::Closed => write!(f, "connection closed"),
            TransportError::Protocol(reason) => write!(f, "protocol violation: {}", reason),
        }
    }
}

impl std::error::Error for TransportError {}

/// A bound QUIC endpoint acting as both client and server.
#[derive(Clone)]
pub struct Transport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    local_identity: Identity,
    dial_timeout: Duration,
}

impl Transport {
    pub fn bind(keypair: &Keypair, addr: SocketAddr) -> Result<Self, TransportError> {
        let tls_error = |e: anyhow::Error| TransportError::Bind {
            addr,
            reason: format!("{:#}", e),
        };
        let certificate = NodeCertificate::issue(keypair).map_err(tls_error)?;
        let server_config = certificate.server_config().map_err(tls_error)?;
        let client_config = certificate.client_config().map_err(tls_error)?;

        let endpoint = Endpoint::server(server_config, addr).map_err(|e| TransportError::Bind {
            addr,
            reason: e.to_string(),
        })?;

        Ok(Self {
            endpoint,
            client_config,
            local_identity: keypair.identity(),
            dial_timeout: DIAL_TIMEOUT,
        })
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn local_identity(&self) -> Identity {
        self.local_identity
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.endpoint
            .local_addr()
            .map_err(|e| TransportError::Protocol(format!("endpoint has no local address: {}", e)))
    }

    /// Connect to `addr` and require that the remote proves `expected`.
    pub async fn dial(
        &self,
        addr: SocketAddr,
        expected: Identity,
    ) -> Result<PeerConnection, TransportError> {
        let sni = sni_for(&expected);
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &sni)
            .map_err(|e| TransportError::Unreachable {
                addr,
                reason: e.to_string(),
            })?;

        let connection = match tokio::time::timeout(self.dial_timeout, connecting).await {
            Err(_) => {
                return Err(TransportError::Unreachable {
                    addr,
                    reason: format!("no handshake within {:?}", self.dial_timeout),
                });
            }
            Ok(Err(e)) => return Err(classify_connection_error(addr, e)),
            Ok(Ok(connection)) => connection,
        };

        let peer = verified_peer(&connection).ok_or_else(|| {
            TransportError::HandshakeFailed("peer presented no usable certificate".into())
        })?;
        if peer != expected {
            connection.close(CLOSE_CODE_NORMAL.into(), b"identity mismatch");
            return Err(TransportError::HandshakeFailed(format!(
                "expected peer {} but certificate carries {}",
                hex::encode(&expected.as_bytes()[..8]),
                hex::encode(&peer.as_bytes()[..8])
            )));
        }

        debug!(peer = %hex::encode(&peer.as_bytes()[..8]), addr = %addr, "dialed peer");
        Ok(PeerConnection { connection, peer })
    }

    /// Next inbound connection attempt, or `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Finish an inbound handshake and read the remote identity.
    pub async fn complete(&self, incoming: Incoming) -> Result<PeerConnection, TransportError> {
        let remote = incoming.remote_address();
        let connecting = incoming
            .accept()
            .map_err(|e| classify_connection_error(remote, e))?;
        let connection = tokio::time::timeout(self.dial_timeout, connecting)
            .await
            .map_err(|_| TransportError::Unreachable {
                addr: remote,
                reason: "inbound handshake timed out".into(),
            })?
            .map_err(|e| classify_connection_error(remote, e))?;

        let peer = verified_peer(&connection).ok_or_else(|| {
            TransportError::HandshakeFailed("client presented no usable certificate".into())
        })?;
        if peer == self.local_identity {
            connection.close(CLOSE_CODE_NORMAL.into(), b"self connection");
            return Err(TransportError::HandshakeFailed("connection from self".into()));
        }

        debug!(peer = %hex::encode(&peer.as_bytes()[..8]), addr = %remote, "accepted peer");
        Ok(PeerConnection { connection, peer })
    }

    pub fn close(&self) {
        self.endpoint.close(CLOSE_CODE_NORMAL.into(), b"shutdown");
    }
}

fn classify_connection_error(addr: SocketAddr, error: quinn::ConnectionError) -> TransportError {
    match error {
        quinn::ConnectionError::TimedOut | quinn::ConnectionError::Reset => {
            TransportError::Unreachable {
                addr,
                reason: error.to_string(),
            }
        }
        quinn::ConnectionError::LocallyClosed => TransportError::Closed,
        other => TransportError::HandshakeFailed(other.to_string()),
    }
}

/// An authenticated connection to one peer.
#[derive(Clone)]
pub struct PeerConnection {
    connection: Connection,
    peer: Identity,
}

impl PeerConnection {
    pub fn peer_id(&self) -> Identity {
        self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Distinguishes several connections to the same peer.
    pub fn stable_id(&self) -> usize {
        self.connection.stable_id()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    pub async fn open_substream(&self, protocol: ProtocolId) -> Result<SubStream, TransportError> {
        let (mut send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|_| TransportError::Closed)?;
        send.write_all(&[protocol.tag()])
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(SubStream {
            protocol,
            send,
            recv,
        })
    }

    /// Wait for the remote to open a stream. The protocol tag is not read
    /// here; call [`IncomingSubStream::negotiate`] on the result, ideally in
    /// the task that will serve the stream.
    pub async fn accept_incoming(&self) -> Result<IncomingSubStream, TransportError> {
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(IncomingSubStream {
            peer: self.peer,
            send,
            recv,
        })
    }

    /// Accept and negotiate in one step. Streams that fail negotiation are
    /// skipped, and a silent one holds up the ones behind it.
    pub async fn accept_substream(&self) -> Result<SubStream, TransportError> {
        loop {
            match self.accept_incoming().await?.negotiate().await {
                Ok(substream) => return Ok(substream),
                Err(e) => trace!(error = %e, "skipping substream that failed negotiation"),
            }
        }
    }

    /// Resolves once the connection has terminated for any reason.
    pub async fn closed(&self) {
        let reason = self.connection.closed().await;
        trace!(peer = %hex::encode(&self.peer.as_bytes()[..8]), reason = %reason, "connection closed");
    }

    pub fn close(&self, reason: &[u8]) {
        self.connection.close(CLOSE_CODE_NORMAL.into(), reason);
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("remote", &self.connection.remote_address())
            .finish()
    }
}

/// A stream the remote opened whose protocol tag has not been read yet.
pub struct IncomingSubStream {
    peer: Identity,
    send: SendStream,
    recv: RecvStream,
}

impl IncomingSubStream {
    /// Read the one-byte protocol tag. A stream with an unknown tag, or one
    /// that stays silent for `SUBSTREAM_TAG_TIMEOUT`, is reset.
    pub async fn negotiate(mut self) -> Result<SubStream, TransportError> {
        let mut tag = [0u8; 1];
        match tokio::time::timeout(SUBSTREAM_TAG_TIMEOUT, self.recv.read_exact(&mut tag)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.reset();
                return Err(TransportError::Protocol("substream protocol tag timed out".into()));
            }
        }

        match ProtocolId::from_tag(tag[0]) {
            Some(protocol) => Ok(SubStream {
                protocol,
                send: self.send,
                recv: self.recv,
            }),
            None => {
                debug!(
                    peer = %hex::encode(&self.peer.as_bytes()[..8]),
                    tag = tag[0],
                    "resetting substream with unknown protocol"
                );
                self.reset();
                Err(TransportError::Protocol(format!("unknown protocol tag {:#04x}", tag[0])))
            }
        }
    }

    fn reset(&mut self) {
        let _ = self.send.reset(RESET_CODE_UNKNOWN_PROTOCOL.into());
        let _ = self.recv.stop(RESET_CODE_UNKNOWN_PROTOCOL.into());
    }
}

/// One logical protocol stream inside a [`PeerConnection`].
pub struct SubStream {
    protocol: ProtocolId,
    send: SendStream,
    recv: RecvStream,
}

impl SubStream {
    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Protocol(format!(
                "frame of {} bytes exceeds {} bytes",
                body.len(),
                MAX_FRAME_SIZE
            )));
        }
        let len = body.len() as u32;
        self.send
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|_| TransportError::Closed)?;
        self.send
            .write_all(body)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    /// Next frame body, or `None` when the remote finished the stream on a
    /// frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut len_buf = [0u8; 4];
        match self.recv.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
            Err(quinn::ReadExactError::FinishedEarly(_)) => {
                return Err(TransportError::Protocol("stream ended inside frame header".into()));
            }
            Err(quinn::ReadExactError::ReadError(_)) => return Err(TransportError::Closed),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            let _ = self.recv.stop(RESET_CODE_UNKNOWN_PROTOCOL.into());
            return Err(TransportError::Protocol(format!(
                "frame of {} bytes exceeds {} bytes",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut body = vec![0u8; len];
        self.recv.read_exact(&mut body).await.map_err(|e| match e {
            quinn::ReadExactError::FinishedEarly(_) => {
                TransportError::Protocol("stream ended inside frame body".into())
            }
            quinn::ReadExactError::ReadError(_) => TransportError::Closed,
        })?;
        Ok(Some(body))
    }

    /// Signal that no more frames will be written.
    pub fn finish(&mut self) {
        let _ = self.send.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn pair() -> (Transport, Transport, Keypair) {
        let kp_b = Keypair::generate();
        let a = Transport::bind(&Keypair::generate(), loopback()).unwrap();
        let b = Transport::bind(&kp_b, loopback()).unwrap();
        (a, b, kp_b)
    }

    async fn accept_one(t: &Transport) -> PeerConnection {
        let incoming = t.accept().await.unwrap();
        t.complete(incoming).await.unwrap()
    }

    #[tokio::test]
    async fn dial_exchanges_frames_on_substream() {
        let (a, b, kp_b) = pair().await;
        let b_addr = b.local_addr().unwrap();

        let (dialed, accepted) = tokio::join!(a.dial(b_addr, kp_b.identity()), accept_one(&b));
        let dialed = dialed.unwrap();
        assert_eq!(dialed.peer_id(), kp_b.identity());
        assert_eq!(accepted.peer_id(), a.local_identity());

        let mut out = dialed.open_substream(ProtocolId::Gossip).await.unwrap();
        out.write_frame(b"first").await.unwrap();
        out.write_frame(b"").await.unwrap();
        out.write_frame(b"third").await.unwrap();
        out.finish();

        let mut inbound = accepted.accept_substream().await.unwrap();
        assert_eq!(inbound.protocol(), ProtocolId::Gossip);
        assert_eq!(inbound.read_frame().await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(inbound.read_frame().await.unwrap(), Some(Vec::new()));
        assert_eq!(inbound.read_frame().await.unwrap(), Some(b"third".to_vec()));
        assert_eq!(inbound.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_on_read() {
        let (a, b, kp_b) = pair().await;
        let (dialed, accepted) =
            tokio::join!(a.dial(b.local_addr().unwrap(), kp_b.identity()), accept_one(&b));
        let dialed = dialed.unwrap();

        let mut out = dialed.open_substream(ProtocolId::Dht).await.unwrap();
        let bogus_len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        out.send.write_all(&bogus_len).await.unwrap();

        let mut inbound = accepted.accept_substream().await.unwrap();
        assert!(matches!(
            inbound.read_frame().await,
            Err(TransportError::Protocol(_))
        ));
        assert!(out.write_frame(&vec![0u8; MAX_FRAME_SIZE + 1]).await.is_err());
    }

    #[tokio::test]
    async fn unknown_protocol_tag_is_skipped() {
        let (a, b, kp_b) = pair().await;
        let (dialed, accepted) =
            tokio::join!(a.dial(b.local_addr().unwrap(), kp_b.identity()), accept_one(&b));
        let dialed = dialed.unwrap();

        let (mut raw_send, _raw_recv) = dialed.connection.open_bi().await.unwrap();
        raw_send.write_all(&[0x7F]).await.unwrap();

        let mut good = dialed.open_substream(ProtocolId::Gossip).await.unwrap();
        good.write_frame(b"still here").await.unwrap();

        let mut inbound = accepted.accept_substream().await.unwrap();
        assert_eq!(inbound.protocol(), ProtocolId::Gossip);
        assert_eq!(inbound.read_frame().await.unwrap(), Some(b"still here".to_vec()));
    }

    #[tokio::test]
    async fn silent_stream_does_not_hold_up_later_streams() {
        let (a, b, kp_b) = pair().await;
        let (dialed, accepted) =
            tokio::join!(a.dial(b.local_addr().unwrap(), kp_b.identity()), accept_one(&b));
        let dialed = dialed.unwrap();

        // Opened but never written: the peer only learns of it once a later
        // stream carries data.
        let (_silent_send, _silent_recv) = dialed.connection.open_bi().await.unwrap();
        let mut good = dialed.open_substream(ProtocolId::Gossip).await.unwrap();
        good.write_frame(b"on time").await.unwrap();

        let silent = accepted.accept_incoming().await.unwrap();
        let next = accepted.accept_incoming().await.unwrap();
        let stalled = tokio::spawn(silent.negotiate());

        let mut inbound = tokio::time::timeout(Duration::from_secs(1), next.negotiate())
            .await
            .expect("negotiation waited on the silent stream")
            .unwrap();
        assert_eq!(inbound.protocol(), ProtocolId::Gossip);
        assert_eq!(inbound.read_frame().await.unwrap(), Some(b"on time".to_vec()));
        stalled.abort();
    }

    #[tokio::test]
    async fn wrong_expected_identity_fails_handshake() {
        let (a, b, _kp_b) = pair().await;
        let b_addr = b.local_addr().unwrap();
        let server = tokio::spawn(async move {
            if let Some(incoming) = b.accept().await {
                let _ = b.complete(incoming).await;
            }
        });

        let impostor = Keypair::generate().identity();
        let result = a.dial(b_addr, impostor).await;
        assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
        server.abort();
    }

    #[tokio::test]
    async fn silent_address_is_unreachable() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let a = Transport::bind(&Keypair::generate(), loopback())
            .unwrap()
            .with_dial_timeout(Duration::from_millis(300));

        let result = a
            .dial(silent.local_addr().unwrap(), Keypair::generate().identity())
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        match Transport::bind(&Keypair::generate(), addr) {
            Err(TransportError::Bind { addr: reported, .. }) => assert_eq!(reported, addr),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("bind on an occupied port must fail"),
        }
    }

    #[test]
    fn protocol_tags_roundtrip() {
        for p in [ProtocolId::Gossip, ProtocolId::Dht] {
            assert_eq!(ProtocolId::from_tag(p.tag()), Some(p));
        }
        assert_eq!(ProtocolId::from_tag(0), None);
    }
}
