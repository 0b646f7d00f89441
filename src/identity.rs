//! # Peer Identity
//!
//! This module defines the identity types used throughout meshcast:
//!
//! - [`Keypair`]: Ed25519 signing keypair, generated once per process
//! - [`Identity`]: 32-byte public key serving as the peer's PeerID
//! - [`Contact`]: a PeerID together with its current set of addresses
//! - [`PeerAddr`]: the structured bootstrap address `/ip4/HOST/udp/PORT/quic/p2p/ID`
//!
//! ## Identity Model
//!
//! Identity = Ed25519 public key. The transport binds the key to every
//! connection through the TLS certificate, so a PeerID cannot be claimed
//! without the matching secret key. Identities double as Kademlia keys:
//! routing uses the XOR distance between them.
//!
//! Addresses are mutable (refreshed on reconnect), the PeerID is not.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// A fresh keypair from the OS random source.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity(self.signing_key.verifying_key().to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

/// A peer's identifier: its Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identity) -> [u8; 32] {
        std::array::from_fn(|i| self.0[i] ^ other.0[i])
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Rejects degenerate keys and anything that is not an Ed25519 point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

/// Lexicographic comparison of two XOR distances.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A reachable peer: its PeerID and the addresses it was last seen on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    pub addrs: Vec<String>,
}

impl Contact {
    pub fn new(identity: Identity, addrs: Vec<String>) -> Self {
        Self { identity, addrs }
    }

    pub fn single(identity: Identity, addr: impl Into<String>) -> Self {
        Self::new(identity, vec![addr.into()])
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(String::as_str)
    }

    /// Addresses that parse as socket addresses, in order.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addrs.iter().filter_map(|a| a.parse().ok()).collect()
    }
}

// ============================================================================
// Bootstrap Address Format
// ============================================================================

/// Reasons a [`PeerAddr`] string can be rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddrError {
    /// The string does not start with `/ip4/` or `/ip6/`.
    UnknownProtocol(String),
    /// A required segment is absent.
    MissingSegment(&'static str),
    InvalidIp(String),
    InvalidPort(String),
    InvalidIdentity(String),
    /// The address family segment does not match the parsed IP.
    FamilyMismatch,
    /// Extra segments after the identity.
    TrailingSegments,
}

impl fmt::Display for PeerAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProtocol(p) => write!(f, "unsupported address protocol '{}'", p),
            Self::MissingSegment(s) => write!(f, "peer address is missing the {} segment", s),
            Self::InvalidIp(ip) => write!(f, "invalid ip address '{}'", ip),
            Self::InvalidPort(port) => write!(f, "invalid port '{}'", port),
            Self::InvalidIdentity(id) => {
                write!(f, "invalid peer identity '{}': expected 64 hex characters", id)
            }
            Self::FamilyMismatch => write!(f, "ip address does not match the ip4/ip6 segment"),
            Self::TrailingSegments => write!(f, "unexpected segments after the peer identity"),
        }
    }
}

impl std::error::Error for PeerAddrError {}

/// A dialable peer address: transport location plus the expected PeerID.
///
/// Textual form: `/ip4/127.0.0.1/udp/4001/quic/p2p/<hex identity>`. The
/// `/quic` segment is optional on input and always emitted on output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub addr: SocketAddr,
    pub identity: Identity,
}

impl PeerAddr {
    pub fn new(addr: SocketAddr, identity: Identity) -> Self {
        Self { addr, identity }
    }

    pub fn to_contact(&self) -> Contact {
        Contact::single(self.identity, self.addr.to_string())
    }
}

impl FromStr for PeerAddr {
    type Err = PeerAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = s.trim().trim_start_matches('/').split('/');

        let family = segments.next().filter(|f| !f.is_empty()).ok_or(PeerAddrError::MissingSegment("ip4/ip6"))?;
        if family != "ip4" && family != "ip6" {
            return Err(PeerAddrError::UnknownProtocol(family.to_string()));
        }
        let ip_str = segments.next().ok_or(PeerAddrError::MissingSegment("host"))?;
        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| PeerAddrError::InvalidIp(ip_str.to_string()))?;
        if (family == "ip4") != ip.is_ipv4() {
            return Err(PeerAddrError::FamilyMismatch);
        }

        match segments.next() {
            Some("udp") => {}
            Some(other) => return Err(PeerAddrError::UnknownProtocol(other.to_string())),
            None => return Err(PeerAddrError::MissingSegment("udp")),
        }
        let port_str = segments.next().ok_or(PeerAddrError::MissingSegment("port"))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| PeerAddrError::InvalidPort(port_str.to_string()))?;

        let mut next = segments.next();
        if next == Some("quic") {
            next = segments.next();
        }
        match next {
            Some("p2p") => {}
            Some(other) => return Err(PeerAddrError::UnknownProtocol(other.to_string())),
            None => return Err(PeerAddrError::MissingSegment("p2p")),
        }
        let id_str = segments.next().ok_or(PeerAddrError::MissingSegment("identity"))?;
        let identity = Identity::from_hex(id_str)
            .map_err(|_| PeerAddrError::InvalidIdentity(id_str.to_string()))?;

        if segments.any(|seg| !seg.is_empty()) {
            return Err(PeerAddrError::TrailingSegments);
        }

        Ok(Self {
            addr: SocketAddr::new(ip, port),
            identity,
        })
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = if self.addr.is_ipv4() { "ip4" } else { "ip6" };
        write!(
            f,
            "/{}/{}/udp/{}/quic/p2p/{}",
            family,
            self.addr.ip(),
            self.addr.port(),
            self.identity.to_hex()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keypairs_are_distinct_and_valid() {
        let first = Keypair::generate().identity();
        let second = Keypair::generate().identity();

        assert_ne!(first, second);
        assert!(first.is_valid() && second.is_valid());
    }

    #[test]
    fn keypair_from_secret_is_stable() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&kp.secret_key_bytes());
        assert_eq!(kp.identity(), restored.identity());
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_to_self() {
        let ones = Identity::from_bytes([0xFF; 32]);
        let mut mixed = [0u8; 32];
        mixed[0] = 0x0F;
        let mixed = Identity::from_bytes(mixed);

        assert_eq!(ones.xor_distance(&ones), [0u8; 32]);
        assert_eq!(ones.xor_distance(&mixed), mixed.xor_distance(&ones));
        assert_eq!(ones.xor_distance(&mixed)[0], 0xF0);
        assert_eq!(ones.xor_distance(&mixed)[31], 0xFF);
    }

    #[test]
    fn degenerate_keys_are_invalid() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFF; 32]).is_valid());
    }

    #[test]
    fn identity_hex_roundtrip() {
        let id = Keypair::generate().identity();
        assert_eq!(Identity::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex("zz").is_err());
    }

    #[test]
    fn peer_addr_parses_full_form() {
        let id = Keypair::generate().identity();
        let text = format!("/ip4/192.168.1.7/udp/4001/quic/p2p/{}", id.to_hex());

        let parsed: PeerAddr = text.parse().unwrap();
        assert_eq!(parsed.addr, "192.168.1.7:4001".parse::<SocketAddr>().unwrap());
        assert_eq!(parsed.identity, id);
        assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn peer_addr_quic_segment_is_optional() {
        let id = Keypair::generate().identity();
        let parsed: PeerAddr = format!("/ip6/::1/udp/9000/p2p/{}", id.to_hex()).parse().unwrap();
        assert_eq!(parsed.addr, "[::1]:9000".parse::<SocketAddr>().unwrap());
        assert!(parsed.to_string().starts_with("/ip6/::1/udp/9000/quic/p2p/"));
    }

    #[test]
    fn peer_addr_rejects_malformed_input() {
        let hex_id = Keypair::generate().identity().to_hex();

        assert_eq!(
            format!("/dns/example.com/udp/1/p2p/{hex_id}").parse::<PeerAddr>(),
            Err(PeerAddrError::UnknownProtocol("dns".to_string()))
        );
        assert_eq!(
            format!("/ip4/::1/udp/1/p2p/{hex_id}").parse::<PeerAddr>(),
            Err(PeerAddrError::FamilyMismatch)
        );
        assert_eq!(
            format!("/ip4/10.0.0.1/tcp/1/p2p/{hex_id}").parse::<PeerAddr>(),
            Err(PeerAddrError::UnknownProtocol("tcp".to_string()))
        );
        assert_eq!(
            format!("/ip4/10.0.0.1/udp/99999/p2p/{hex_id}").parse::<PeerAddr>(),
            Err(PeerAddrError::InvalidPort("99999".to_string()))
        );
        assert_eq!(
            "/ip4/10.0.0.1/udp/1".parse::<PeerAddr>(),
            Err(PeerAddrError::MissingSegment("p2p"))
        );
        assert!(matches!(
            "/ip4/10.0.0.1/udp/1/p2p/xyz".parse::<PeerAddr>(),
            Err(PeerAddrError::InvalidIdentity(_))
        ));
        assert_eq!(
            format!("/ip4/10.0.0.1/udp/1/p2p/{hex_id}/extra").parse::<PeerAddr>(),
            Err(PeerAddrError::TrailingSegments)
        );
    }
}
