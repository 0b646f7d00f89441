//! # Local Discovery
//!
//! Finds peers on the same network segment without a rendezvous server.
//!
//! Every node periodically sends an [`Advertisement`] (service tag, PeerID,
//! listening addresses) to a well-known UDP multicast group and listens on
//! the same group. Advertisements from other nodes with a matching tag turn
//! into [`PeerFound`] events delivered through [`PeerFoundHandler`].
//!
//! Discovery holds no connection state. A `(PeerID, address)` pair is
//! reported again once `rediscover_after` has passed since it was last
//! reported, so a dial that failed is retried by a later advertisement.
//!
//! When `announce_to` is a unicast address no group is joined and the
//! advertisements are sent point-to-point.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::identity::Identity;
use crate::messages::{decode, encode, Advertisement};
use crate::protocols::PeerFoundHandler;

pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);
pub const DEFAULT_DISCOVERY_PORT: u16 = 7777;
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SERVICE_TAG: &str = "meshcast-chat";

const MAX_DATAGRAM_SIZE: usize = 2048;
const MAX_ADVERTISED_ADDRS: usize = 8;

/// A peer seen on the local segment, with the addresses it can be dialed on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerFound {
    pub peer_id: Identity,
    pub addresses: Vec<String>,
}

/// Settings for local-segment discovery. The defaults announce on the
/// multicast group every few seconds and listen on the same port.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Advertisements with any other tag are ignored.
    pub service_tag: String,
    /// Time between two outgoing advertisements.
    pub interval: Duration,
    /// How long a reported `(PeerID, address)` pair stays quiet.
    pub rediscover_after: Duration,
    /// Address the discovery socket binds.
    pub listen_addr: SocketAddr,
    /// Destination of outgoing advertisements. A multicast address is joined.
    pub announce_to: SocketAddr,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_tag: DEFAULT_SERVICE_TAG.to_string(),
            interval: DEFAULT_ANNOUNCE_INTERVAL,
            rediscover_after: DEFAULT_ANNOUNCE_INTERVAL * 3,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_DISCOVERY_PORT),
            announce_to: SocketAddr::new(IpAddr::V4(DEFAULT_MULTICAST_GROUP), DEFAULT_DISCOVERY_PORT),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_service_tag(mut self, tag: impl Into<String>) -> Self {
        self.service_tag = tag.into();
        self
    }
}

/// Running discovery service. Stops when shut down or dropped.
pub struct LocalDiscovery {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    malformed: Arc<AtomicU64>,
    announcer: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

impl LocalDiscovery {
    /// Bind the discovery socket and start advertising `addresses` for
    /// `local`. Must be called inside a tokio runtime.
    pub fn spawn<H: PeerFoundHandler>(
        config: DiscoveryConfig,
        local: Identity,
        addresses: Vec<String>,
        handler: Arc<H>,
    ) -> Result<Self> {
        let socket = bind_socket(&config)?;
        let socket = Arc::new(UdpSocket::from_std(socket).context("failed to register discovery socket")?);
        let local_addr = socket.local_addr().context("discovery socket has no local address")?;

        let advertisement = Advertisement {
            service_tag: config.service_tag.clone(),
            peer_id: local,
            addresses: addresses.into_iter().take(MAX_ADVERTISED_ADDRS).collect(),
        };
        let datagram = encode(&advertisement).context("failed to encode advertisement")?;

        let cancel = CancellationToken::new();
        let malformed = Arc::new(AtomicU64::new(0));

        let announcer = tokio::spawn(run_announcer(
            socket.clone(),
            datagram,
            config.announce_to,
            config.interval,
            cancel.clone(),
        ));
        let listener = tokio::spawn(run_listener(
            socket,
            config.service_tag.clone(),
            local,
            config.rediscover_after,
            handler,
            malformed.clone(),
            cancel.clone(),
        ));

        info!(
            listen = %local_addr,
            announce_to = %config.announce_to,
            tag = %config.service_tag,
            "local discovery started"
        );

        Ok(Self {
            cancel,
            local_addr,
            malformed,
            announcer: Some(announcer),
            listener: Some(listener),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Datagrams that did not decode as an advertisement.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.announcer.take() {
            let _ = task.await;
        }
        if let Some(task) = self.listener.take() {
            let _ = task.await;
        }
        debug!("local discovery stopped");
    }
}

impl Drop for LocalDiscovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn bind_socket(config: &DiscoveryConfig) -> Result<std::net::UdpSocket> {
    let domain = if config.listen_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create discovery socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .context("failed to set SO_REUSEPORT")?;
    socket
        .set_nonblocking(true)
        .context("failed to make discovery socket non-blocking")?;
    socket
        .bind(&SockAddr::from(config.listen_addr))
        .with_context(|| format!("failed to bind discovery socket on {}", config.listen_addr))?;

    if let IpAddr::V4(group) = config.announce_to.ip()
        && group.is_multicast()
    {
        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("failed to join multicast group {}", group))?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
    }

    Ok(socket.into())
}

async fn run_announcer(
    socket: Arc<UdpSocket>,
    datagram: Vec<u8>,
    announce_to: SocketAddr,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("discovery announcer shutting down");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&datagram, announce_to).await {
                    warn!(to = %announce_to, error = %e, "failed to send advertisement");
                } else {
                    trace!(to = %announce_to, "advertisement sent");
                }
            }
        }
    }
}

async fn run_listener<H: PeerFoundHandler>(
    socket: Arc<UdpSocket>,
    service_tag: String,
    local: Identity,
    rediscover_after: Duration,
    handler: Arc<H>,
    malformed: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut reported: HashMap<(Identity, String), Instant> = HashMap::new();

    loop {
        let (len, source) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("discovery listener shutting down");
                break;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "discovery receive failed");
                    continue;
                }
            },
        };

        let advertisement: Advertisement = match decode(&buf[..len]) {
            Ok(ad) => ad,
            Err(e) => {
                malformed.fetch_add(1, Ordering::Relaxed);
                debug!(from = %source, error = %e, "dropping malformed advertisement");
                continue;
            }
        };
        if advertisement.service_tag != service_tag {
            trace!(from = %source, tag = %advertisement.service_tag, "ignoring foreign service tag");
            continue;
        }
        if advertisement.peer_id == local {
            continue;
        }

        let addresses = normalize_addresses(&advertisement.addresses, source.ip());
        if addresses.is_empty() {
            continue;
        }

        let now = Instant::now();
        reported.retain(|_, at| now.duration_since(*at) < rediscover_after);

        let mut fresh = false;
        for addr in &addresses {
            let key = (advertisement.peer_id, addr.clone());
            if !reported.contains_key(&key) {
                reported.insert(key, now);
                fresh = true;
            }
        }
        if !fresh {
            continue;
        }

        debug!(
            peer = %hex::encode(&advertisement.peer_id.as_bytes()[..8]),
            addrs = ?addresses,
            "peer found on local network"
        );
        handler
            .on_peer_found(PeerFound {
                peer_id: advertisement.peer_id,
                addresses,
            })
            .await;
    }
}

/// Parse advertised socket addresses, substituting the datagram source IP
/// for an unspecified host.
fn normalize_addresses(advertised: &[String], source: IpAddr) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in advertised.iter().take(MAX_ADVERTISED_ADDRS) {
        let Ok(mut addr) = raw.parse::<SocketAddr>() else {
            trace!(addr = %raw, "skipping unparsable advertised address");
            continue;
        };
        if addr.port() == 0 {
            continue;
        }
        if addr.ip().is_unspecified() {
            addr.set_ip(source);
        }
        let addr = addr.to_string();
        if !out.contains(&addr) {
            out.push(addr);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct ChannelHandler(mpsc::UnboundedSender<PeerFound>);

    #[async_trait]
    impl PeerFoundHandler for ChannelHandler {
        async fn on_peer_found(&self, found: PeerFound) {
            let _ = self.0.send(found);
        }
    }

    struct Fixture {
        discovery: LocalDiscovery,
        local: Identity,
        found: mpsc::UnboundedReceiver<PeerFound>,
        sink: std::net::UdpSocket,
        sender: std::net::UdpSocket,
    }

    fn fixture(rediscover_after: Duration) -> Fixture {
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = DiscoveryConfig {
            interval: Duration::from_millis(50),
            rediscover_after,
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            announce_to: sink.local_addr().unwrap(),
            ..DiscoveryConfig::default()
        };
        let local = Keypair::generate().identity();
        let (tx, found) = mpsc::unbounded_channel();
        let discovery = LocalDiscovery::spawn(
            config,
            local,
            vec!["0.0.0.0:4001".to_string()],
            Arc::new(ChannelHandler(tx)),
        )
        .unwrap();
        Fixture {
            discovery,
            local,
            found,
            sink,
            sender,
        }
    }

    fn advertise(f: &Fixture, tag: &str, peer_id: Identity, addrs: &[&str]) {
        let ad = Advertisement {
            service_tag: tag.to_string(),
            peer_id,
            addresses: addrs.iter().map(|a| a.to_string()).collect(),
        };
        f.sender
            .send_to(&encode(&ad).unwrap(), f.discovery.local_addr())
            .unwrap();
    }

    async fn expect_found(f: &mut Fixture) -> PeerFound {
        tokio::time::timeout(Duration::from_secs(2), f.found.recv())
            .await
            .expect("no PeerFound event")
            .expect("handler channel closed")
    }

    async fn expect_quiet(f: &mut Fixture) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.found.try_recv().is_err(), "unexpected PeerFound event");
    }

    #[tokio::test]
    async fn announcer_sends_decodable_advertisements() {
        let f = fixture(Duration::from_secs(60));
        f.sink.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let sink = f.sink.try_clone().unwrap();
        let datagram = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let (len, _) = sink.recv_from(&mut buf).unwrap();
            buf[..len].to_vec()
        })
        .await
        .unwrap();

        let ad: Advertisement = decode(&datagram).unwrap();
        assert_eq!(ad.service_tag, DEFAULT_SERVICE_TAG);
        assert_eq!(ad.peer_id, f.local);
        assert_eq!(ad.addresses, vec!["0.0.0.0:4001".to_string()]);
    }

    #[tokio::test]
    async fn matching_advertisement_reports_peer_with_source_ip() {
        let mut f = fixture(Duration::from_secs(60));
        let peer = Keypair::generate().identity();

        advertise(&f, DEFAULT_SERVICE_TAG, peer, &["0.0.0.0:5000", "10.0.0.9:5000"]);
        let found = expect_found(&mut f).await;
        assert_eq!(found.peer_id, peer);
        assert_eq!(found.addresses, vec!["127.0.0.1:5000".to_string(), "10.0.0.9:5000".to_string()]);
    }

    #[tokio::test]
    async fn self_foreign_and_malformed_datagrams_are_ignored() {
        let mut f = fixture(Duration::from_secs(60));

        advertise(&f, DEFAULT_SERVICE_TAG, f.local, &["127.0.0.1:4001"]);
        advertise(&f, "some-other-app", Keypair::generate().identity(), &["127.0.0.1:4002"]);
        f.sender
            .send_to(b"definitely not an advertisement", f.discovery.local_addr())
            .unwrap();
        expect_quiet(&mut f).await;
        assert_eq!(f.discovery.malformed(), 1);

        let peer = Keypair::generate().identity();
        advertise(&f, DEFAULT_SERVICE_TAG, peer, &["127.0.0.1:4003"]);
        assert_eq!(expect_found(&mut f).await.peer_id, peer);
    }

    #[tokio::test]
    async fn repeated_advertisement_is_reported_again_after_expiry() {
        let mut f = fixture(Duration::from_millis(300));
        let peer = Keypair::generate().identity();

        advertise(&f, DEFAULT_SERVICE_TAG, peer, &["127.0.0.1:4100"]);
        expect_found(&mut f).await;

        advertise(&f, DEFAULT_SERVICE_TAG, peer, &["127.0.0.1:4100"]);
        expect_quiet(&mut f).await;

        advertise(&f, DEFAULT_SERVICE_TAG, peer, &["127.0.0.1:4101"]);
        let found = expect_found(&mut f).await;
        assert!(found.addresses.contains(&"127.0.0.1:4101".to_string()));

        tokio::time::sleep(Duration::from_millis(350)).await;
        advertise(&f, DEFAULT_SERVICE_TAG, peer, &["127.0.0.1:4100"]);
        assert_eq!(expect_found(&mut f).await.peer_id, peer);
    }

    #[tokio::test]
    async fn shutdown_stops_listening() {
        let f = fixture(Duration::from_secs(60));
        let Fixture {
            discovery,
            mut found,
            sender,
            ..
        } = f;
        let addr = discovery.local_addr();
        discovery.shutdown().await;

        let ad = Advertisement {
            service_tag: DEFAULT_SERVICE_TAG.to_string(),
            peer_id: Keypair::generate().identity(),
            addresses: vec!["127.0.0.1:4200".to_string()],
        };
        let _ = sender.send_to(&encode(&ad).unwrap(), addr);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(found.try_recv().is_err());
    }

    #[test]
    fn normalize_skips_bad_and_duplicate_addresses() {
        let source: IpAddr = "192.168.1.20".parse().unwrap();
        let advertised = vec![
            "0.0.0.0:4001".to_string(),
            "192.168.1.20:4001".to_string(),
            "not-an-address".to_string(),
            "10.0.0.1:0".to_string(),
        ];
        assert_eq!(normalize_addresses(&advertised, source), vec!["192.168.1.20:4001".to_string()]);
    }
}
