//! # Kademlia Bootstrap Table
//!
//! A minimal Kademlia routing layer used to find peers that are not on the
//! local network segment. It stores no values; its only job is to answer
//! "who is close to this identity" and to populate itself from seed peers.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `bootstrap(seeds)` | Iterative `FindNode(self)` through each seed |
//! | `iterative_find_node(id)` | Find contacts closest to an identity |
//! | `find_peer(id)` | Addresses of `id`, or the closest known contacts |
//!
//! ## Routing Table
//!
//! 256 k-buckets indexed by the first differing bit of the XOR distance.
//! Inserting into a full bucket pings its least-recently-seen contact in the
//! background; the newcomer only replaces it if that ping fails.
//!
//! ## Actor Architecture
//!
//! - `DhtNode`: public handle, cheap to clone
//! - `DhtNodeActor`: owns the routing table; lookups run on the caller's task
//!   and only touch the table through commands

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::identity::{distance_cmp, Contact, Identity};
use crate::protocols::DhtNodeRpc;

/// Contacts per bucket.
pub const DEFAULT_K: usize = 20;

/// Parallel queries per lookup round.
pub const DEFAULT_ALPHA: usize = 3;

const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

const BUCKET_STALE_THRESHOLD: Duration = Duration::from_secs(10 * 60);

const PER_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

const DHT_COMMAND_CHANNEL_SIZE: usize = 128;

const MAX_LOOKUP_ROUNDS: usize = 20;

const LOOKUP_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Addresses kept per contact.
const MAX_CONTACT_ADDRS: usize = 8;

/// One k-bucket. The front of `contacts` is the least recently seen entry.
#[derive(Debug)]
struct KBucket {
    contacts: VecDeque<Contact>,
    touched_at: Instant,
}

/// What happened when a contact was offered to its bucket.
#[derive(Debug)]
enum Insertion {
    Added,
    Moved,
    BucketFull { candidate: Contact, incumbent: Contact },
}

/// A full bucket waiting on a liveness check of its oldest entry.
#[derive(Clone, Debug)]
struct EvictionProbe {
    bucket: usize,
    incumbent: Contact,
    candidate: Contact,
}

impl KBucket {
    fn empty() -> Self {
        Self {
            contacts: VecDeque::new(),
            touched_at: Instant::now(),
        }
    }

    fn position(&self, id: &Identity) -> Option<usize> {
        self.contacts.iter().position(|c| &c.identity == id)
    }

    fn offer(&mut self, contact: Contact, capacity: usize) -> Insertion {
        if let Some(pos) = self.position(&contact.identity) {
            // Known peer: move to the back, taking fresher addresses if any.
            if let Some(mut known) = self.contacts.remove(pos) {
                if !contact.addrs.is_empty() {
                    known.addrs = contact.addrs;
                }
                self.contacts.push_back(known);
            }
            self.touched_at = Instant::now();
            return Insertion::Moved;
        }

        match self.contacts.front() {
            Some(front) if self.contacts.len() >= capacity => Insertion::BucketFull {
                incumbent: front.clone(),
                candidate: contact,
            },
            _ => {
                self.contacts.push_back(contact);
                self.touched_at = Instant::now();
                Insertion::Added
            }
        }
    }

    fn move_to_back(&mut self, id: &Identity) {
        if let Some(entry) = self.position(id).and_then(|pos| self.contacts.remove(pos)) {
            self.contacts.push_back(entry);
        }
    }

    fn evict(&mut self, id: &Identity) {
        self.contacts.retain(|c| &c.identity != id);
    }
}

/// Index of the first bit where `a` and `b` differ, or 255 if equal.
fn bucket_for(a: &Identity, b: &Identity) -> usize {
    a.xor_distance(b)
        .iter()
        .enumerate()
        .find(|(_, byte)| **byte != 0)
        .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
        .unwrap_or(255)
}

/// A random identity whose distance from `origin` falls in `bucket`.
fn random_id_in_bucket(origin: &Identity, bucket: usize) -> Identity {
    let (byte, bit) = (bucket / 8, bucket % 8);
    let mut distance: [u8; 32] = rand::random();
    distance[..byte].fill(0);
    let lead = 0x80u8 >> bit;
    distance[byte] = lead | (distance[byte] & (lead - 1));

    let mut out = [0u8; 32];
    for ((o, a), d) in out.iter_mut().zip(origin.as_bytes()).zip(distance) {
        *o = a ^ d;
    }
    Identity::from_bytes(out)
}

/// 256 k-buckets keyed by the XOR distance prefix from our own identity.
#[derive(Debug)]
pub struct RoutingTable {
    local: Identity,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local: Identity, k: usize) -> Self {
        Self {
            local,
            k: k.max(1),
            buckets: (0..256).map(|_| KBucket::empty()).collect(),
        }
    }

    /// Insert or refresh `contact`, returning whether it is in the table
    /// afterwards. When its bucket is full the contact is dropped and this
    /// returns `false`; use the node's observe path to get ping-before-evict.
    pub fn update(&mut self, contact: Contact) -> bool {
        let identity = contact.identity;
        self.insert(contact).is_none() && self.get(&identity).is_some()
    }

    /// Like `update`, but hands back a probe when the bucket is full.
    fn insert(&mut self, mut contact: Contact) -> Option<EvictionProbe> {
        if contact.identity == self.local || !contact.identity.is_valid() {
            return None;
        }
        contact.addrs.truncate(MAX_CONTACT_ADDRS);
        let bucket = bucket_for(&self.local, &contact.identity);
        match self.buckets[bucket].offer(contact, self.k) {
            Insertion::Added | Insertion::Moved => None,
            Insertion::BucketFull { candidate, incumbent } => Some(EvictionProbe {
                bucket,
                incumbent,
                candidate,
            }),
        }
    }

    /// Up to `count` contacts sorted by XOR distance to `target`, closest first.
    pub fn closest(&self, target: &Identity, count: usize) -> Vec<Contact> {
        let mut ranked: Vec<([u8; 32], &Contact)> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .map(|c| (c.identity.xor_distance(target), c))
            .collect();
        ranked.sort_by(|(a, _), (b, _)| distance_cmp(a, b));
        ranked.into_iter().take(count).map(|(_, c)| c.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    /// Settle a probe: a live incumbent stays, a dead one makes room.
    fn resolve_probe(&mut self, probe: EvictionProbe, incumbent_alive: bool) {
        let k = self.k;
        let bucket = &mut self.buckets[probe.bucket];
        if incumbent_alive {
            bucket.move_to_back(&probe.incumbent.identity);
            return;
        }
        bucket.evict(&probe.incumbent.identity);
        if bucket.position(&probe.candidate.identity).is_none() && bucket.contacts.len() < k {
            bucket.contacts.push_back(probe.candidate);
            bucket.touched_at = Instant::now();
        }
    }

    fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        (0..self.buckets.len())
            .filter(|&i| {
                let b = &self.buckets[i];
                !b.contacts.is_empty() && b.touched_at.elapsed() > max_age
            })
            .collect()
    }

    fn touch_bucket(&mut self, bucket: usize) {
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.touched_at = Instant::now();
        }
    }

    fn get(&self, id: &Identity) -> Option<Contact> {
        if *id == self.local {
            return None;
        }
        let bucket = &self.buckets[bucket_for(&self.local, id)];
        bucket.position(id).map(|pos| bucket.contacts[pos].clone())
    }
}

// ============================================================================
// Iterative lookup
// ============================================================================

/// Working state of one iterative `FindNode` lookup.
struct Lookup {
    target: Identity,
    local: Identity,
    width: usize,
    shortlist: Vec<Contact>,
    seen: HashSet<Identity>,
    asked: HashSet<Identity>,
    responded: usize,
}

impl Lookup {
    fn new(target: Identity, local: Identity, width: usize, known: Vec<Contact>) -> Self {
        let mut lookup = Self {
            target,
            local,
            width,
            shortlist: Vec::new(),
            seen: HashSet::new(),
            asked: HashSet::new(),
            responded: 0,
        };
        lookup.absorb(known);
        lookup
    }

    /// Put `seed` at the head of the shortlist so it is asked first.
    fn pin(&mut self, seed: Contact) {
        if seed.identity == self.local {
            return;
        }
        self.shortlist.retain(|c| c.identity != seed.identity);
        self.seen.insert(seed.identity);
        self.shortlist.insert(0, seed);
    }

    fn absorb(&mut self, contacts: impl IntoIterator<Item = Contact>) {
        for contact in contacts {
            if contact.identity != self.local && self.seen.insert(contact.identity) {
                self.shortlist.push(contact);
            }
        }
        let target = self.target;
        self.shortlist.sort_by(|a, b| {
            distance_cmp(&a.identity.xor_distance(&target), &b.identity.xor_distance(&target))
        });
        self.shortlist.truncate(self.width);
    }

    /// The next `alpha` closest contacts nobody has asked yet.
    fn next_batch(&mut self, alpha: usize) -> Vec<Contact> {
        let batch: Vec<Contact> = self
            .shortlist
            .iter()
            .filter(|c| !self.asked.contains(&c.identity))
            .take(alpha)
            .cloned()
            .collect();
        self.asked.extend(batch.iter().map(|c| c.identity));
        batch
    }

    fn forget(&mut self, id: &Identity) {
        self.shortlist.retain(|c| &c.identity != id);
    }
}

struct LookupResult {
    closest: Vec<Contact>,
    responded: usize,
}

// ============================================================================
// DHT Node
// ============================================================================

pub struct DhtNode<N: DhtNodeRpc> {
    commands: mpsc::Sender<Command>,
    local: Contact,
    rpc: Arc<N>,
    k: usize,
    alpha: usize,
    shutdown: CancellationToken,
}

impl<N: DhtNodeRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            local: self.local.clone(),
            rpc: Arc::clone(&self.rpc),
            k: self.k,
            alpha: self.alpha,
            shutdown: self.shutdown.clone(),
        }
    }
}

enum Command {
    Observe(Contact),
    Lookup(Identity, oneshot::Sender<Option<Contact>>),
    Closest(Identity, oneshot::Sender<Vec<Contact>>),
    ServeFindNode(Contact, Identity, oneshot::Sender<Vec<Contact>>),
    Size(oneshot::Sender<usize>),
    StaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    BucketRefreshed(usize),
    ProbeResult(EvictionProbe, bool),
    Quit,
}

impl<N: DhtNodeRpc> DhtNode<N> {
    pub fn new(local: Contact, rpc: Arc<N>, k: usize, alpha: usize) -> Self {
        Self::with_shutdown(local, rpc, k, alpha, CancellationToken::new())
    }

    /// Like [`DhtNode::new`], but the actor and the bucket refresh task also
    /// stop when `shutdown` is cancelled.
    pub fn with_shutdown(
        local: Contact,
        rpc: Arc<N>,
        k: usize,
        alpha: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (commands, inbox) = mpsc::channel(DHT_COMMAND_CHANNEL_SIZE);
        let k = k.max(1);

        let actor = DhtNodeActor {
            table: RoutingTable::new(local.identity, k),
            k,
            inbox,
            probes: commands.downgrade(),
            pinging: HashSet::new(),
            rpc: Arc::clone(&rpc),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(actor.run());

        let node = Self {
            commands,
            local,
            rpc,
            k,
            alpha: alpha.max(1),
            shutdown,
        };
        node.spawn_bucket_refresh();
        node
    }

    pub fn identity(&self) -> Identity {
        self.local.identity
    }

    pub fn contact(&self) -> Contact {
        self.local.clone()
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| anyhow!("DHT actor stopped"))?;
        rx.await.map_err(|_| anyhow!("DHT actor stopped"))
    }

    /// The routing-table entry for `identity`, if any.
    pub async fn lookup_contact(&self, identity: &Identity) -> Option<Contact> {
        let identity = *identity;
        self.ask(|tx| Command::Lookup(identity, tx)).await.ok().flatten()
    }

    /// Record a contact learned from a verified connection or a lookup reply.
    pub async fn observe_contact(&self, contact: Contact) {
        let _ = self.commands.send(Command::Observe(contact)).await;
    }

    pub async fn routing_table_size(&self) -> usize {
        self.ask(Command::Size).await.unwrap_or(0)
    }

    /// Serve an inbound `FindNode`. The requester is recorded as a contact.
    pub async fn handle_find_node_request(&self, from: &Contact, target: Identity) -> Vec<Contact> {
        let from = from.clone();
        self.ask(|tx| Command::ServeFindNode(from, target, tx))
            .await
            .unwrap_or_default()
    }

    fn spawn_bucket_refresh(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let start = Instant::now() + BUCKET_REFRESH_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, BUCKET_REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = node.commands.closed() => break,
                    _ = ticker.tick() => {}
                }
                let Ok(stale) = node
                    .ask(|tx| Command::StaleBuckets(BUCKET_STALE_THRESHOLD, tx))
                    .await
                else {
                    break;
                };
                if !stale.is_empty() {
                    debug!(count = stale.len(), "refreshing stale buckets");
                }
                for bucket in stale {
                    let target = random_id_in_bucket(&node.local.identity, bucket);
                    if let Err(e) = node.iterative_find_node(target).await {
                        debug!(bucket, error = %e, "bucket refresh lookup failed");
                    }
                    if node.commands.send(Command::BucketRefreshed(bucket)).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    /// The `k` closest contacts to `target` the network could tell us about.
    pub async fn iterative_find_node(&self, target: Identity) -> Result<Vec<Contact>> {
        Ok(self.run_lookup(target, None).await?.closest)
    }

    /// Join the wide-area network through `seeds`. Each seed anchors an
    /// iterative lookup of our own identity. Fails only if no seed answered.
    pub async fn bootstrap(&self, seeds: &[Contact]) -> Result<Vec<Contact>> {
        if seeds.is_empty() {
            bail!("no bootstrap seeds given");
        }

        let me = self.local.identity;
        let mut responded = 0usize;
        let mut found: Vec<Contact> = Vec::new();
        for seed in seeds.iter().filter(|s| s.identity != me) {
            let result = self.run_lookup(me, Some(seed.clone())).await?;
            responded += result.responded;
            for contact in result.closest {
                if found.iter().all(|c| c.identity != contact.identity) {
                    found.push(contact);
                }
            }
        }

        if responded == 0 {
            bail!("none of {} bootstrap seeds responded", seeds.len());
        }

        found.sort_by(|a, b| distance_cmp(&a.identity.xor_distance(&me), &b.identity.xor_distance(&me)));
        debug!(seeds = seeds.len(), found = found.len(), "bootstrap completed");
        Ok(found)
    }

    /// Addresses of `target` if it is known or can be found; otherwise the
    /// closest known contacts to it, closest first.
    pub async fn find_peer(&self, target: Identity) -> Result<Vec<Contact>> {
        if let Some(contact) = self.lookup_contact(&target).await {
            return Ok(vec![contact]);
        }

        let closest = self.iterative_find_node(target).await?;
        match closest.iter().find(|c| c.identity == target) {
            Some(exact) => Ok(vec![exact.clone()]),
            None => Ok(closest),
        }
    }

    async fn run_lookup(&self, target: Identity, seed: Option<Contact>) -> Result<LookupResult> {
        let started = Instant::now();
        let known = self.ask(|tx| Command::Closest(target, tx)).await?;
        let mut lookup = Lookup::new(target, self.local.identity, self.k, known);
        if let Some(seed) = seed {
            lookup.pin(seed);
        }

        let mut rounds = 0;
        while rounds < MAX_LOOKUP_ROUNDS {
            if started.elapsed() > LOOKUP_TOTAL_TIMEOUT {
                debug!(?target, rounds, found = lookup.shortlist.len(), "lookup deadline reached");
                break;
            }
            let batch = lookup.next_batch(self.alpha);
            if batch.is_empty() {
                break;
            }
            rounds += 1;

            let mut queries = JoinSet::new();
            for contact in batch {
                let rpc = Arc::clone(&self.rpc);
                queries.spawn(async move {
                    let reply = tokio::time::timeout(PER_QUERY_TIMEOUT, rpc.find_node(&contact, target))
                        .await
                        .unwrap_or_else(|_| Err(anyhow!("query timed out")));
                    (contact, reply)
                });
            }

            while let Some(joined) = queries.join_next().await {
                let Ok((contact, reply)) = joined else {
                    continue;
                };
                match reply {
                    Ok(nodes) => {
                        lookup.responded += 1;
                        self.observe_contact(contact).await;
                        let usable: Vec<Contact> = nodes
                            .into_iter()
                            .filter(|n| n.identity.is_valid() && !n.addrs.is_empty())
                            .collect();
                        for node in &usable {
                            self.observe_contact(node.clone()).await;
                        }
                        lookup.absorb(usable);
                    }
                    Err(e) => {
                        trace!(peer = ?contact.identity, error = %e, "find_node query failed");
                        lookup.forget(&contact.identity);
                    }
                }
            }
        }
        if rounds == MAX_LOOKUP_ROUNDS {
            warn!(?target, "lookup hit the round limit");
        }

        debug!(
            ?target,
            rounds,
            found = lookup.shortlist.len(),
            asked = lookup.asked.len(),
            responded = lookup.responded,
            "lookup finished"
        );
        Ok(LookupResult {
            closest: lookup.shortlist,
            responded: lookup.responded,
        })
    }

    pub async fn quit(&self) {
        let _ = self.commands.send(Command::Quit).await;
        self.shutdown.cancel();
    }
}

struct DhtNodeActor<N: DhtNodeRpc> {
    table: RoutingTable,
    k: usize,
    inbox: mpsc::Receiver<Command>,
    probes: mpsc::WeakSender<Command>,
    /// Buckets with a liveness ping in flight.
    pinging: HashSet<usize>,
    rpc: Arc<N>,
    shutdown: CancellationToken,
}

impl<N: DhtNodeRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        loop {
            let command = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.inbox.recv() => command,
            };
            let Some(command) = command else {
                break;
            };
            match command {
                Command::Observe(contact) => self.observe(contact),
                Command::Lookup(id, reply) => {
                    let _ = reply.send(self.table.get(&id));
                }
                Command::Closest(target, reply) => {
                    let _ = reply.send(self.table.closest(&target, self.k));
                }
                Command::ServeFindNode(from, target, reply) => {
                    self.observe(from);
                    let _ = reply.send(self.table.closest(&target, self.k));
                }
                Command::Size(reply) => {
                    let _ = reply.send(self.table.len());
                }
                Command::StaleBuckets(max_age, reply) => {
                    let _ = reply.send(self.table.stale_buckets(max_age));
                }
                Command::BucketRefreshed(bucket) => self.table.touch_bucket(bucket),
                Command::ProbeResult(probe, alive) => {
                    self.pinging.remove(&probe.bucket);
                    if !alive {
                        debug!(evicted = ?probe.incumbent.identity, "incumbent unresponsive, replacing");
                    }
                    self.table.resolve_probe(probe, alive);
                }
                Command::Quit => break,
            }
        }
        debug!("DHT actor shutting down");
    }

    fn observe(&mut self, contact: Contact) {
        if contact.addrs.is_empty() {
            return;
        }
        let Some(probe) = self.table.insert(contact) else {
            return;
        };
        // One ping per bucket at a time; later challengers are dropped.
        if !self.pinging.insert(probe.bucket) {
            trace!(bucket = probe.bucket, "incumbent check already pending");
            return;
        }
        let rpc = Arc::clone(&self.rpc);
        let probes = self.probes.clone();
        tokio::spawn(async move {
            let alive = rpc.ping(&probe.incumbent).await.is_ok();
            if let Some(tx) = probes.upgrade() {
                let _ = tx.send(Command::ProbeResult(probe, alive)).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::sleep;

    /// In-process stand-in for the network: every node is reachable through
    /// the shared `Swarm` unless marked down.
    #[derive(Default)]
    struct Swarm {
        nodes: Mutex<HashMap<Identity, DhtNode<SimNet>>>,
        down: Mutex<HashSet<Identity>>,
    }

    impl Swarm {
        fn reach(&self, id: &Identity) -> anyhow::Result<DhtNode<SimNet>> {
            if self.down.lock().unwrap().contains(id) {
                return Err(anyhow!("{id:?} is down"));
            }
            self.nodes
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow!("{id:?} unknown"))
        }
    }

    struct SimNet {
        swarm: Arc<Swarm>,
        me: Contact,
        pinged: Mutex<Vec<Identity>>,
    }

    #[async_trait::async_trait]
    impl DhtNodeRpc for SimNet {
        async fn find_node(&self, to: &Contact, target: Identity) -> anyhow::Result<Vec<Contact>> {
            let peer = self.swarm.reach(&to.identity)?;
            Ok(peer.handle_find_node_request(&self.me, target).await)
        }

        async fn ping(&self, to: &Contact) -> anyhow::Result<()> {
            self.pinged.lock().unwrap().push(to.identity);
            self.swarm.reach(&to.identity).map(|_| ())
        }
    }

    fn keyed(index: u32) -> Identity {
        let mut secret = [7u8; 32];
        secret[28..].copy_from_slice(&index.to_le_bytes());
        Keypair::from_secret_key_bytes(&secret).identity()
    }

    fn contact(index: u32) -> Contact {
        let [_, _, hi, lo] = index.to_be_bytes();
        Contact::single(keyed(index), format!("10.{hi}.{lo}.1:4001"))
    }

    fn spawn(swarm: &Arc<Swarm>, index: u32, k: usize) -> (DhtNode<SimNet>, Arc<SimNet>) {
        let me = contact(index);
        let net = Arc::new(SimNet {
            swarm: Arc::clone(swarm),
            me: me.clone(),
            pinged: Mutex::new(Vec::new()),
        });
        let node = DhtNode::new(me, Arc::clone(&net), k, DEFAULT_ALPHA);
        swarm.nodes.lock().unwrap().insert(node.identity(), node.clone());
        (node, net)
    }

    /// `count` indices whose identities share a bucket as seen from index 0.
    fn same_bucket(count: usize) -> Vec<u32> {
        let origin = keyed(0);
        let mut by_bucket: HashMap<usize, Vec<u32>> = HashMap::new();
        for index in 1u32..4000 {
            let mates = by_bucket.entry(bucket_for(&origin, &keyed(index))).or_default();
            mates.push(index);
            if mates.len() == count {
                return mates.clone();
            }
        }
        panic!("no {count} identities share a bucket");
    }

    fn bucket_mates() -> (u32, u32) {
        let mates = same_bucket(2);
        (mates[0], mates[1])
    }

    async fn eventually(what: &str, mut check: impl AsyncFnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check().await {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn assert_sorted_towards(contacts: &[Contact], target: &Identity) {
        for pair in contacts.windows(2) {
            let near = pair[0].identity.xor_distance(target);
            let far = pair[1].identity.xor_distance(target);
            assert_ne!(distance_cmp(&near, &far), std::cmp::Ordering::Greater);
        }
    }

    #[test]
    fn bucket_is_first_differing_bit() {
        let zero = Identity::from_bytes([0u8; 32]);
        let mut top = [0u8; 32];
        top[0] = 0x80;
        assert_eq!(bucket_for(&zero, &Identity::from_bytes(top)), 0);

        let mut low = [0u8; 32];
        low[1] = 0x01;
        assert_eq!(bucket_for(&zero, &Identity::from_bytes(low)), 15);
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let origin = keyed(5);
        for bucket in [0usize, 7, 8, 100, 255] {
            let target = random_id_in_bucket(&origin, bucket);
            assert_eq!(bucket_for(&origin, &target), bucket);
        }
    }

    #[test]
    fn routing_table_orders_by_distance_and_skips_self() {
        let local = keyed(0);
        let mut table = RoutingTable::new(local, DEFAULT_K);
        table.update(Contact::single(local, "10.0.0.1:4001"));
        table.update(Contact::single(Identity::from_bytes([0u8; 32]), "10.0.0.9:4001"));
        assert!(table.is_empty());

        for index in 1..=30 {
            table.update(contact(index));
        }
        let target = keyed(17);
        let closest = table.closest(&target, 5);
        assert_eq!(closest.len(), 5);
        assert_eq!(closest[0].identity, target);
        assert_sorted_towards(&closest, &target);
        assert!(table.closest(&target, 0).is_empty());
    }

    #[test]
    fn refreshed_contact_keeps_its_slot_and_takes_new_addrs() {
        let mut table = RoutingTable::new(keyed(0), DEFAULT_K);
        table.update(contact(1));
        table.update(Contact::single(keyed(1), "192.0.2.1:5000"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&keyed(1)).unwrap().primary_addr(), Some("192.0.2.1:5000"));
    }

    #[test]
    fn update_reports_whether_contact_was_kept() {
        let (first, second) = bucket_mates();
        let mut table = RoutingTable::new(keyed(0), 1);

        assert!(table.update(contact(first)));
        assert!(table.update(contact(first)));
        assert!(!table.update(contact(second)));
        assert!(!table.update(contact(0)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn iterative_find_node_returns_expected_contacts() {
        let swarm = Arc::new(Swarm::default());
        let (main, _) = spawn(&swarm, 0x10, DEFAULT_K);
        let (one, _) = spawn(&swarm, 0x11, DEFAULT_K);
        let (two, _) = spawn(&swarm, 0x12, DEFAULT_K);

        for peer in [&one, &two] {
            main.observe_contact(peer.contact()).await;
            peer.observe_contact(main.contact()).await;
        }

        let results = main.iterative_find_node(two.identity()).await.unwrap();
        assert_eq!(results.first().map(|c| c.identity), Some(two.identity()));
        assert!(results.iter().any(|c| c.identity == one.identity()));
    }

    #[tokio::test]
    async fn bootstrap_learns_seed_neighbours() {
        let swarm = Arc::new(Swarm::default());
        let (seed, _) = spawn(&swarm, 0x40, DEFAULT_K);
        let mut others = Vec::new();
        for index in 0x41..0x46 {
            let (node, _) = spawn(&swarm, index, DEFAULT_K);
            seed.observe_contact(node.contact()).await;
            others.push(node);
        }
        let (newcomer, _) = spawn(&swarm, 0x50, DEFAULT_K);

        let found = newcomer.bootstrap(&[seed.contact()]).await.unwrap();

        assert!(found.iter().any(|c| c.identity == seed.identity()));
        assert_sorted_towards(&found, &newcomer.identity());
        for other in &others {
            assert!(newcomer.lookup_contact(&other.identity()).await.is_some());
        }
        // The seed learned about the newcomer from its FindNode.
        assert!(seed.lookup_contact(&newcomer.identity()).await.is_some());
    }

    #[tokio::test]
    async fn bootstrap_fails_when_no_seed_answers() {
        let swarm = Arc::new(Swarm::default());
        let (newcomer, _) = spawn(&swarm, 0x60, DEFAULT_K);

        assert!(newcomer.bootstrap(&[contact(0x61)]).await.is_err());
        assert!(newcomer.bootstrap(&[]).await.is_err());
        assert_eq!(newcomer.routing_table_size().await, 0);
    }

    #[tokio::test]
    async fn bootstrap_survives_one_dead_seed() {
        let swarm = Arc::new(Swarm::default());
        let (live, _) = spawn(&swarm, 0x70, DEFAULT_K);
        let (newcomer, _) = spawn(&swarm, 0x71, DEFAULT_K);
        let dead = contact(0x72);

        let found = newcomer
            .bootstrap(&[dead.clone(), live.contact()])
            .await
            .expect("one live seed is enough");
        assert!(found.iter().any(|c| c.identity == live.identity()));
        assert!(found.iter().all(|c| c.identity != dead.identity));
    }

    #[tokio::test]
    async fn find_peer_returns_exact_match_or_closest() {
        let swarm = Arc::new(Swarm::default());
        let (main, _) = spawn(&swarm, 0x20, DEFAULT_K);
        let (hop, _) = spawn(&swarm, 0x21, DEFAULT_K);
        let (far, _) = spawn(&swarm, 0x22, DEFAULT_K);
        main.observe_contact(hop.contact()).await;
        hop.observe_contact(far.contact()).await;

        assert_eq!(main.find_peer(far.identity()).await.unwrap(), vec![far.contact()]);

        let missing = keyed(0x99);
        let closest = main.find_peer(missing).await.unwrap();
        assert!(!closest.is_empty());
        assert!(closest.iter().all(|c| c.identity != missing));
        assert_sorted_towards(&closest, &missing);
    }

    #[tokio::test]
    async fn full_bucket_keeps_live_incumbent() {
        let (incumbent_idx, challenger_idx) = bucket_mates();
        let swarm = Arc::new(Swarm::default());
        let (main, net) = spawn(&swarm, 0, 1);
        let (incumbent, _) = spawn(&swarm, incumbent_idx, 1);
        let challenger = contact(challenger_idx);

        main.observe_contact(incumbent.contact()).await;
        main.observe_contact(challenger.clone()).await;
        eventually("a liveness ping", async || !net.pinged.lock().unwrap().is_empty()).await;
        main.routing_table_size().await;

        assert_eq!(*net.pinged.lock().unwrap(), vec![incumbent.identity()]);
        assert!(main.lookup_contact(&incumbent.identity()).await.is_some());
        assert!(main.lookup_contact(&challenger.identity).await.is_none());
    }

    #[tokio::test]
    async fn full_bucket_replaces_dead_incumbent() {
        let (incumbent_idx, challenger_idx) = bucket_mates();
        let swarm = Arc::new(Swarm::default());
        let (main, net) = spawn(&swarm, 0, 1);
        let incumbent = contact(incumbent_idx);
        let challenger = contact(challenger_idx);
        swarm.down.lock().unwrap().insert(incumbent.identity);

        main.observe_contact(incumbent.clone()).await;
        main.observe_contact(challenger.clone()).await;
        eventually("a liveness ping", async || !net.pinged.lock().unwrap().is_empty()).await;
        eventually("the challenger to be inserted", async || {
            main.lookup_contact(&challenger.identity).await.is_some()
        })
        .await;
        assert!(main.lookup_contact(&incumbent.identity).await.is_none());
    }

    #[tokio::test]
    async fn full_bucket_checks_one_incumbent_at_a_time() {
        let mates = same_bucket(5);
        let swarm = Arc::new(Swarm::default());
        let (main, net) = spawn(&swarm, 0, 1);
        let (incumbent, _) = spawn(&swarm, mates[0], 1);

        main.observe_contact(incumbent.contact()).await;
        for &challenger in &mates[1..4] {
            main.observe_contact(contact(challenger)).await;
        }
        eventually("a liveness ping", async || !net.pinged.lock().unwrap().is_empty()).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(*net.pinged.lock().unwrap(), vec![incumbent.identity()]);

        // Once settled, the next challenger triggers a fresh check.
        main.observe_contact(contact(mates[4])).await;
        eventually("a second liveness ping", async || net.pinged.lock().unwrap().len() == 2).await;
        assert!(main.lookup_contact(&incumbent.identity()).await.is_some());
    }

    #[tokio::test]
    async fn cancelled_node_stops_answering() {
        let swarm = Arc::new(Swarm::default());
        let me = contact(0x80);
        let net = Arc::new(SimNet {
            swarm: Arc::clone(&swarm),
            me: me.clone(),
            pinged: Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();
        let node = DhtNode::with_shutdown(me, net, DEFAULT_K, DEFAULT_ALPHA, shutdown.clone());
        node.observe_contact(contact(0x81)).await;
        assert_eq!(node.routing_table_size().await, 1);

        shutdown.cancel();
        eventually("the actor to stop", async || node.commands.is_closed()).await;
        assert!(node.lookup_contact(&keyed(0x81)).await.is_none());
    }
}
