//! Core overlay logic: identity, distance, the bucketed routing table and the
//! [`DhtPeer`] node context.
//!
//! This module contains the building blocks every other module leans on:
//!
//! - **Identity**: [`PeerId`], [`generate_peer_id`]
//! - **Distance Metrics**: [`shared_prefix_len`], [`bucket_index`], [`xor_distance`]
//! - **Routing**: [`RoutingTable`], [`PeerRecord`] with separate join and refresh
//!   insertion policies
//! - **Node Context**: [`DhtPeer`], which owns the routing table, the missed
//!   heartbeat counters and the [`PeerNetwork`] transport

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatReply, MissedHeartbeats};
use crate::protocol::{JoinRequest, Welcome};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Number of buckets in every routing table.
pub const NUM_BUCKETS: usize = 16;

/// Bucket capacity enforced when a peer is learned from a join request.
pub const JOIN_BUCKET_CAPACITY: usize = 1;

/// Bucket capacity enforced when peers are learned from a welcome message.
pub const REFRESH_BUCKET_CAPACITY: usize = 2;

/// Length of a peer identifier in hex characters (16 bits of namespace).
pub const PEER_ID_HEX_LEN: usize = 4;

/// At most this many leading hex digits contribute to an identifier's value.
const MAX_ID_DIGITS: usize = 16;

// ============================================================================
// Identity
// ============================================================================

/// Hex-encoded peer identifier.
///
/// Well-formed identifiers are [`PEER_ID_HEX_LEN`] lowercase hex characters
/// produced by [`generate_peer_id`]. Identifiers received from the wire are
/// kept verbatim, even when they are not valid hex (the join decoder falls
/// back to the sentinel `xxxx`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value used for XOR distance.
    ///
    /// Only the longest leading run of hex digits counts, capped at
    /// [`MAX_ID_DIGITS`]; an identifier without one is worth zero.
    fn value(&self) -> u64 {
        self.0
            .chars()
            .take_while(char::is_ascii_hexdigit)
            .take(MAX_ID_DIGITS)
            .filter_map(|c| c.to_digit(16))
            .fold(0u64, |acc, digit| (acc << 4) | u64::from(digit))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Derive a peer identifier from a node's reachable address.
///
/// Hashes `"<ip>:<port>"` with BLAKE3 and keeps the first
/// [`PEER_ID_HEX_LEN`] hex characters of the digest:
///
/// ```
/// use hexdht::generate_peer_id;
///
/// let ip = "192.168.1.20".parse().unwrap();
/// let id = generate_peer_id(ip, 4000);
/// assert_eq!(id.as_str().len(), 4);
/// assert_eq!(id, generate_peer_id(ip, 4000));
/// ```
pub fn generate_peer_id(ip: IpAddr, port: u16) -> PeerId {
    let digest = blake3::hash(format!("{ip}:{port}").as_bytes());
    let mut encoded = hex::encode(digest.as_bytes());
    encoded.truncate(PEER_ID_HEX_LEN);
    PeerId(encoded)
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// Count the leading characters two identifiers have in common.
///
/// Comparison is case-sensitive and stops at the first mismatch or at the end
/// of the shorter identifier.
pub fn shared_prefix_len(a: &PeerId, b: &PeerId) -> usize {
    a.0.chars()
        .zip(b.0.chars())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Bucket a peer belongs in, relative to the local identifier.
///
/// Identical identifiers and any prefix longer than the table land in the
/// last bucket.
pub fn bucket_index(local_id: &PeerId, other: &PeerId) -> usize {
    shared_prefix_len(local_id, other).min(NUM_BUCKETS - 1)
}

/// XOR distance between two identifiers read as base-16 integers.
///
/// # Properties
/// - `xor_distance(a, a) == 0`
/// - `xor_distance(a, b) == xor_distance(b, a)`
///
/// The result only orders peers inside a bucket; there is no multi-hop lookup
/// built on top of it.
pub fn xor_distance(a: &PeerId, b: &PeerId) -> u64 {
    a.value() ^ b.value()
}

// ============================================================================
// Logical Clock
// ============================================================================

/// Strictly increasing tick counter used to stamp [`PeerRecord::last_seen`].
///
/// Starts from a random tick below 1000 so that stamps from different nodes
/// carry no meaning relative to each other.
#[derive(Clone, Copy, Debug)]
pub struct LogicalClock {
    next: u64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::starting_at(rand::thread_rng().gen_range(0..1000))
    }

    pub fn starting_at(tick: u64) -> Self {
        Self { next: tick }
    }

    /// Return the current tick and advance the clock.
    pub fn tick(&mut self) -> u64 {
        let now = self.next;
        self.next += 1;
        now
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// One known remote node.
///
/// Records are never edited in place once they are in a bucket: the table
/// either swaps in a whole new record or drops the candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Advisory display name, never used for routing decisions.
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    /// Tick of the last (re)insertion, stamped by the routing table.
    pub last_seen: u64,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, name: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            peer_id,
            name: name.into(),
            ip,
            port,
            last_seen: 0,
        }
    }

    /// Build a record for a listening address, deriving its identifier.
    pub fn from_addr(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self::new(generate_peer_id(addr.ip(), addr.port()), name, addr.ip(), addr.port())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Whether the record carries an address a probe can actually dial.
    pub fn is_reachable(&self) -> bool {
        self.port != 0 && !self.ip.is_unspecified()
    }
}

/// Outcome of offering a peer to the routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The bucket had room; the peer was added.
    Inserted { bucket: usize },
    /// The peer took the slot of `evicted`.
    Replaced { bucket: usize, evicted: PeerRecord },
    /// Every occupant compared better; the peer was dropped.
    Discarded { bucket: usize },
}

/// Whether `candidate` should take the slot held by `existing`.
///
/// Closer to the local identifier wins; on equal distance the more recently
/// stamped record wins.
fn supersedes(local_id: &PeerId, candidate: &PeerRecord, existing: &PeerRecord) -> bool {
    let distance_new = xor_distance(local_id, &candidate.peer_id);
    let distance_existing = xor_distance(local_id, &existing.peer_id);
    distance_new < distance_existing
        || (distance_new == distance_existing && candidate.last_seen > existing.last_seen)
}

/// Peers sharing one prefix length with the local identifier.
#[derive(Debug, Default, Clone)]
struct Bucket {
    peers: Vec<PeerRecord>,
}

impl Bucket {
    fn new() -> Self {
        Self { peers: Vec::new() }
    }

    /// Replace the first of the leading `scan` occupants that `candidate`
    /// supersedes, returning the evicted record.
    fn replace_first_loser(
        &mut self,
        local_id: &PeerId,
        candidate: &PeerRecord,
        scan: usize,
    ) -> Option<PeerRecord> {
        let pos = self
            .peers
            .iter()
            .take(scan)
            .position(|existing| supersedes(local_id, candidate, existing))?;
        Some(std::mem::replace(&mut self.peers[pos], candidate.clone()))
    }

    fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        let pos = self.peers.iter().position(|p| &p.peer_id == id)?;
        Some(self.peers.remove(pos))
    }
}

/// Routing table of [`NUM_BUCKETS`] capacity-bounded buckets.
///
/// A record for identifier `X` lives only in bucket
/// `min(shared_prefix_len(local, X), NUM_BUCKETS - 1)`. Memory stays bounded
/// by `NUM_BUCKETS * REFRESH_BUCKET_CAPACITY` records regardless of how many
/// peers the overlay has.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: PeerId,
    buckets: Vec<Bucket>,
    clock: LogicalClock,
}

impl RoutingTable {
    pub fn new(local_id: PeerId) -> Self {
        Self::with_clock(local_id, LogicalClock::new())
    }

    pub fn with_clock(local_id: PeerId, clock: LogicalClock) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket::new(); NUM_BUCKETS],
            clock,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Insert a peer learned from a join request (capacity 1 per bucket).
    ///
    /// An empty bucket always accepts the peer. Otherwise the peer is compared
    /// against the bucket's first occupant only and either replaces it or is
    /// dropped.
    pub fn insert_on_join(&mut self, mut peer: PeerRecord) -> InsertOutcome {
        peer.last_seen = self.clock.tick();
        let idx = bucket_index(&self.local_id, &peer.peer_id);
        let bucket = &mut self.buckets[idx];

        if bucket.peers.is_empty() {
            debug!(bucket = idx, peer = %peer.peer_id, addr = %peer.socket_addr(), "bucket was empty; added peer");
            bucket.peers.push(peer);
            return InsertOutcome::Inserted { bucket: idx };
        }

        match bucket.replace_first_loser(&self.local_id, &peer, JOIN_BUCKET_CAPACITY) {
            Some(evicted) => {
                debug!(bucket = idx, old = %evicted.peer_id, new = %peer.peer_id, "replaced peer");
                InsertOutcome::Replaced {
                    bucket: idx,
                    evicted,
                }
            }
            None => {
                debug!(bucket = idx, kept = %bucket.peers[0].peer_id, dropped = %peer.peer_id, "kept existing peer");
                InsertOutcome::Discarded { bucket: idx }
            }
        }
    }

    /// Insert every peer from a welcome list (capacity 2 per bucket).
    ///
    /// Each peer replaces the first occupant it supersedes; failing that it is
    /// appended if the bucket has room, and dropped otherwise.
    pub fn insert_on_refresh<I>(&mut self, peers: I) -> Vec<InsertOutcome>
    where
        I: IntoIterator<Item = PeerRecord>,
    {
        peers.into_iter().map(|peer| self.refresh_one(peer)).collect()
    }

    fn refresh_one(&mut self, mut peer: PeerRecord) -> InsertOutcome {
        peer.last_seen = self.clock.tick();
        let idx = bucket_index(&self.local_id, &peer.peer_id);
        let bucket = &mut self.buckets[idx];

        if let Some(evicted) =
            bucket.replace_first_loser(&self.local_id, &peer, REFRESH_BUCKET_CAPACITY)
        {
            debug!(bucket = idx, old = %evicted.peer_id, new = %peer.peer_id, "refresh replaced peer");
            return InsertOutcome::Replaced {
                bucket: idx,
                evicted,
            };
        }

        if bucket.peers.len() < REFRESH_BUCKET_CAPACITY {
            debug!(bucket = idx, peer = %peer.peer_id, "bucket was not full; added peer");
            bucket.peers.push(peer);
            InsertOutcome::Inserted { bucket: idx }
        } else {
            debug!(bucket = idx, dropped = %peer.peer_id, "kept existing peers");
            InsertOutcome::Discarded { bucket: idx }
        }
    }

    /// Remove the first record carrying `peer_id`.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.buckets.iter_mut().enumerate().find_map(|(idx, bucket)| {
            let removed = bucket.remove(peer_id)?;
            debug!(bucket = idx, peer = %peer_id, "removed peer");
            Some(removed)
        })
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.buckets
            .iter()
            .any(|b| b.peers.iter().any(|p| &p.peer_id == peer_id))
    }

    /// Occupants of one bucket, in slot order.
    pub fn bucket(&self, idx: usize) -> &[PeerRecord] {
        self.buckets
            .get(idx)
            .map(|b| b.peers.as_slice())
            .unwrap_or(&[])
    }

    /// All known peers, bucket by bucket.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.buckets
            .iter()
            .flat_map(|b| b.peers.iter().cloned())
            .collect()
    }

    pub fn occupancy(&self) -> Vec<usize> {
        self.buckets.iter().map(|b| b.peers.len()).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Network Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Transport used by a node for its outbound traffic.
///
/// The node context is generic over this trait so tests can swap the TCP
/// implementation ([`crate::net::TcpNetwork`]) for an in-memory one.
#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    /// Send a join request to a bootstrap peer and return its welcome.
    async fn join(&self, to: SocketAddr, request: &JoinRequest) -> Result<Welcome>;

    /// Probe a peer once.
    ///
    /// Resolves when the peer answers with a heartbeat response or closes the
    /// connection without one. The caller owns the response timeout; an `Err`
    /// is a transport failure, which is not a missed heartbeat.
    async fn heartbeat(&self, to: &PeerRecord) -> Result<HeartbeatReply>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of a node's routing state for logging and diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct TelemetrySnapshot {
    pub peer_id: PeerId,
    pub known_peers: usize,
    pub bucket_occupancy: Vec<usize>,
    /// Peers with a miss counter currently tracked.
    pub tracked_misses: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Node Context
// ─────────────────────────────────────────────────────────────────────────────

/// One running overlay participant.
///
/// A `DhtPeer` owns the routing table, the missed-heartbeat counters and the
/// [`PeerNetwork`] used for outbound connections. Both shared structures sit
/// behind async mutexes and every handler finishes its mutation under a
/// single lock acquisition, so concurrent joins and probes never observe a
/// half-applied update.
///
/// # Key Methods
///
/// * [`handle_join_request`](Self::handle_join_request) - bootstrap side of a join
/// * [`join_network`](Self::join_network) - joiner side of a join
/// * [`heartbeat_monitor`](Self::heartbeat_monitor) - liveness sweeps over known peers
///
/// Several nodes can live in one process; nothing is global.
pub struct DhtPeer<N: PeerNetwork> {
    /// This node's identifier.
    pub id: PeerId,
    /// Reachability info advertised to other peers.
    pub self_record: PeerRecord,
    config: NodeConfig,
    routing: Arc<Mutex<RoutingTable>>,
    missed: Arc<Mutex<MissedHeartbeats>>,
    network: Arc<N>,
}

impl<N: PeerNetwork> DhtPeer<N> {
    pub fn new(self_record: PeerRecord, network: N, config: NodeConfig) -> Self {
        let id = self_record.peer_id.clone();
        Self {
            routing: Arc::new(Mutex::new(RoutingTable::new(id.clone()))),
            missed: Arc::new(Mutex::new(MissedHeartbeats::default())),
            network: Arc::new(network),
            id,
            self_record,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Handle an inbound join request and build the welcome to send back.
    ///
    /// The joiner is recorded at the connection's remote IP and at the
    /// listening port it advertised, falling back to the remote port. The
    /// welcome lists this node first, then every other known peer except the
    /// joiner.
    pub async fn handle_join_request(&self, request: JoinRequest, remote: SocketAddr) -> Welcome {
        info!(name = %request.peer_name, id = %request.peer_id, %remote, "new join request");
        let port = request.listen_port.unwrap_or_else(|| remote.port());
        let joiner = PeerRecord::new(request.peer_id.clone(), request.peer_name, remote.ip(), port);

        let known = {
            let mut rt = self.routing.lock().await;
            rt.insert_on_join(joiner);
            rt.peers()
        };

        let mut peers = Vec::with_capacity(known.len() + 1);
        peers.push(self.self_record.clone());
        peers.extend(known.into_iter().filter(|p| p.peer_id != request.peer_id));
        Welcome::new(self.name(), peers)
    }

    /// Apply a welcome received from a bootstrap peer.
    ///
    /// Every listed peer other than this node goes through the refresh
    /// insertion policy.
    pub async fn handle_welcome(&self, welcome: Welcome) -> Vec<InsertOutcome> {
        info!(
            version = welcome.version,
            msg_type = welcome.msg_type,
            num_peers = welcome.num_peers,
            sender = %welcome.sender_name,
            "received welcome from target peer"
        );
        let peers: Vec<PeerRecord> = welcome
            .peers
            .into_iter()
            .filter(|p| p.peer_id != self.id)
            .collect();
        self.refresh_peers(peers).await
    }

    /// Join the overlay through `target`.
    pub async fn join_network(&self, target: SocketAddr) -> Result<()> {
        let request = JoinRequest::new(self.name(), self.id.clone(), Some(self.self_record.port));
        let welcome = self.network.join(target, &request).await?;
        self.handle_welcome(welcome).await;
        Ok(())
    }

    /// Insert peers through the refresh policy.
    pub async fn refresh_peers(&self, peers: Vec<PeerRecord>) -> Vec<InsertOutcome> {
        let mut rt = self.routing.lock().await;
        rt.insert_on_refresh(peers)
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        let mut rt = self.routing.lock().await;
        rt.remove(peer_id)
    }

    /// Build a heartbeat monitor sharing this node's table and counters.
    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor<N> {
        HeartbeatMonitor::new(
            self.routing.clone(),
            self.missed.clone(),
            self.network.clone(),
            &self.config,
        )
    }

    /// Current routing table contents, bucket by bucket.
    pub async fn known_peers(&self) -> Vec<PeerRecord> {
        let rt = self.routing.lock().await;
        rt.peers()
    }

    pub async fn bucket(&self, idx: usize) -> Vec<PeerRecord> {
        let rt = self.routing.lock().await;
        rt.bucket(idx).to_vec()
    }

    pub async fn contains_peer(&self, peer_id: &PeerId) -> bool {
        let rt = self.routing.lock().await;
        rt.contains(peer_id)
    }

    /// Consecutive missed heartbeats currently tracked for a peer.
    pub async fn missed_heartbeats(&self, peer_id: &PeerId) -> Option<u32> {
        let missed = self.missed.lock().await;
        missed.get(peer_id)
    }

    pub async fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let (known_peers, bucket_occupancy) = {
            let rt = self.routing.lock().await;
            (rt.len(), rt.occupancy())
        };
        let tracked_misses = {
            let missed = self.missed.lock().await;
            missed.len()
        };
        TelemetrySnapshot {
            peer_id: self.id.clone(),
            known_peers,
            bucket_occupancy,
            tracked_misses,
        }
    }
}
