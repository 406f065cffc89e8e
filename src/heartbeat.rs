//! Heartbeat-driven failure detection.
//!
//! Every sweep probes each peer in the routing table once. A probe either
//! sees a response before the response timeout (the peer's miss counter goes
//! back to zero) or times out (the counter goes up by one). Reaching the miss
//! threshold evicts the peer. A transport error tears the probe down without
//! touching the counter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::core::{PeerId, PeerNetwork, PeerRecord, RoutingTable};

/// Consecutive unanswered probes per peer.
#[derive(Clone, Debug, Default)]
pub struct MissedHeartbeats {
    counts: HashMap<PeerId, u32>,
}

impl MissedHeartbeats {
    pub fn get(&self, peer_id: &PeerId) -> Option<u32> {
        self.counts.get(peer_id).copied()
    }

    /// Record a response from the peer.
    pub fn reset(&mut self, peer_id: &PeerId) {
        self.counts.insert(peer_id.clone(), 0);
    }

    /// Record one unanswered probe and return the new count.
    pub fn record_miss(&mut self, peer_id: &PeerId) -> u32 {
        let count = self.counts.entry(peer_id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear(&mut self, peer_id: &PeerId) -> Option<u32> {
        self.counts.remove(peer_id)
    }

    /// Drop counters for peers that are no longer known.
    pub fn retain_known(&mut self, known: &HashSet<PeerId>) {
        self.counts.retain(|id, _| known.contains(id));
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// How a heartbeat exchange ended on the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatReply {
    /// The peer sent data containing the response marker.
    Acknowledged,
    /// The peer closed the connection without responding.
    Closed,
}

/// Terminal state of a single probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Responded,
    TimedOut { missed: u32, evicted: bool },
    /// Transport error; not counted as a miss.
    Failed,
    /// The record had no usable address, so nothing was sent.
    Skipped,
}

/// Tally of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub responded: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub skipped: usize,
    pub evicted: Vec<PeerId>,
}

/// Periodically probes every known peer and evicts unresponsive ones.
///
/// Obtained from [`crate::DhtPeer::heartbeat_monitor`]; shares the node's
/// routing table and miss counters.
pub struct HeartbeatMonitor<N: PeerNetwork> {
    routing: Arc<Mutex<RoutingTable>>,
    missed: Arc<Mutex<MissedHeartbeats>>,
    network: Arc<N>,
    interval: Duration,
    response_timeout: Duration,
    miss_threshold: u32,
}

impl<N: PeerNetwork> HeartbeatMonitor<N> {
    pub(crate) fn new(
        routing: Arc<Mutex<RoutingTable>>,
        missed: Arc<Mutex<MissedHeartbeats>>,
        network: Arc<N>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            routing,
            missed,
            network,
            interval: config.heartbeat_interval,
            response_timeout: config.response_timeout,
            miss_threshold: config.miss_threshold,
        }
    }

    /// Sweep forever, one sweep per interval.
    ///
    /// The first sweep fires one full interval after start. Each sweep runs in
    /// its own task so a slow sweep never delays the next tick.
    pub async fn run(self) {
        let monitor = Arc::new(self);
        let mut ticker = time::interval_at(Instant::now() + monitor.interval, monitor.interval);
        loop {
            ticker.tick().await;
            let monitor = monitor.clone();
            tokio::spawn(async move {
                let report = monitor.sweep().await;
                debug!(?report, "heartbeat sweep finished");
            });
        }
    }

    /// Probe every peer currently in the routing table once.
    pub async fn sweep(&self) -> SweepReport {
        let peers = {
            let rt = self.routing.lock().await;
            rt.peers()
        };
        {
            let known: HashSet<PeerId> = peers.iter().map(|p| p.peer_id.clone()).collect();
            let mut missed = self.missed.lock().await;
            missed.retain_known(&known);
        }
        info!(peers = peers.len(), "sending heartbeat messages");

        let outcomes = join_all(peers.iter().map(|peer| self.probe(peer))).await;

        let mut report = SweepReport {
            probed: peers.len(),
            ..SweepReport::default()
        };
        for (peer, outcome) in peers.iter().zip(outcomes) {
            match outcome {
                ProbeOutcome::Responded => report.responded += 1,
                ProbeOutcome::TimedOut { evicted, .. } => {
                    report.timed_out += 1;
                    if evicted {
                        report.evicted.push(peer.peer_id.clone());
                    }
                }
                ProbeOutcome::Failed => report.failed += 1,
                ProbeOutcome::Skipped => report.skipped += 1,
            }
        }
        report
    }

    /// Probe one peer, applying the outcome to the miss counters.
    pub async fn probe(&self, peer: &PeerRecord) -> ProbeOutcome {
        if !peer.is_reachable() {
            warn!(peer = %peer.peer_id, "skipping heartbeat: missing address or port");
            return ProbeOutcome::Skipped;
        }

        let deadline = Instant::now() + self.response_timeout;
        match time::timeout_at(deadline, self.network.heartbeat(peer)).await {
            Ok(Ok(HeartbeatReply::Acknowledged)) => {
                self.missed.lock().await.reset(&peer.peer_id);
                debug!(peer = %peer.peer_id, "received heartbeat response");
                ProbeOutcome::Responded
            }
            Ok(Ok(HeartbeatReply::Closed)) => {
                // No response arrived; the timer still decides.
                time::sleep_until(deadline).await;
                self.record_timeout(peer).await
            }
            Ok(Err(err)) => {
                warn!(peer = %peer.peer_id, addr = %peer.socket_addr(), "heartbeat transport error: {err:#}");
                ProbeOutcome::Failed
            }
            Err(_) => self.record_timeout(peer).await,
        }
    }

    async fn record_timeout(&self, peer: &PeerRecord) -> ProbeOutcome {
        let mut missed = self.missed.lock().await;
        let count = missed.record_miss(&peer.peer_id);
        info!(peer = %peer.peer_id, missed = count, "no heartbeat response");
        if count < self.miss_threshold {
            return ProbeOutcome::TimedOut {
                missed: count,
                evicted: false,
            };
        }

        missed.clear(&peer.peer_id);
        let mut rt = self.routing.lock().await;
        rt.remove(&peer.peer_id);
        info!(peer = %peer.peer_id, "peer removed due to missed heartbeats");
        ProbeOutcome::TimedOut {
            missed: count,
            evicted: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misses_accumulate_and_reset() {
        let id = PeerId::from("00aa");
        let mut missed = MissedHeartbeats::default();
        assert_eq!(missed.get(&id), None);
        assert_eq!(missed.record_miss(&id), 1);
        assert_eq!(missed.record_miss(&id), 2);
        missed.reset(&id);
        assert_eq!(missed.get(&id), Some(0));
        assert_eq!(missed.record_miss(&id), 1);
        assert_eq!(missed.clear(&id), Some(1));
        assert!(missed.is_empty());
    }

    #[test]
    fn retain_known_drops_forgotten_peers() {
        let mut missed = MissedHeartbeats::default();
        missed.record_miss(&PeerId::from("00aa"));
        missed.record_miss(&PeerId::from("00bb"));

        let known: HashSet<PeerId> = [PeerId::from("00bb")].into_iter().collect();
        missed.retain_known(&known);
        assert_eq!(missed.len(), 1);
        assert_eq!(missed.get(&PeerId::from("00bb")), Some(1));
    }
}
