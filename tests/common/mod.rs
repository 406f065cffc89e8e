#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex, RwLock};

use hexdht::{
    DhtPeer, HeartbeatReply, JoinRequest, NodeConfig, PeerId, PeerNetwork, PeerRecord, Welcome,
};

/// How a simulated peer reacts to a heartbeat probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Answers every probe.
    Responsive,
    /// Accepts the connection and never writes anything.
    Silent,
    /// Accepts the connection and closes it without answering.
    HangsUp,
    /// Refuses the connection.
    Refuses,
}

#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_addr: SocketAddr,
    liveness: Arc<Mutex<HashMap<SocketAddr, Liveness>>>,
    probes: Arc<Mutex<Vec<SocketAddr>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_addr: SocketAddr) -> Self {
        Self {
            registry,
            self_addr,
            liveness: Arc::new(Mutex::new(HashMap::new())),
            probes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_liveness(&self, addr: SocketAddr, liveness: Liveness) {
        let mut map = self.liveness.lock().await;
        map.insert(addr, liveness);
    }

    pub async fn probe_calls(&self) -> Vec<SocketAddr> {
        let probes = self.probes.lock().await;
        probes.clone()
    }
}

#[async_trait::async_trait]
impl PeerNetwork for TestNetwork {
    async fn join(&self, to: SocketAddr, request: &JoinRequest) -> Result<Welcome> {
        let peer = self
            .registry
            .get(&to)
            .await
            .ok_or_else(|| anyhow!("connection refused by {to}"))?;
        // Go through the wire format in both directions.
        let request = JoinRequest::decode(&request.encode());
        let welcome = peer.handle_join_request(request, self.self_addr).await;
        Welcome::decode(&welcome.encode()?)
    }

    async fn heartbeat(&self, to: &PeerRecord) -> Result<HeartbeatReply> {
        let addr = to.socket_addr();
        {
            let mut probes = self.probes.lock().await;
            probes.push(addr);
        }
        let liveness = {
            let map = self.liveness.lock().await;
            map.get(&addr).copied().unwrap_or(Liveness::Responsive)
        };
        match liveness {
            Liveness::Responsive => Ok(HeartbeatReply::Acknowledged),
            Liveness::Silent => std::future::pending().await,
            Liveness::HangsUp => Ok(HeartbeatReply::Closed),
            Liveness::Refuses => Err(anyhow!("connection refused by {addr}")),
        }
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<SocketAddr, Arc<DhtPeer<TestNetwork>>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &Arc<DhtPeer<TestNetwork>>) {
        let mut peers = self.peers.write().await;
        peers.insert(node.self_record.socket_addr(), node.clone());
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<Arc<DhtPeer<TestNetwork>>> {
        let peers = self.peers.read().await;
        peers.get(addr).cloned()
    }
}

pub struct TestNode {
    pub node: Arc<DhtPeer<TestNetwork>>,
    pub network: TestNetwork,
}

impl TestNode {
    /// A node with an explicit identifier, listening on `127.0.0.1:port`.
    pub async fn with_id(registry: Arc<NetworkRegistry>, id: &str, port: u16) -> Self {
        let record = make_record(id, port);
        let network = TestNetwork::new(registry.clone(), record.socket_addr());
        let config = NodeConfig::new(format!("node-{id}"));
        let node = Arc::new(DhtPeer::new(record, network.clone(), config));
        registry.register(&node).await;
        Self { node, network }
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.self_record.socket_addr()
    }

    pub fn id(&self) -> PeerId {
        self.node.id.clone()
    }
}

pub fn make_record(id: &str, port: u16) -> PeerRecord {
    PeerRecord::new(
        PeerId::from(id),
        format!("node-{id}"),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
    )
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// A join request as a peer listening on `port` would send it.
pub fn join_request(id: &str, port: u16) -> JoinRequest {
    JoinRequest::new(format!("node-{id}"), PeerId::from(id), Some(port))
}
