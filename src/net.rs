//! TCP implementation of the peer transport.
//!
//! This module provides [`TcpNetwork`], the [`PeerNetwork`] used by the
//! binary, plus helpers to pick the local address and bind the listener whose
//! address becomes the node's identity.
//!
//! Every exchange uses a fresh short-lived connection: one per join, one per
//! heartbeat probe. Dropping the stream tears the connection down.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::core::{PeerNetwork, PeerRecord};
use crate::framing::{read_heartbeat_reply, read_to_close, write_message, MAX_MESSAGE_LEN};
use crate::heartbeat::HeartbeatReply;
use crate::protocol::{JoinRequest, Welcome, HEARTBEAT_PROBE};

/// Plain TCP transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpNetwork;

#[async_trait]
impl PeerNetwork for TcpNetwork {
    async fn join(&self, to: SocketAddr, request: &JoinRequest) -> Result<Welcome> {
        let mut stream = TcpStream::connect(to)
            .await
            .with_context(|| format!("connecting to target peer {to}"))?;
        info!(%to, "connected to target peer");

        write_message(&mut stream, &request.encode()).await?;
        let bytes = read_to_close(&mut stream, MAX_MESSAGE_LEN)
            .await
            .with_context(|| format!("reading welcome from {to}"))?;
        Welcome::decode(&bytes).with_context(|| format!("decoding welcome from {to}"))
    }

    async fn heartbeat(&self, to: &PeerRecord) -> Result<HeartbeatReply> {
        let addr = to.socket_addr();
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        write_message(&mut stream, HEARTBEAT_PROBE).await?;
        debug!(peer = %to.peer_id, %addr, "sent heartbeat");

        if read_heartbeat_reply(&mut stream, MAX_MESSAGE_LEN).await? {
            Ok(HeartbeatReply::Acknowledged)
        } else {
            Ok(HeartbeatReply::Closed)
        }
    }
}

/// First non-loopback IPv4 address of this machine, or `127.0.0.1`.
///
/// Asks the OS which source address it would route external traffic from.
/// Connecting a UDP socket sends nothing on the wire.
pub fn local_ipv4() -> IpAddr {
    let routed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());

    match routed {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

/// Bind the node's listener on an OS-assigned port and describe it.
///
/// Listens on `config.bind_ip`, or on [`local_ipv4`] when unset. The returned
/// record carries the identifier derived from the bound address.
pub async fn bind_listener(config: &NodeConfig) -> Result<(TcpListener, PeerRecord)> {
    let ip = config.bind_ip.unwrap_or_else(local_ipv4);
    let listener = TcpListener::bind((ip, 0))
        .await
        .with_context(|| format!("binding listener on {ip}"))?;
    let addr = listener.local_addr()?;
    Ok((listener, PeerRecord::from_addr(config.name.clone(), addr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generate_peer_id;

    #[test]
    fn local_ipv4_is_never_unspecified() {
        let ip = local_ipv4();
        assert!(ip.is_ipv4());
        assert!(!ip.is_unspecified());
    }

    #[tokio::test]
    async fn bind_listener_derives_identity_from_address() {
        let config = NodeConfig::new("alice").with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let (listener, record) = bind_listener(&config).await.unwrap();
        let addr = listener.local_addr().unwrap();

        assert_ne!(addr.port(), 0);
        assert_eq!(record.socket_addr(), addr);
        assert_eq!(record.name, "alice");
        assert_eq!(record.peer_id, generate_peer_id(addr.ip(), addr.port()));
    }

    #[tokio::test]
    async fn heartbeat_to_closed_port_is_a_transport_error() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let record = PeerRecord::from_addr("gone", addr);
        assert!(TcpNetwork.heartbeat(&record).await.is_err());
    }
}
