//! # hexdht
//!
//! Peer discovery and liveness maintenance for a small overlay network in the
//! style of a Kademlia DHT. Every node:
//!
//! - keeps a bounded routing table of known peers, bucketed by how many hex
//!   characters their identifier shares with its own;
//! - answers join requests with a welcome listing the peers it knows;
//! - probes every known peer on a fixed period and evicts peers that miss
//!   three heartbeats in a row.
//!
//! The overlay only discovers and maintains peers. It stores no values and
//! routes no application data.
//!
//! The crate is split into a handful of modules:
//!
//! - [`core`](crate::core): identity, XOR distance, the [`RoutingTable`] and the
//!   [`DhtPeer`] node context.
//! - [`heartbeat`]: miss counters and the [`HeartbeatMonitor`] sweep.
//! - [`protocol`]: join request, welcome and heartbeat wire formats.
//! - [`framing`]: bounded reads over raw TCP streams.
//! - [`net`]: the TCP [`PeerNetwork`] implementation and listener binding.
//! - [`server`]: accept loop and per-connection dispatch.
//! - [`config`]: [`NodeConfig`] and the overlay's timing constants.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use hexdht::{bind_listener, serve, DhtPeer, NodeConfig, TcpNetwork};
//!
//! # async fn launch() -> Result<()> {
//! let config = NodeConfig::new("alice");
//! let (listener, self_record) = bind_listener(&config).await?;
//! let node = Arc::new(DhtPeer::new(self_record, TcpNetwork, config));
//!
//! tokio::spawn(serve(node.clone(), listener));
//! tokio::spawn(node.heartbeat_monitor().run());
//! node.join_network("10.0.0.2:41000".parse()?).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces together behind a small CLI.

pub mod config;
pub mod core;
pub mod framing;
pub mod heartbeat;
pub mod net;
pub mod protocol;
pub mod server;

pub use crate::config::NodeConfig;
pub use crate::core::{
    bucket_index, generate_peer_id, shared_prefix_len, xor_distance, DhtPeer, InsertOutcome,
    PeerId, PeerNetwork, PeerRecord, RoutingTable, TelemetrySnapshot, NUM_BUCKETS,
};
pub use heartbeat::{HeartbeatMonitor, HeartbeatReply, MissedHeartbeats, ProbeOutcome, SweepReport};
pub use net::{bind_listener, TcpNetwork};
pub use protocol::{JoinRequest, Welcome};
pub use server::{handle_connection, serve};
