//! Overlay peer binary.
//!
//! Starts a node listening on an OS-assigned port, optionally joins the
//! overlay through a bootstrap peer, and keeps heartbeating known peers until
//! interrupted.
//!
//! # Usage
//!
//! ```bash
//! hexdht -n alice
//! hexdht -n bob -p 192.168.1.20:41235
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use hexdht::{bind_listener, serve, DhtPeer, NodeConfig, TcpNetwork};

#[derive(Parser, Debug)]
#[command(name = "hexdht")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Display name announced to other peers.
    #[arg(short, long)]
    name: String,

    /// Bootstrap peer to join through.
    #[arg(short, long, value_name = "IP:PORT")]
    peer: Option<SocketAddr>,

    /// Address to listen on instead of the first non-loopback IPv4 address.
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Seconds between telemetry log lines.
    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig::new(args.name);
    config.bind_ip = args.bind;
    config.bootstrap = args.peer;
    config.telemetry_interval = Duration::from_secs(args.telemetry_interval);

    let (listener, self_record) = bind_listener(&config).await?;
    info!(
        name = %config.name,
        addr = %self_record.socket_addr(),
        peer_id = %self_record.peer_id,
        "peer is listening"
    );

    let node = Arc::new(DhtPeer::new(self_record, TcpNetwork, config.clone()));

    let server_node = node.clone();
    tokio::spawn(async move {
        if let Err(err) = serve(server_node, listener).await {
            error!("server stopped: {err:#}");
        }
    });

    tokio::spawn(node.heartbeat_monitor().run());

    if let Some(target) = config.bootstrap {
        let join_node = node.clone();
        let delay = config.join_delay;
        tokio::spawn(async move {
            time::sleep(delay).await;
            match join_node.join_network(target).await {
                Ok(()) => info!(%target, "joined network"),
                Err(err) => warn!(%target, "join failed: {err:#}"),
            }
        });
    }

    let mut telemetry = time::interval(config.telemetry_interval);
    telemetry.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting");
                break;
            }
            _ = telemetry.tick() => {
                let snapshot = node.telemetry_snapshot().await;
                match serde_json::to_string(&snapshot) {
                    Ok(json) => info!(telemetry = %json, "routing table snapshot"),
                    Err(err) => warn!("failed to serialize telemetry: {err}"),
                }
            }
        }
    }

    Ok(())
}
