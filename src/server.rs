use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::core::{DhtPeer, PeerNetwork};
use crate::framing::{read_message, write_message};
use crate::protocol::{InboundMessage, HEARTBEAT_RESPONSE};

/// Accept connections forever, handling each one on its own task.
///
/// Failed accepts are logged and skipped; only the caller dropping the
/// future stops the loop.
pub async fn serve<N: PeerNetwork>(node: Arc<DhtPeer<N>>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        debug!(%remote, "incoming connection");

        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(node, stream, remote).await {
                warn!(%remote, "connection error: {err:#}");
            }
        });
    }
}

/// Handles a single inbound connection.
///
/// Each connection carries exactly one exchange: the first message decides
/// whether this is a heartbeat probe (answered with `RESPONSE`) or a join
/// request (answered with a welcome). The write side is shut down afterwards
/// so the peer sees the end of the reply.
pub async fn handle_connection<N, S>(node: Arc<DhtPeer<N>>, mut stream: S, remote: SocketAddr) -> Result<()>
where
    N: PeerNetwork,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(bytes) = read_message(&mut stream).await? else {
        debug!(%remote, "connection ended before any data");
        return Ok(());
    };

    match InboundMessage::classify(&bytes) {
        InboundMessage::Heartbeat => {
            write_message(&mut stream, HEARTBEAT_RESPONSE).await?;
            debug!(%remote, "answered heartbeat");
        }
        InboundMessage::Join(request) => {
            let name = request.peer_name.clone();
            let welcome = node.handle_join_request(request, remote).await;
            write_message(&mut stream, &welcome.encode()?).await?;
            debug!(%remote, %name, peers = welcome.num_peers, "sent welcome message");
        }
    }

    // The peer may already have hung up after reading its reply.
    if let Err(err) = stream.shutdown().await {
        debug!(%remote, "shutdown failed: {err}");
    }
    Ok(())
}
