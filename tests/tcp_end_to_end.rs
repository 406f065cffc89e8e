use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::Result;
use hexdht::{
    bind_listener, bucket_index, serve, xor_distance, DhtPeer, NodeConfig, ProbeOutcome, TcpNetwork,
    Welcome,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn spawn_node(name: &str) -> Result<Arc<DhtPeer<TcpNetwork>>> {
    let config = NodeConfig::new(name).with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let (listener, record) = bind_listener(&config).await?;
    let node = Arc::new(DhtPeer::new(record, TcpNetwork, config));
    tokio::spawn(serve(node.clone(), listener));
    Ok(node)
}

#[tokio::test]
async fn joiner_and_bootstrap_learn_each_other() -> Result<()> {
    let bootstrap = spawn_node("bootstrap").await?;
    let joiner = spawn_node("joiner").await?;

    joiner
        .join_network(bootstrap.self_record.socket_addr())
        .await?;

    let known_by_bootstrap = bootstrap.known_peers().await;
    assert_eq!(known_by_bootstrap.len(), 1);
    assert_eq!(known_by_bootstrap[0].peer_id, joiner.id);
    assert_eq!(
        known_by_bootstrap[0].socket_addr(),
        joiner.self_record.socket_addr(),
        "joiner is recorded at its listening address"
    );

    let known_by_joiner = joiner.known_peers().await;
    assert_eq!(known_by_joiner.len(), 1);
    assert_eq!(known_by_joiner[0].peer_id, bootstrap.id);
    assert_eq!(known_by_joiner[0].name, "bootstrap");
    Ok(())
}

#[tokio::test]
async fn third_peer_learns_earlier_joiner_from_welcome() -> Result<()> {
    let bootstrap = spawn_node("bootstrap").await?;
    let first = spawn_node("first").await?;
    let second = spawn_node("second").await?;
    let target = bootstrap.self_record.socket_addr();

    first.join_network(target).await?;
    second.join_network(target).await?;

    // Identifiers derive from ephemeral ports, so work out from the bucket
    // indices which joiners the bootstrap's join policy keeps.
    let first_bucket = bucket_index(&bootstrap.id, &first.id);
    let second_bucket = bucket_index(&bootstrap.id, &second.id);
    let first_kept = first_bucket != second_bucket
        || xor_distance(&bootstrap.id, &first.id) < xor_distance(&bootstrap.id, &second.id);
    let second_kept = first_bucket != second_bucket || !first_kept;

    assert_eq!(bootstrap.contains_peer(&first.id).await, first_kept);
    assert_eq!(bootstrap.contains_peer(&second.id).await, second_kept);

    // The welcome lists the bootstrap, then the first joiner if it was kept.
    // Under the refresh policy a closer first joiner sharing the bootstrap's
    // bucket replaces it instead of being appended.
    let mut expected = vec![bootstrap.id.clone()];
    if first_kept {
        let same_bucket =
            bucket_index(&second.id, &bootstrap.id) == bucket_index(&second.id, &first.id);
        if same_bucket && xor_distance(&second.id, &first.id) < xor_distance(&second.id, &bootstrap.id) {
            expected.clear();
        }
        expected.push(first.id.clone());
    }
    let mut known: Vec<_> = second.known_peers().await.into_iter().map(|p| p.peer_id).collect();
    known.sort();
    expected.sort();
    assert_eq!(known, expected);
    Ok(())
}

#[tokio::test]
async fn live_peers_answer_heartbeats_over_tcp() -> Result<()> {
    let bootstrap = spawn_node("bootstrap").await?;
    let joiner = spawn_node("joiner").await?;
    joiner
        .join_network(bootstrap.self_record.socket_addr())
        .await?;

    let report = bootstrap.heartbeat_monitor().sweep().await;
    assert_eq!(report.probed, 1);
    assert_eq!(report.responded, 1);
    assert_eq!(bootstrap.missed_heartbeats(&joiner.id).await, Some(0));

    let outcome = joiner
        .heartbeat_monitor()
        .probe(&bootstrap.self_record)
        .await;
    assert_eq!(outcome, ProbeOutcome::Responded);
    Ok(())
}

#[tokio::test]
async fn raw_join_request_gets_binary_welcome() -> Result<()> {
    let bootstrap = spawn_node("boot").await?;

    let mut stream = TcpStream::connect(bootstrap.self_record.socket_addr()).await?;
    stream.write_all(b"Join request from raw [beef]").await?;
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await?;

    assert_eq!(&bytes[..5], &[18, 2, 1, 0, 4]);
    let welcome = Welcome::decode(&bytes)?;
    assert_eq!(welcome.sender_name, "boot");
    assert_eq!(welcome.peers.len(), 1);
    assert_eq!(welcome.peers[0].peer_id, bootstrap.id);
    Ok(())
}

#[tokio::test]
async fn heartbeat_probe_gets_response() -> Result<()> {
    let node = spawn_node("responder").await?;

    let mut stream = TcpStream::connect(node.self_record.socket_addr()).await?;
    stream.write_all(b"HEARTBEAT").await?;
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    assert_eq!(reply, b"RESPONSE");
    assert!(node.known_peers().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn overlong_join_id_does_not_block_later_joiners() -> Result<()> {
    let bootstrap = spawn_node("boot").await?;

    let mut stream = TcpStream::connect(bootstrap.self_record.socket_addr()).await?;
    let text = format!("Join request from mallory [{}] listening on 1", "a".repeat(300));
    stream.write_all(text.as_bytes()).await?;
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await?;
    assert!(Welcome::decode(&bytes).is_ok());

    let joiner = spawn_node("joiner").await?;
    joiner
        .join_network(bootstrap.self_record.socket_addr())
        .await?;
    assert!(joiner.known_peers().await.iter().any(|p| p.peer_id == bootstrap.id));
    Ok(())
}
