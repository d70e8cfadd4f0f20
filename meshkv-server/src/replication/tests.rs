use super::*;
use crate::core::registry::NodeContext;
use crate::core::store::{KvStore, StoreOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn node(host_id: u8) -> Arc<KvStore> {
    let ctx = NodeContext::new(Some(host_id));
    KvStore::open(
        "mesh",
        &ctx,
        StoreOptions {
            replicated: true,
            ..StoreOptions::default()
        },
    )
    .unwrap()
}

fn config(host_id: u8, peers: Vec<PeerConfig>) -> ReplicationConfig {
    ReplicationConfig {
        enabled: true,
        host_id,
        listen_address: Some("127.0.0.1:0".parse().unwrap()),
        peers,
        reconnect_delay_ms: 100,
        ack_interval_ms: 50,
        heartbeat_interval_ms: 200,
        ..ReplicationConfig::default()
    }
}

async fn start_node(
    store: &Arc<KvStore>,
    cfg: ReplicationConfig,
) -> (Arc<ReplicationCoordinator>, SocketAddr) {
    let coordinator = ReplicationCoordinator::new(cfg).unwrap();
    coordinator.register_store(Arc::clone(store)).unwrap();
    let addr = coordinator.start().await.unwrap();
    (coordinator, addr)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn test_bootstrap_then_live_sync() {
    let a = node(1);
    let (_coord_a, addr_a) = start_node(&a, config(1, vec![])).await;

    // Data written before the peer ever connects arrives via bootstrap.
    a.put("pre1", b"v1".to_vec()).unwrap();
    a.put("pre2", b"v2".to_vec()).unwrap();

    let b = node(2);
    let peers = vec![PeerConfig {
        host_id: 1,
        address: addr_a,
    }];
    let (_coord_b, _) = start_node(&b, config(2, peers)).await;

    wait_until(|| b.len() == 2).await;
    assert_eq!(b.get("pre1"), Some(b"v1".to_vec()));
    assert_eq!(b.get("pre2"), Some(b"v2".to_vec()));

    // And later writes arrive live.
    a.put("live", b"v3".to_vec()).unwrap();
    a.remove("pre1").unwrap();
    wait_until(|| b.get("live").is_some() && b.get("pre1").is_none()).await;
}

#[tokio::test]
async fn test_bidirectional_convergence_to_union() {
    let a = node(1);
    let b = node(2);

    let (coord_a, addr_a) = start_node(&a, config(1, vec![])).await;
    let (_coord_b, addr_b) = start_node(
        &b,
        config(
            2,
            vec![PeerConfig {
                host_id: 1,
                address: addr_a,
            }],
        ),
    )
    .await;
    coord_a.add_peer(PeerConfig {
        host_id: 2,
        address: addr_b,
    });

    for i in 0..10 {
        a.put(&format!("a{i}"), b"from-a".to_vec()).unwrap();
        b.put(&format!("b{i}"), b"from-b".to_vec()).unwrap();
    }

    wait_until(|| a.len() == 20 && b.len() == 20).await;
    assert_eq!(a.entries(), b.entries());
}

#[tokio::test]
async fn test_conflicting_writes_converge() {
    let a = node(1);
    let b = node(2);

    let (coord_a, addr_a) = start_node(&a, config(1, vec![])).await;
    let (_coord_b, addr_b) = start_node(
        &b,
        config(
            2,
            vec![PeerConfig {
                host_id: 1,
                address: addr_a,
            }],
        ),
    )
    .await;
    coord_a.add_peer(PeerConfig {
        host_id: 2,
        address: addr_b,
    });

    a.put("contested", b"from-a".to_vec()).unwrap();
    b.put("contested", b"from-b".to_vec()).unwrap();

    // Both sides must settle on the same winner, whichever it is.
    wait_until(|| {
        let va = a.get("contested");
        let vb = b.get("contested");
        va.is_some() && va == vb
    })
    .await;
}

#[tokio::test]
async fn test_applied_entries_are_not_relogged() {
    let a = node(1);
    let b = node(2);

    let (coord_a, addr_a) = start_node(&a, config(1, vec![])).await;
    let (_coord_b, addr_b) = start_node(
        &b,
        config(
            2,
            vec![PeerConfig {
                host_id: 1,
                address: addr_a,
            }],
        ),
    )
    .await;
    coord_a.add_peer(PeerConfig {
        host_id: 2,
        address: addr_b,
    });

    for i in 0..5 {
        a.put(&format!("k{i}"), b"v".to_vec()).unwrap();
    }
    wait_until(|| b.len() == 5).await;
    // Give any echo a chance to happen, then check the logs only hold the
    // locally originated writes.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.log().unwrap().current_offset(), 5);
    assert_eq!(b.log().unwrap().current_offset(), 0);
}

#[tokio::test]
async fn test_peer_cursor_advances_with_acks() {
    let a = node(1);
    let (coord_a, addr_a) = start_node(&a, config(1, vec![])).await;

    let b = node(2);
    let (coord_b, _) = start_node(
        &b,
        config(
            2,
            vec![PeerConfig {
                host_id: 1,
                address: addr_a,
            }],
        ),
    )
    .await;

    for i in 0..8 {
        a.put(&format!("k{i}"), b"v".to_vec()).unwrap();
    }
    wait_until(|| b.len() == 8).await;
    wait_until(|| coord_a.peer_cursor(2, "mesh") == Some(8)).await;
    assert_eq!(coord_b.resume_position(1, "mesh"), Some(8));
}

#[tokio::test]
async fn test_fresh_replacement_node_bootstraps() {
    let a = node(1);
    let (_coord_a, addr_a) = start_node(&a, config(1, vec![])).await;
    a.put("k", b"v1".to_vec()).unwrap();

    let peers = vec![PeerConfig {
        host_id: 1,
        address: addr_a,
    }];

    let b = node(2);
    let (coord_b, _) = start_node(&b, config(2, peers.clone())).await;
    wait_until(|| b.len() == 1).await;
    coord_b.shutdown();

    // More writes while the peer is away.
    a.put("k2", b"v2".to_vec()).unwrap();

    // A replacement node with no state pulls everything via bootstrap.
    let b2 = node(2);
    let (_coord_b2, _) = start_node(&b2, config(2, peers)).await;
    wait_until(|| b2.len() == 2).await;
    assert_eq!(b2.get("k"), Some(b"v1".to_vec()));
    assert_eq!(b2.get("k2"), Some(b"v2".to_vec()));
}

#[tokio::test]
async fn test_reconnecting_peer_resumes_from_acked_offset() {
    use crate::protocol::frame::{read_frame, write_frame};
    use tokio::net::TcpStream;

    let a = node(1);
    let (coord_a, addr_a) = start_node(&a, config(1, vec![])).await;
    for i in 0..3 {
        a.put(&format!("k{i}"), b"v".to_vec()).unwrap();
    }

    // First session bootstraps, then acks everything received.
    let stream = TcpStream::connect(addr_a).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();
    write_frame(
        &mut writer,
        &PeerMessage::Hello {
            host_id: 9,
            store: "mesh".to_string(),
            resume_from: None,
        },
    )
    .await
    .unwrap();

    let mut snapshot_entries = 0;
    let resume_offset = loop {
        match read_frame::<_, PeerMessage>(&mut reader)
            .await
            .unwrap()
            .unwrap()
        {
            PeerMessage::SnapshotEntry { .. } => snapshot_entries += 1,
            PeerMessage::BatchComplete { resume_offset, .. } => break resume_offset,
            other => panic!("unexpected message during bootstrap: {other:?}"),
        }
    };
    assert_eq!(snapshot_entries, 3);
    assert_eq!(resume_offset, 3);

    write_frame(
        &mut writer,
        &PeerMessage::Ack {
            next_wanted: resume_offset,
        },
    )
    .await
    .unwrap();
    wait_until(|| coord_a.peer_cursor(9, "mesh") == Some(3)).await;
    drop(reader);
    drop(writer);

    // A write while the peer is away stays buffered in the log.
    a.put("k3", b"v".to_vec()).unwrap();

    // The second session announces the acked position and must be served
    // straight from the log: no snapshot replay, no second bootstrap, just
    // the missed entry.
    let stream = TcpStream::connect(addr_a).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();
    write_frame(
        &mut writer,
        &PeerMessage::Hello {
            host_id: 9,
            store: "mesh".to_string(),
            resume_from: Some(resume_offset),
        },
    )
    .await
    .unwrap();

    let (offset, entry) = loop {
        match read_frame::<_, PeerMessage>(&mut reader)
            .await
            .unwrap()
            .unwrap()
        {
            PeerMessage::Entry { offset, entry } => break (offset, entry),
            PeerMessage::Heartbeat { .. } => {}
            other => panic!("resume must not replay the snapshot: {other:?}"),
        }
    };
    assert_eq!(offset, 3);
    assert_eq!(entry.key, "k3");
    assert_eq!(coord_a.stats().bootstraps_served, 1);
}

#[tokio::test]
async fn test_stats_reflect_traffic() {
    let a = node(1);
    let (coord_a, addr_a) = start_node(&a, config(1, vec![])).await;

    let b = node(2);
    let (coord_b, _) = start_node(
        &b,
        config(
            2,
            vec![PeerConfig {
                host_id: 1,
                address: addr_a,
            }],
        ),
    )
    .await;

    a.put("k", b"v".to_vec()).unwrap();
    wait_until(|| b.len() == 1).await;

    let stats_a = coord_a.stats();
    assert!(stats_a.bootstraps_served >= 1);
    assert_eq!(stats_a.log_offset, 1);

    let stats_b = coord_b.stats();
    assert_eq!(stats_b.connected_peers, 1);
    assert!(stats_b.entries_applied >= 1);
}
