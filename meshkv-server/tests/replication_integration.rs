//! Full-stack replication tests: two nodes, each with its own wire server
//! and replication coordinator, exercised through remote clients only.

use meshkv_server::client::{Connection, RemoteMap};
use meshkv_server::core::store::StoreOptions;
use meshkv_server::core::{ChangeEvent, NodeContext};
use meshkv_server::{
    KvStore, PeerConfig, ReplicationConfig, ReplicationCoordinator, StoreRegistry, WireServer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const STORE: &str = "maps/mesh";

struct Node {
    store: Arc<KvStore>,
    coordinator: Arc<ReplicationCoordinator>,
    client_addr: SocketAddr,
    repl_addr: SocketAddr,
}

async fn start_node(host_id: u8, peers: Vec<PeerConfig>) -> Node {
    let ctx = NodeContext::new(Some(host_id));
    let store = KvStore::open(
        STORE,
        &ctx,
        StoreOptions {
            replicated: true,
            ..StoreOptions::default()
        },
    )
    .unwrap();

    let coordinator = ReplicationCoordinator::new(ReplicationConfig {
        enabled: true,
        host_id,
        listen_address: Some("127.0.0.1:0".parse().unwrap()),
        peers,
        reconnect_delay_ms: 100,
        ack_interval_ms: 50,
        heartbeat_interval_ms: 200,
        ..ReplicationConfig::default()
    })
    .unwrap();
    coordinator.register_store(Arc::clone(&store)).unwrap();
    let repl_addr = coordinator.start().await.unwrap();

    let registry = StoreRegistry::new();
    registry.insert(Arc::clone(&store));
    let server = WireServer::new(registry);
    let client_addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

    Node {
        store,
        coordinator,
        client_addr,
        repl_addr,
    }
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

async fn connect(addr: SocketAddr) -> RemoteMap {
    RemoteMap::new(Connection::connect(addr).await.unwrap(), STORE)
}

/// Two nodes pulling from each other.
async fn start_pair() -> (Node, Node) {
    let a = start_node(1, vec![]).await;
    let b = start_node(
        2,
        vec![PeerConfig {
            host_id: 1,
            address: a.repl_addr,
        }],
    )
    .await;
    a.coordinator.add_peer(PeerConfig {
        host_id: 2,
        address: b.repl_addr,
    });
    (a, b)
}

#[tokio::test]
async fn test_three_node_mesh_converges_to_union() {
    let n1 = start_node(1, vec![]).await;
    let n2 = start_node(2, vec![]).await;
    let n3 = start_node(3, vec![]).await;
    let nodes = [&n1, &n2, &n3];
    for node in nodes {
        for other in nodes {
            if node.store.host_id() != other.store.host_id() {
                node.coordinator.add_peer(PeerConfig {
                    host_id: other.store.host_id().unwrap(),
                    address: other.repl_addr,
                });
            }
        }
    }

    connect(n1.client_addr)
        .await
        .insert("hello1", b"world1".to_vec())
        .await
        .unwrap();
    connect(n2.client_addr)
        .await
        .insert("hello2", b"world2".to_vec())
        .await
        .unwrap();
    connect(n3.client_addr)
        .await
        .insert("hello3", b"world3".to_vec())
        .await
        .unwrap();

    wait_until(|| nodes.iter().all(|n| n.store.len() == 3)).await;
    for node in nodes {
        assert_eq!(node.store.get("hello1"), Some(b"world1".to_vec()));
        assert_eq!(node.store.get("hello2"), Some(b"world2".to_vec()));
        assert_eq!(node.store.get("hello3"), Some(b"world3".to_vec()));
    }
}

#[tokio::test]
async fn test_client_write_on_one_node_read_on_the_other() {
    let (a, b) = start_pair().await;
    let map_a = connect(a.client_addr).await;
    let map_b = connect(b.client_addr).await;

    map_a.insert("k", b"hello".to_vec()).await.unwrap();
    wait_until(|| b.store.get("k").is_some()).await;
    assert_eq!(map_b.get("k").await.unwrap(), Some(b"hello".to_vec()));

    map_b.remove("k").await.unwrap();
    wait_until(|| a.store.get("k").is_none()).await;
    assert_eq!(map_a.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_writes_on_both_nodes_converge_to_union() {
    let (a, b) = start_pair().await;
    let map_a = connect(a.client_addr).await;
    let map_b = connect(b.client_addr).await;

    for i in 0..10 {
        map_a.insert(&format!("a{i}"), b"1".to_vec()).await.unwrap();
        map_b.insert(&format!("b{i}"), b"2".to_vec()).await.unwrap();
    }

    wait_until(|| a.store.len() == 20 && b.store.len() == 20).await;
    assert_eq!(a.store.entries(), b.store.entries());
}

#[tokio::test]
async fn test_remote_subscriber_sees_replicated_changes() {
    let (a, b) = start_pair().await;
    let map_a = connect(a.client_addr).await;
    let map_b = connect(b.client_addr).await;

    let mut subscription = map_b.subscribe(false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Written on node A, observed by a subscriber attached to node B.
    map_a.insert("replicated", b"v".to_vec()).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("event should arrive")
        .unwrap();
    assert!(matches!(
        event,
        ChangeEvent::Inserted { ref key, .. } if key == "replicated"
    ));
    subscription.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn test_late_joining_node_bootstraps_full_state() {
    let a = start_node(1, vec![]).await;
    let map_a = connect(a.client_addr).await;
    for i in 0..25 {
        map_a.insert(&format!("k{i}"), b"v".to_vec()).await.unwrap();
    }

    let b = start_node(
        2,
        vec![PeerConfig {
            host_id: 1,
            address: a.repl_addr,
        }],
    )
    .await;

    wait_until(|| b.store.len() == 25).await;
    let map_b = connect(b.client_addr).await;
    assert_eq!(map_b.len().await.unwrap(), 25);
}

#[tokio::test]
async fn test_bootstrap_subscriber_gets_batch_complete() {
    let a = start_node(1, vec![]).await;
    let map_a = connect(a.client_addr).await;
    map_a.insert("k", b"v".to_vec()).await.unwrap();

    // Bring node B up without replication first, so the subscription is in
    // place before the snapshot is pulled; both the snapshot entry and the
    // boundary must come through it.
    let ctx = NodeContext::new(Some(2));
    let store_b = KvStore::open(
        STORE,
        &ctx,
        StoreOptions {
            replicated: true,
            ..StoreOptions::default()
        },
    )
    .unwrap();
    let registry = StoreRegistry::new();
    registry.insert(Arc::clone(&store_b));
    let server = WireServer::new(registry);
    let client_addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let map_b = RemoteMap::new(Connection::connect(client_addr).await.unwrap(), STORE);
    let mut subscription = map_b.subscribe(true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let coordinator = ReplicationCoordinator::new(ReplicationConfig {
        enabled: true,
        host_id: 2,
        listen_address: Some("127.0.0.1:0".parse().unwrap()),
        peers: vec![PeerConfig {
            host_id: 1,
            address: a.repl_addr,
        }],
        reconnect_delay_ms: 100,
        ack_interval_ms: 50,
        heartbeat_interval_ms: 200,
        ..ReplicationConfig::default()
    })
    .unwrap();
    coordinator.register_store(Arc::clone(&store_b)).unwrap();
    coordinator.start().await.unwrap();

    let mut saw_insert = false;
    let mut saw_boundary = false;
    while !(saw_insert && saw_boundary) {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("event should arrive")
            .unwrap();
        match event {
            ChangeEvent::Inserted { ref key, .. } if key == "k" => saw_insert = true,
            ChangeEvent::BatchComplete { data_up_to_ms } => {
                assert!(data_up_to_ms > 0);
                saw_boundary = true;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_conflicting_writes_settle_on_one_winner() {
    let (a, b) = start_pair().await;
    let map_a = connect(a.client_addr).await;
    let map_b = connect(b.client_addr).await;

    map_a.insert("contested", b"from-a".to_vec()).await.unwrap();
    map_b.insert("contested", b"from-b".to_vec()).await.unwrap();

    wait_until(|| {
        let va = a.store.get("contested");
        let vb = b.store.get("contested");
        va.is_some() && va == vb
    })
    .await;
}

#[tokio::test]
async fn test_wal_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = NodeContext::new(Some(1));
    let opts = StoreOptions {
        engine: "wal".to_string(),
        data_dir: Some(dir.path().to_path_buf()),
        replicated: true,
        ..StoreOptions::default()
    };

    {
        let store = KvStore::open(STORE, &ctx, opts.clone()).unwrap();
        store.put("durable", b"v".to_vec()).unwrap();
        store.put("gone", b"x".to_vec()).unwrap();
        store.remove("gone").unwrap();
    }

    let store = KvStore::open(STORE, &ctx, opts).unwrap();
    assert_eq!(store.get("durable"), Some(b"v".to_vec()));
    assert_eq!(store.get("gone"), None);
    assert_eq!(store.len(), 1);
}
