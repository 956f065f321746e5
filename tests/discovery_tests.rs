//! Discovery following registries of a live cluster.

use shardherd::cluster::store::memory::InMemoryStore;
use shardherd::cluster::{
    ClusterConfig, ClusterDiscovery, ClusterRegistry, ClusterTopology, ListenerResult,
    NodeId, NodeIdAllocator, RecordingFatalHandler, TopologyListener,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ROOT: &str = "/discovery";
const WAIT: Duration = Duration::from_secs(5);

/// (version, node count, leader) of every snapshot delivered.
type Seen = Arc<Mutex<Vec<(u64, usize, Option<NodeId>)>>>;

fn recorder() -> (Seen, Arc<dyn TopologyListener>) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: Arc<dyn TopologyListener> = Arc::new(move |t: &ClusterTopology| -> ListenerResult {
        sink.lock()
            .unwrap()
            .push((t.version(), t.len(), t.leader_node_id()));
        Ok(())
    });
    (seen, listener)
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn join(store: &InMemoryStore, cluster: &str) -> ClusterRegistry {
    let session = store.connect();
    let fatal = RecordingFatalHandler::new();
    let allocator = Arc::new(
        NodeIdAllocator::new(session.clone(), ROOT)
            .unwrap()
            .with_fatal_handler(fatal.clone()),
    );
    ClusterRegistry::builder(
        ClusterConfig::new(cluster).with_root_path(ROOT).with_max_shards(8),
        session,
        allocator,
    )
    .fatal_handler(fatal)
    .start()
    .await
    .unwrap()
}

#[tokio::test]
async fn test_discovery_tracks_membership_and_leader() {
    let store = InMemoryStore::new();
    let discovery = ClusterDiscovery::start(store.connect(), ROOT).unwrap();

    let (seen, listener) = recorder();
    discovery
        .add_topology_listener("orders", listener)
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap()[0], (1, 0, None));

    let a = join(&store, "orders").await;
    let b = join(&store, "orders").await;

    assert!(
        eventually(|| {
            discovery
                .topology("orders")
                .map(|t| t.len() == 2 && t.unassigned_shards().map(|u| u.is_empty()).unwrap_or(false))
                .unwrap_or(false)
        })
        .await
    );
    let topology = discovery.topology("orders").unwrap();
    assert_eq!(topology.leader_node_id(), Some(a.node_id()));
    assert!(topology.contains(b.node_id()));

    a.shutdown().await;
    assert!(
        eventually(|| {
            discovery
                .topology("orders")
                .map(|t| t.len() == 1 && t.leader_node_id() == Some(b.node_id()))
                .unwrap_or(false)
        })
        .await
    );

    let versions: Vec<u64> = seen.lock().unwrap().iter().map(|(v, _, _)| *v).collect();
    assert!(versions.windows(2).all(|w| w[0] < w[1]), "{versions:?}");

    b.shutdown().await;
    discovery.shutdown().await;
}

#[tokio::test]
async fn test_discovery_keeps_clusters_apart() {
    let store = InMemoryStore::new();
    let discovery = ClusterDiscovery::start(store.connect(), ROOT).unwrap();

    let (orders_seen, orders) = recorder();
    let (billing_seen, billing) = recorder();
    discovery.add_topology_listener("orders", orders).await.unwrap();
    let billing_id = discovery
        .add_topology_listener("billing", billing)
        .await
        .unwrap();

    let node = join(&store, "orders").await;
    assert!(eventually(|| orders_seen.lock().unwrap().iter().any(|(_, n, _)| *n == 1)).await);

    assert!(billing_seen.lock().unwrap().iter().all(|(_, n, _)| *n == 0));
    assert!(discovery.remove_topology_listener("billing", billing_id).await.unwrap());

    let mut clusters = discovery.clusters();
    clusters.sort();
    assert_eq!(clusters, vec!["orders".to_string()]);

    node.shutdown().await;
    discovery.shutdown().await;
}

#[tokio::test]
async fn test_discovery_resyncs_after_reconnect() {
    let store = InMemoryStore::new();
    let session = store.connect();
    let discovery = ClusterDiscovery::start(session.clone(), ROOT).unwrap();

    let (_, listener) = recorder();
    discovery.add_topology_listener("orders", listener).await.unwrap();

    session.simulate_disconnect();
    let node = join(&store, "orders").await;
    session.simulate_reconnect();

    assert!(
        eventually(|| {
            discovery
                .topology("orders")
                .map(|t| t.contains(node.node_id()))
                .unwrap_or(false)
        })
        .await
    );

    node.shutdown().await;
    discovery.shutdown().await;
}
