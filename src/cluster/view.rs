//! Watch-driven reader of one cluster's state in the store.
//!
//! Both [`ClusterDiscovery`](super::ClusterDiscovery) and
//! [`ClusterRegistry`](super::ClusterRegistry) keep a [`ClusterView`] per
//! cluster. The view owns the watches on the cluster node (metadata and
//! member list) and a data watch on every member, and turns
//! [`WatchEvent`]s into an up-to-date node map. It is driven from a single
//! actor task, so it needs no locking.
//!
//! # Store Layout
//!
//! ```text
//! <root>/clusters/<cluster>            metadata: {"max_shards": N}
//! <root>/clusters/<cluster>/<id hex>   ephemeral NodeInfo of one member
//! ```

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::error::ClusterResult;
use super::store::{CoordinationStore, WatchEvent, WatchId, WatchSink, join_path, parent_path};
use super::topology::{ClusterMetadata, ClusterTopology, NodeId, NodeInfo, ShardResolver};
use crate::constants::CLUSTERS_SEGMENT;

/// Path of the cluster node for `cluster` under `root`.
pub fn cluster_path(root: &str, cluster: &str) -> String {
    join_path(&join_path(root, CLUSTERS_SEGMENT), cluster)
}

/// Path of a member's registration.
pub fn node_path(cluster_path: &str, node_id: NodeId) -> String {
    join_path(cluster_path, &format!("{:04x}", node_id))
}

fn parse_node_id(segment: &str) -> Option<NodeId> {
    NodeId::from_str_radix(segment, 16).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    info: NodeInfo,
    version: i32,
}

/// Cached view of one cluster.
#[derive(Debug)]
pub struct ClusterView {
    cluster_name: String,
    cluster_path: String,
    sink: WatchSink,
    metadata: Option<ClusterMetadata>,
    members: BTreeMap<NodeId, Member>,
    cluster_watches: Vec<WatchId>,
    member_watches: BTreeMap<NodeId, WatchId>,
}

impl ClusterView {
    /// A view whose watch events are delivered to `sink`.
    pub fn new(root: &str, cluster_name: &str, sink: WatchSink) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            cluster_path: cluster_path(root, cluster_name),
            sink,
            metadata: None,
            members: BTreeMap::new(),
            cluster_watches: Vec::new(),
            member_watches: BTreeMap::new(),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn cluster_path(&self) -> &str {
        &self.cluster_path
    }

    pub fn node_path(&self, node_id: NodeId) -> String {
        node_path(&self.cluster_path, node_id)
    }

    pub fn metadata(&self) -> Option<&ClusterMetadata> {
        self.metadata.as_ref()
    }

    pub fn max_shards(&self) -> Option<u32> {
        self.metadata.as_ref().map(|m| m.max_shards)
    }

    pub fn node(&self, node_id: NodeId) -> Option<&NodeInfo> {
        self.members.get(&node_id).map(|m| &m.info)
    }

    /// Store version of a member's registration, for version-checked writes.
    pub fn node_version(&self, node_id: NodeId) -> Option<i32> {
        self.members.get(&node_id).map(|m| m.version)
    }

    pub fn nodes(&self) -> BTreeMap<NodeId, NodeInfo> {
        self.members
            .iter()
            .map(|(id, m)| (*id, m.info.clone()))
            .collect()
    }

    /// Whether `path` belongs to this cluster.
    pub fn owns_path(&self, path: &str) -> bool {
        path == self.cluster_path || parent_path(path) == Some(self.cluster_path.as_str())
    }

    /// Unversioned topology of the current member set.
    pub fn topology(&self) -> ClusterTopology {
        let resolver = self
            .max_shards()
            .and_then(|max| ShardResolver::with_max_shards(max).ok());
        ClusterTopology::new(self.nodes(), resolver)
    }

    /// Register the cluster watches and load the current state.
    pub async fn start(&mut self, store: &dyn CoordinationStore) -> ClusterResult<()> {
        self.stop(store).await;
        self.cluster_watches.push(
            store
                .watch_data(&self.cluster_path, self.sink.clone())
                .await?,
        );
        self.cluster_watches.push(
            store
                .watch_children(&self.cluster_path, self.sink.clone())
                .await?,
        );
        self.refresh(store).await?;
        Ok(())
    }

    /// Remove every watch. Errors are logged; the view is left empty.
    pub async fn stop(&mut self, store: &dyn CoordinationStore) {
        let watches: Vec<WatchId> = self
            .cluster_watches
            .drain(..)
            .chain(std::mem::take(&mut self.member_watches).into_values())
            .collect();
        for id in watches {
            if let Err(e) = store.unwatch(id).await {
                debug!(cluster = %self.cluster_name, error = %e, "Failed to remove watch");
            }
        }
        self.members.clear();
        self.metadata = None;
    }

    /// Re-read metadata and every member. Returns true if anything changed.
    pub async fn refresh(&mut self, store: &dyn CoordinationStore) -> ClusterResult<bool> {
        let metadata = match store.read(&self.cluster_path).await? {
            Some((data, _)) => match ClusterMetadata::from_bytes(&data) {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    warn!(cluster = %self.cluster_name, error = %e, "Unreadable cluster metadata");
                    None
                }
            },
            None => None,
        };

        let ids: Vec<NodeId> = store
            .list_children(&self.cluster_path)
            .await?
            .unwrap_or_default()
            .iter()
            .filter_map(|child| parse_node_id(child))
            .collect();

        self.sync_member_watches(store, &ids).await?;

        let mut members = BTreeMap::new();
        if let Some(max_shards) = metadata.as_ref().map(|m| m.max_shards) {
            for id in ids {
                if let Some(member) = self.read_member(store, id, max_shards).await? {
                    members.insert(id, member);
                }
            }
        }

        let changed = metadata != self.metadata || members != self.members;
        self.metadata = metadata;
        self.members = members;
        Ok(changed)
    }

    /// Apply one watch event. Returns true if the view changed.
    pub async fn handle_event(
        &mut self,
        store: &dyn CoordinationStore,
        event: &WatchEvent,
    ) -> ClusterResult<bool> {
        let path = event.path();
        if path == self.cluster_path {
            return self.refresh(store).await;
        }

        let node_id = match path.rsplit('/').next().and_then(parse_node_id) {
            Some(id) if self.owns_path(path) => id,
            _ => return Ok(false),
        };
        let Some(max_shards) = self.max_shards() else {
            return self.refresh(store).await;
        };

        let member = self.read_member(store, node_id, max_shards).await?;
        let changed = self.members.get(&node_id) != member.as_ref();
        match member {
            Some(member) => {
                self.members.insert(node_id, member);
            }
            None => {
                self.members.remove(&node_id);
            }
        }
        debug!(
            cluster = %self.cluster_name,
            node_id,
            changed,
            "Member watch event applied"
        );
        Ok(changed)
    }

    async fn read_member(
        &self,
        store: &dyn CoordinationStore,
        node_id: NodeId,
        max_shards: u32,
    ) -> ClusterResult<Option<Member>> {
        let Some((data, stat)) = store.read(&self.node_path(node_id)).await? else {
            return Ok(None);
        };
        match NodeInfo::from_bytes(&data, max_shards) {
            Ok(info) => Ok(Some(Member {
                info,
                version: stat.version,
            })),
            Err(e) => {
                warn!(
                    cluster = %self.cluster_name,
                    node_id,
                    error = %e,
                    "Skipping unreadable member registration"
                );
                Ok(None)
            }
        }
    }

    async fn sync_member_watches(
        &mut self,
        store: &dyn CoordinationStore,
        ids: &[NodeId],
    ) -> ClusterResult<()> {
        let stale: Vec<NodeId> = self
            .member_watches
            .keys()
            .filter(|id| !ids.contains(id))
            .copied()
            .collect();
        for id in stale {
            if let Some(watch) = self.member_watches.remove(&id) {
                store.unwatch(watch).await?;
            }
        }

        for id in ids {
            if !self.member_watches.contains_key(id) {
                let watch = store
                    .watch_data(&self.node_path(*id), self.sink.clone())
                    .await?;
                self.member_watches.insert(*id, watch);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::store::memory::InMemoryStore;
    use crate::cluster::store::{CreateMode, ensure_path};
    use tokio::sync::mpsc;

    async fn setup_cluster(client: &dyn CoordinationStore, max_shards: u32) {
        ensure_path(client, "/discovery/clusters").await.unwrap();
        let meta = ClusterMetadata { max_shards }.to_bytes().unwrap();
        client
            .create("/discovery/clusters/orders", &meta, CreateMode::Persistent)
            .await
            .unwrap();
    }

    #[test]
    fn test_paths() {
        assert_eq!(cluster_path("/discovery", "orders"), "/discovery/clusters/orders");
        assert_eq!(
            node_path("/discovery/clusters/orders", 0x0108),
            "/discovery/clusters/orders/0108"
        );
        assert_eq!(parse_node_id("0108"), Some(0x0108));
        assert_eq!(parse_node_id("zz"), None);
    }

    #[tokio::test]
    async fn test_view_of_missing_cluster_is_empty() {
        let store = InMemoryStore::new();
        let client = store.connect();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut view = ClusterView::new("/discovery", "orders", tx);
        view.start(client.as_ref()).await.unwrap();

        let topology = view.topology();
        assert!(topology.is_empty());
        assert_eq!(topology.shard_resolver(), None);
    }

    #[tokio::test]
    async fn test_view_follows_members() {
        let store = InMemoryStore::new();
        let client = store.connect();
        setup_cluster(client.as_ref(), 4).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut view = ClusterView::new("/discovery", "orders", tx);
        view.start(client.as_ref()).await.unwrap();
        assert_eq!(view.max_shards(), Some(4));

        let info = NodeInfo::new(100, 4);
        client
            .create(
                "/discovery/clusters/orders/0008",
                &info.to_bytes().unwrap(),
                CreateMode::Ephemeral,
            )
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(view.handle_event(client.as_ref(), &event).await.unwrap());
        assert_eq!(view.node(8), Some(&info));
        assert_eq!(view.topology().leader_node_id(), Some(8));

        let updated = info.with_started(&crate::cluster::topology::ShardSet::full(4));
        client
            .set_data("/discovery/clusters/orders/0008", &updated.to_bytes().unwrap(), None)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event, WatchEvent::DataChanged { path: "/discovery/clusters/orders/0008".into() });
        assert!(view.handle_event(client.as_ref(), &event).await.unwrap());
        assert_eq!(view.node(8).unwrap().shards().len(), 4);
        assert_eq!(view.node_version(8), Some(1));
    }

    #[tokio::test]
    async fn test_stop_removes_watches() {
        let store = InMemoryStore::new();
        let client = store.connect();
        setup_cluster(client.as_ref(), 4).await;
        client
            .create(
                "/discovery/clusters/orders/0008",
                &NodeInfo::new(1, 4).to_bytes().unwrap(),
                CreateMode::Ephemeral,
            )
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut view = ClusterView::new("/discovery", "orders", tx);
        view.start(client.as_ref()).await.unwrap();
        assert_eq!(store.watch_count().await, 3);

        view.stop(client.as_ref()).await;
        assert_eq!(store.watch_count().await, 0);
        assert!(view.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_events_are_ignored() {
        let store = InMemoryStore::new();
        let client = store.connect();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut view = ClusterView::new("/discovery", "orders", tx);

        let event = WatchEvent::DataChanged {
            path: "/discovery/clusters/payments/0008".into(),
        };
        assert!(!view.handle_event(client.as_ref(), &event).await.unwrap());
    }
}
