//! Read-only cluster discovery.
//!
//! [`ClusterDiscovery`] lets any number of call sites follow the topology of
//! any number of clusters. The first listener for a cluster sets up its store
//! watches; removing the last one tears them down.
//!
//! # Architecture
//!
//! One actor task per `ClusterDiscovery` serializes everything: listener
//! adds and removes, watch events of every followed cluster, and connection
//! changes. Listeners are invoked from that task, so a listener never sees
//! snapshots out of order.
//!
//! ```text
//!  add/remove listener ──┐
//!  store watch events ───┼──▶ discovery actor ──▶ listeners (per cluster)
//!  connection changes ───┘          │
//!                                   └──▶ latest snapshot per cluster (DashMap)
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use shardherd::cluster::{ClusterDiscovery, ClusterTopology, ListenerResult};
//! use shardherd::cluster::store::memory::InMemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! let discovery = ClusterDiscovery::start(store.connect(), "/discovery")?;
//!
//! let id = discovery
//!     .add_topology_listener("orders", Arc::new(|t: &ClusterTopology| -> ListenerResult {
//!         println!("leader: {:?}", t.leader_node_id());
//!         Ok(())
//!     }))
//!     .await?;
//!
//! discovery.remove_topology_listener("orders", id).await?;
//! discovery.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::background_tasks::BackgroundTaskRegistry;
use super::error::{ClusterError, ClusterResult};
use super::listeners::{ListenerId, ListenerSet, TopologyListener, invoke};
use super::store::{ConnectionState, CoordinationStore, WatchEvent, join_path};
use super::topology::ClusterTopology;
use super::validation::{validate_cluster_name, validate_root_path};
use super::view::ClusterView;
use crate::constants::CLUSTERS_SEGMENT;

const LISTENER_KIND: &str = "topology";

enum Command {
    AddListener {
        cluster: String,
        id: ListenerId,
        listener: Arc<dyn TopologyListener>,
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    RemoveListener {
        cluster: String,
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Followed cluster state, owned by the actor.
struct FollowedCluster {
    view: ClusterView,
    listeners: ListenerSet<dyn TopologyListener>,
    version: u64,
    current: Arc<ClusterTopology>,
}

/// Follows cluster topologies in the store and republishes them.
pub struct ClusterDiscovery {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: Arc<DashMap<String, Arc<ClusterTopology>>>,
    tasks: Mutex<BackgroundTaskRegistry>,
}

impl fmt::Debug for ClusterDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterDiscovery")
            .field("clusters", &self.snapshots.len())
            .finish()
    }
}

impl ClusterDiscovery {
    /// Start the discovery actor. Must be called within a tokio runtime.
    pub fn start(store: Arc<dyn CoordinationStore>, root: impl Into<String>) -> ClusterResult<Self> {
        let root = root.into();
        validate_root_path(&root)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let snapshots = Arc::new(DashMap::new());

        let actor = DiscoveryActor {
            connection: store.connection_events(),
            connection_open: true,
            store,
            clusters_path: join_path(&root, CLUSTERS_SEGMENT),
            root,
            events_tx,
            clusters: HashMap::new(),
            snapshots: snapshots.clone(),
        };

        let mut tasks = BackgroundTaskRegistry::new();
        tasks.spawn("discovery-actor", actor.run(command_rx, events_rx));

        Ok(Self {
            commands,
            snapshots,
            tasks: Mutex::new(tasks),
        })
    }

    /// Follow `cluster`. The listener receives the current snapshot before
    /// this returns, then every subsequent change.
    pub async fn add_topology_listener(
        &self,
        cluster: &str,
        listener: Arc<dyn TopologyListener>,
    ) -> ClusterResult<ListenerId> {
        validate_cluster_name(cluster)?;
        let id = ListenerId::next();
        let (reply, rx) = oneshot::channel();
        self.send(Command::AddListener {
            cluster: cluster.to_string(),
            id,
            listener,
            reply,
        })?;
        rx.await.map_err(|_| ClusterError::ShuttingDown)??;
        Ok(id)
    }

    /// Stop delivering to listener `id`. Returns false if it was not registered.
    pub async fn remove_topology_listener(&self, cluster: &str, id: ListenerId) -> ClusterResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoveListener {
            cluster: cluster.to_string(),
            id,
            reply,
        })?;
        rx.await.map_err(|_| ClusterError::ShuttingDown)
    }

    /// Last snapshot published for `cluster`, if it is being followed.
    pub fn topology(&self, cluster: &str) -> Option<Arc<ClusterTopology>> {
        self.snapshots.get(cluster).map(|t| t.clone())
    }

    /// Names of followed clusters.
    pub fn clusters(&self) -> Vec<String> {
        self.snapshots.iter().map(|e| e.key().clone()).collect()
    }

    /// Tear down every watch and stop the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        self.tasks.lock().await.shutdown_all().await;
    }

    fn send(&self, command: Command) -> ClusterResult<()> {
        self.commands
            .send(command)
            .map_err(|_| ClusterError::ShuttingDown)
    }
}

struct DiscoveryActor {
    store: Arc<dyn CoordinationStore>,
    root: String,
    clusters_path: String,
    connection: broadcast::Receiver<ConnectionState>,
    connection_open: bool,
    events_tx: mpsc::UnboundedSender<WatchEvent>,
    clusters: HashMap<String, FollowedCluster>,
    snapshots: Arc<DashMap<String, Arc<ClusterTopology>>>,
}

impl DiscoveryActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
    ) {
        info!(root = %self.root, "Cluster discovery started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                change = self.connection.recv(), if self.connection_open => match change {
                    Ok(ConnectionState::Reconnected) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.resync().await;
                    }
                    Ok(state) => debug!(state = %state, "Discovery observed connection change"),
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Connection events closed");
                        self.connection_open = false;
                    }
                },
            }
        }
        info!(root = %self.root, "Cluster discovery stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddListener {
                cluster,
                id,
                listener,
                reply,
            } => {
                let result = self.add_listener(&cluster, id, listener).await;
                let _ = reply.send(result);
            }
            Command::RemoveListener { cluster, id, reply } => {
                let removed = self.remove_listener(&cluster, id).await;
                let _ = reply.send(removed);
            }
            Command::Shutdown { .. } => {}
        }
    }

    async fn add_listener(
        &mut self,
        cluster: &str,
        id: ListenerId,
        listener: Arc<dyn TopologyListener>,
    ) -> ClusterResult<()> {
        if !self.clusters.contains_key(cluster) {
            let mut view = ClusterView::new(&self.root, cluster, self.events_tx.clone());
            if let Err(e) = view.start(self.store.as_ref()).await {
                view.stop(self.store.as_ref()).await;
                return Err(e);
            }
            let current = Arc::new(view.topology().with_version(1));
            self.snapshots.insert(cluster.to_string(), current.clone());
            self.clusters.insert(
                cluster.to_string(),
                FollowedCluster {
                    view,
                    listeners: ListenerSet::new(),
                    version: 1,
                    current,
                },
            );
            info!(cluster, "Following cluster");
        }

        let Some(followed) = self.clusters.get_mut(cluster) else {
            return Err(ClusterError::ShuttingDown);
        };
        let current = followed.current.clone();
        invoke(LISTENER_KIND, id, || listener.on_topology(&current));
        followed.listeners.insert(id, listener);
        debug!(cluster, listener = ?id, listeners = followed.listeners.len(), "Topology listener added");
        Ok(())
    }

    async fn remove_listener(&mut self, cluster: &str, id: ListenerId) -> bool {
        let Some(followed) = self.clusters.get_mut(cluster) else {
            return false;
        };
        if !followed.listeners.remove(id) {
            return false;
        }

        if followed.listeners.is_empty() {
            if let Some(mut followed) = self.clusters.remove(cluster) {
                followed.view.stop(self.store.as_ref()).await;
            }
            self.snapshots.remove(cluster);
            info!(cluster, "Stopped following cluster");
        }
        true
    }

    /// Map a watch event to the followed cluster it belongs to.
    fn cluster_of(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix(&self.clusters_path)?.strip_prefix('/')?;
        rest.split('/').next().map(str::to_string)
    }

    async fn handle_event(&mut self, event: WatchEvent) {
        let Some(cluster) = self.cluster_of(event.path()) else {
            debug!(path = event.path(), "Ignoring event outside followed clusters");
            return;
        };
        let Some(followed) = self.clusters.get_mut(&cluster) else {
            return;
        };

        match followed.view.handle_event(self.store.as_ref(), &event).await {
            Ok(true) => Self::publish(&cluster, followed, &self.snapshots),
            Ok(false) => {}
            Err(e) => warn!(cluster = %cluster, error = %e, "Failed to apply watch event"),
        }
    }

    /// Re-read every followed cluster after reconnecting.
    async fn resync(&mut self) {
        for (cluster, followed) in self.clusters.iter_mut() {
            match followed.view.refresh(self.store.as_ref()).await {
                Ok(true) => Self::publish(cluster, followed, &self.snapshots),
                Ok(false) => {}
                Err(e) => warn!(cluster = %cluster, error = %e, "Failed to resync cluster"),
            }
        }
    }

    fn publish(
        cluster: &str,
        followed: &mut FollowedCluster,
        snapshots: &DashMap<String, Arc<ClusterTopology>>,
    ) {
        let next = followed.view.topology().with_version(followed.version);
        if next == *followed.current {
            return;
        }

        followed.version += 1;
        let snapshot = Arc::new(next.with_version(followed.version));
        followed.current = snapshot.clone();
        snapshots.insert(cluster.to_string(), snapshot.clone());

        debug!(
            cluster,
            version = snapshot.version(),
            nodes = snapshot.len(),
            leader = ?snapshot.leader_node_id(),
            "Publishing topology"
        );
        followed
            .listeners
            .notify(LISTENER_KIND, |l| l.on_topology(&snapshot));
    }

    async fn teardown(&mut self) {
        for (_, mut followed) in self.clusters.drain() {
            followed.view.stop(self.store.as_ref()).await;
        }
        self.snapshots.clear();
    }
}
