//! Cluster membership, leadership and shard ownership for one node.
//!
//! [`ClusterRegistry`] registers this node under its cluster, keeps a live
//! view of the other members, and, while it is the leader, moves shards
//! between members with the configured [`ShardAllocationStrategy`].
//!
//! # Architecture
//!
//! ```text
//!  public API ──commands──┐
//!  member watch events ───┼──▶ registry actor ──▶ leadership / shards listeners
//!  connection changes ────┘        │    │
//!                                  │    └──▶ RegistrySnapshot (watch channel)
//!                                  └──▶ version-checked store writes (leader)
//! ```
//!
//! All mutation happens on the actor task. Readers never block it: they read
//! the last [`RegistrySnapshot`] from a `tokio::sync::watch` channel.
//!
//! Shards move in two steps. The leader first moves a shard from its owner's
//! active set to its stopping set while adding it to the new owner's active
//! set, in one transaction. The old owner drains and acknowledges with
//! [`ClusterRegistry::shards_stopped`], after which the leader clears the
//! stopping entry. A shard is therefore never active on two nodes.
//!
//! # Usage
//!
//! ```rust,no_run
//! use shardherd::cluster::{ClusterConfig, ClusterRegistry, NodeIdAllocator};
//! use shardherd::cluster::store::memory::InMemoryStore;
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! let session = store.connect();
//! let allocator = Arc::new(NodeIdAllocator::new(session.clone(), "/discovery")?);
//!
//! let registry = ClusterRegistry::builder(ClusterConfig::new("orders"), session, allocator)
//!     .start()
//!     .await?;
//!
//! let reply = registry.route("lookup", 42, None, Bytes::from_static(b"ping")).await?;
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBackoff};
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::allocation::{EvenShardAllocationStrategy, ShardAllocationStrategy};
use super::background_tasks::BackgroundTaskRegistry;
use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult, StoreError};
use super::fatal::{SharedFatalHandler, default_handler};
use super::listeners::{LeadershipListener, ListenerId, ListenerSet, ShardsListener, invoke};
use super::metrics;
use super::retry;
use super::routing::{
    BroadcastMessage, ClusterTransport, HandlerRegistry, InboundDispatch, LocalOnlyTransport,
    RoutedRequest,
};
use super::sequence::{NodeIdAllocator, Sequence};
use super::store::{
    ClaimOutcome, ConnectionState, CoordinationStore, CreateMode, SessionId, StoreOp, WatchEvent,
    claim_ephemeral, ensure_path, join_path,
};
use super::topology::{ClusterMetadata, ClusterTopology, NodeId, NodeInfo, ShardId, ShardSet};
use super::view::ClusterView;
use crate::constants::{CLUSTERS_SEGMENT, SHARDS_STOPPED_HANDLER};

/// Publish/rebalance rounds per actor step before giving up until the next event.
const MAX_SETTLE_ROUNDS: usize = 8;

/// Version-conflict retries for one leader write.
const LEADER_WRITE_ATTEMPTS: usize = 5;

/// Timer task that posts the next re-registration attempt to the actor.
const REGISTRATION_RETRY_TASK: &str = "registration-retry";

const LEADERSHIP_KIND: &str = "leadership";
const SHARDS_KIND: &str = "shards";

/// Registration lifecycle of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Deregistering,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
            RegistrationState::Deregistering => "deregistering",
        };
        f.write_str(name)
    }
}

/// What the registry last published.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub state: RegistrationState,
    pub node_id: NodeId,
    pub topology: Arc<ClusterTopology>,
    /// This node's registration as last read from the store.
    pub local: Option<NodeInfo>,
    pub is_leader: bool,
}

impl RegistrySnapshot {
    fn initial(node_id: NodeId) -> Self {
        Self {
            state: RegistrationState::Unregistered,
            node_id,
            topology: Arc::new(ClusterTopology::empty(None)),
            local: None,
            is_leader: false,
        }
    }

    /// True if `shard` is in the local active set.
    pub fn owns(&self, shard: ShardId) -> bool {
        self.local
            .as_ref()
            .map(|local| local.shards().contains(shard))
            .unwrap_or(false)
    }
}

/// Payload of the built-in stop acknowledgement forwarded to the leader.
#[derive(Debug, Serialize, Deserialize)]
struct ShardsStoppedMessage {
    node_id: NodeId,
    shards: Vec<ShardId>,
}

enum Command {
    Register {
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    Deregister {
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    ShardsStopped {
        node_id: NodeId,
        shards: Vec<ShardId>,
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    AddLeadershipListener {
        id: ListenerId,
        listener: Arc<dyn LeadershipListener>,
        reply: oneshot::Sender<()>,
    },
    RemoveLeadershipListener {
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    AddShardsListener {
        id: ListenerId,
        listener: Arc<dyn ShardsListener>,
        reply: oneshot::Sender<()>,
    },
    RemoveShardsListener {
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    /// Posted by the retry timer; stale generations are ignored.
    RetryRegistration {
        generation: u64,
    },
}

/// Builder for [`ClusterRegistry`].
pub struct ClusterRegistryBuilder {
    config: ClusterConfig,
    store: Arc<dyn CoordinationStore>,
    allocator: Arc<NodeIdAllocator>,
    transport: Option<Arc<dyn ClusterTransport>>,
    handlers: HandlerRegistry,
    strategy: Option<Arc<dyn ShardAllocationStrategy>>,
    fatal: Option<SharedFatalHandler>,
}

impl ClusterRegistryBuilder {
    /// Transport for requests to other nodes. Defaults to [`LocalOnlyTransport`].
    pub fn transport(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Strategy used while this node leads. Defaults to [`EvenShardAllocationStrategy`].
    pub fn strategy(mut self, strategy: Arc<dyn ShardAllocationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn fatal_handler(mut self, handler: SharedFatalHandler) -> Self {
        self.fatal = Some(handler);
        self
    }

    /// Acquire a node id, register, and start following the cluster.
    ///
    /// Returns once the first registration attempt has settled.
    pub async fn start(self) -> ClusterResult<ClusterRegistry> {
        self.config
            .validate()
            .map_err(|errors| ClusterError::Config(errors.join("; ")))?;

        let sequence = self.allocator.acquire(&self.config.sequence_name).await?;
        let node_id = sequence.node_id();
        let cluster = self.config.cluster_name.clone();

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalOnlyTransport));
        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(EvenShardAllocationStrategy::new()));
        let fatal = self.fatal.unwrap_or_else(default_handler);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(RegistrySnapshot::initial(node_id));

        let actor = RegistryActor {
            cluster: cluster.clone(),
            node_id,
            self_commands: commands.downgrade(),
            timers: BackgroundTaskRegistry::new(),
            retry_backoff: None,
            retry_generation: 0,
            config: self.config.clone(),
            connection: self.store.connection_events(),
            connection_open: true,
            view: ClusterView::new(&self.config.root_path, &cluster, events_tx),
            store: self.store,
            strategy,
            transport: transport.clone(),
            fatal,
            snapshots: snapshot_tx,
            state: RegistrationState::Unregistered,
            desired: false,
            is_leader: false,
            local: None,
            topology: Arc::new(ClusterTopology::empty(None)),
            version: 0,
            claimed_session: None,
            known_sessions: Vec::new(),
            leadership_listeners: ListenerSet::new(),
            shards_listeners: ListenerSet::new(),
        };

        let mut tasks = BackgroundTaskRegistry::new();
        tasks.spawn(
            format!("registry-actor:{}", cluster),
            actor.run(command_rx, events_rx),
        );

        let registry = ClusterRegistry {
            inner: Arc::new(Inner {
                config: self.config,
                node_id,
                sequence,
                commands,
                snapshots: snapshot_rx,
                handlers: self.handlers,
                transport: transport.clone(),
                tasks: Mutex::new(tasks),
            }),
        };

        transport.bind(
            &cluster,
            node_id,
            Arc::new(RegistryEndpoint {
                inner: Arc::downgrade(&registry.inner),
            }),
        );

        if let Err(e) = registry.register().await {
            error!(cluster = %cluster, node_id, error = %e, "Initial registration failed");
            registry.shutdown().await;
            return Err(e);
        }

        info!(cluster = %cluster, node_id, "Cluster registry started");
        Ok(registry)
    }
}

struct Inner {
    config: ClusterConfig,
    node_id: NodeId,
    sequence: Arc<Sequence>,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<RegistrySnapshot>,
    handlers: HandlerRegistry,
    transport: Arc<dyn ClusterTransport>,
    tasks: Mutex<BackgroundTaskRegistry>,
}

/// Handle to a node's membership in one cluster. Cheap to clone.
#[derive(Clone)]
pub struct ClusterRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.inner.snapshots.borrow();
        f.debug_struct("ClusterRegistry")
            .field("cluster", &self.inner.config.cluster_name)
            .field("node_id", &self.inner.node_id)
            .field("state", &snapshot.state)
            .field("is_leader", &snapshot.is_leader)
            .finish()
    }
}

impl ClusterRegistry {
    pub fn builder(
        config: ClusterConfig,
        store: Arc<dyn CoordinationStore>,
        allocator: Arc<NodeIdAllocator>,
    ) -> ClusterRegistryBuilder {
        ClusterRegistryBuilder {
            config,
            store,
            allocator,
            transport: None,
            handlers: HandlerRegistry::new(),
            strategy: None,
            fatal: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn cluster_name(&self) -> &str {
        &self.inner.config.cluster_name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// The node-id reservation backing this registry.
    pub fn sequence(&self) -> &Arc<Sequence> {
        &self.inner.sequence
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn state(&self) -> RegistrationState {
        self.inner.snapshots.borrow().state
    }

    pub fn is_leader(&self) -> bool {
        self.inner.snapshots.borrow().is_leader
    }

    pub fn topology(&self) -> Arc<ClusterTopology> {
        self.inner.snapshots.borrow().topology.clone()
    }

    /// Local registration as last read from the store.
    pub fn node_info(&self) -> Option<NodeInfo> {
        self.inner.snapshots.borrow().local.clone()
    }

    /// Receive every snapshot the registry publishes.
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.inner.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    ///
    /// Returns `None` on timeout or if the registry stopped.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Option<RegistrySnapshot>
    where
        F: FnMut(&RegistrySnapshot) -> bool,
    {
        let mut rx = self.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => Some(snapshot.clone()),
            _ => None,
        }
    }

    /// (Re-)register this node. Idempotent while registered.
    pub async fn register(&self) -> ClusterResult<()> {
        self.call(|reply| Command::Register { reply }).await?
    }

    /// Remove this node's registration. Shards it owned are released for the
    /// next leader pass; reconnects no longer re-register.
    pub async fn deregister(&self) -> ClusterResult<()> {
        self.call(|reply| Command::Deregister { reply }).await?
    }

    /// Add a leadership listener. It is told immediately if this node leads.
    pub async fn add_leadership_listener(
        &self,
        listener: Arc<dyn LeadershipListener>,
    ) -> ClusterResult<ListenerId> {
        let id = ListenerId::next();
        self.call(|reply| Command::AddLeadershipListener { id, listener, reply })
            .await?;
        Ok(id)
    }

    pub async fn remove_leadership_listener(&self, id: ListenerId) -> ClusterResult<bool> {
        self.call(|reply| Command::RemoveLeadershipListener { id, reply })
            .await
    }

    /// Add a shards listener. It is told immediately about the current
    /// active and stopping sets.
    ///
    /// While at least one shards listener is registered, stops are only
    /// acknowledged through [`shards_stopped`](Self::shards_stopped).
    pub async fn add_shards_listener(
        &self,
        listener: Arc<dyn ShardsListener>,
    ) -> ClusterResult<ListenerId> {
        let id = ListenerId::next();
        self.call(|reply| Command::AddShardsListener { id, listener, reply })
            .await?;
        Ok(id)
    }

    pub async fn remove_shards_listener(&self, id: ListenerId) -> ClusterResult<bool> {
        self.call(|reply| Command::RemoveShardsListener { id, reply })
            .await
    }

    /// Run `op` only if `shard` is currently active on this node.
    pub async fn for_shard<F, Fut, T>(&self, shard: ShardId, op: F) -> ClusterResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.inner.snapshots.borrow().owns(shard) {
            return Err(ClusterError::ShardNotLocal {
                shard,
                node_id: self.inner.node_id,
            });
        }
        Ok(op().await)
    }

    /// Send `payload` to `handler` on the node owning the shard of `id`.
    pub async fn route(
        &self,
        handler: &str,
        id: i64,
        key: Option<&str>,
        payload: Bytes,
    ) -> ClusterResult<Bytes> {
        let topology = self.topology();
        let shard = topology.shard_for(id).ok_or(ClusterError::NotRegistered)?;
        let owner = topology
            .owner_of(shard)
            .ok_or(ClusterError::ShardUnassigned(shard))?;

        let request = RoutedRequest {
            cluster: self.inner.config.cluster_name.clone(),
            handler: handler.to_string(),
            source: self.inner.node_id,
            shard: Some(shard),
            id: Some(id),
            key: key.map(str::to_string),
            payload,
        };
        self.send_request(owner, request).await
    }

    /// Deliver `payload` to `handler` on every other member.
    ///
    /// Returns the number of nodes that accepted it. Unreachable nodes are
    /// skipped.
    pub async fn broadcast(&self, handler: &str, payload: Bytes) -> usize {
        let topology = self.topology();
        let message = BroadcastMessage {
            cluster: self.inner.config.cluster_name.clone(),
            handler: handler.to_string(),
            source: self.inner.node_id,
            payload,
        };

        let sends = topology
            .nodes()
            .keys()
            .filter(|&&id| id != self.inner.node_id)
            .map(|&target| {
                let message = message.clone();
                async move { (target, self.inner.transport.notify(target, message).await) }
            });

        let mut delivered = 0;
        for (target, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(
                        cluster = %self.inner.config.cluster_name,
                        target,
                        handler,
                        error = %e,
                        "Broadcast not delivered"
                    );
                }
            }
        }
        delivered
    }

    /// Acknowledge that this node finished draining `shards`.
    ///
    /// Goes to the leader, which clears them from this node's stopping set.
    /// Shards not currently stopping here are ignored.
    pub async fn shards_stopped(&self, shards: &ShardSet) -> ClusterResult<()> {
        let node_id = self.inner.node_id;
        let leader = self
            .topology()
            .leader_node_id()
            .ok_or(ClusterError::NotRegistered)?;

        if leader == node_id {
            return self
                .call(|reply| Command::ShardsStopped {
                    node_id,
                    shards: shards.to_vec(),
                    reply,
                })
                .await?;
        }

        let payload = serde_json::to_vec(&ShardsStoppedMessage {
            node_id,
            shards: shards.to_vec(),
        })?;
        let request = RoutedRequest {
            cluster: self.inner.config.cluster_name.clone(),
            handler: SHARDS_STOPPED_HANDLER.to_string(),
            source: node_id,
            shard: None,
            id: None,
            key: None,
            payload: Bytes::from(payload),
        };
        self.send_request(leader, request).await.map(|_| ())
    }

    /// Deregister, stop the actor and release the transport endpoint.
    ///
    /// The node-id reservation is kept; release it through the allocator.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        self.inner
            .transport
            .unbind(&self.inner.config.cluster_name, self.inner.node_id);
        self.inner.tasks.lock().await.shutdown_all().await;
    }

    async fn send_request(&self, target: NodeId, request: RoutedRequest) -> ClusterResult<Bytes> {
        let cluster = self.inner.config.cluster_name.clone();
        let timeout = self.inner.config.route_timeout;
        let handler = request.handler.clone();
        let local = target == self.inner.node_id;
        let destination = if local { "local" } else { "remote" };
        let started = Instant::now();

        let outcome = if local {
            tokio::time::timeout(timeout, self.handle_request(request)).await
        } else {
            tokio::time::timeout(timeout, self.inner.transport.request(target, request)).await
        };

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(ClusterError::RouteTimeout {
                node_id: target,
                handler: handler.clone(),
                timeout,
            }),
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.as_metric_label(),
        };
        metrics::record_route(&cluster, destination, status, started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(cluster = %cluster, target, handler = %handler, error = %e, "Routed request failed");
        }
        result
    }

    async fn handle_request(&self, request: RoutedRequest) -> ClusterResult<Bytes> {
        if request.handler == SHARDS_STOPPED_HANDLER {
            let message: ShardsStoppedMessage = serde_json::from_slice(&request.payload)?;
            self.call(|reply| Command::ShardsStopped {
                node_id: message.node_id,
                shards: message.shards,
                reply,
            })
            .await??;
            return Ok(Bytes::new());
        }

        let handler = self
            .inner
            .handlers
            .get(&request.handler)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownHandler(request.handler.clone()))?;
        let ctx = request.context(self.inner.node_id);

        match request.shard {
            Some(shard) => {
                self.for_shard(shard, || handler.handle(ctx, request.payload))
                    .await?
            }
            None => handler.handle(ctx, request.payload).await,
        }
    }

    async fn handle_message(&self, message: BroadcastMessage) -> ClusterResult<()> {
        let ctx = message.context(self.inner.node_id);
        self.inner
            .handlers
            .dispatch(&message.handler, ctx, message.payload)
            .await
            .map(|_| ())
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> ClusterResult<T> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(make(reply))
            .map_err(|_| ClusterError::ShuttingDown)?;
        rx.await.map_err(|_| ClusterError::ShuttingDown)
    }
}

/// Transport-facing endpoint. Holds the registry weakly so a bound endpoint
/// does not keep a dropped registry alive.
struct RegistryEndpoint {
    inner: Weak<Inner>,
}

impl RegistryEndpoint {
    fn registry(&self) -> ClusterResult<ClusterRegistry> {
        self.inner
            .upgrade()
            .map(|inner| ClusterRegistry { inner })
            .ok_or(ClusterError::ShuttingDown)
    }
}

#[async_trait::async_trait]
impl InboundDispatch for RegistryEndpoint {
    async fn on_request(&self, request: RoutedRequest) -> ClusterResult<Bytes> {
        self.registry()?.handle_request(request).await
    }

    async fn on_message(&self, message: BroadcastMessage) -> ClusterResult<()> {
        self.registry()?.handle_message(message).await
    }
}

struct RegistryActor {
    cluster: String,
    node_id: NodeId,
    /// Weak so that dropping every handle still closes the command channel.
    self_commands: mpsc::WeakUnboundedSender<Command>,
    timers: BackgroundTaskRegistry,
    /// Remaining re-registration delays while a retry cycle is active.
    retry_backoff: Option<ExponentialBackoff>,
    retry_generation: u64,
    config: ClusterConfig,
    store: Arc<dyn CoordinationStore>,
    view: ClusterView,
    strategy: Arc<dyn ShardAllocationStrategy>,
    transport: Arc<dyn ClusterTransport>,
    fatal: SharedFatalHandler,
    connection: broadcast::Receiver<ConnectionState>,
    connection_open: bool,
    snapshots: watch::Sender<RegistrySnapshot>,
    state: RegistrationState,
    /// Whether the node should be registered (cleared by deregister/shutdown).
    desired: bool,
    is_leader: bool,
    local: Option<NodeInfo>,
    topology: Arc<ClusterTopology>,
    version: u64,
    claimed_session: Option<SessionId>,
    /// Sessions this process has registered under.
    known_sessions: Vec<SessionId>,
    leadership_listeners: ListenerSet<dyn LeadershipListener>,
    shards_listeners: ListenerSet<dyn ShardsListener>,
}

impl RegistryActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_watch_event(event).await,
                change = self.connection.recv(), if self.connection_open => {
                    self.on_connection_change(change).await;
                }
            }
        }
        debug!(cluster = %self.cluster, node_id = self.node_id, "Registry actor stopped");
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Register { reply } => {
                let result = self.register().await;
                if result.is_ok() {
                    self.cancel_registration_retry();
                }
                let _ = reply.send(result);
            }
            Command::Deregister { reply } => {
                self.desired = false;
                self.cancel_registration_retry();
                let result = self.deregister().await;
                let _ = reply.send(result);
            }
            Command::ShardsStopped {
                node_id,
                shards,
                reply,
            } => {
                let result = self.acknowledge(node_id, shards).await;
                let _ = reply.send(result);
            }
            Command::AddLeadershipListener { id, listener, reply } => {
                if self.is_leader {
                    invoke(LEADERSHIP_KIND, id, || {
                        listener.on_leadership_changed(true, &self.topology)
                    });
                }
                self.leadership_listeners.insert(id, listener);
                let _ = reply.send(());
            }
            Command::RemoveLeadershipListener { id, reply } => {
                let _ = reply.send(self.leadership_listeners.remove(id));
            }
            Command::AddShardsListener { id, listener, reply } => {
                if let Some(local) = &self.local {
                    if !local.shards().is_empty() {
                        invoke(SHARDS_KIND, id, || listener.shards_started(local.shards()));
                    }
                    if !local.shards_stopping().is_empty() {
                        invoke(SHARDS_KIND, id, || {
                            listener.shards_stopping(local.shards_stopping())
                        });
                    }
                }
                self.shards_listeners.insert(id, listener);
                let _ = reply.send(());
            }
            Command::RemoveShardsListener { id, reply } => {
                let _ = reply.send(self.shards_listeners.remove(id));
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
            Command::RetryRegistration { generation } => {
                if generation == self.retry_generation && self.retry_backoff.is_some() {
                    self.attempt_reregistration().await;
                }
            }
        }
        ControlFlow::Continue(())
    }

    // ========================================================================
    // Registration
    // ========================================================================

    async fn register(&mut self) -> ClusterResult<()> {
        self.desired = true;
        if self.state == RegistrationState::Registered && self.local.is_some() {
            return Ok(());
        }

        self.state = RegistrationState::Registering;
        self.publish_state();

        match self.try_register().await {
            Ok(()) => {
                self.settle().await;
                Ok(())
            }
            Err(e) => {
                self.state = RegistrationState::Unregistered;
                self.publish_state();
                let outcome = if matches!(e, ClusterError::NodeIdCollision { .. }) {
                    "collision"
                } else {
                    "failed"
                };
                metrics::record_registration(&self.cluster, outcome);
                if e.is_fatal() {
                    self.on_fatal(&e);
                } else {
                    warn!(cluster = %self.cluster, node_id = self.node_id, error = %e, "Registration failed");
                }
                Err(e)
            }
        }
    }

    async fn try_register(&mut self) -> ClusterResult<()> {
        let store = self.store.as_ref();

        ensure_path(store, &join_path(&self.config.root_path, CLUSTERS_SEGMENT)).await?;
        let metadata = ClusterMetadata {
            max_shards: self.config.max_shards,
        };
        store
            .create(self.view.cluster_path(), &metadata.to_bytes()?, CreateMode::Persistent)
            .await?;

        self.view.start(store).await?;
        let max_shards = self.view.max_shards().unwrap_or(self.config.max_shards);
        if max_shards != self.config.max_shards {
            info!(
                cluster = %self.cluster,
                configured = self.config.max_shards,
                existing = max_shards,
                "Joining cluster with its existing shard count"
            );
        }

        let timestamp = Utc::now().timestamp_millis();
        let info = NodeInfo::new(timestamp, max_shards).with_attributes(self.config.attributes.clone());
        let path = self.view.node_path(self.node_id);

        let outcome = claim_ephemeral(store, &path, &info.to_bytes()?, &self.known_sessions).await?;
        if let ClaimOutcome::HeldByOther { owner } = outcome {
            return Err(ClusterError::NodeIdCollision {
                node_id: self.node_id,
                owner,
            });
        }

        let session = store.session_id();
        self.claimed_session = Some(session);
        if !self.known_sessions.contains(&session) {
            self.known_sessions.push(session);
        }
        self.state = RegistrationState::Registered;
        metrics::record_registration(&self.cluster, "registered");
        info!(
            cluster = %self.cluster,
            node_id = self.node_id,
            timestamp,
            outcome = ?outcome,
            "Node registered"
        );

        self.view.refresh(store).await?;
        Ok(())
    }

    /// Best-effort removal of the registration entry.
    async fn deregister(&mut self) -> ClusterResult<()> {
        if self.state == RegistrationState::Unregistered {
            return Ok(());
        }

        self.state = RegistrationState::Deregistering;
        self.publish_state();

        let path = self.view.node_path(self.node_id);
        let result = match self.store.delete(&path).await {
            Ok(outcome) => {
                info!(cluster = %self.cluster, node_id = self.node_id, outcome = ?outcome, "Node deregistered");
                Ok(())
            }
            Err(e) => {
                warn!(cluster = %self.cluster, node_id = self.node_id, error = %e, "Failed to remove registration");
                Err(e.into())
            }
        };

        self.state = RegistrationState::Unregistered;
        metrics::record_registration(&self.cluster, "deregistered");
        if let Err(e) = self.view.refresh(self.store.as_ref()).await {
            debug!(cluster = %self.cluster, error = %e, "View refresh after deregistration failed");
        }
        self.settle().await;
        result
    }

    async fn teardown(&mut self) {
        self.desired = false;
        self.cancel_registration_retry();
        if let Err(e) = self.deregister().await {
            debug!(cluster = %self.cluster, error = %e, "Deregistration during shutdown failed");
        }
        self.view.stop(self.store.as_ref()).await;
        self.publish_state();
    }

    fn on_fatal(&mut self, e: &ClusterError) {
        error!(cluster = %self.cluster, node_id = self.node_id, error = %e, "Fatal membership error");
        self.desired = false;
        self.cancel_registration_retry();
        self.fatal.on_fatal(e);
    }

    // ========================================================================
    // Events
    // ========================================================================

    async fn on_watch_event(&mut self, event: WatchEvent) {
        match self.view.handle_event(self.store.as_ref(), &event).await {
            Ok(true) => self.settle().await,
            Ok(false) => {}
            Err(e) => {
                debug!(cluster = %self.cluster, path = event.path(), error = %e, "Failed to apply watch event");
            }
        }
    }

    async fn on_connection_change(&mut self, change: Result<ConnectionState, broadcast::error::RecvError>) {
        match change {
            Ok(ConnectionState::Suspended) | Ok(ConnectionState::Lost) => {
                self.cancel_registration_retry();
                if self.state == RegistrationState::Registered {
                    warn!(
                        cluster = %self.cluster,
                        node_id = self.node_id,
                        "Store connection interrupted, giving up shards until reconnected"
                    );
                    let desired = self.desired;
                    let _ = self.deregister().await;
                    self.desired = desired;
                }
            }
            Ok(ConnectionState::Reconnected) | Err(broadcast::error::RecvError::Lagged(_)) => {
                if !self.store.is_connected() {
                    return;
                }
                if self.desired {
                    self.begin_reregistration().await;
                } else if let Err(e) = self.view.start(self.store.as_ref()).await {
                    warn!(cluster = %self.cluster, error = %e, "Failed to resync view after reconnect");
                }
            }
            Ok(ConnectionState::Connected) => {}
            Err(broadcast::error::RecvError::Closed) => {
                self.connection_open = false;
            }
        }
    }

    /// Register again after a reconnect, with backoff if configured.
    ///
    /// Waiting happens on a timer task, so the actor keeps serving commands
    /// and connection changes between attempts.
    async fn begin_reregistration(&mut self) {
        self.cancel_registration_retry();
        self.retry_backoff = Some(retry::registration_policy().build());
        self.attempt_reregistration().await;
    }

    async fn attempt_reregistration(&mut self) {
        match self.register().await {
            Ok(()) => self.cancel_registration_retry(),
            Err(e) if e.is_retryable() && self.config.registration_retry => {
                match self.retry_backoff.as_mut().and_then(|b| b.next()) {
                    Some(delay) => self.schedule_registration_retry(delay),
                    None => {
                        warn!(cluster = %self.cluster, error = %e, "Giving up re-registration until next reconnect");
                        self.cancel_registration_retry();
                    }
                }
            }
            Err(_) => self.cancel_registration_retry(),
        }
    }

    fn schedule_registration_retry(&mut self, delay: Duration) {
        self.retry_generation += 1;
        let generation = self.retry_generation;
        let commands = self.self_commands.clone();
        debug!(cluster = %self.cluster, delay = ?delay, generation, "Retrying registration");

        self.timers.spawn(REGISTRATION_RETRY_TASK, async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::RetryRegistration { generation });
            }
        });
    }

    /// Stop any retry cycle. An attempt already queued becomes stale.
    fn cancel_registration_retry(&mut self) {
        self.retry_generation += 1;
        self.retry_backoff = None;
        self.timers.cancel(REGISTRATION_RETRY_TASK);
    }

    // ========================================================================
    // Publishing and leader duties
    // ========================================================================

    /// Publish, then let the leader act, until nothing changes.
    async fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let auto_ack = match self.publish().await {
                Ok(auto_ack) => auto_ack,
                Err(e) => {
                    if e.is_fatal() {
                        self.state = RegistrationState::Unregistered;
                        self.publish_state();
                        self.on_fatal(&e);
                    } else {
                        debug!(cluster = %self.cluster, error = %e, "Publish failed");
                    }
                    return;
                }
            };

            let mut progressed = false;
            if let Some(shards) = auto_ack {
                if self.is_leader {
                    match self.apply_stop_ack(self.node_id, &shards).await {
                        Ok(applied) => progressed |= applied,
                        Err(e) => warn!(cluster = %self.cluster, error = %e, "Local stop acknowledgement failed"),
                    }
                } else {
                    self.forward_ack(shards);
                }
            }

            if self.is_leader {
                match self.rebalance_once().await {
                    Ok(applied) => progressed |= applied,
                    Err(e) => warn!(cluster = %self.cluster, error = %e, "Rebalance failed"),
                }
            }

            if !progressed {
                return;
            }
        }
        warn!(cluster = %self.cluster, rounds = MAX_SETTLE_ROUNDS, "Topology did not settle");
    }

    /// Recompute the snapshot from the view and notify listeners.
    ///
    /// Returns the stopping shards to acknowledge on the node's behalf when
    /// nobody is listening for them.
    async fn publish(&mut self) -> ClusterResult<Option<ShardSet>> {
        let registered = self.state == RegistrationState::Registered;
        let local = if registered {
            self.view.node(self.node_id).cloned()
        } else {
            None
        };
        if registered && local.is_none() {
            self.check_registration_present().await?;
        }

        let previous_leader = self.topology.leader_node_id();
        let topology = self.view.topology();
        if topology.clone().with_version(self.topology.version()) != *self.topology {
            self.version += 1;
            self.topology = Arc::new(topology.with_version(self.version));
            metrics::set_cluster_nodes(&self.cluster, self.topology.len());
        }

        let is_leader = registered && local.is_some() && self.topology.is_leader(self.node_id);
        let leadership_changed = is_leader != self.is_leader;
        self.is_leader = is_leader;

        let max_shards = self.topology.max_shards().unwrap_or(self.config.max_shards);
        let previous = std::mem::replace(&mut self.local, local);
        let (old_shards, old_stopping) = shard_sets(previous.as_ref(), max_shards);
        let (new_shards, new_stopping) = shard_sets(self.local.as_ref(), max_shards);

        self.publish_state();
        metrics::set_local_shards(&self.cluster, new_shards.len(), new_stopping.len());

        if leadership_changed {
            info!(cluster = %self.cluster, node_id = self.node_id, is_leader, "Leadership changed");
            metrics::set_leader(&self.cluster, is_leader);
            let topology = self.topology.clone();
            self.leadership_listeners.notify(LEADERSHIP_KIND, |l| {
                l.on_leadership_changed(is_leader, &topology)
            });
        }

        let started = new_shards.difference(&old_shards);
        // Shards leave this node either through the stopping set or, when the
        // registration is gone, all at once.
        let stopping = if self.local.is_some() {
            new_stopping.difference(&old_stopping)
        } else {
            old_shards.clone()
        };

        if !started.is_empty() {
            info!(cluster = %self.cluster, node_id = self.node_id, shards = %started, "Shards started");
            self.shards_listeners
                .notify(SHARDS_KIND, |l| l.shards_started(&started));
        }
        if !stopping.is_empty() {
            info!(cluster = %self.cluster, node_id = self.node_id, shards = %stopping, "Shards stopping");
            self.shards_listeners
                .notify(SHARDS_KIND, |l| l.shards_stopping(&stopping));
        }

        // A new leader may never have seen an acknowledgement sent to its
        // predecessor, so unattended stops are re-sent when the leader moves.
        let leader_moved = self.topology.leader_node_id() != previous_leader;
        let auto_ack = self.local.is_some()
            && !new_stopping.is_empty()
            && (!stopping.is_empty() || leader_moved)
            && self.shards_listeners.is_empty()
            && self.config.ack_stops_without_listeners;
        Ok(auto_ack.then_some(new_stopping))
    }

    /// Fail if our registration vanished while our session is still alive.
    ///
    /// Missing while disconnected, or under a previous session, is the
    /// normal prelude to a reconnect and is left to the connection handler.
    async fn check_registration_present(&self) -> ClusterResult<()> {
        let store = self.store.as_ref();
        if !store.is_connected() || self.claimed_session != Some(store.session_id()) {
            return Ok(());
        }
        if store.stat(&self.view.node_path(self.node_id)).await?.is_none() {
            return Err(ClusterError::RegistrationLost(self.node_id));
        }
        Ok(())
    }

    fn publish_state(&self) {
        let is_leader = self.is_leader && self.state == RegistrationState::Registered;
        self.snapshots.send_replace(RegistrySnapshot {
            state: self.state,
            node_id: self.node_id,
            topology: self.topology.clone(),
            local: self.local.clone(),
            is_leader,
        });
    }

    /// One leader pass: plan with the strategy and write the result with
    /// version checks. Returns true if a plan was written.
    async fn rebalance_once(&mut self) -> ClusterResult<bool> {
        let Some(max_shards) = self.view.max_shards() else {
            return Ok(false);
        };
        let store = self.store.as_ref();

        for attempt in 0..LEADER_WRITE_ATTEMPTS {
            let nodes = self.view.nodes();
            let plan = self.strategy.rebalance(&nodes, max_shards);
            if plan.is_empty() {
                return Ok(attempt > 0);
            }

            let ops = plan
                .apply(&nodes)
                .into_iter()
                .map(|(id, info)| {
                    Ok(StoreOp::SetData {
                        path: self.view.node_path(id),
                        data: info.to_bytes()?,
                        expected_version: self.view.node_version(id),
                    })
                })
                .collect::<ClusterResult<Vec<_>>>()?;

            match store.transaction(ops).await {
                Ok(()) => {
                    metrics::record_rebalance(&self.cluster, "applied", plan.started_count(), plan.stopped_count());
                    info!(cluster = %self.cluster, plan = %plan, "Rebalance applied");
                    self.view.refresh(store).await?;
                    return Ok(true);
                }
                Err(e @ (StoreError::BadVersion { .. } | StoreError::NoNode(_))) => {
                    metrics::record_rebalance(&self.cluster, "conflict", 0, 0);
                    debug!(cluster = %self.cluster, attempt, error = %e, "Rebalance raced a member update");
                    self.view.refresh(store).await?;
                }
                Err(e) => {
                    metrics::record_rebalance(&self.cluster, "failed", 0, 0);
                    metrics::record_store_failure("rebalance", e.as_metric_label());
                    return Err(e.into());
                }
            }
        }
        Ok(true)
    }

    /// Leader side of a stop acknowledgement, followed by a settle.
    async fn acknowledge(&mut self, node_id: NodeId, shards: Vec<ShardId>) -> ClusterResult<()> {
        if !self.is_leader {
            return Err(ClusterError::NotLeader(self.node_id));
        }
        let max_shards = self.view.max_shards().unwrap_or(self.config.max_shards);
        let shards = ShardSet::from_shards(max_shards, shards)?;
        if self.apply_stop_ack(node_id, &shards).await? {
            self.settle().await;
        }
        Ok(())
    }

    /// Clear acknowledged shards from `node_id`'s stopping set.
    ///
    /// Stale acknowledgements (shards no longer stopping there) are a no-op.
    async fn apply_stop_ack(&mut self, node_id: NodeId, shards: &ShardSet) -> ClusterResult<bool> {
        let store = self.store.as_ref();
        for _ in 0..LEADER_WRITE_ATTEMPTS {
            let Some(info) = self.view.node(node_id).cloned() else {
                debug!(cluster = %self.cluster, node_id, "Stop acknowledgement for absent node");
                return Ok(false);
            };
            let acked = info.shards_stopping().intersection(shards);
            if acked.is_empty() {
                debug!(cluster = %self.cluster, node_id, shards = %shards, "Stale stop acknowledgement");
                return Ok(false);
            }

            let updated = info.with_stop_acknowledged(&acked);
            let path = self.view.node_path(node_id);
            match store
                .set_data(&path, &updated.to_bytes()?, self.view.node_version(node_id))
                .await
            {
                Ok(_) => {
                    info!(cluster = %self.cluster, node_id, shards = %acked, "Shard stop acknowledged");
                    self.view.refresh(store).await?;
                    return Ok(true);
                }
                Err(StoreError::BadVersion { .. }) => {
                    self.view.refresh(store).await?;
                }
                Err(StoreError::NoNode(_)) => {
                    self.view.refresh(store).await?;
                    return Ok(false);
                }
                Err(e) => {
                    metrics::record_store_failure("stop_ack", e.as_metric_label());
                    return Err(e.into());
                }
            }
        }
        Ok(false)
    }

    /// Send an automatic acknowledgement to the current leader.
    fn forward_ack(&self, shards: ShardSet) {
        let Some(leader) = self.topology.leader_node_id() else {
            return;
        };
        let payload = match serde_json::to_vec(&ShardsStoppedMessage {
            node_id: self.node_id,
            shards: shards.to_vec(),
        }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(cluster = %self.cluster, error = %e, "Failed to encode stop acknowledgement");
                return;
            }
        };
        let request = RoutedRequest {
            cluster: self.cluster.clone(),
            handler: SHARDS_STOPPED_HANDLER.to_string(),
            source: self.node_id,
            shard: None,
            id: None,
            key: None,
            payload: Bytes::from(payload),
        };
        let transport = self.transport.clone();
        let timeout = self.config.route_timeout;
        let cluster = self.cluster.clone();

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, transport.request(leader, request)).await {
                Ok(Ok(_)) => debug!(cluster = %cluster, leader, shards = %shards, "Stop acknowledgement forwarded"),
                Ok(Err(e)) => warn!(cluster = %cluster, leader, error = %e, "Stop acknowledgement rejected"),
                Err(_) => warn!(cluster = %cluster, leader, "Stop acknowledgement timed out"),
            }
        });
    }
}

fn shard_sets(info: Option<&NodeInfo>, max_shards: u32) -> (ShardSet, ShardSet) {
    match info {
        Some(info) => (info.shards().clone(), info.shards_stopping().clone()),
        None => (ShardSet::new(max_shards), ShardSet::new(max_shards)),
    }
}
