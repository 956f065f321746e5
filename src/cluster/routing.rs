//! Request routing between cluster members.
//!
//! Handlers are registered by name in a [`HandlerRegistry`] built at startup.
//! A [`ClusterTransport`] carries [`RoutedRequest`]s and
//! [`BroadcastMessage`]s to other members and hands inbound traffic to the
//! local [`InboundDispatch`] endpoint (the node's
//! [`ClusterRegistry`](super::ClusterRegistry)). Envelope encoding on the
//! wire belongs to the transport; this layer only moves opaque payloads.
//!
//! # Available Transports
//!
//! - [`LocalOnlyTransport`]: single-node deployments, every remote target is
//!   unreachable
//! - [`InMemoryNetwork`]: in-process network with partitions and latency
//!   injection (requires `test-utilities`)

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::error::{ClusterError, ClusterResult};
use super::topology::{NodeId, ShardId};

/// Context handed to a request handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub cluster: String,
    /// Node executing the handler.
    pub node_id: NodeId,
    /// Node that sent the request.
    pub source: NodeId,
    /// Shard the request was routed by, if any.
    pub shard: Option<ShardId>,
    /// Entity id the shard was derived from.
    pub id: Option<i64>,
    pub key: Option<String>,
}

/// Request routed to the owner of a shard (or to a specific node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedRequest {
    pub cluster: String,
    pub handler: String,
    pub source: NodeId,
    pub shard: Option<ShardId>,
    pub id: Option<i64>,
    pub key: Option<String>,
    pub payload: Bytes,
}

impl RoutedRequest {
    pub fn context(&self, node_id: NodeId) -> RequestContext {
        RequestContext {
            cluster: self.cluster.clone(),
            node_id,
            source: self.source,
            shard: self.shard,
            id: self.id,
            key: self.key.clone(),
        }
    }
}

/// Best-effort message to every other member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub cluster: String,
    pub handler: String,
    pub source: NodeId,
    pub payload: Bytes,
}

impl BroadcastMessage {
    pub fn context(&self, node_id: NodeId) -> RequestContext {
        RequestContext {
            cluster: self.cluster.clone(),
            node_id,
            source: self.source,
            shard: None,
            id: None,
            key: None,
        }
    }
}

/// Application handler for routed requests and broadcasts.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> ClusterResult<Bytes>;
}

/// Adapter turning an async closure into a [`RequestHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler.
///
/// ```rust
/// use shardherd::cluster::routing::{handler_fn, HandlerRegistry};
///
/// let handlers = HandlerRegistry::new()
///     .register("echo", handler_fn(|_ctx, payload| async move {
///         Ok::<_, shardherd::cluster::ClusterError>(payload)
///     }));
/// assert!(handlers.contains("echo"));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RequestContext, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = ClusterResult<Bytes>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(RequestContext, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = ClusterResult<Bytes>> + Send,
{
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> ClusterResult<Bytes> {
        (self.0)(ctx, payload).await
    }
}

/// Named handlers, fixed once the registry is started.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler; a later registration under the same name replaces it.
    pub fn register(mut self, name: impl Into<String>, handler: impl RequestHandler + 'static) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn register_shared(mut self, name: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn RequestHandler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run handler `name`.
    pub async fn dispatch(&self, name: &str, ctx: RequestContext, payload: Bytes) -> ClusterResult<Bytes> {
        let handler = self
            .get(name)
            .ok_or_else(|| ClusterError::UnknownHandler(name.to_string()))?;
        handler.handle(ctx, payload).await
    }
}

/// Inbound side of a member, attached to the transport.
#[async_trait]
pub trait InboundDispatch: Send + Sync {
    async fn on_request(&self, request: RoutedRequest) -> ClusterResult<Bytes>;

    async fn on_message(&self, message: BroadcastMessage) -> ClusterResult<()>;
}

/// Carries requests between members.
#[async_trait]
pub trait ClusterTransport: Send + Sync + fmt::Debug {
    /// Attach the local endpoint of `node_id` in `cluster`.
    fn bind(&self, cluster: &str, node_id: NodeId, endpoint: Arc<dyn InboundDispatch>);

    fn unbind(&self, cluster: &str, node_id: NodeId);

    /// Send a request and wait for the response.
    async fn request(&self, target: NodeId, request: RoutedRequest) -> ClusterResult<Bytes>;

    /// Deliver a one-way message.
    async fn notify(&self, target: NodeId, message: BroadcastMessage) -> ClusterResult<()>;
}

/// Transport for a cluster of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnlyTransport;

#[async_trait]
impl ClusterTransport for LocalOnlyTransport {
    fn bind(&self, _cluster: &str, _node_id: NodeId, _endpoint: Arc<dyn InboundDispatch>) {}

    fn unbind(&self, _cluster: &str, _node_id: NodeId) {}

    async fn request(&self, target: NodeId, _request: RoutedRequest) -> ClusterResult<Bytes> {
        Err(ClusterError::Unreachable(target))
    }

    async fn notify(&self, target: NodeId, _message: BroadcastMessage) -> ClusterResult<()> {
        Err(ClusterError::Unreachable(target))
    }
}

#[cfg(any(test, feature = "test-utilities"))]
pub use memory::InMemoryNetwork;

#[cfg(any(test, feature = "test-utilities"))]
mod memory {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use dashmap::{DashMap, DashSet};

    use super::*;

    type Endpoint = (String, NodeId);

    #[derive(Default)]
    struct NetworkInner {
        endpoints: DashMap<Endpoint, Arc<dyn InboundDispatch>>,
        isolated: DashSet<Endpoint>,
        latency: DashMap<Endpoint, Duration>,
        requests: AtomicU64,
        messages: AtomicU64,
    }

    /// In-process network connecting registries of one test.
    #[derive(Clone, Default)]
    pub struct InMemoryNetwork {
        inner: Arc<NetworkInner>,
    }

    impl fmt::Debug for InMemoryNetwork {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("InMemoryNetwork")
                .field("endpoints", &self.inner.endpoints.len())
                .field("isolated", &self.inner.isolated.len())
                .finish()
        }
    }

    impl InMemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make `node_id` unreachable.
        pub fn isolate(&self, cluster: &str, node_id: NodeId) {
            self.inner.isolated.insert((cluster.to_string(), node_id));
        }

        pub fn heal(&self, cluster: &str, node_id: NodeId) {
            self.inner.isolated.remove(&(cluster.to_string(), node_id));
        }

        /// Delay every delivery to `node_id`.
        pub fn set_latency(&self, cluster: &str, node_id: NodeId, latency: Duration) {
            self.inner
                .latency
                .insert((cluster.to_string(), node_id), latency);
        }

        pub fn is_bound(&self, cluster: &str, node_id: NodeId) -> bool {
            self.inner
                .endpoints
                .contains_key(&(cluster.to_string(), node_id))
        }

        /// Requests delivered so far.
        pub fn request_count(&self) -> u64 {
            self.inner.requests.load(Ordering::SeqCst)
        }

        /// Broadcast messages delivered so far.
        pub fn message_count(&self) -> u64 {
            self.inner.messages.load(Ordering::SeqCst)
        }

        async fn endpoint(&self, cluster: &str, target: NodeId) -> ClusterResult<Arc<dyn InboundDispatch>> {
            let key = (cluster.to_string(), target);
            if self.inner.isolated.contains(&key) {
                return Err(ClusterError::Unreachable(target));
            }
            let latency = self.inner.latency.get(&key).map(|l| *l);
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            self.inner
                .endpoints
                .get(&key)
                .map(|e| e.value().clone())
                .ok_or(ClusterError::Unreachable(target))
        }
    }

    #[async_trait]
    impl ClusterTransport for InMemoryNetwork {
        fn bind(&self, cluster: &str, node_id: NodeId, endpoint: Arc<dyn InboundDispatch>) {
            self.inner
                .endpoints
                .insert((cluster.to_string(), node_id), endpoint);
        }

        fn unbind(&self, cluster: &str, node_id: NodeId) {
            self.inner.endpoints.remove(&(cluster.to_string(), node_id));
        }

        async fn request(&self, target: NodeId, request: RoutedRequest) -> ClusterResult<Bytes> {
            let endpoint = self.endpoint(&request.cluster, target).await?;
            self.inner.requests.fetch_add(1, Ordering::SeqCst);
            endpoint.on_request(request).await
        }

        async fn notify(&self, target: NodeId, message: BroadcastMessage) -> ClusterResult<()> {
            let endpoint = self.endpoint(&message.cluster, target).await?;
            self.inner.messages.fetch_add(1, Ordering::SeqCst);
            endpoint.on_message(message).await
        }
    }
}
