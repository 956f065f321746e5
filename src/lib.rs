//! # Shardherd
//! Cluster membership, leader election and shard ownership over a
//! hierarchical coordination store.
//!
//! A process joins a named cluster with a [`ClusterRegistry`](cluster::ClusterRegistry).
//! The registry draws a compact 16-bit node id from a shared sequence,
//! registers the node, and keeps a live [`ClusterTopology`](cluster::ClusterTopology)
//! of every member. The oldest member leads and spreads `max_shards` shards
//! across the others; the registry tells each node which shards to start and
//! which to drain. Processes that only need to watch a cluster use
//! [`ClusterDiscovery`](cluster::ClusterDiscovery).
//!
//! # Goals
//! - A shard is never active on two nodes at once
//! - Node ids stay small and are reused after a node leaves
//! - Every state change happens on one actor task per registry, so listeners
//!   observe snapshots in order
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use shardherd::prelude::*;
//! use shardherd::cluster::store::memory::InMemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     shardherd::telemetry::init_logging(shardherd::telemetry::LogFormat::Pretty)?;
//!
//!     let store = InMemoryStore::new();
//!     let session = store.connect();
//!     let allocator = Arc::new(NodeIdAllocator::new(session.clone(), "/discovery")?);
//!
//!     let handlers = HandlerRegistry::new().register(
//!         "greet",
//!         handler_fn(|ctx, _payload| async move {
//!             Ok::<_, ClusterError>(bytes::Bytes::from(format!("shard {:?}", ctx.shard)))
//!         }),
//!     );
//!
//!     let registry = ClusterRegistry::builder(ClusterConfig::new("orders"), session, allocator)
//!         .handlers(handlers)
//!         .start()
//!         .await?;
//!
//!     let reply = registry.route("greet", 42, None, bytes::Bytes::new()).await?;
//!     println!("{}", String::from_utf8_lossy(&reply));
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod cluster;
pub mod constants;
pub mod telemetry;

pub mod prelude {
    //! Types most applications need to join or follow a cluster.
    pub use crate::cluster::{
        ClusterConfig, ClusterDiscovery, ClusterError, ClusterRegistry, ClusterResult,
        ClusterTopology, HandlerRegistry, LeadershipListener, ListenerResult, NodeId,
        NodeIdAllocator, NodeInfo, RegistrationState, RequestContext, RequestHandler, ShardId,
        ShardSet, ShardsListener, TopologyListener, handler_fn,
    };

    pub use bytes;
}
