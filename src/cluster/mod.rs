//! Cluster membership, shard ownership and node-id allocation on top of a
//! hierarchical coordination store.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────────┐     ┌──────────────────────┐
//!   │  ClusterRegistry     │     │  ClusterDiscovery    │
//!   │  (member, leader)    │     │  (read-only follow)  │
//!   └─────┬──────────┬─────┘     └──────────┬───────────┘
//!         │          │                      │
//!         │    ┌─────▼──────────┐           │
//!         │    │ NodeIdAllocator│           │
//!         │    └─────┬──────────┘           │
//!         ▼          ▼                      ▼
//!   ┌───────────────────────────────────────────────┐
//!   │        CoordinationStore (sessions, ephemeral │
//!   │        nodes, watches, transactions)          │
//!   └───────────────────────────────────────────────┘
//! ```
//!
//! Store layout under the configured root:
//!
//! ```text
//! <root>/clusters/<cluster>            {"max_shards": N}
//! <root>/clusters/<cluster>/<node-id>  ephemeral, NodeInfo JSON
//! <root>/sequences/<name>/<group>/<index>  ephemeral id reservation
//! ```
//!
//! Each node gets a 16-bit id from a [`NodeIdAllocator`] sequence, registers
//! itself as an ephemeral entry under its cluster, and the oldest registered
//! node leads. The leader runs the [`ShardAllocationStrategy`] and moves shards
//! with version-checked writes.
//!
//! # Usage
//!
//! ```rust,no_run
//! use shardherd::cluster::{ClusterConfig, ClusterRegistry, NodeIdAllocator, ShardSet};
//! use shardherd::cluster::store::memory::InMemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! let session = store.connect();
//! let allocator = Arc::new(NodeIdAllocator::new(session.clone(), "/discovery")?);
//!
//! let config = ClusterConfig::new("orders").with_max_shards(16);
//! let registry = ClusterRegistry::builder(config, session, allocator).start().await?;
//!
//! if let Some(local) = registry.node_info() {
//!     println!("node {:#06x} owns {}", registry.node_id(), local.shards());
//! }
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod allocation;
pub mod background_tasks;
mod config;
pub mod discovery;
mod error;
pub mod fatal;
pub mod listeners;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod routing;
pub mod sequence;
pub mod store;
pub mod topology;
mod validation;
pub mod view;

pub use allocation::{EvenShardAllocationStrategy, RebalancePlan, ShardAllocationStrategy};
pub use background_tasks::BackgroundTaskRegistry;
pub use config::{ClusterConfig, ClusterProfile};
pub use discovery::ClusterDiscovery;
pub use error::{ClusterError, ClusterResult, ErrorDisposition, StoreError, StoreResult};
#[cfg(any(test, feature = "test-utilities"))]
pub use fatal::RecordingFatalHandler;
pub use fatal::{ExitProcess, FatalHandler, SharedFatalHandler};
pub use listeners::{
    LeadershipListener, ListenerId, ListenerResult, ListenerSet, ShardsListener,
    TopologyListener,
};
pub use registry::{ClusterRegistry, ClusterRegistryBuilder, RegistrationState, RegistrySnapshot};
#[cfg(any(test, feature = "test-utilities"))]
pub use routing::InMemoryNetwork;
pub use routing::{
    BroadcastMessage, ClusterTransport, HandlerRegistry, InboundDispatch, LocalOnlyTransport,
    RequestContext, RequestHandler, RoutedRequest, handler_fn,
};
pub use sequence::{NodeIdAllocator, Sequence, decode_node_id, encode_node_id};
pub use store::{ConnectionState, CoordinationStore, SessionId, WatchEvent};
pub use topology::{
    ClusterMetadata, ClusterTopology, NodeId, NodeInfo, ShardId, ShardResolver, ShardSet,
};
pub use validation::{validate_cluster_name, validate_root_path, validate_sequence_name};
