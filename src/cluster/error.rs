//! Error types for the membership and coordination layer.
//!
//! # Error Handling Patterns
//!
//! Errors fall into four dispositions, see [`ErrorDisposition`]:
//!
//! ## Fatal (Process-Ending)
//!
//! - This node's registration slot is owned by a foreign live session
//! - This node's registration or id reservation vanished while its session is alive
//!
//! These are handed to the configured [`FatalHandler`](super::fatal::FatalHandler)
//! instead of being returned to a caller that might ignore them.
//!
//! ## Retryable
//!
//! Used for connectivity problems with the store. Re-registration on
//! reconnect retries these with [`retry::registration_policy`](super::retry::registration_policy).
//!
//! ## Caller-Surfaced
//!
//! - Shard not local to this node
//! - Route timeout
//! - Node-id space exhausted
//!
//! ## Expected Absence Is Not An Error
//!
//! Store outcomes such as "node already exists" or "node already deleted" are
//! returned as [`CreateOutcome`](super::store::CreateOutcome) and
//! [`DeleteOutcome`](super::store::DeleteOutcome) values, and reads return
//! `Option`. Only unexpected store conditions become [`StoreError`].

use std::time::Duration;

use thiserror::Error;

use super::topology::{NodeId, ShardId};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for membership-layer operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors reported by a [`CoordinationStore`](super::store::CoordinationStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The path (or, for creates, its parent) does not exist.
    #[error("no node at {0}")]
    NoNode(String),

    /// A node already exists where an operation required absence.
    #[error("node already exists at {0}")]
    NodeExists(String),

    /// Delete of a node that still has children.
    #[error("node {0} has children")]
    NotEmpty(String),

    /// A version-checked write observed a different version.
    #[error("version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral node {0} cannot have children")]
    NoChildrenForEphemerals(String),

    /// The client is currently disconnected from the store.
    #[error("connection to the coordination store lost")]
    ConnectionLoss,

    /// The client session has expired.
    #[error("coordination store session expired")]
    SessionExpired,

    /// The client has been closed.
    #[error("coordination store client closed")]
    Closed,

    /// Malformed path.
    #[error("invalid path {0}")]
    InvalidPath(String),
}

impl StoreError {
    /// Returns true for failures caused by (temporary) loss of connectivity.
    #[inline]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss | StoreError::SessionExpired)
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            StoreError::NoNode(_) => "no_node",
            StoreError::NodeExists(_) => "node_exists",
            StoreError::NotEmpty(_) => "not_empty",
            StoreError::BadVersion { .. } => "bad_version",
            StoreError::NoChildrenForEphemerals(_) => "no_children_for_ephemerals",
            StoreError::ConnectionLoss => "connection_loss",
            StoreError::SessionExpired => "session_expired",
            StoreError::Closed => "closed",
            StoreError::InvalidPath(_) => "invalid_path",
        }
    }
}

/// How an error must be treated by the component that observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Terminate the process rather than risk double ownership.
    Fatal,
    /// Transient; the operation can be retried after reconnecting.
    Retryable,
    /// Returned to the API caller, who decides what to do.
    CallerSurfaced,
    /// Aborts the current actor task; logged, actor keeps running.
    Internal,
}

/// Errors that can occur in the membership and coordination layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Error from the coordination store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The shard is not in this node's active shard set.
    #[error("shard {shard} is not local to node {node_id:#06x}")]
    ShardNotLocal { shard: ShardId, node_id: NodeId },

    /// No node currently owns the shard.
    #[error("shard {0} has no owner")]
    ShardUnassigned(ShardId),

    /// Shard number outside `[0, max_shards)`.
    #[error("shard {shard} out of range for {max_shards} shards")]
    InvalidShard { shard: ShardId, max_shards: u32 },

    /// A routed request did not complete within its deadline.
    #[error("request to node {node_id:#06x} for handler {handler} timed out after {timeout:?}")]
    RouteTimeout {
        node_id: NodeId,
        handler: String,
        timeout: Duration,
    },

    /// Every group and index of the sequence is taken.
    #[error("node-id space of sequence {0} exhausted")]
    AllocationExhausted(String),

    /// Another live session, or a persistent node (`owner: None`), occupies
    /// this node's slot.
    #[error("node id {node_id:#06x} already held by {}", holder_label(.owner))]
    NodeIdCollision { node_id: NodeId, owner: Option<u64> },

    /// The registration node disappeared while the session is alive.
    #[error("registration of node {0:#06x} removed while session is alive")]
    RegistrationLost(NodeId),

    /// The id reservation disappeared while the session is alive.
    #[error("reservation {path} removed while session is alive")]
    ReservationLost { path: String },

    /// Operation requires a registered node.
    #[error("node is not registered")]
    NotRegistered,

    /// Operation requires this node to be leader.
    #[error("node {0:#06x} is not the leader")]
    NotLeader(NodeId),

    /// No handler registered under this name.
    #[error("no handler registered as {0}")]
    UnknownHandler(String),

    /// Target node unknown to the transport.
    #[error("node {0:#06x} is unreachable")]
    Unreachable(NodeId),

    /// Failure reported by a remote handler.
    #[error("remote error: {0}")]
    Remote(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The actor has shut down.
    #[error("component is shutting down")]
    ShuttingDown,
}

fn holder_label(owner: &Option<u64>) -> String {
    match owner {
        Some(owner) => format!("live session {owner:#x}"),
        None => "a persistent entry".to_string(),
    }
}

impl ClusterError {
    /// Classify this error according to the layer's error taxonomy.
    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            ClusterError::NodeIdCollision { .. }
            | ClusterError::RegistrationLost(_)
            | ClusterError::ReservationLost { .. } => ErrorDisposition::Fatal,

            ClusterError::Store(e) if e.is_connection_error() => ErrorDisposition::Retryable,
            ClusterError::Unreachable(_) => ErrorDisposition::Retryable,

            ClusterError::ShardNotLocal { .. }
            | ClusterError::ShardUnassigned(_)
            | ClusterError::InvalidShard { .. }
            | ClusterError::RouteTimeout { .. }
            | ClusterError::AllocationExhausted(_)
            | ClusterError::NotRegistered
            | ClusterError::NotLeader(_)
            | ClusterError::UnknownHandler(_)
            | ClusterError::Remote(_)
            | ClusterError::Config(_)
            | ClusterError::ShuttingDown => ErrorDisposition::CallerSurfaced,

            ClusterError::Store(_) | ClusterError::Serde(_) => ErrorDisposition::Internal,
        }
    }

    /// Returns true if the error must terminate the process.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.disposition() == ErrorDisposition::Fatal
    }

    /// Returns true if the failed operation may succeed when retried.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.disposition() == ErrorDisposition::Retryable
    }

    /// Returns true if the error is a routing timeout.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::RouteTimeout { .. })
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            ClusterError::Store(_) => "store",
            ClusterError::ShardNotLocal { .. } => "shard_not_local",
            ClusterError::ShardUnassigned(_) => "shard_unassigned",
            ClusterError::InvalidShard { .. } => "invalid_shard",
            ClusterError::RouteTimeout { .. } => "route_timeout",
            ClusterError::AllocationExhausted(_) => "allocation_exhausted",
            ClusterError::NodeIdCollision { .. } => "node_id_collision",
            ClusterError::RegistrationLost(_) => "registration_lost",
            ClusterError::ReservationLost { .. } => "reservation_lost",
            ClusterError::NotRegistered => "not_registered",
            ClusterError::NotLeader(_) => "not_leader",
            ClusterError::UnknownHandler(_) => "unknown_handler",
            ClusterError::Unreachable(_) => "unreachable",
            ClusterError::Remote(_) => "remote",
            ClusterError::Config(_) => "config",
            ClusterError::Serde(_) => "serde",
            ClusterError::ShuttingDown => "shutting_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_conditions() {
        assert!(ClusterError::NodeIdCollision { node_id: 9, owner: Some(3) }.is_fatal());
        assert!(ClusterError::RegistrationLost(9).is_fatal());
        assert!(
            ClusterError::ReservationLost {
                path: "/discovery/sequences/nodes/00/08".into()
            }
            .is_fatal()
        );
        assert!(!ClusterError::NotRegistered.is_fatal());
    }

    #[test]
    fn test_collision_names_the_holder() {
        let live = ClusterError::NodeIdCollision { node_id: 8, owner: Some(0x2a) };
        assert_eq!(live.to_string(), "node id 0x0008 already held by live session 0x2a");

        let persistent = ClusterError::NodeIdCollision { node_id: 8, owner: None };
        assert_eq!(persistent.to_string(), "node id 0x0008 already held by a persistent entry");
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        assert!(ClusterError::Store(StoreError::ConnectionLoss).is_retryable());
        assert!(ClusterError::Store(StoreError::SessionExpired).is_retryable());
        assert!(!ClusterError::Store(StoreError::NoNode("/x".into())).is_retryable());
    }

    #[test]
    fn test_caller_surfaced_errors() {
        let err = ClusterError::ShardNotLocal {
            shard: 3,
            node_id: 8,
        };
        assert_eq!(err.disposition(), ErrorDisposition::CallerSurfaced);
        assert_eq!(err.to_string(), "shard 3 is not local to node 0x0008");

        let timeout = ClusterError::RouteTimeout {
            node_id: 9,
            handler: "echo".into(),
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_timeout());
        assert_eq!(timeout.disposition(), ErrorDisposition::CallerSurfaced);

        assert_eq!(
            ClusterError::AllocationExhausted("nodes".into()).disposition(),
            ErrorDisposition::CallerSurfaced
        );
    }

    #[test]
    fn test_store_error_conversion() {
        let err: ClusterError = StoreError::NotEmpty("/a".into()).into();
        assert_eq!(err.disposition(), ErrorDisposition::Internal);
        assert_eq!(err.as_metric_label(), "store");
    }
}
