//! Hierarchical coordination store contract.
//!
//! The membership layer needs a store with:
//! - a `/`-separated path namespace
//! - persistent nodes and ephemeral nodes bound to the client session
//! - data watches and child-list watches delivered as [`WatchEvent`]s
//! - atomic multi-path transactions
//! - a session identity that changes when a session is lost
//!
//! # Available Implementations
//!
//! - [`InMemorySession`](memory::InMemorySession): in-process store for tests
//!   and single-process deployments (requires `test-utilities`)
//!
//! # Watches
//!
//! Watches are persistent: they stay registered until [`CoordinationStore::unwatch`]
//! is called, may be placed on paths that do not exist yet, and deliver every
//! change into an unbounded channel. Actors own the receiving end, so store
//! dispatch never blocks on actor work.

#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::error::{StoreError, StoreResult};

/// Opaque store session identity.
pub type SessionId = u64;

/// Receiving side of a watch registration.
pub type WatchSink = mpsc::UnboundedSender<WatchEvent>;

/// Handle returned by watch registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// Node lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives until explicitly deleted.
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
}

/// Result of a create; "already exists" is an expected outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Result of a delete; "already gone" is an expected outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Absent,
}

/// Metadata of a stored node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Data version, incremented on every write.
    pub version: i32,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<SessionId>,
    pub num_children: usize,
    /// Creation time, milliseconds since the epoch.
    pub ctime_ms: i64,
}

/// One operation of an atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        expected_version: Option<i32>,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        expected_version: Option<i32>,
    },
    /// Assert the node exists at the given version.
    Check { path: String, version: i32 },
}

impl StoreOp {
    pub fn path(&self) -> &str {
        match self {
            StoreOp::Create { path, .. }
            | StoreOp::Delete { path, .. }
            | StoreOp::SetData { path, .. }
            | StoreOp::Check { path, .. } => path,
        }
    }
}

/// Change notification delivered to a watch sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A data-watched node was created.
    NodeCreated { path: String },
    /// A data-watched node was deleted.
    NodeDeleted { path: String },
    /// A data-watched node's data changed.
    DataChanged { path: String },
    /// A child-watched node gained or lost children, or was itself
    /// created or deleted.
    ChildrenChanged { path: String },
}

impl WatchEvent {
    pub fn path(&self) -> &str {
        match self {
            WatchEvent::NodeCreated { path }
            | WatchEvent::NodeDeleted { path }
            | WatchEvent::DataChanged { path }
            | WatchEvent::ChildrenChanged { path } => path,
        }
    }
}

/// Connectivity transitions of a store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection established.
    Connected,
    /// Connection interrupted; the session may still be alive.
    Suspended,
    /// Connection restored. The session id may differ from before.
    Reconnected,
    /// The session is gone; its ephemeral nodes will be removed.
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Suspended => write!(f, "suspended"),
            ConnectionState::Reconnected => write!(f, "reconnected"),
            ConnectionState::Lost => write!(f, "lost"),
        }
    }
}

/// Client handle to a hierarchical coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    /// Current session identity.
    fn session_id(&self) -> SessionId;

    /// Whether the client currently has a live connection.
    fn is_connected(&self) -> bool;

    /// Subscribe to connectivity transitions.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionState>;

    // ========================================================================
    // Node Operations
    // ========================================================================

    /// Create a node. The parent must exist.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<CreateOutcome>;

    /// Delete a childless node.
    async fn delete(&self, path: &str) -> StoreResult<DeleteOutcome>;

    /// Read data and metadata, `None` if absent.
    async fn read(&self, path: &str) -> StoreResult<Option<(Vec<u8>, NodeStat)>>;

    /// Read metadata only, `None` if absent.
    async fn stat(&self, path: &str) -> StoreResult<Option<NodeStat>>;

    /// Overwrite data, optionally only at `expected_version`.
    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat>;

    /// Child names (last path segment), `None` if the node is absent.
    async fn list_children(&self, path: &str) -> StoreResult<Option<Vec<String>>>;

    /// Apply every op or none of them.
    async fn transaction(&self, ops: Vec<StoreOp>) -> StoreResult<()>;

    // ========================================================================
    // Watches
    // ========================================================================

    /// Watch creation, deletion and data changes of `path`.
    async fn watch_data(&self, path: &str, sink: WatchSink) -> StoreResult<WatchId>;

    /// Watch the child list of `path`.
    async fn watch_children(&self, path: &str, sink: WatchSink) -> StoreResult<WatchId>;

    /// Remove a watch. Unknown ids are ignored.
    async fn unwatch(&self, id: WatchId) -> StoreResult<()>;
}

/// Join a parent path and a child segment.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of `path`, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Check that `path` is absolute, has no empty segments and no trailing slash.
pub fn validate_path(path: &str) -> StoreResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path[1..].split('/').any(str::is_empty) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Create `path` and any missing ancestors as persistent nodes.
///
/// Concurrent creation by another client is not an error.
pub async fn ensure_path(store: &dyn CoordinationStore, path: &str) -> StoreResult<()> {
    validate_path(path)?;
    if path == "/" {
        return Ok(());
    }

    let mut current = String::new();
    for segment in path[1..].split('/') {
        current.push('/');
        current.push_str(segment);
        store.create(&current, &[], CreateMode::Persistent).await?;
    }
    Ok(())
}

/// Outcome of claiming an ephemeral slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The slot was free and is now ours.
    Created,
    /// A leftover from one of our earlier sessions was replaced.
    Reclaimed { previous_owner: SessionId },
    /// The current session already owned the slot; its data was refreshed.
    AlreadyOwned,
    /// Someone else holds the slot: a live foreign session, or nobody at
    /// all (`None`) when a persistent node sits at the path.
    HeldByOther { owner: Option<SessionId> },
}

const CLAIM_ATTEMPTS: usize = 5;

/// Claim the ephemeral node at `path` for the current session.
///
/// `previous_sessions` are the earlier session ids of this process; entries
/// they own are deleted and recreated. Any other entry, persistent ones
/// included, is left alone and reported as held.
pub async fn claim_ephemeral(
    store: &dyn CoordinationStore,
    path: &str,
    data: &[u8],
    previous_sessions: &[SessionId],
) -> StoreResult<ClaimOutcome> {
    let mut replaced: Option<SessionId> = None;

    for attempt in 0..CLAIM_ATTEMPTS {
        if store.create(path, data, CreateMode::Ephemeral).await? == CreateOutcome::Created {
            return Ok(match replaced {
                Some(previous_owner) => ClaimOutcome::Reclaimed { previous_owner },
                None => ClaimOutcome::Created,
            });
        }

        let Some(stat) = store.stat(path).await? else {
            debug!(path, attempt, "Claimed slot vanished before inspection, retrying");
            continue;
        };

        let current = store.session_id();
        match stat.ephemeral_owner {
            Some(owner) if owner == current => {
                store.set_data(path, data, None).await?;
                return Ok(ClaimOutcome::AlreadyOwned);
            }
            Some(owner) if previous_sessions.contains(&owner) => {
                warn!(path, previous_owner = owner, "Replacing stale entry left by an earlier session");
                store.delete(path).await?;
                replaced = Some(owner);
            }
            owner => return Ok(ClaimOutcome::HeldByOther { owner }),
        }
    }

    Err(StoreError::NodeExists(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryStore;
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
        assert!(validate_path("").is_err());
    }

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let store = InMemoryStore::new();
        let client = store.connect();
        ensure_path(client.as_ref(), "/x/y/z").await.unwrap();
        ensure_path(client.as_ref(), "/x/y/z").await.unwrap();
        assert_eq!(
            client.list_children("/x/y").await.unwrap(),
            Some(vec!["z".to_string()])
        );
    }

    // ========================================================================
    // claim_ephemeral
    // ========================================================================

    #[tokio::test]
    async fn test_claim_free_slot() {
        let store = InMemoryStore::new();
        let client = store.connect();
        ensure_path(client.as_ref(), "/c").await.unwrap();

        let outcome = claim_ephemeral(client.as_ref(), "/c/n", b"1", &[]).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Created);

        let outcome = claim_ephemeral(client.as_ref(), "/c/n", b"2", &[]).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::AlreadyOwned);
        let (data, _) = client.read("/c/n").await.unwrap().unwrap();
        assert_eq!(data, b"2");
    }

    #[tokio::test]
    async fn test_claim_replaces_previous_session_entry() {
        let store = InMemoryStore::new();
        let client = store.connect();
        ensure_path(client.as_ref(), "/c").await.unwrap();
        claim_ephemeral(client.as_ref(), "/c/n", b"old", &[]).await.unwrap();

        let old = client.simulate_session_loss();
        client.simulate_reconnect();

        let outcome = claim_ephemeral(client.as_ref(), "/c/n", b"new", &[old]).await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Reclaimed { previous_owner: old }
        );
        let stat = client.stat("/c/n").await.unwrap().unwrap();
        assert_eq!(stat.ephemeral_owner, Some(client.session_id()));
    }

    #[tokio::test]
    async fn test_claim_reports_foreign_owner() {
        let store = InMemoryStore::new();
        let a = store.connect();
        let b = store.connect();
        ensure_path(a.as_ref(), "/c").await.unwrap();
        claim_ephemeral(a.as_ref(), "/c/n", b"a", &[]).await.unwrap();

        let outcome = claim_ephemeral(b.as_ref(), "/c/n", b"b", &[]).await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::HeldByOther {
                owner: Some(a.session_id())
            }
        );
    }

    #[tokio::test]
    async fn test_claim_leaves_persistent_entry_alone() {
        let store = InMemoryStore::new();
        let client = store.connect();
        ensure_path(client.as_ref(), "/c/n/child").await.unwrap();

        let outcome = claim_ephemeral(client.as_ref(), "/c/n", b"x", &[client.session_id()])
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::HeldByOther { owner: None });

        let stat = client.stat("/c/n").await.unwrap().unwrap();
        assert_eq!(stat.ephemeral_owner, None);
        assert!(store.exists("/c/n/child").await);
    }
}
