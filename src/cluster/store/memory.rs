//! In-memory coordination store for testing.
//!
//! [`InMemoryStore`] plays the server: one shared node tree. Each call to
//! [`InMemoryStore::connect`] yields an [`InMemorySession`] client with its own
//! session id, so several registries in one process behave like separate
//! processes talking to one ensemble.
//!
//! # Fault Injection
//!
//! - [`InMemorySession::simulate_disconnect`]: connection suspended, operations
//!   fail with `ConnectionLoss`, ephemerals stay
//! - [`InMemorySession::simulate_reconnect`]: connection restored
//! - [`InMemorySession::fail_next_operations`]: the next operations fail with
//!   `ConnectionLoss` although the connection reports itself as up
//! - [`InMemorySession::simulate_session_loss`]: the client gets a new session
//!   id; the old session's ephemerals linger until
//!   [`InMemoryStore::expire_session`] removes them
//! - [`InMemorySession::close`]: orderly close, ephemerals removed at once
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! shardherd = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use super::{
    ConnectionState, CoordinationStore, CreateMode, CreateOutcome, DeleteOutcome, NodeStat, SessionId, StoreOp,
    WatchEvent, WatchId, WatchSink, parent_path, validate_path,
};
use crate::cluster::error::{StoreError, StoreResult};

const CONNECTION_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct StoredNode {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<SessionId>,
    ctime_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Data,
    Children,
}

#[derive(Debug)]
struct Watch {
    path: String,
    kind: WatchKind,
    sink: WatchSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Created,
    Deleted,
    DataChanged,
}

#[derive(Debug)]
struct StoreState {
    nodes: BTreeMap<String, StoredNode>,
    watches: BTreeMap<WatchId, Watch>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<StoreState>,
    next_session: AtomicU64,
    next_watch: AtomicU64,
}

/// Shared in-memory node tree; the "server" side.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            StoredNode {
                data: Vec::new(),
                version: 0,
                ephemeral_owner: None,
                ctime_ms: Utc::now().timestamp_millis(),
            },
        );
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState {
                    nodes,
                    watches: BTreeMap::new(),
                }),
                next_session: AtomicU64::new(1),
                next_watch: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new client with a fresh session.
    pub fn connect(&self) -> Arc<InMemorySession> {
        let session = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        debug!(session, "In-memory store session opened");
        Arc::new(InMemorySession {
            store: self.clone(),
            session: AtomicU64::new(session),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            injected_failures: AtomicUsize::new(0),
            events,
        })
    }

    /// End `session` server-side: delete its ephemerals and fire watches.
    pub async fn expire_session(&self, session: SessionId) {
        let mut state = self.shared.state.lock().await;
        let doomed: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        let mut changes = Vec::with_capacity(doomed.len());
        for path in doomed {
            state.nodes.remove(&path);
            changes.push((path, Change::Deleted));
        }
        debug!(session, removed = changes.len(), "In-memory store session expired");
        dispatch(&mut state, &changes);
    }

    /// Whether a node exists at `path`.
    pub async fn exists(&self, path: &str) -> bool {
        self.shared.state.lock().await.nodes.contains_key(path)
    }

    /// All paths currently stored, sorted.
    pub async fn paths(&self) -> Vec<String> {
        self.shared.state.lock().await.nodes.keys().cloned().collect()
    }

    /// Number of live watch registrations.
    pub async fn watch_count(&self) -> usize {
        self.shared.state.lock().await.watches.len()
    }

    fn next_watch_id(&self) -> WatchId {
        WatchId(self.shared.next_watch.fetch_add(1, Ordering::SeqCst))
    }
}

/// Client connection to an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemorySession {
    store: InMemoryStore,
    session: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    injected_failures: AtomicUsize,
    events: broadcast::Sender<ConnectionState>,
}

impl InMemorySession {
    /// The server this client talks to.
    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    /// Suspend the connection. The session stays alive.
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(ConnectionState::Suspended);
    }

    /// Restore the connection.
    pub fn simulate_reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionState::Reconnected);
    }

    /// Make the next `count` operations fail with `ConnectionLoss` while the
    /// connection stays up. Zero clears any pending failures.
    pub fn fail_next_operations(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Lose the session: the client disconnects and will reconnect under a
    /// new session id. Returns the old id, whose ephemerals linger until
    /// expired on the store.
    pub fn simulate_session_loss(&self) -> SessionId {
        self.connected.store(false, Ordering::SeqCst);
        let fresh = self.store.shared.next_session.fetch_add(1, Ordering::SeqCst);
        let old = self.session.swap(fresh, Ordering::SeqCst);
        let _ = self.events.send(ConnectionState::Lost);
        old
    }

    /// Close the client and expire its session.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.store.expire_session(self.session_id()).await;
        let _ = self.events.send(ConnectionState::Lost);
    }

    fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss);
        }
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            debug!(session = self.session_id(), "Injected connection loss");
            return Err(StoreError::ConnectionLoss);
        }
        Ok(())
    }

    async fn watch(&self, path: &str, kind: WatchKind, sink: WatchSink) -> StoreResult<WatchId> {
        self.check()?;
        validate_path(path)?;
        let id = self.store.next_watch_id();
        let mut state = self.store.shared.state.lock().await;
        state.watches.insert(
            id,
            Watch {
                path: path.to_string(),
                kind,
                sink,
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl CoordinationStore for InMemorySession {
    fn session_id(&self) -> SessionId {
        self.session.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<CreateOutcome> {
        self.check()?;
        let mut state = self.store.shared.state.lock().await;
        let mut changes = Vec::new();
        let outcome = match create_node(&mut state.nodes, path, data, mode, self.session_id(), &mut changes) {
            Ok(()) => CreateOutcome::Created,
            Err(StoreError::NodeExists(_)) => CreateOutcome::AlreadyExists,
            Err(e) => return Err(e),
        };
        dispatch(&mut state, &changes);
        Ok(outcome)
    }

    async fn delete(&self, path: &str) -> StoreResult<DeleteOutcome> {
        self.check()?;
        let mut state = self.store.shared.state.lock().await;
        let mut changes = Vec::new();
        let outcome = match delete_node(&mut state.nodes, path, None, &mut changes) {
            Ok(()) => DeleteOutcome::Deleted,
            Err(StoreError::NoNode(_)) => DeleteOutcome::Absent,
            Err(e) => return Err(e),
        };
        dispatch(&mut state, &changes);
        Ok(outcome)
    }

    async fn read(&self, path: &str) -> StoreResult<Option<(Vec<u8>, NodeStat)>> {
        self.check()?;
        validate_path(path)?;
        let state = self.store.shared.state.lock().await;
        Ok(state
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), stat_of(&state.nodes, path, node))))
    }

    async fn stat(&self, path: &str) -> StoreResult<Option<NodeStat>> {
        self.check()?;
        validate_path(path)?;
        let state = self.store.shared.state.lock().await;
        Ok(state.nodes.get(path).map(|node| stat_of(&state.nodes, path, node)))
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat> {
        self.check()?;
        let mut state = self.store.shared.state.lock().await;
        let mut changes = Vec::new();
        set_node_data(&mut state.nodes, path, data, expected_version, &mut changes)?;
        dispatch(&mut state, &changes);
        state
            .nodes
            .get(path)
            .map(|node| stat_of(&state.nodes, path, node))
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn list_children(&self, path: &str) -> StoreResult<Option<Vec<String>>> {
        self.check()?;
        validate_path(path)?;
        let state = self.store.shared.state.lock().await;
        if !state.nodes.contains_key(path) {
            return Ok(None);
        }
        Ok(Some(children_of(&state.nodes, path)))
    }

    async fn transaction(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        self.check()?;
        let mut state = self.store.shared.state.lock().await;
        let mut staged = state.nodes.clone();
        let mut changes = Vec::new();
        let session = self.session_id();

        for op in &ops {
            match op {
                StoreOp::Create { path, data, mode } => {
                    create_node(&mut staged, path, data, *mode, session, &mut changes)?
                }
                StoreOp::Delete {
                    path,
                    expected_version,
                } => delete_node(&mut staged, path, *expected_version, &mut changes)?,
                StoreOp::SetData {
                    path,
                    data,
                    expected_version,
                } => set_node_data(&mut staged, path, data, *expected_version, &mut changes)?,
                StoreOp::Check { path, version } => {
                    let node = staged
                        .get(path)
                        .ok_or_else(|| StoreError::NoNode(path.clone()))?;
                    if node.version != *version {
                        return Err(StoreError::BadVersion {
                            path: path.clone(),
                            expected: *version,
                            actual: node.version,
                        });
                    }
                }
            }
        }

        state.nodes = staged;
        dispatch(&mut state, &changes);
        Ok(())
    }

    async fn watch_data(&self, path: &str, sink: WatchSink) -> StoreResult<WatchId> {
        self.watch(path, WatchKind::Data, sink).await
    }

    async fn watch_children(&self, path: &str, sink: WatchSink) -> StoreResult<WatchId> {
        self.watch(path, WatchKind::Children, sink).await
    }

    async fn unwatch(&self, id: WatchId) -> StoreResult<()> {
        let mut state = self.store.shared.state.lock().await;
        state.watches.remove(&id);
        Ok(())
    }
}

fn stat_of(nodes: &BTreeMap<String, StoredNode>, path: &str, node: &StoredNode) -> NodeStat {
    NodeStat {
        version: node.version,
        ephemeral_owner: node.ephemeral_owner,
        num_children: children_of(nodes, path).len(),
        ctime_ms: node.ctime_ms,
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn children_of(nodes: &BTreeMap<String, StoredNode>, path: &str) -> Vec<String> {
    let prefix = child_prefix(path);
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| {
            let rest = &key[prefix.len()..];
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}

fn create_node(
    nodes: &mut BTreeMap<String, StoredNode>,
    path: &str,
    data: &[u8],
    mode: CreateMode,
    session: SessionId,
    changes: &mut Vec<(String, Change)>,
) -> StoreResult<()> {
    validate_path(path)?;
    let parent = parent_path(path).ok_or_else(|| StoreError::NodeExists(path.to_string()))?;
    if nodes.contains_key(path) {
        return Err(StoreError::NodeExists(path.to_string()));
    }
    match nodes.get(parent) {
        None => return Err(StoreError::NoNode(parent.to_string())),
        Some(node) if node.ephemeral_owner.is_some() => {
            return Err(StoreError::NoChildrenForEphemerals(parent.to_string()));
        }
        Some(_) => {}
    }

    nodes.insert(
        path.to_string(),
        StoredNode {
            data: data.to_vec(),
            version: 0,
            ephemeral_owner: match mode {
                CreateMode::Persistent => None,
                CreateMode::Ephemeral => Some(session),
            },
            ctime_ms: Utc::now().timestamp_millis(),
        },
    );
    changes.push((path.to_string(), Change::Created));
    Ok(())
}

fn delete_node(
    nodes: &mut BTreeMap<String, StoredNode>,
    path: &str,
    expected_version: Option<i32>,
    changes: &mut Vec<(String, Change)>,
) -> StoreResult<()> {
    validate_path(path)?;
    if path == "/" {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    let node = nodes
        .get(path)
        .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
    check_version(path, node.version, expected_version)?;
    if !children_of(nodes, path).is_empty() {
        return Err(StoreError::NotEmpty(path.to_string()));
    }
    nodes.remove(path);
    changes.push((path.to_string(), Change::Deleted));
    Ok(())
}

fn check_version(path: &str, actual: i32, expected: Option<i32>) -> StoreResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(StoreError::BadVersion {
            path: path.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn set_node_data(
    nodes: &mut BTreeMap<String, StoredNode>,
    path: &str,
    data: &[u8],
    expected_version: Option<i32>,
    changes: &mut Vec<(String, Change)>,
) -> StoreResult<()> {
    validate_path(path)?;
    let node = nodes
        .get_mut(path)
        .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
    check_version(path, node.version, expected_version)?;
    node.data = data.to_vec();
    node.version = node.version.wrapping_add(1);
    changes.push((path.to_string(), Change::DataChanged));
    Ok(())
}

/// Deliver committed changes to matching watches, dropping closed sinks.
fn dispatch(state: &mut StoreState, changes: &[(String, Change)]) {
    if changes.is_empty() {
        return;
    }

    let mut closed = Vec::new();
    for (id, watch) in &state.watches {
        for (path, change) in changes {
            let event = match watch.kind {
                WatchKind::Data if watch.path == *path => Some(match change {
                    Change::Created => WatchEvent::NodeCreated { path: path.clone() },
                    Change::Deleted => WatchEvent::NodeDeleted { path: path.clone() },
                    Change::DataChanged => WatchEvent::DataChanged { path: path.clone() },
                }),
                WatchKind::Children if *change != Change::DataChanged => {
                    let own = watch.path == *path;
                    let parent = parent_path(path) == Some(watch.path.as_str());
                    (own || parent).then(|| WatchEvent::ChildrenChanged {
                        path: watch.path.clone(),
                    })
                }
                _ => None,
            };

            let Some(event) = event else { continue };
            if watch.sink.send(event).is_err() {
                closed.push(*id);
                break;
            }
        }
    }

    for id in closed {
        state.watches.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::store::ensure_path;
    use tokio::sync::mpsc;

    // ========================================================================
    // Basic Operations
    // ========================================================================

    #[tokio::test]
    async fn test_create_read_delete() {
        let store = InMemoryStore::new();
        let client = store.connect();

        assert_eq!(
            client.create("/a", b"x", CreateMode::Persistent).await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            client.create("/a", b"y", CreateMode::Persistent).await.unwrap(),
            CreateOutcome::AlreadyExists
        );

        let (data, stat) = client.read("/a").await.unwrap().unwrap();
        assert_eq!(data, b"x");
        assert_eq!(stat.version, 0);
        assert_eq!(stat.ephemeral_owner, None);

        assert_eq!(client.delete("/a").await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(client.delete("/a").await.unwrap(), DeleteOutcome::Absent);
        assert!(client.read("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = InMemoryStore::new();
        let client = store.connect();
        let err = client
            .create("/a/b", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NoNode("/a".into()));
    }

    #[tokio::test]
    async fn test_ephemeral_cannot_have_children() {
        let store = InMemoryStore::new();
        let client = store.connect();
        client.create("/e", b"", CreateMode::Ephemeral).await.unwrap();
        let err = client
            .create("/e/c", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NoChildrenForEphemerals("/e".into()));
    }

    #[tokio::test]
    async fn test_delete_non_empty_fails() {
        let store = InMemoryStore::new();
        let client = store.connect();
        ensure_path(client.as_ref(), "/a/b").await.unwrap();
        assert_eq!(
            client.delete("/a").await.unwrap_err(),
            StoreError::NotEmpty("/a".into())
        );
    }

    #[tokio::test]
    async fn test_children_and_stat() {
        let store = InMemoryStore::new();
        let client = store.connect();
        ensure_path(client.as_ref(), "/p/x/deep").await.unwrap();
        ensure_path(client.as_ref(), "/p/y").await.unwrap();
        ensure_path(client.as_ref(), "/pq").await.unwrap();

        assert_eq!(
            client.list_children("/p").await.unwrap(),
            Some(vec!["x".to_string(), "y".to_string()])
        );
        assert_eq!(client.stat("/p").await.unwrap().unwrap().num_children, 2);
        assert_eq!(client.list_children("/missing").await.unwrap(), None);
        assert_eq!(
            client.list_children("/").await.unwrap(),
            Some(vec!["p".to_string(), "pq".to_string()])
        );
    }

    #[tokio::test]
    async fn test_versioned_set_data() {
        let store = InMemoryStore::new();
        let client = store.connect();
        client.create("/v", b"0", CreateMode::Persistent).await.unwrap();

        let stat = client.set_data("/v", b"1", Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);

        let err = client.set_data("/v", b"2", Some(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::BadVersion { expected: 0, actual: 1, .. }));
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let client = store.connect();
        client.create("/a", b"a", CreateMode::Persistent).await.unwrap();
        client.create("/b", b"b", CreateMode::Persistent).await.unwrap();

        let result = client
            .transaction(vec![
                StoreOp::SetData {
                    path: "/a".into(),
                    data: b"a2".to_vec(),
                    expected_version: Some(0),
                },
                StoreOp::SetData {
                    path: "/b".into(),
                    data: b"b2".to_vec(),
                    expected_version: Some(7),
                },
            ])
            .await;
        assert!(matches!(result, Err(StoreError::BadVersion { .. })));
        assert_eq!(client.read("/a").await.unwrap().unwrap().0, b"a");

        client
            .transaction(vec![
                StoreOp::Check {
                    path: "/b".into(),
                    version: 0,
                },
                StoreOp::SetData {
                    path: "/a".into(),
                    data: b"a2".to_vec(),
                    expected_version: Some(0),
                },
                StoreOp::Create {
                    path: "/c".into(),
                    data: Vec::new(),
                    mode: CreateMode::Ephemeral,
                },
                StoreOp::Delete {
                    path: "/b".into(),
                    expected_version: None,
                },
            ])
            .await
            .unwrap();
        assert_eq!(client.read("/a").await.unwrap().unwrap().0, b"a2");
        assert!(store.exists("/c").await);
        assert!(!store.exists("/b").await);
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    #[tokio::test]
    async fn test_close_removes_ephemerals() {
        let store = InMemoryStore::new();
        let a = store.connect();
        let b = store.connect();
        assert_ne!(a.session_id(), b.session_id());

        a.create("/eph", b"", CreateMode::Ephemeral).await.unwrap();
        let stat = b.stat("/eph").await.unwrap().unwrap();
        assert_eq!(stat.ephemeral_owner, Some(a.session_id()));

        a.close().await;
        assert!(b.stat("/eph").await.unwrap().is_none());
        assert_eq!(
            a.read("/eph").await.unwrap_err(),
            StoreError::Closed
        );
    }

    #[tokio::test]
    async fn test_disconnect_and_session_loss() {
        let store = InMemoryStore::new();
        let client = store.connect();
        let mut events = client.connection_events();
        client.create("/eph", b"", CreateMode::Ephemeral).await.unwrap();

        client.simulate_disconnect();
        assert_eq!(events.recv().await.unwrap(), ConnectionState::Suspended);
        assert_eq!(
            client.read("/eph").await.unwrap_err(),
            StoreError::ConnectionLoss
        );

        let old = client.simulate_session_loss();
        assert_eq!(events.recv().await.unwrap(), ConnectionState::Lost);
        assert_ne!(old, client.session_id());

        client.simulate_reconnect();
        assert_eq!(events.recv().await.unwrap(), ConnectionState::Reconnected);

        // lingering until expired
        let stat = client.stat("/eph").await.unwrap().unwrap();
        assert_eq!(stat.ephemeral_owner, Some(old));
        store.expire_session(old).await;
        assert!(!store.exists("/eph").await);
    }

    #[tokio::test]
    async fn test_injected_failures_while_connected() {
        let store = InMemoryStore::new();
        let client = store.connect();
        client.fail_next_operations(2);

        assert!(client.is_connected());
        for _ in 0..2 {
            assert_eq!(
                client.create("/a", b"", CreateMode::Persistent).await.unwrap_err(),
                StoreError::ConnectionLoss
            );
        }
        assert_eq!(
            client.create("/a", b"", CreateMode::Persistent).await.unwrap(),
            CreateOutcome::Created
        );

        client.fail_next_operations(5);
        client.fail_next_operations(0);
        assert!(client.read("/a").await.unwrap().is_some());
    }

    // ========================================================================
    // Watches
    // ========================================================================

    #[tokio::test]
    async fn test_data_watch_on_absent_path() {
        let store = InMemoryStore::new();
        let client = store.connect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.watch_data("/w", tx).await.unwrap();

        client.create("/w", b"", CreateMode::Persistent).await.unwrap();
        client.set_data("/w", b"1", None).await.unwrap();
        client.delete("/w").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), WatchEvent::NodeCreated { path: "/w".into() });
        assert_eq!(rx.recv().await.unwrap(), WatchEvent::DataChanged { path: "/w".into() });
        assert_eq!(rx.recv().await.unwrap(), WatchEvent::NodeDeleted { path: "/w".into() });
    }

    #[tokio::test]
    async fn test_child_watch_and_unwatch() {
        let store = InMemoryStore::new();
        let client = store.connect();
        client.create("/p", b"", CreateMode::Persistent).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = client.watch_children("/p", tx).await.unwrap();

        client.create("/p/c", b"", CreateMode::Ephemeral).await.unwrap();
        client.set_data("/p/c", b"ignored", None).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchEvent::ChildrenChanged { path: "/p".into() }
        );
        assert!(rx.try_recv().is_err());

        client.unwatch(id).await.unwrap();
        assert_eq!(store.watch_count().await, 0);
        client.delete("/p/c").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expiry_fires_watches() {
        let store = InMemoryStore::new();
        let owner = store.connect();
        let observer = store.connect();
        owner.create("/p", b"", CreateMode::Persistent).await.unwrap();
        owner.create("/p/e", b"", CreateMode::Ephemeral).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        observer.watch_children("/p", tx.clone()).await.unwrap();
        observer.watch_data("/p/e", tx).await.unwrap();

        store.expire_session(owner.session_id()).await;

        let mut events = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        events.sort_by(|a, b| a.path().cmp(b.path()));
        assert_eq!(
            events,
            vec![
                WatchEvent::ChildrenChanged { path: "/p".into() },
                WatchEvent::NodeDeleted { path: "/p/e".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_sink_removes_watch() {
        let store = InMemoryStore::new();
        let client = store.connect();
        let (tx, rx) = mpsc::unbounded_channel();
        client.watch_data("/gone", tx).await.unwrap();
        drop(rx);

        client.create("/gone", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(store.watch_count().await, 0);
    }
}
