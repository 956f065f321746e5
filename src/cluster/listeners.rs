//! Listener traits and isolated listener invocation.
//!
//! Listeners are called from inside an actor task, in registration order.
//! A listener that returns an error or panics is logged and counted; the
//! remaining listeners still receive the notification and the actor keeps
//! running. Listeners must not block: long work (draining a shard, for
//! example) belongs in a spawned task that reports back later.
//!
//! # Usage
//!
//! ```rust
//! use shardherd::cluster::{ClusterTopology, ListenerResult, ListenerSet, TopologyListener};
//! use std::sync::Arc;
//!
//! let mut listeners: ListenerSet<dyn TopologyListener> = ListenerSet::new();
//! let id = listeners.add(Arc::new(|topology: &ClusterTopology| -> ListenerResult {
//!     println!("{} nodes", topology.len());
//!     Ok(())
//! }));
//!
//! listeners.notify("topology", |l| l.on_topology(&ClusterTopology::empty(None)));
//! assert!(listeners.remove(id));
//! ```

use std::error::Error;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use super::metrics;
use super::topology::{ClusterTopology, ShardSet};

/// Result returned by listener callbacks.
pub type ListenerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Receives topology snapshots from [`ClusterDiscovery`](super::ClusterDiscovery)
/// and [`ClusterRegistry`](super::ClusterRegistry).
pub trait TopologyListener: Send + Sync {
    fn on_topology(&self, topology: &ClusterTopology) -> ListenerResult;
}

impl<F> TopologyListener for F
where
    F: Fn(&ClusterTopology) -> ListenerResult + Send + Sync,
{
    fn on_topology(&self, topology: &ClusterTopology) -> ListenerResult {
        self(topology)
    }
}

/// Notified when the local node gains or loses leadership.
pub trait LeadershipListener: Send + Sync {
    fn on_leadership_changed(&self, is_leader: bool, topology: &ClusterTopology) -> ListenerResult;
}

impl<F> LeadershipListener for F
where
    F: Fn(bool, &ClusterTopology) -> ListenerResult + Send + Sync,
{
    fn on_leadership_changed(&self, is_leader: bool, topology: &ClusterTopology) -> ListenerResult {
        self(is_leader, topology)
    }
}

/// Notified about changes to the local node's shard sets.
///
/// After `shards_stopping`, the listener drains the shards and then calls
/// [`ClusterRegistry::shards_stopped`](super::ClusterRegistry::shards_stopped).
pub trait ShardsListener: Send + Sync {
    /// Shards newly added to the local active set.
    fn shards_started(&self, shards: &ShardSet) -> ListenerResult;

    /// Shards moved from the local active set to the stopping set.
    fn shards_stopping(&self, shards: &ShardSet) -> ListenerResult;
}

/// Handle returned when a listener is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    pub(crate) fn next() -> Self {
        ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ordered set of listeners of one kind.
pub struct ListenerSet<L: ?Sized> {
    listeners: Vec<(ListenerId, Arc<L>)>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.push((id, listener));
        id
    }

    /// Insert under an id allocated elsewhere.
    pub fn insert(&mut self, id: ListenerId, listener: Arc<L>) {
        self.listeners.push((id, listener));
    }

    pub fn get(&self, id: ListenerId) -> Option<&Arc<L>> {
        self.listeners
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, l)| l)
    }

    /// Returns false if `id` was not registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Invoke `f` on every listener, isolating failures.
    ///
    /// Returns the number of listeners that failed.
    pub fn notify<F>(&self, kind: &'static str, mut f: F) -> usize
    where
        F: FnMut(&L) -> ListenerResult,
    {
        let mut failures = 0;
        for (id, listener) in &self.listeners {
            if !invoke(kind, *id, || f(listener)) {
                failures += 1;
            }
        }
        failures
    }
}

/// Run one listener callback, catching errors and panics.
///
/// Returns true on success.
pub fn invoke<F>(kind: &'static str, id: ListenerId, f: F) -> bool
where
    F: FnOnce() -> ListenerResult,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(kind, listener = ?id, error = %e, "Listener returned an error");
            metrics::record_listener_failure(kind);
            false
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(kind, listener = ?id, panic = %message, "Listener panicked");
            metrics::record_listener_failure(kind);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut set: ListenerSet<dyn TopologyListener> = ListenerSet::new();

        let s1 = seen.clone();
        set.add(Arc::new(move |_: &ClusterTopology| -> ListenerResult {
            s1.lock().unwrap().push(1);
            Err("boom".into())
        }));
        set.add(Arc::new(|_: &ClusterTopology| -> ListenerResult { panic!("listener bug") }));
        let s3 = seen.clone();
        set.add(Arc::new(move |_: &ClusterTopology| -> ListenerResult {
            s3.lock().unwrap().push(3);
            Ok(())
        }));

        let topology = ClusterTopology::empty(None);
        let failures = set.notify("topology", |l| l.on_topology(&topology));

        assert_eq!(failures, 2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_add_remove() {
        let mut set: ListenerSet<dyn LeadershipListener> = ListenerSet::new();
        let a = set.add(Arc::new(|_: bool, _: &ClusterTopology| -> ListenerResult { Ok(()) }));
        let b = set.add(Arc::new(|_: bool, _: &ClusterTopology| -> ListenerResult { Ok(()) }));
        assert_ne!(a, b);
        assert_eq!(set.len(), 2);

        assert!(set.remove(a));
        assert!(!set.remove(a));
        assert!(set.get(b).is_some());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_shards_listener_receives_sets() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);
        impl ShardsListener for Recorder {
            fn shards_started(&self, shards: &ShardSet) -> ListenerResult {
                self.0.lock().unwrap().push(format!("start {}", shards));
                Ok(())
            }
            fn shards_stopping(&self, shards: &ShardSet) -> ListenerResult {
                self.0.lock().unwrap().push(format!("stop {}", shards));
                Ok(())
            }
        }

        let recorder = Arc::new(Recorder::default());
        let mut set: ListenerSet<dyn ShardsListener> = ListenerSet::new();
        set.add(recorder.clone());

        let shards = ShardSet::from_shards(4, [2, 3]).unwrap();
        set.notify("shards", |l| l.shards_started(&shards));
        set.notify("shards", |l| l.shards_stopping(&shards));

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["start {2,3}".to_string(), "stop {2,3}".to_string()]
        );
    }
}
