//! Node-id allocation from a self-resizing two-level namespace.
//!
//! A sequence hands out 16-bit node ids `(group << 8) | index`. Each claimed
//! id is an ephemeral reservation at
//! `<root>/sequences/<name>/<group hex>/<index hex>`, so ids of crashed
//! processes return to the pool when their sessions end. The first
//! [`RESERVED_NODE_IDS`] ids of group 0 are never handed out.
//!
//! # Architecture
//!
//! ```text
//! NodeIdAllocator ──acquire(name)──▶ once per name ──▶ Sequence
//!                                                       │
//!                     ┌─────────────────────────────────┤
//!                     ▼                                 ▼
//!           data watch on reservation        child watch on sequence path
//!                     │                                 │
//!                     └──────────▶ watcher task ◀───────┘
//!                                      ▲
//!                          connection state changes
//! ```
//!
//! The watcher task owns all reactions:
//! - reservation deleted while the session is alive: fatal
//! - connection restored: the reservation is re-claimed; a foreign live
//!   owner is fatal
//! - groups created or deleted elsewhere: node width recomputed
//!
//! # Growth and Shrink
//!
//! Claiming an index at or above [`GROW_THRESHOLD`] eagerly creates the next
//! group so other nodes never wait for it. Claiming at or below
//! [`SHRINK_THRESHOLD`] deletes empty higher groups. Node width follows the
//! highest group through [`NODE_WIDTH_STEPS`], never dropping below what this
//! node's own id needs.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::background_tasks::BackgroundTaskRegistry;
use super::error::{ClusterError, ClusterResult, StoreError};
use super::fatal::{SharedFatalHandler, default_handler};
use super::metrics;
use super::retry;
use super::store::{
    ClaimOutcome, ConnectionState, CoordinationStore, CreateMode, CreateOutcome, SessionId, WatchEvent, WatchId,
    claim_ephemeral, ensure_path, join_path,
};
use super::topology::NodeId;
use super::validation::{validate_root_path, validate_sequence_name};
use crate::constants::{
    GROW_THRESHOLD, MAX_SEQUENCE_GROUP, NODE_WIDTH_STEPS, RESERVED_NODE_IDS, SEQUENCE_GROUP_SIZE, SEQUENCES_SEGMENT,
    SHRINK_THRESHOLD,
};

/// Attempts per group before moving on, bounding livelock under heavy churn.
const CLAIM_ATTEMPTS_PER_GROUP: usize = 2 * SEQUENCE_GROUP_SIZE as usize;

const WATCHER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound of the random pause after losing a reservation race.
const RACE_JITTER_MAX_MS: u64 = 5;

// =============================================================================
// Id Encoding
// =============================================================================

/// Combine a group and an index into a node id.
#[inline]
pub fn encode_node_id(group: u8, index: u8) -> NodeId {
    (NodeId::from(group) << 8) | NodeId::from(index)
}

/// Split a node id into its group and index.
#[inline]
pub fn decode_node_id(node_id: NodeId) -> (u8, u8) {
    ((node_id >> 8) as u8, (node_id & 0xFF) as u8)
}

/// Smallest non-negative value missing from a sorted list of distinct values.
///
/// Values are at least their position, and once `list[i] != i` every later
/// position differs too, so the first gap is found by bisection.
pub fn gap_find(list: &[u16]) -> u16 {
    let len = list.len();
    if len == 0 || usize::from(list[len - 1]) == len - 1 {
        return len as u16;
    }

    let (mut lo, mut hi) = (0usize, len - 1);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if usize::from(list[mid]) == mid {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo as u16
}

/// Bits needed for node ids when `highest_group` is the highest existing group.
pub fn width_for_group(highest_group: u8) -> u8 {
    NODE_WIDTH_STEPS
        .iter()
        .find(|(bound, _)| *bound >= highest_group)
        .map(|(_, bits)| *bits)
        .unwrap_or(16)
}

fn segment_name(value: u8) -> String {
    format!("{:02x}", value)
}

fn parse_segment(name: &str) -> Option<u8> {
    u8::from_str_radix(name, 16).ok()
}

#[derive(Debug, Serialize, Deserialize)]
struct ReservationRecord {
    claimed_at: i64,
}

fn reservation_data() -> ClusterResult<Vec<u8>> {
    Ok(serde_json::to_vec(&ReservationRecord {
        claimed_at: Utc::now().timestamp_millis(),
    })?)
}

// =============================================================================
// Sequence
// =============================================================================

/// State shared between a [`Sequence`] and its watcher task.
#[derive(Debug)]
struct SequenceState {
    name: String,
    node_id: NodeId,
    reservation_path: String,
    sequence_path: String,
    width: AtomicU8,
    released: AtomicBool,
    claimed_session: AtomicU64,
}

impl SequenceState {
    fn group(&self) -> u8 {
        decode_node_id(self.node_id).0
    }

    /// Recompute the width from the groups that currently exist.
    async fn refresh_width(&self, store: &dyn CoordinationStore) -> ClusterResult<u8> {
        let highest = store
            .list_children(&self.sequence_path)
            .await?
            .unwrap_or_default()
            .iter()
            .filter_map(|name| parse_segment(name))
            .max()
            .unwrap_or(0);
        let width = width_for_group(highest).max(width_for_group(self.group()));

        let previous = self.width.swap(width, Ordering::SeqCst);
        if previous != width {
            info!(
                sequence = %self.name,
                node_id = self.node_id,
                previous,
                width,
                "Node width changed"
            );
        }
        metrics::set_node_width(&self.name, width);
        Ok(width)
    }
}

/// A claimed node id.
///
/// The reservation lives until [`Sequence::release`] or until the session
/// ends. Dropping the sequence stops its watcher but keeps the reservation.
pub struct Sequence {
    state: Arc<SequenceState>,
    store: Arc<dyn CoordinationStore>,
    watches: Mutex<Vec<WatchId>>,
    tasks: Mutex<Option<BackgroundTaskRegistry>>,
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("name", &self.state.name)
            .field("node_id", &format_args!("{:#06x}", self.state.node_id))
            .field("width", &self.node_width())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Sequence {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// The claimed id.
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.state.node_id
    }

    /// Bits needed to represent ids up to the highest existing group.
    #[inline]
    pub fn node_width(&self) -> u8 {
        self.state.width.load(Ordering::SeqCst)
    }

    pub fn group(&self) -> u8 {
        decode_node_id(self.state.node_id).0
    }

    pub fn index(&self) -> u8 {
        decode_node_id(self.state.node_id).1
    }

    /// Store path of the reservation.
    pub fn reservation_path(&self) -> &str {
        &self.state.reservation_path
    }

    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::SeqCst)
    }

    /// Stop watching and delete the reservation, freeing the id.
    ///
    /// Idempotent.
    pub async fn release(&self) -> ClusterResult<()> {
        if self.state.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tasks = self.tasks.lock().ok().and_then(|mut tasks| tasks.take());
        if let Some(mut tasks) = tasks {
            tasks.shutdown_all_with_timeout(WATCHER_SHUTDOWN_TIMEOUT).await;
        }

        let watches: Vec<WatchId> = self
            .watches
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        for id in watches {
            if let Err(e) = self.store.unwatch(id).await {
                debug!(sequence = %self.state.name, error = %e, "Failed to remove watch");
            }
        }

        self.store.delete(&self.state.reservation_path).await?;
        info!(
            sequence = %self.state.name,
            node_id = self.state.node_id,
            "Node id released"
        );
        Ok(())
    }
}

// =============================================================================
// Allocator
// =============================================================================

/// Claims node ids, once per sequence name per allocator.
///
/// One allocator is created alongside the store connection and handed to
/// whatever needs node ids; its lifetime is the connection's.
pub struct NodeIdAllocator {
    store: Arc<dyn CoordinationStore>,
    root: String,
    sequences: DashMap<String, Arc<OnceCell<Arc<Sequence>>>>,
    fatal: SharedFatalHandler,
    max_group: u8,
}

impl fmt::Debug for NodeIdAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdAllocator")
            .field("root", &self.root)
            .field("sequences", &self.sequences.len())
            .finish()
    }
}

impl NodeIdAllocator {
    /// Allocator storing reservations under `root`.
    pub fn new(store: Arc<dyn CoordinationStore>, root: impl Into<String>) -> ClusterResult<Self> {
        let root = root.into();
        validate_root_path(&root)?;
        Ok(Self {
            store,
            root,
            sequences: DashMap::new(),
            fatal: default_handler(),
            max_group: MAX_SEQUENCE_GROUP,
        })
    }

    /// Replace the handler invoked when a reservation is lost or stolen.
    pub fn with_fatal_handler(mut self, handler: SharedFatalHandler) -> Self {
        self.fatal = handler;
        self
    }

    #[cfg(test)]
    fn with_max_group(mut self, max_group: u8) -> Self {
        self.max_group = max_group;
        self
    }

    /// Claim (or return the already claimed) id of sequence `name`.
    ///
    /// Concurrent callers for the same name share one claim. A failed claim
    /// is retried by the next call.
    pub async fn acquire(&self, name: &str) -> ClusterResult<Arc<Sequence>> {
        validate_sequence_name(name)?;
        let cell = self.sequences.entry(name.to_string()).or_default().clone();
        cell.get_or_try_init(|| self.claim(name)).await.cloned()
    }

    /// The sequence claimed under `name`, if any.
    pub fn sequence(&self, name: &str) -> Option<Arc<Sequence>> {
        self.sequences
            .get(name)
            .and_then(|cell| cell.get().cloned())
    }

    /// Release every claimed sequence.
    pub async fn release_all(&self) -> ClusterResult<()> {
        let claimed: Vec<Arc<Sequence>> = self
            .sequences
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        for sequence in claimed {
            sequence.release().await?;
        }
        Ok(())
    }

    fn sequence_path(&self, name: &str) -> String {
        join_path(&join_path(&self.root, SEQUENCES_SEGMENT), name)
    }

    async fn claim(&self, name: &str) -> ClusterResult<Arc<Sequence>> {
        let store = self.store.as_ref();
        let sequence_path = self.sequence_path(name);
        retry::with_store_policy(|| ensure_path(store, &sequence_path), StoreError::is_connection_error).await?;

        for group in 0..=self.max_group {
            if let Some((index, path)) = self.claim_in_group(name, &sequence_path, group).await? {
                return self.finish_claim(name, sequence_path, group, index, path).await;
            }
        }

        error!(sequence = name, "Node-id space exhausted");
        Err(ClusterError::AllocationExhausted(name.to_string()))
    }

    /// Try to claim a free index in `group`; `None` when the group is full.
    async fn claim_in_group(
        &self,
        name: &str,
        sequence_path: &str,
        group: u8,
    ) -> ClusterResult<Option<(u8, String)>> {
        let store = self.store.as_ref();
        let group_path = join_path(sequence_path, &segment_name(group));
        let reserved = if group == 0 { RESERVED_NODE_IDS } else { 0 };

        for attempt in 0..CLAIM_ATTEMPTS_PER_GROUP {
            store.create(&group_path, &[], CreateMode::Persistent).await?;

            let Some(stat) = store.stat(&group_path).await? else {
                continue;
            };
            if stat.num_children + usize::from(reserved) >= usize::from(SEQUENCE_GROUP_SIZE) {
                debug!(sequence = name, group, "Group full, trying next");
                return Ok(None);
            }

            let Some(children) = store.list_children(&group_path).await? else {
                continue;
            };
            let mut taken: Vec<u16> = children
                .iter()
                .filter_map(|child| parse_segment(child))
                .map(u16::from)
                .chain(0..u16::from(reserved))
                .collect();
            taken.sort_unstable();
            taken.dedup();

            let index = gap_find(&taken);
            if index >= SEQUENCE_GROUP_SIZE {
                return Ok(None);
            }
            let index = index as u8;
            let path = join_path(&group_path, &segment_name(index));

            match store.create(&path, &reservation_data()?, CreateMode::Ephemeral).await {
                Ok(CreateOutcome::Created) => return Ok(Some((index, path))),
                Ok(CreateOutcome::AlreadyExists) => {
                    debug!(sequence = name, group, index, attempt, "Lost reservation race, retrying");
                    metrics::record_sequence_race(name);
                    // Spread out claimants that keep picking the same gap.
                    let jitter = fastrand::u64(0..=RACE_JITTER_MAX_MS);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                }
                Err(StoreError::NoNode(_)) => {
                    debug!(sequence = name, group, "Group removed concurrently, recreating");
                }
                Err(e) => {
                    metrics::record_store_failure("create", e.as_metric_label());
                    return Err(e.into());
                }
            }
        }

        warn!(sequence = name, group, "Giving up on contended group");
        Ok(None)
    }

    async fn finish_claim(
        &self,
        name: &str,
        sequence_path: String,
        group: u8,
        index: u8,
        reservation_path: String,
    ) -> ClusterResult<Arc<Sequence>> {
        let store = self.store.as_ref();
        let node_id = encode_node_id(group, index);

        if index >= GROW_THRESHOLD && group < self.max_group {
            let next = join_path(&sequence_path, &segment_name(group + 1));
            if store.create(&next, &[], CreateMode::Persistent).await? == CreateOutcome::Created {
                info!(sequence = name, group = group + 1, "Created next node-id group");
            }
        } else if index <= SHRINK_THRESHOLD {
            self.shrink(name, &sequence_path, group).await?;
        }

        let state = Arc::new(SequenceState {
            name: name.to_string(),
            node_id,
            reservation_path,
            sequence_path,
            width: AtomicU8::new(width_for_group(group)),
            released: AtomicBool::new(false),
            claimed_session: AtomicU64::new(store.session_id()),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let connection_events = self.store.connection_events();
        let data_watch = store.watch_data(&state.reservation_path, tx.clone()).await?;
        let child_watch = store.watch_children(&state.sequence_path, tx).await?;
        state.refresh_width(store).await?;

        let mut tasks = BackgroundTaskRegistry::new();
        tasks.spawn(
            format!("sequence-watcher:{}", name),
            watch_reservation(
                state.clone(),
                self.store.clone(),
                self.fatal.clone(),
                rx,
                connection_events,
            ),
        );

        metrics::record_sequence_claim(name);
        info!(
            sequence = name,
            node_id = format_args!("{:#06x}", node_id),
            group,
            index,
            width = state.width.load(Ordering::SeqCst),
            "Node id claimed"
        );

        Ok(Arc::new(Sequence {
            state,
            store: self.store.clone(),
            watches: Mutex::new(vec![data_watch, child_watch]),
            tasks: Mutex::new(Some(tasks)),
        }))
    }

    /// Delete empty groups above `group`, highest first.
    ///
    /// Stops at the first group still in use so the remaining groups stay
    /// contiguous from zero.
    async fn shrink(&self, name: &str, sequence_path: &str, group: u8) -> ClusterResult<()> {
        let store = self.store.as_ref();
        let mut higher: Vec<u8> = store
            .list_children(sequence_path)
            .await?
            .unwrap_or_default()
            .iter()
            .filter_map(|child| parse_segment(child))
            .filter(|g| *g > group)
            .collect();
        higher.sort_unstable_by(|a, b| b.cmp(a));

        for g in higher {
            let path = join_path(sequence_path, &segment_name(g));
            match store.delete(&path).await {
                Ok(_) => debug!(sequence = name, group = g, "Removed unused node-id group"),
                Err(StoreError::NotEmpty(_)) => {
                    debug!(sequence = name, group = g, "Highest node-id group in use, shrink stops");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// =============================================================================
// Watcher
// =============================================================================

async fn watch_reservation(
    state: Arc<SequenceState>,
    store: Arc<dyn CoordinationStore>,
    fatal: SharedFatalHandler,
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    mut connection: broadcast::Receiver<ConnectionState>,
) {
    loop {
        let outcome = tokio::select! {
            event = events.recv() => match event {
                Some(event) => on_watch_event(&state, store.as_ref(), event).await,
                None => return,
            },
            change = connection.recv() => match change {
                Ok(change) => on_connection_change(&state, store.as_ref(), change).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(sequence = %state.name, skipped, "Missed connection events");
                    if store.is_connected() {
                        on_connection_change(&state, store.as_ref(), ConnectionState::Reconnected).await
                    } else {
                        Ok(())
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                fatal.on_fatal(&e);
                return;
            }
            Err(e) => {
                warn!(sequence = %state.name, error = %e, "Sequence watcher step failed");
            }
        }
    }
}

async fn on_watch_event(
    state: &SequenceState,
    store: &dyn CoordinationStore,
    event: WatchEvent,
) -> ClusterResult<()> {
    if state.released.load(Ordering::SeqCst) {
        return Ok(());
    }

    match event {
        WatchEvent::NodeDeleted { path } if path == state.reservation_path => {
            if !store.is_connected() {
                debug!(sequence = %state.name, "Reservation removed while disconnected");
                return Ok(());
            }
            let claimed = state.claimed_session.load(Ordering::SeqCst);
            if store.session_id() != claimed {
                debug!(sequence = %state.name, "Reservation of an earlier session removed");
                return Ok(());
            }
            if store.stat(&path).await?.is_none() {
                error!(
                    sequence = %state.name,
                    node_id = state.node_id,
                    path = %path,
                    "Reservation removed while session is alive"
                );
                return Err(ClusterError::ReservationLost { path });
            }
            Ok(())
        }
        WatchEvent::ChildrenChanged { path } if path == state.sequence_path => {
            state.refresh_width(store).await.map(|_| ())
        }
        other => {
            debug!(sequence = %state.name, event = ?other, "Ignoring sequence watch event");
            Ok(())
        }
    }
}

async fn on_connection_change(
    state: &SequenceState,
    store: &dyn CoordinationStore,
    change: ConnectionState,
) -> ClusterResult<()> {
    match change {
        ConnectionState::Reconnected => {
            if state.released.load(Ordering::SeqCst) {
                return Ok(());
            }
            let result = retry::with_registration_policy(
                || reclaim(state, store),
                ClusterError::is_retryable,
            )
            .await;
            if let Err(e) = &result {
                warn!(sequence = %state.name, error = %e, "Failed to re-claim reservation");
            }
            result?;
            state.refresh_width(store).await.map(|_| ())
        }
        ConnectionState::Suspended | ConnectionState::Lost => {
            debug!(sequence = %state.name, state = %change, "Store connection interrupted");
            Ok(())
        }
        ConnectionState::Connected => Ok(()),
    }
}

/// Re-create the reservation for the current session.
async fn reclaim(state: &SequenceState, store: &dyn CoordinationStore) -> ClusterResult<()> {
    let group_path = join_path(&state.sequence_path, &segment_name(state.group()));
    ensure_path(store, &group_path).await?;

    let previous: [SessionId; 1] = [state.claimed_session.load(Ordering::SeqCst)];
    match claim_ephemeral(store, &state.reservation_path, &reservation_data()?, &previous).await? {
        ClaimOutcome::HeldByOther { owner } => {
            error!(
                sequence = %state.name,
                node_id = state.node_id,
                owner = ?owner,
                "Node id reservation held by someone else"
            );
            Err(ClusterError::NodeIdCollision {
                node_id: state.node_id,
                owner,
            })
        }
        outcome => {
            state.claimed_session.store(store.session_id(), Ordering::SeqCst);
            info!(
                sequence = %state.name,
                node_id = state.node_id,
                outcome = ?outcome,
                "Reservation re-claimed after reconnect"
            );
            Ok(())
        }
    }
}
