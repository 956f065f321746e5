//! Centralized coordination constants.
//!
//! This module consolidates the magic numbers used by the membership layer.
//! Having them in one place makes it easier to:
//!
//! - Understand the layout of the coordination store
//! - Update values consistently
//! - Keep the node-id namespace rules next to each other
//!
//! # Categories
//!
//! - **Store Layout**: path segments under the configured root
//! - **Node-ID Namespace**: group/index widths, reserved ids, growth thresholds
//! - **Cluster Defaults**: shard counts, timeouts, well-known handler names

use std::time::Duration;

// =============================================================================
// Store Layout
// =============================================================================

/// Default root under which all cluster and sequence state lives.
pub const DEFAULT_ROOT_PATH: &str = "/discovery";

/// Segment holding one child per cluster name.
pub const CLUSTERS_SEGMENT: &str = "clusters";

/// Segment holding one child per node-id sequence name.
pub const SEQUENCES_SEGMENT: &str = "sequences";

// =============================================================================
// Node-ID Namespace
// =============================================================================

/// Number of indices inside one group (`index ∈ [0, 255]`).
pub const SEQUENCE_GROUP_SIZE: u16 = 256;

/// Highest group number that may ever be created.
pub const MAX_SEQUENCE_GROUP: u8 = 0xFF;

/// Ids `0..RESERVED_NODE_IDS` of group 0 are never handed to real nodes.
///
/// They identify system-defined sequences in identifier generators that embed
/// the node id.
pub const RESERVED_NODE_IDS: u8 = 8;

/// Claiming an index at or above this value eagerly creates the next group.
pub const GROW_THRESHOLD: u8 = 0xCF;

/// Claiming an index at or below this value removes empty higher groups.
pub const SHRINK_THRESHOLD: u8 = 0x9F;

/// Monotone step table mapping the highest existing group to the number of
/// bits identifier generators need to embed a node id.
///
/// Each entry is `(highest group covered, bits)`; the first entry whose group
/// bound is `>=` the highest group wins.
pub const NODE_WIDTH_STEPS: [(u8, u8); 9] = [
    (0x00, 8),
    (0x01, 9),
    (0x03, 10),
    (0x07, 11),
    (0x0F, 12),
    (0x1F, 13),
    (0x3F, 14),
    (0x7F, 15),
    (0xFF, 16),
];

// =============================================================================
// Cluster Defaults
// =============================================================================

/// Default number of shards a new cluster is created with.
pub const DEFAULT_MAX_SHARDS: u32 = 256;

/// Upper bound accepted for `max_shards`.
pub const MAX_SHARDS_LIMIT: u32 = 1 << 20;

/// Default sequence used to derive a registry's node id.
pub const DEFAULT_SEQUENCE_NAME: &str = "nodes";

/// Default deadline for routed requests.
pub const DEFAULT_ROUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum length for cluster and sequence names.
pub const MAX_NAME_LENGTH: usize = 128;

/// Built-in handler that carries shard-stop acknowledgments to the leader.
pub const SHARDS_STOPPED_HANDLER: &str = "shardherd.shards_stopped";

/// Node attribute marking a node that should be drained and receive no new shards.
pub const DEPARTING_ATTRIBUTE: &str = "shardherd.departing";

/// Exit status used when a fatal coordination condition terminates the process.
pub const FATAL_EXIT_CODE: i32 = 70;
