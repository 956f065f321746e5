//! Configuration for a cluster registry.
//!
//! # Configuration Profiles
//!
//! ```rust,no_run
//! use shardherd::cluster::{ClusterConfig, ClusterProfile};
//!
//! // Development profile - generous timeouts for debugging
//! let dev_config = ClusterConfig::from_profile(ClusterProfile::Development);
//!
//! // Production profile - balanced defaults
//! let prod_config = ClusterConfig::from_profile(ClusterProfile::Production);
//!
//! // Low-latency profile - short routing deadlines
//! let ll_config = ClusterConfig::from_profile(ClusterProfile::LowLatency);
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use super::validation::{validate_cluster_name, validate_root_path, validate_sequence_name};
use crate::constants::{
    DEFAULT_MAX_SHARDS, DEFAULT_ROOT_PATH, DEFAULT_ROUTE_TIMEOUT, DEFAULT_SEQUENCE_NAME,
    MAX_SHARDS_LIMIT,
};

/// Prefix of environment variables that become node attributes.
pub const NODE_ATTRIBUTE_ENV_PREFIX: &str = "SHARDHERD_NODE_ATTR_";

/// Validated configuration profiles.
///
/// | Profile | Use Case | Route Timeout |
/// |---------|----------|---------------|
/// | Development | Local testing | 60s |
/// | Production | General workloads | 30s |
/// | LowLatency | Interactive traffic | 2s |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterProfile {
    /// Relaxed timeouts for stepping through code in a debugger.
    ///
    /// **Not suitable for production use.**
    Development,

    /// Balanced configuration. Recommended for most deployments.
    Production,

    /// Short routing deadlines so callers fail over quickly.
    LowLatency,
}

impl ClusterProfile {
    /// Get a human-readable description of the profile.
    pub fn description(&self) -> &'static str {
        match self {
            ClusterProfile::Development => "Local development and testing",
            ClusterProfile::Production => "Balanced production workloads",
            ClusterProfile::LowLatency => "Short routing deadlines",
        }
    }

    /// Get all available profiles.
    pub fn all() -> &'static [ClusterProfile] {
        &[
            ClusterProfile::Development,
            ClusterProfile::Production,
            ClusterProfile::LowLatency,
        ]
    }
}

impl std::fmt::Display for ClusterProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterProfile::Development => write!(f, "development"),
            ClusterProfile::Production => write!(f, "production"),
            ClusterProfile::LowLatency => write!(f, "low-latency"),
        }
    }
}

impl std::str::FromStr for ClusterProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(ClusterProfile::Development),
            "production" | "prod" => Ok(ClusterProfile::Production),
            "low-latency" | "latency" | "ll" => Ok(ClusterProfile::LowLatency),
            _ => Err(format!(
                "Unknown profile '{}'. Valid profiles: development, production, low-latency",
                s
            )),
        }
    }
}

/// Configuration of one [`ClusterRegistry`](super::ClusterRegistry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Name of the cluster to join. Becomes a store path segment.
    pub cluster_name: String,

    /// Root under which cluster and sequence state lives.
    pub root_path: String,

    /// Shard count written to the cluster metadata when this node creates it.
    ///
    /// An existing cluster keeps the count it was created with.
    pub max_shards: u32,

    /// Node-id sequence the registry draws its id from.
    pub sequence_name: String,

    /// Deadline for routed requests.
    pub route_timeout: Duration,

    /// Retry re-registration with backoff after reconnecting.
    pub registration_retry: bool,

    /// Acknowledge shard stops immediately when no shards listener is
    /// registered to drain them.
    pub ack_stops_without_listeners: bool,

    /// Attributes merged into this node's registration.
    pub attributes: BTreeMap<String, String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            root_path: DEFAULT_ROOT_PATH.to_string(),
            max_shards: DEFAULT_MAX_SHARDS,
            sequence_name: DEFAULT_SEQUENCE_NAME.to_string(),
            route_timeout: DEFAULT_ROUTE_TIMEOUT,
            registration_retry: true,
            ack_stops_without_listeners: true,
            attributes: BTreeMap::new(),
        }
    }
}

impl ClusterConfig {
    /// Default configuration for `cluster_name`.
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Self::default()
        }
    }

    /// Create a configuration from a validated profile.
    pub fn from_profile(profile: ClusterProfile) -> Self {
        let defaults = Self::default();
        match profile {
            ClusterProfile::Development => Self {
                route_timeout: Duration::from_secs(60),
                ..defaults
            },
            ClusterProfile::Production => defaults,
            ClusterProfile::LowLatency => Self {
                route_timeout: Duration::from_secs(2),
                ..defaults
            },
        }
    }

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn with_root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = root_path.into();
        self
    }

    pub fn with_max_shards(mut self, max_shards: u32) -> Self {
        self.max_shards = max_shards;
        self
    }

    pub fn with_sequence_name(mut self, name: impl Into<String>) -> Self {
        self.sequence_name = name.into();
        self
    }

    pub fn with_route_timeout(mut self, timeout: Duration) -> Self {
        self.route_timeout = timeout;
        self
    }

    pub fn with_registration_retry(mut self, enabled: bool) -> Self {
        self.registration_retry = enabled;
        self
    }

    pub fn with_ack_stops_without_listeners(mut self, enabled: bool) -> Self {
        self.ack_stops_without_listeners = enabled;
        self
    }

    /// Add one node attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = validate_cluster_name(&self.cluster_name) {
            errors.push(e.to_string());
        }
        if let Err(e) = validate_sequence_name(&self.sequence_name) {
            errors.push(e.to_string());
        }
        if let Err(e) = validate_root_path(&self.root_path) {
            errors.push(e.to_string());
        }

        if self.max_shards == 0 || self.max_shards > MAX_SHARDS_LIMIT {
            errors.push(format!(
                "max_shards ({}) must be between 1 and {}",
                self.max_shards, MAX_SHARDS_LIMIT
            ));
        }

        if self.route_timeout.is_zero() {
            errors.push("route_timeout must be greater than zero".to_string());
        }

        if self.attributes.keys().any(String::is_empty) {
            errors.push("attribute keys cannot be empty".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Load configuration from environment variables.
    ///
    /// - `SHARDHERD_PROFILE`: base profile (default `production`)
    /// - `SHARDHERD_CLUSTER_NAME`
    /// - `SHARDHERD_ROOT_PATH`
    /// - `SHARDHERD_MAX_SHARDS`
    /// - `SHARDHERD_SEQUENCE_NAME`
    /// - `SHARDHERD_ROUTE_TIMEOUT_MS`
    /// - `SHARDHERD_REGISTRATION_RETRY`
    /// - `SHARDHERD_ACK_STOPS_WITHOUT_LISTENERS`
    /// - `SHARDHERD_NODE_ATTR_<KEY>`: node attribute `<key>` (lowercased)
    ///
    /// The result is validated before it is returned.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let profile = match std::env::var("SHARDHERD_PROFILE") {
            Ok(v) => v.parse::<ClusterProfile>()?,
            Err(_) => ClusterProfile::Production,
        };
        let mut config = Self::from_profile(profile);

        if let Ok(name) = std::env::var("SHARDHERD_CLUSTER_NAME") {
            config.cluster_name = name;
        }
        if let Ok(root) = std::env::var("SHARDHERD_ROOT_PATH") {
            config.root_path = root;
        }
        if let Ok(v) = std::env::var("SHARDHERD_MAX_SHARDS") {
            config.max_shards = v
                .parse()
                .map_err(|e| format!("Invalid SHARDHERD_MAX_SHARDS: {}", e))?;
        }
        if let Ok(name) = std::env::var("SHARDHERD_SEQUENCE_NAME") {
            config.sequence_name = name;
        }
        if let Ok(v) = std::env::var("SHARDHERD_ROUTE_TIMEOUT_MS") {
            let millis: u64 = v
                .parse()
                .map_err(|e| format!("Invalid SHARDHERD_ROUTE_TIMEOUT_MS: {}", e))?;
            config.route_timeout = Duration::from_millis(millis);
        }
        if let Ok(v) = std::env::var("SHARDHERD_REGISTRATION_RETRY") {
            config.registration_retry = parse_flag(&v);
        }
        if let Ok(v) = std::env::var("SHARDHERD_ACK_STOPS_WITHOUT_LISTENERS") {
            config.ack_stops_without_listeners = parse_flag(&v);
        }

        for (key, value) in std::env::vars() {
            if let Some(attr) = key.strip_prefix(NODE_ATTRIBUTE_ENV_PREFIX)
                && !attr.is_empty()
            {
                config.attributes.insert(attr.to_lowercase(), value);
            }
        }

        config.validate().map_err(|errors| errors.join("; "))?;
        Ok(config)
    }
}

fn parse_flag(value: &str) -> bool {
    value.to_lowercase() != "false" && value != "0"
}
