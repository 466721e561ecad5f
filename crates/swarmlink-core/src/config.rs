//! Client configuration.
//!
//! Every tunable constant of the client lives here with a serde default, so a
//! partial TOML file only overrides what it names:
//!
//! ```toml
//! max_retry_count = 4
//!
//! [status_policy]
//! moved = [421, 404]
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SwarmError, SwarmResult};

/// Seed nodes used to bootstrap the pool when it is empty or too small.
pub const DEFAULT_SEED_NODES: &[&str] = &[
    "https://storage.seed1.loki.network:4433",
    "https://storage.seed3.loki.network:4433",
    "https://public.loki.foundation:4433",
];

/// How a protocol status code is treated by the RPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Stale or faulty node: count a failure, retry elsewhere
    NodeFault,
    /// Local clock is off: recalibrate and surface `ClockOutOfSync`
    ClockOutOfSync,
    /// The node no longer owns the account: invalidate and refetch the swarm
    SwarmMoved,
    /// Anything else: retried like a node fault, then surfaced
    Unclassified,
}

/// Maps status codes to a [`StatusClass`].
///
/// The "moved" and "faulty node" sets overlap in practice, so both are
/// configurable instead of fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPolicy {
    pub node_fault: BTreeSet<u16>,
    pub clock_out_of_sync: BTreeSet<u16>,
    pub moved: BTreeSet<u16>,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            node_fault: [400, 500, 502, 503].into_iter().collect(),
            clock_out_of_sync: [406].into_iter().collect(),
            moved: [421].into_iter().collect(),
        }
    }
}

impl StatusPolicy {
    /// Classify a non-success status code.
    ///
    /// `moved` is checked first so an override can steal a code from the
    /// node-fault set.
    pub fn classify(&self, status: u16) -> StatusClass {
        if self.moved.contains(&status) {
            StatusClass::SwarmMoved
        } else if self.clock_out_of_sync.contains(&status) {
            StatusClass::ClockOutOfSync
        } else if self.node_fault.contains(&status) {
            StatusClass::NodeFault
        } else {
            StatusClass::Unclassified
        }
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Bootstrap seed node URLs
    pub seed_nodes: Vec<String>,
    /// Refresh the pool from a seed when it holds fewer nodes than this
    pub min_pool_size: usize,
    /// A cached swarm smaller than this is not trusted
    pub min_swarm_size: usize,
    /// Consecutive failures before a node is evicted
    pub failure_threshold: u32,
    /// Attempts per logical RPC operation
    pub max_retry_count: usize,
    /// Relays per onion path
    pub onion_path_len: usize,
    /// Envelopes per downstream processing batch
    pub batch_size: usize,
    /// Default message TTL in milliseconds
    pub message_ttl_ms: u64,
    /// Config TTL extension applied by group admins, in milliseconds
    pub config_ttl_extension_ms: u64,
    pub poll: PollConfig,
    pub status_policy: StatusPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seed_nodes: DEFAULT_SEED_NODES.iter().map(|s| s.to_string()).collect(),
            min_pool_size: 12,
            min_swarm_size: 3,
            failure_threshold: 3,
            max_retry_count: 6,
            onion_path_len: 3,
            batch_size: 512,
            message_ttl_ms: 14 * 24 * 60 * 60 * 1000,
            config_ttl_extension_ms: 14 * 24 * 60 * 60 * 1000,
            poll: PollConfig::default(),
            status_policy: StatusPolicy::default(),
        }
    }
}

/// Poller timing, all in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// One-to-one poller interval after a successful cycle
    pub user_interval_ms: u64,
    /// One-to-one poller ceiling while backing off
    pub user_max_interval_ms: u64,
    /// Multiplier applied to the one-to-one interval after a failure
    pub user_backoff_factor: f64,
    /// Legacy group poller lower bound
    pub legacy_min_interval_ms: u64,
    /// Legacy group poller upper bound
    pub legacy_max_interval_ms: u64,
    /// Time since last message at which the legacy interval saturates
    pub legacy_limit_ms: u64,
    /// Assumed time since last message when none is known
    pub legacy_default_since_ms: u64,
    /// v2 group poller interval
    pub group_interval_ms: u64,
    /// v2 group poller interval after a failed cycle
    pub group_error_interval_ms: u64,
    /// Community poller interval
    pub community_interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            user_interval_ms: 2_000,
            user_max_interval_ms: 15_000,
            user_backoff_factor: 1.2,
            legacy_min_interval_ms: 4_000,
            legacy_max_interval_ms: 4 * 60 * 1000,
            legacy_limit_ms: 12 * 60 * 60 * 1000,
            legacy_default_since_ms: 5 * 60 * 1000,
            group_interval_ms: 3_000,
            group_error_interval_ms: 10_000,
            community_interval_ms: 4_000,
        }
    }
}

impl PollConfig {
    pub fn user_interval(&self) -> Duration {
        Duration::from_millis(self.user_interval_ms)
    }

    pub fn user_max_interval(&self) -> Duration {
        Duration::from_millis(self.user_max_interval_ms)
    }

    pub fn group_interval(&self) -> Duration {
        Duration::from_millis(self.group_interval_ms)
    }

    pub fn group_error_interval(&self) -> Duration {
        Duration::from_millis(self.group_error_interval_ms)
    }

    pub fn community_interval(&self) -> Duration {
        Duration::from_millis(self.community_interval_ms)
    }
}

impl ClientConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(input: &str) -> SwarmResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| SwarmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file. A missing file yields the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> SwarmResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> SwarmResult<String> {
        toml::to_string_pretty(self).map_err(|e| SwarmError::Config(e.to_string()))
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> SwarmResult<()> {
        if self.max_retry_count == 0 {
            return Err(SwarmError::Config("max_retry_count must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(SwarmError::Config("batch_size must be at least 1".into()));
        }
        if self.failure_threshold == 0 {
            return Err(SwarmError::Config("failure_threshold must be at least 1".into()));
        }
        if self.poll.legacy_min_interval_ms > self.poll.legacy_max_interval_ms {
            return Err(SwarmError::Config(
                "legacy_min_interval_ms exceeds legacy_max_interval_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_millis(self.message_ttl_ms)
    }
}
