//! Replicator configuration.

use serde::{Deserialize, Serialize};

const HOUR_MS: u64 = 60 * 60 * 1000;

/// Tuning knobs for a [`Replicator`](crate::Replicator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// How often to send full-state digests to a random peer (in milliseconds).
    pub gossip_interval_ms: u64,
    /// How often to propagate buffered deltas (in milliseconds).
    pub delta_propagation_interval_ms: u64,
    /// How often pending changes are flushed to subscribers (in milliseconds).
    pub notify_subscribers_interval_ms: u64,
    /// How often the removed-node pruning steps run (in milliseconds).
    pub pruning_interval_ms: u64,
    /// Time after a node is removed before its data is pruned.
    pub max_pruning_dissemination_ms: u64,
    /// Lifetime of a performed-pruning marker.
    pub pruning_marker_time_to_live_ms: u64,
    /// Lifetime of a performed-pruning marker on durable keys.
    pub durable_pruning_marker_time_to_live_ms: u64,
    /// Maximum number of keys in one Status or Gossip message.
    pub max_delta_elements: usize,
    /// Merged delta operations beyond which full state is sent instead.
    pub max_delta_size: usize,
    pub delta_crdt_enabled: bool,
    /// Keys written through to the durable store. A trailing `*` matches
    /// by prefix.
    pub durable_keys: Vec<String>,
    /// Delta fan-out divisor, also the delta log cleanup cadence in ticks.
    pub gossip_interval_divisor: usize,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 2000,
            delta_propagation_interval_ms: 200,
            notify_subscribers_interval_ms: 500,
            pruning_interval_ms: 120_000,
            max_pruning_dissemination_ms: 300_000,
            pruning_marker_time_to_live_ms: 6 * HOUR_MS,
            durable_pruning_marker_time_to_live_ms: 10 * 24 * HOUR_MS,
            max_delta_elements: 500,
            max_delta_size: 50,
            delta_crdt_enabled: true,
            durable_keys: Vec::new(),
            gossip_interval_divisor: 5,
        }
    }
}

impl ReplicatorConfig {
    pub fn builder() -> ReplicatorConfigBuilder {
        ReplicatorConfigBuilder::new()
    }

    pub fn is_durable(&self, key: &str) -> bool {
        self.durable_keys.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => pattern == key,
        })
    }

    pub fn has_durable_keys(&self) -> bool {
        !self.durable_keys.is_empty()
    }

    pub fn pruning_marker_ttl_ms(&self, durable: bool) -> u64 {
        if durable {
            self.durable_pruning_marker_time_to_live_ms
        } else {
            self.pruning_marker_time_to_live_ms
        }
    }
}

/// Builder for replicator configuration.
pub struct ReplicatorConfigBuilder {
    config: ReplicatorConfig,
}

impl ReplicatorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ReplicatorConfig::default(),
        }
    }

    pub fn gossip_interval(mut self, ms: u64) -> Self {
        self.config.gossip_interval_ms = ms;
        self
    }

    pub fn delta_propagation_interval(mut self, ms: u64) -> Self {
        self.config.delta_propagation_interval_ms = ms;
        self
    }

    pub fn notify_subscribers_interval(mut self, ms: u64) -> Self {
        self.config.notify_subscribers_interval_ms = ms;
        self
    }

    pub fn pruning_interval(mut self, ms: u64) -> Self {
        self.config.pruning_interval_ms = ms;
        self
    }

    pub fn max_pruning_dissemination(mut self, ms: u64) -> Self {
        self.config.max_pruning_dissemination_ms = ms;
        self
    }

    pub fn pruning_marker_time_to_live(mut self, ms: u64) -> Self {
        self.config.pruning_marker_time_to_live_ms = ms;
        self
    }

    pub fn durable_pruning_marker_time_to_live(mut self, ms: u64) -> Self {
        self.config.durable_pruning_marker_time_to_live_ms = ms;
        self
    }

    pub fn max_delta_elements(mut self, max: usize) -> Self {
        self.config.max_delta_elements = max.max(1);
        self
    }

    pub fn max_delta_size(mut self, max: usize) -> Self {
        self.config.max_delta_size = max;
        self
    }

    pub fn delta_crdt_enabled(mut self, enabled: bool) -> Self {
        self.config.delta_crdt_enabled = enabled;
        self
    }

    pub fn durable_key(mut self, pattern: impl Into<String>) -> Self {
        self.config.durable_keys.push(pattern.into());
        self
    }

    pub fn gossip_interval_divisor(mut self, divisor: usize) -> Self {
        self.config.gossip_interval_divisor = divisor.max(1);
        self
    }

    pub fn build(self) -> ReplicatorConfig {
        self.config
    }
}

impl Default for ReplicatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
