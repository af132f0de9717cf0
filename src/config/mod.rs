//! Configuration for the warden.
//!
//! Every timeout, threshold, and membership fact the lifecycle machine
//! consults lives here. The timing subset is hot-reloadable: callers hold a
//! `watch::Receiver<Timeouts>` and observe updates without a restart.

use crate::error::{Result, WardenError};
use crate::types::NodeAddr;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;

/// Main configuration for a warden instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Name of the managed database inside the domain.
    pub database_name: String,
    /// Static cluster membership: every node that may run an engine agent.
    pub nodes: Vec<NodeAddr>,
    /// Number of consecutive phase failures before a full wipe. Structural
    /// failures jump straight to this value.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
    /// Schema migration batch size (rows per `run_step` call).
    #[serde(default = "default_migration_batch")]
    pub migration_batch_size: usize,
    /// Target software schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// All timing knobs (hot-reloadable).
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Bounded-retry settings for single engine calls.
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_escalation_threshold() -> u32 {
    3
}

fn default_migration_batch() -> usize {
    100
}

fn default_schema_version() -> u32 {
    1
}

impl WardenConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(WardenError::InvalidConfig {
                field: "nodes".to_string(),
                reason: "Cluster membership must not be empty".to_string(),
            });
        }

        let mut ids: Vec<_> = self.nodes.iter().map(|n| n.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.nodes.len() {
            return Err(WardenError::InvalidConfig {
                field: "nodes".to_string(),
                reason: "Node IDs must be unique".to_string(),
            });
        }

        if self.database_name.is_empty() {
            return Err(WardenError::InvalidConfig {
                field: "database_name".to_string(),
                reason: "Database name must not be empty".to_string(),
            });
        }

        if self.escalation_threshold == 0 {
            return Err(WardenError::InvalidConfig {
                field: "escalation_threshold".to_string(),
                reason: "Escalation threshold must be at least 1".to_string(),
            });
        }

        if self.migration_batch_size == 0 {
            return Err(WardenError::InvalidConfig {
                field: "migration_batch_size".to_string(),
                reason: "Migration batch size must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Minimal configuration for local development and tests.
    pub fn development(nodes: Vec<NodeAddr>) -> Self {
        Self {
            database_name: "storedb".to_string(),
            nodes,
            escalation_threshold: 3,
            migration_batch_size: 100,
            schema_version: 1,
            timeouts: Timeouts::default(),
            retry: RetrySettings::default(),
        }
    }

    /// Number of nodes in the static membership.
    pub fn cluster_size(&self) -> usize {
        self.nodes.len()
    }

    /// Agents that must corroborate "exists" before it is believed.
    /// Inherited tuning for this engine's administrative protocol.
    pub fn exists_quorum(&self) -> usize {
        self.cluster_size().saturating_sub(2).max(1)
    }

    /// Spare-node count the database is reconfigured to after membership
    /// changes: one spare per started pair beyond the first four nodes.
    pub fn spare_count_for(total_nodes: usize) -> u32 {
        (total_nodes.saturating_sub(4) / 2) as u32
    }
}

/// Timing knobs, all hot-reloadable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Deadline for a single lifecycle phase.
    #[serde(with = "humantime_serde")]
    pub phase: Duration,
    /// Deadline for the agent-wait phase, usually longer than the rest.
    #[serde(with = "humantime_serde")]
    pub wait_for_agents: Duration,
    /// Deadline for one remote administrative call.
    #[serde(with = "humantime_serde")]
    pub remote_call: Duration,
    /// How often a long-running operation's monitor is polled.
    #[serde(with = "humantime_serde")]
    pub monitor_poll: Duration,
    /// Deadline for a long-running operation; observed progress resets it.
    #[serde(with = "humantime_serde")]
    pub operation: Duration,
    /// Steady-state check interval while running.
    #[serde(with = "humantime_serde")]
    pub steady_check: Duration,
    /// How long an agent must stay unreachable before its node is dead.
    #[serde(with = "humantime_serde")]
    pub node_death: Duration,
    /// How long a node may sit in an unexpected engine state before it is
    /// restarted or rebuilt.
    #[serde(with = "humantime_serde")]
    pub node_wrong_state: Duration,
    /// Grace period for a non-operational database before escalation.
    #[serde(with = "humantime_serde")]
    pub database_nonop_grace: Duration,
    /// Pause in the FAILURE state before returning to START.
    #[serde(with = "humantime_serde")]
    pub failure_backoff: Duration,
    /// Budget for the control task's liveness heartbeat.
    #[serde(with = "humantime_serde")]
    pub heartbeat_budget: Duration,
    /// Watchdog poll interval.
    #[serde(with = "humantime_serde")]
    pub watchdog_poll: Duration,
    /// Doomsday: continuous unhealthy time before wipe-and-rebuild.
    #[serde(with = "humantime_serde")]
    pub doomsday: Duration,
    /// How long external administrative calls wait for the running phase.
    #[serde(with = "humantime_serde")]
    pub external_op_wait: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            phase: Duration::from_secs(120),
            wait_for_agents: Duration::from_secs(600),
            remote_call: Duration::from_secs(30),
            monitor_poll: Duration::from_secs(2),
            operation: Duration::from_secs(300),
            steady_check: Duration::from_secs(10),
            node_death: Duration::from_secs(90),
            node_wrong_state: Duration::from_secs(120),
            database_nonop_grace: Duration::from_secs(60),
            failure_backoff: Duration::from_secs(5),
            heartbeat_budget: Duration::from_secs(60),
            watchdog_poll: Duration::from_secs(5),
            doomsday: Duration::from_secs(2 * 60 * 60),
            external_op_wait: Duration::from_secs(300),
        }
    }
}

/// Bounded retry settings for a single engine call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum attempts including the first.
    pub max_attempts: u32,
    /// Fixed sleep between attempts.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Hot-reload handle for the timing subset.
///
/// The lifecycle machine and watchdog read through the receiver so a config
/// update takes effect at the next blocking point, no restart needed.
#[derive(Debug)]
pub struct TimeoutsHandle {
    tx: watch::Sender<Timeouts>,
}

impl TimeoutsHandle {
    pub fn new(initial: Timeouts) -> (Self, watch::Receiver<Timeouts>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    /// Publish updated timeouts to every subscriber.
    pub fn update(&self, timeouts: Timeouts) {
        // send only fails when all receivers are gone, which means the
        // machine is already torn down
        let _ = self.tx.send(timeouts);
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(h) = s.strip_suffix('h') {
            h.parse::<u64>()
                .map(|v| Duration::from_secs(v * 3600))
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeAddr;

    fn nodes(n: u64) -> Vec<NodeAddr> {
        (1..=n)
            .map(|i| NodeAddr::new(i, format!("10.0.0.{}", i), 1862))
            .collect()
    }

    #[test]
    fn test_development_config_validates() {
        let config = WardenConfig::development(nodes(4));
        assert!(config.validate().is_ok());
        assert_eq!(config.escalation_threshold, 3);
    }

    #[test]
    fn test_empty_membership_rejected() {
        let config = WardenConfig::development(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_node_ids_rejected() {
        let mut ns = nodes(3);
        ns[2].id = 1;
        let config = WardenConfig::development(ns);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exists_quorum() {
        assert_eq!(WardenConfig::development(nodes(8)).exists_quorum(), 6);
        assert_eq!(WardenConfig::development(nodes(4)).exists_quorum(), 2);
        // Quorum never drops below one agent
        assert_eq!(WardenConfig::development(nodes(2)).exists_quorum(), 1);
    }

    #[test]
    fn test_spare_count() {
        assert_eq!(WardenConfig::spare_count_for(4), 0);
        assert_eq!(WardenConfig::spare_count_for(6), 1);
        assert_eq!(WardenConfig::spare_count_for(8), 2);
    }

    #[test]
    fn test_timeouts_reload() {
        let (handle, rx) = TimeoutsHandle::new(Timeouts::default());
        let mut updated = Timeouts::default();
        updated.node_death = Duration::from_secs(30);
        handle.update(updated.clone());
        assert_eq!(rx.borrow().node_death, Duration::from_secs(30));
    }

    #[test]
    fn test_humantime_roundtrip() {
        let json = serde_json::to_string(&Timeouts::default()).unwrap();
        let back: Timeouts = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Timeouts::default());
    }

    #[test]
    fn test_humantime_units() {
        #[derive(serde::Deserialize)]
        struct D {
            #[serde(with = "humantime_serde")]
            d: Duration,
        }
        let d: D = serde_json::from_str(r#"{"d":"2h"}"#).unwrap();
        assert_eq!(d.d, Duration::from_secs(7200));
        let d: D = serde_json::from_str(r#"{"d":"90s"}"#).unwrap();
        assert_eq!(d.d, Duration::from_secs(90));
        let d: D = serde_json::from_str(r#"{"d":"250ms"}"#).unwrap();
        assert_eq!(d.d, Duration::from_millis(250));
    }
}
