//! Published status of the managed database.
//!
//! Other components of the storage system locate the database through this
//! snapshot. The endpoint field is set only inside the terminal `Running`
//! transition; a partially bootstrapped cluster never publishes one.

use super::ClusterPhase;
use crate::types::Endpoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse externally visible status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoarseStatus {
    /// Waiting for agents or establishing the administrative connection.
    Connecting,
    /// Creating or initializing domain/database state.
    Initializing,
    /// Schema migration in progress.
    Upgrading,
    /// Applying the current schema and final checks.
    SettingUp,
    /// Database confirmed running; endpoint published.
    Running,
    /// In the failure path, possibly awaiting escalation.
    Failed,
}

/// Snapshot published by the lifecycle machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenStatus {
    pub status: CoarseStatus,
    /// Name of the current lifecycle phase.
    pub phase: ClusterPhase,
    /// Data-access connection string; present only while running.
    pub endpoint: Option<Endpoint>,
    /// Whether the cluster is mid-initialization (first bootstrap of the
    /// domain or database, as opposed to reconnecting to an existing one).
    pub initializing: bool,
    /// Whether domain membership is known to be empty.
    pub domain_empty: bool,
    /// Per-node liveness summary.
    pub nodes_alive: usize,
    pub nodes_total: usize,
    /// When the database was last successfully (re)created.
    pub last_recreation: Option<DateTime<Utc>>,
}

impl WardenStatus {
    pub fn initial(nodes_total: usize) -> Self {
        Self {
            status: CoarseStatus::Connecting,
            phase: ClusterPhase::Start,
            endpoint: None,
            initializing: false,
            domain_empty: true,
            nodes_alive: 0,
            nodes_total,
            last_recreation: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == CoarseStatus::Running
    }
}
