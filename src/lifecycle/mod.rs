//! The cluster lifecycle state machine and its supporting pieces.
//!
//! One [`ClusterLifecycle`] instance drives one cluster, and only on the
//! elected master node. The machine walks a strict forward order of phases
//! from `Start` to `Running`; any phase may escape to `Failure`, which
//! always routes back to `Start`.
//!
//! Module layout:
//! - [`machine`]: the control loop, phase handlers, escalation, and the
//!   externally invoked administrative operations
//! - [`steady`]: the periodic health check that runs while `Running`
//! - [`status`]: the published status other components read

pub mod machine;
pub mod status;
pub mod steady;

pub use machine::{ClusterLifecycle, WardenDeps};
pub use status::{CoarseStatus, WardenStatus};
pub use steady::NodeRecord;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Bootstrap phase of the cluster, in strict forward order.
///
/// The derived `Ord` follows declaration order and is what "has the machine
/// gotten at least this far" comparisons use. `Failure` sits outside the
/// forward order and is only ever matched structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterPhase {
    Start,
    WaitForAgents,
    SetupCredentials,
    Connect,
    GetDomain,
    CreateDomain,
    GetDatabase,
    CreateDatabase,
    InitializeDatabase,
    CheckDatabaseState,
    GetEndpoint,
    SchemaMigrate,
    ApplySchema,
    AboutToRun,
    Running,
    Failure,
}

impl ClusterPhase {
    /// Lowercase name used in logs and the published status.
    pub fn name(&self) -> &'static str {
        match self {
            ClusterPhase::Start => "start",
            ClusterPhase::WaitForAgents => "wait_for_agents",
            ClusterPhase::SetupCredentials => "setup_credentials",
            ClusterPhase::Connect => "connect",
            ClusterPhase::GetDomain => "get_domain",
            ClusterPhase::CreateDomain => "create_domain",
            ClusterPhase::GetDatabase => "get_database",
            ClusterPhase::CreateDatabase => "create_database",
            ClusterPhase::InitializeDatabase => "initialize_database",
            ClusterPhase::CheckDatabaseState => "check_database_state",
            ClusterPhase::GetEndpoint => "get_endpoint",
            ClusterPhase::SchemaMigrate => "schema_migrate",
            ClusterPhase::ApplySchema => "apply_schema",
            ClusterPhase::AboutToRun => "about_to_run",
            ClusterPhase::Running => "running",
            ClusterPhase::Failure => "failure",
        }
    }
}

/// Liveness pulse of the control task.
///
/// Refreshed at every blocking point so `health_check` can tell
/// "legitimately waiting" from "wedged": a wedged task either blew past its
/// phase deadline or stopped beating entirely.
#[derive(Debug)]
pub struct Pulse {
    heartbeat: Mutex<Instant>,
    deadline: Mutex<Option<Instant>>,
}

impl Pulse {
    pub fn new() -> Self {
        Self {
            heartbeat: Mutex::new(Instant::now()),
            deadline: Mutex::new(None),
        }
    }

    /// Refresh the liveness heartbeat.
    pub fn beat(&self) {
        *self.heartbeat.lock() = Instant::now();
    }

    /// Set (or clear) the absolute deadline of the current phase.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock() = deadline;
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.heartbeat.lock().elapsed()
    }

    /// Whether the control task has exceeded its phase deadline or its
    /// heartbeat budget.
    pub fn is_wedged(&self, heartbeat_budget: Duration) -> bool {
        if let Some(deadline) = *self.deadline.lock() {
            if Instant::now() >= deadline {
                return true;
            }
        }
        self.heartbeat_age() >= heartbeat_budget
    }
}

impl Default for Pulse {
    fn default() -> Self {
        Self::new()
    }
}
