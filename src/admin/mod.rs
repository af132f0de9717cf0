//! Client surface for the engine's administrative endpoint.
//!
//! Every cluster node runs one administrative agent ("MA") for the database
//! engine. The warden talks to exactly one agent at a time through the trait
//! objects defined here; the wire protocol behind them is out of scope and
//! supplied by the embedding binary (or by the simulated cluster in tests).
//!
//! Handles are tied to the connection that produced them: when the lifecycle
//! machine fails over to another node's agent it re-derives the domain and
//! database handles from the new connection before adopting it, and the old
//! triple is dropped wholesale.
//!
//! All methods return the crate [`Result`]; implementations classify engine
//! errors into [`WardenError::NotPresent`], [`WardenError::LostConnection`],
//! [`WardenError::Transient`], or a fatal variant so callers decide policy by
//! matching the variant, never by inspecting engine error codes.
//!
//! [`WardenError::NotPresent`]: crate::error::WardenError::NotPresent
//! [`WardenError::LostConnection`]: crate::error::WardenError::LostConnection
//! [`WardenError::Transient`]: crate::error::WardenError::Transient

pub mod monitor;
pub mod retry;

pub use monitor::{MonitorReport, MonitorState, OpMonitor};
pub use retry::RetryHelper;

use crate::error::Result;
use crate::types::{NodeAddr, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Credentials used both to connect to agents and to create the domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Opaque generated domain password.
    pub password: String,
}

impl Credentials {
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let password: String = (0..24)
            .map(|_| {
                let c: u8 = rng.gen_range(0..62);
                match c {
                    0..=9 => (b'0' + c) as char,
                    10..=35 => (b'a' + c - 10) as char,
                    _ => (b'A' + c - 36) as char,
                }
            })
            .collect();
        Self { password }
    }
}

/// Creation-time settings for the managed database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database name within the domain.
    pub name: String,
    /// Number of spare nodes held out of the active replica set.
    pub spare_count: u32,
}

/// Engine-reported state of the whole database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseState {
    /// Fully up, all replicas present.
    Operational,
    /// Up, tolerating one node failure.
    FaultTolerant,
    /// Up, tolerating multiple node failures.
    HaFaultTolerant,
    /// Cleanly stopped.
    Stopped,
    /// Up but not serving; escalates after a grace period.
    NonOperational,
    /// The agent could not determine the state.
    Unknown,
}

impl DatabaseState {
    /// Whether the database is serving traffic in some form.
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            DatabaseState::Operational
                | DatabaseState::FaultTolerant
                | DatabaseState::HaFaultTolerant
        )
    }
}

/// Engine-process state of a single node, as reported by the agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineNodeState {
    Running,
    Starting,
    Stopped,
    Recovering,
    Unknown,
}

/// Per-node status snapshot used by the steady-state check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: NodeId,
    /// Whether the node's agent answered.
    pub reachable: bool,
    /// Engine process state on the node.
    pub engine_state: EngineNodeState,
    /// Whether the node is part of the domain membership group.
    pub member: bool,
    /// Set while the node's supervisor is relocating its data disk; the
    /// steady-state check skips such nodes entirely.
    pub disk_failover_in_progress: bool,
}

/// Factory for agent connections. Injected into the lifecycle machine.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    /// Connect to the agent at `addr`. Fails with `LostConnection` when the
    /// agent is unreachable.
    async fn connect(
        &self,
        addr: &NodeAddr,
        credentials: &Credentials,
    ) -> Result<Box<dyn AdminConnection>>;

    /// Cheap reachability check, usable before credentials exist.
    async fn ping(&self, addr: &NodeAddr) -> Result<()>;
}

/// One live connection to a node's administrative agent.
#[async_trait]
pub trait AdminConnection: Send + Sync {
    /// The node whose agent this connection talks to.
    fn peer(&self) -> NodeAddr;

    /// Fetch the domain, or `NotPresent` when this agent has none.
    async fn get_domain(&self) -> Result<Box<dyn DomainHandle>>;

    /// Create the domain across the given members.
    async fn create_domain(
        &self,
        credentials: &Credentials,
        members: &[NodeAddr],
    ) -> Result<Box<dyn DomainHandle>>;

    /// Wipe the local engine state of one node. Used by the escalation
    /// path and by wipe-and-restart-all.
    async fn wipe_host(&self, node: NodeId) -> Result<()>;
}

/// Handle to the engine's cluster membership group.
#[async_trait]
pub trait DomainHandle: Send + Sync {
    /// Fetch the database by name, or `NotPresent`.
    async fn get_database(&self, name: &str) -> Result<Box<dyn DatabaseHandle>>;

    /// Create the database; returns a monitor for the long-running create.
    async fn create_database(&self, config: &DatabaseConfig) -> Result<Box<dyn OpMonitor>>;

    /// Current domain membership.
    async fn members(&self) -> Result<Vec<NodeId>>;

    /// Add nodes to the membership group. Callers must pass an even count.
    async fn add_members(&self, nodes: &[NodeId]) -> Result<Box<dyn OpMonitor>>;
}

/// Handle to the managed database itself.
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    async fn initialize(&self) -> Result<Box<dyn OpMonitor>>;
    async fn start(&self) -> Result<Box<dyn OpMonitor>>;
    async fn stop(&self) -> Result<()>;
    /// In-place engine upgrade; runs the schema migration sub-phase first.
    async fn upgrade(&self) -> Result<Box<dyn OpMonitor>>;
    /// Adjust the spare-node count after membership changes.
    async fn reconfigure_spares(&self, spare_count: u32) -> Result<Box<dyn OpMonitor>>;

    async fn database_state(&self) -> Result<DatabaseState>;
    /// The data-access connection string. Only meaningful once serving.
    async fn connection_endpoint(&self) -> Result<String>;
    /// Status of every node the engine knows about.
    async fn node_statuses(&self) -> Result<Vec<NodeReport>>;

    /// Restart a cleanly stopped node.
    async fn restart_node(&self, node: NodeId) -> Result<()>;
    /// Wipe and rebuild a node stuck in a non-stopped state, then re-admit
    /// it to the membership group.
    async fn rebuild_node(&self, node: NodeId) -> Result<()>;
    /// Bring a previously disabled node back into the membership group.
    async fn recover_host(&self, node: NodeId) -> Result<()>;
    /// Stop the engine waiting on a dead node.
    async fn disable_host(&self, node: NodeId) -> Result<()>;
    /// Point a node's engine process at a different data disk.
    async fn set_paths(&self, node: NodeId, disk_index: u32) -> Result<()>;
}
