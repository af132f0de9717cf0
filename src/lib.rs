//! Warden - lifecycle manager for a storage cluster's backing database engine.
//!
//! The warden runs on the elected master node and is the only component that
//! talks to the engine's per-node administrative agents. It bootstraps the
//! engine's membership domain and database from nothing, watches them while
//! they run, heals what it can, escalates what it cannot, and migrates the
//! schema across software versions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        wardend                           │
//! ├──────────────────────────────────────────────────────────┤
//! │  Watchdog: doomsday reset | forced reset | liveness       │
//! ├──────────────────────────────────────────────────────────┤
//! │  Lifecycle machine: bootstrap phases | steady-state check │
//! ├──────────────────────────────────────────────────────────┤
//! │  Schema migrator: checkpointed batch conversion           │
//! ├──────────────────────────────────────────────────────────┤
//! │  Admin boundary: agent connector | domain | database      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use warden::config::WardenConfig;
//! use warden::lifecycle::WardenDeps;
//! use warden::sim::SimCluster;
//!
//! #[tokio::main]
//! async fn main() -> warden::Result<()> {
//!     let sim = SimCluster::new(4);
//!     let config = WardenConfig::development(sim.addrs());
//!     let deps = WardenDeps {
//!         connector: sim.connector(),
//!         store: sim.store(),
//!     };
//!     warden::run(config, deps).await
//! }
//! ```

pub mod admin;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod migrate;
pub mod shutdown;
pub mod sim;
pub mod types;
pub mod watchdog;

// Re-exports
pub use error::{Result, WardenError};
pub use types::*;

use config::WardenConfig;
use lifecycle::{ClusterLifecycle, WardenDeps};
use shutdown::{ShutdownCoordinator, SignalHandler};
use std::sync::Arc;
use tracing::info;
use watchdog::Watchdog;

/// Run the warden with the given configuration and collaborators until an
/// OS shutdown signal arrives. Fails only on invalid configuration or a
/// dead control task.
pub async fn run(config: WardenConfig, deps: WardenDeps) -> Result<()> {
    config.validate()?;
    info!(
        database = %config.database_name,
        nodes = config.nodes.len(),
        "Starting warden"
    );

    let coordinator = ShutdownCoordinator::new();
    let lifecycle = Arc::new(ClusterLifecycle::new(config, deps));
    let watchdog = Watchdog::new(Arc::clone(&lifecycle));

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        SignalHandler::new(signal_coordinator).run().await;
    });

    let result = watchdog.run(coordinator).await;
    info!("Warden shutdown complete");
    result
}
