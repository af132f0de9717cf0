//! Watchdog supervision against the simulated cluster: doomsday resets,
//! operator-forced resets and coordinated shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;
use warden::admin::DatabaseState;
use warden::lifecycle::{ClusterLifecycle, ClusterPhase, WardenDeps};
use warden::shutdown::ShutdownCoordinator;
use warden::sim::SimCluster;
use warden::watchdog::Watchdog;

fn lifecycle_with(sim: &SimCluster, config: warden::config::WardenConfig) -> Arc<ClusterLifecycle> {
    Arc::new(ClusterLifecycle::new(
        config,
        WardenDeps {
            connector: sim.connector(),
            store: sim.store(),
        },
    ))
}

#[tokio::test(start_paused = true)]
async fn test_doomsday_reset_fires_exactly_once_per_episode() {
    let sim = SimCluster::new(4);
    // Three dark nodes: the machine sits in agent-wait forever. The long
    // budget keeps the machine itself from failing, so only the watchdog
    // can act.
    sim.set_reachable(2, false);
    sim.set_reachable(3, false);
    sim.set_reachable(4, false);

    let mut config = common::fast_config(sim.addrs());
    config.timeouts.wait_for_agents = Duration::from_secs(3_600);
    let lifecycle = lifecycle_with(&sim, config);

    let coordinator = ShutdownCoordinator::new();
    let watchdog = Watchdog::new(Arc::clone(&lifecycle));
    let coord = coordinator.clone();
    let handle = tokio::spawn(async move { watchdog.run(coord).await });

    // Past the doomsday window: one full reset, whose wipe reaches only
    // the one live node.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sim.wipe_log(), vec![1]);

    // Still stuck much later: no second reset in the same episode.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sim.wipe_log(), vec![1]);

    coordinator.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_forced_reset_wipes_healthy_cluster() {
    let sim = SimCluster::new(4);
    let lifecycle = lifecycle_with(&sim, common::fast_config(sim.addrs()));

    let coordinator = ShutdownCoordinator::new();
    let watchdog = Watchdog::new(Arc::clone(&lifecycle));
    let reset = watchdog.reset_handle();
    let coord = coordinator.clone();
    let handle = tokio::spawn(async move { watchdog.run(coord).await });

    lifecycle
        .wait_until_phase(ClusterPhase::Running, Duration::from_secs(120))
        .await
        .unwrap();
    assert!(sim.wipe_log().is_empty());

    reset.request();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(sim.wipe_log().len(), 4);

    // The machine bootstraps back to running on its own.
    let mut running = false;
    for _ in 0..500 {
        tokio::time::sleep(common::ms(20)).await;
        if lifecycle.health_check().unwrap_or(false) {
            running = true;
            break;
        }
    }
    assert!(running, "machine never recovered after forced reset");

    coordinator.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_machine_and_database() {
    let sim = SimCluster::new(4);
    let lifecycle = lifecycle_with(&sim, common::fast_config(sim.addrs()));

    let coordinator = ShutdownCoordinator::new();
    let watchdog = Watchdog::new(Arc::clone(&lifecycle));
    let coord = coordinator.clone();
    let handle = tokio::spawn(async move { watchdog.run(coord).await });

    lifecycle
        .wait_until_phase(ClusterPhase::Running, Duration::from_secs(120))
        .await
        .unwrap();

    coordinator.shutdown();
    handle.await.unwrap().unwrap();
    assert!(!lifecycle.is_started());
    assert_eq!(sim.database_state(), Some(DatabaseState::Stopped));
}
