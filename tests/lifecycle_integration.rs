//! Integration tests driving the full lifecycle machine against the
//! simulated engine cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;
use warden::admin::{DatabaseState, EngineNodeState};
use warden::lifecycle::{ClusterLifecycle, ClusterPhase, CoarseStatus, WardenDeps};
use warden::migrate::{ColumnDef, ColumnType, Row, TableLayout, Value};
use warden::sim::{InjectedError, SimCluster};

fn lifecycle_over(sim: &SimCluster) -> Arc<ClusterLifecycle> {
    Arc::new(ClusterLifecycle::new(
        common::fast_config(sim.addrs()),
        WardenDeps {
            connector: sim.connector(),
            store: sim.store(),
        },
    ))
}

fn layout(logical: &str, physical: &str) -> TableLayout {
    TableLayout {
        logical: logical.to_string(),
        physical: physical.to_string(),
        columns: vec![
            ColumnDef {
                name: "id".into(),
                ty: ColumnType::Integer,
            },
            ColumnDef {
                name: "name".into(),
                ty: ColumnType::Text,
            },
        ],
    }
}

fn rows(count: usize) -> Vec<Row> {
    (1..=count)
        .map(|i| Row {
            key: format!("k{:02}", i),
            columns: vec![
                ("id".into(), Value::Integer(i as i64)),
                ("name".into(), Value::Text(format!("row{}", i))),
            ],
        })
        .collect()
}

async fn wait_running(lifecycle: &ClusterLifecycle) {
    lifecycle
        .wait_until_phase(ClusterPhase::Running, Duration::from_secs(120))
        .await
        .expect("machine did not reach running");
}

#[tokio::test(start_paused = true)]
async fn test_eight_node_fresh_install_node_death_and_readmission() {
    let sim = SimCluster::new(8);
    sim.sim_store().seed_table(layout("users", "users_v1"), rows(5));
    let lifecycle = lifecycle_over(&sim);

    lifecycle.start();
    wait_running(&lifecycle).await;

    let endpoint = lifecycle.current_endpoint().expect("endpoint published");
    assert!(!endpoint.is_empty());
    assert!(sim.has_domain());
    assert!(sim.has_database());
    assert_eq!(sim.members().len(), 8);
    assert_eq!(sim.spare_count(), Some(2));

    // The seeded prior table was migrated on the way up.
    assert_eq!(sim.sim_store().converted_rows("users_v1_next").len(), 5);
    assert!(sim.sim_store().schema_applied());

    let status = lifecycle.status();
    assert_eq!(status.status, CoarseStatus::Running);
    assert!(status.last_recreation.is_some());
    assert_eq!(status.nodes_alive, 8);

    // Node 3's agent goes dark for longer than the death timeout: the
    // verdict is pronounced once and the node leaves the membership.
    sim.set_reachable(3, false);
    tokio::time::sleep(common::ms(1_500)).await;
    assert_eq!(sim.disable_log(), vec![3]);
    assert!(sim.is_disabled(3));
    assert!(!sim.members().contains(&3));
    assert_eq!(lifecycle.status().nodes_alive, 7);

    // The node comes back wiped: recovered, re-admitted (7 + 1 keeps the
    // membership even), spares recomputed.
    sim.restore_node(3);
    tokio::time::sleep(common::ms(1_500)).await;
    assert!(sim.members().contains(&3));
    assert_eq!(sim.add_members_log(), vec![vec![3]]);
    assert_eq!(sim.recover_log(), vec![3]);
    assert_eq!(sim.spare_count(), Some(2));
    assert!(lifecycle.health_check().unwrap());

    // Clean stop shuts the database down first.
    lifecycle.stop().await;
    assert_eq!(sim.database_state(), Some(DatabaseState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_create_domain_failure_escalates_to_full_wipe() {
    let sim = SimCluster::new(4);
    // Creation failures never self-heal: each one forces a wipe of all
    // four nodes before the machine returns to the start.
    sim.fail_next("create_domain", 3, InjectedError::Failed);
    let lifecycle = lifecycle_over(&sim);

    lifecycle.start();
    wait_running(&lifecycle).await;

    assert_eq!(sim.wipe_log().len(), 12);
    assert!(sim.has_domain());
    assert!(lifecycle.current_endpoint().is_some());
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failures_below_threshold_do_not_wipe() {
    let sim = SimCluster::new(4);
    sim.fail_next("connection_endpoint", 2, InjectedError::Failed);
    let lifecycle = lifecycle_over(&sim);

    lifecycle.start();
    wait_running(&lifecycle).await;

    // Two consecutive failures stay under the threshold of three.
    assert!(sim.wipe_log().is_empty());
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_third_consecutive_failure_wipes() {
    let sim = SimCluster::new(4);
    sim.fail_next("connection_endpoint", 3, InjectedError::Failed);
    let lifecycle = lifecycle_over(&sim);

    lifecycle.start();
    wait_running(&lifecycle).await;

    assert_eq!(sim.wipe_log().len(), 4);
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_health_check_unsticks_wedged_remote_call() {
    let sim = SimCluster::new(4);
    let mut config = common::fast_config(sim.addrs());
    // Take the per-call timeout out of the picture: only health_check's
    // interrupt can free a call that never returns.
    config.timeouts.remote_call = Duration::from_secs(3_600);
    let lifecycle = Arc::new(ClusterLifecycle::new(
        config,
        WardenDeps {
            connector: sim.connector(),
            store: sim.store(),
        },
    ));

    sim.wedge("get_domain");
    lifecycle.start();

    // Drive the clock; the machine parks inside the wedged call until a
    // health check notices the blown phase deadline.
    for _ in 0..100 {
        tokio::time::sleep(common::ms(20)).await;
        let _ = lifecycle.health_check();
    }

    sim.unwedge("get_domain");
    let mut running = false;
    for _ in 0..500 {
        tokio::time::sleep(common::ms(20)).await;
        if lifecycle.health_check().unwrap() {
            running = true;
            break;
        }
    }
    assert!(running, "wedged call was never unstuck");
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_nonoperational_database_escalates_after_grace() {
    let sim = SimCluster::new(4);
    let lifecycle = lifecycle_over(&sim);
    lifecycle.start();
    wait_running(&lifecycle).await;

    sim.set_database_state(Some(DatabaseState::NonOperational));
    tokio::time::sleep(common::ms(1_500)).await;
    // Past the grace window the machine left Running and unpublished the
    // endpoint.
    assert!(lifecycle.current_endpoint().is_none());

    sim.set_database_state(None);
    wait_running(&lifecycle).await;
    assert!(lifecycle.current_endpoint().is_some());
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_wipe_and_restart_all_rebootstraps() {
    let sim = SimCluster::new(4);
    let lifecycle = lifecycle_over(&sim);
    lifecycle.start();
    wait_running(&lifecycle).await;
    assert!(sim.wipe_log().is_empty());

    lifecycle.wipe_and_restart_all().await.unwrap();
    assert_eq!(sim.wipe_log().len(), 4);
    assert!(!sim.has_domain());

    tokio::time::sleep(common::ms(200)).await;
    wait_running(&lifecycle).await;
    assert!(sim.has_domain());
    assert!(lifecycle.current_endpoint().is_some());
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_update_schema_converts_new_tables() {
    let sim = SimCluster::new(4);
    let lifecycle = lifecycle_over(&sim);
    lifecycle.start();
    wait_running(&lifecycle).await;

    sim.sim_store()
        .seed_table(layout("orders", "orders_v1"), rows(3));
    lifecycle.update_schema().await.unwrap();

    assert_eq!(sim.sim_store().converted_rows("orders_v1_next").len(), 3);
    assert!(sim
        .sim_store()
        .dropped_tables()
        .contains(&"orders_v1".to_string()));
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_recover_host_for_move_repoints_disk() {
    let sim = SimCluster::new(4);
    let lifecycle = lifecycle_over(&sim);
    lifecycle.start();
    wait_running(&lifecycle).await;

    lifecycle.recover_host_for_move(2, 1).await.unwrap();
    assert_eq!(sim.disk_index(2), Some(1));
    assert_eq!(sim.disable_log(), vec![2]);
    assert_eq!(sim.recover_log(), vec![2]);

    // The steady-state check re-admits the moved node.
    tokio::time::sleep(common::ms(1_000)).await;
    assert!(sim.members().contains(&2));
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stopped_engine_node_is_restarted_not_rebuilt() {
    let sim = SimCluster::new(4);
    let lifecycle = lifecycle_over(&sim);
    lifecycle.start();
    wait_running(&lifecycle).await;

    sim.set_engine_state(2, EngineNodeState::Stopped);
    tokio::time::sleep(common::ms(1_000)).await;
    assert_eq!(sim.restart_log(), vec![2]);
    assert!(sim.rebuild_log().is_empty());

    sim.set_engine_state(4, EngineNodeState::Recovering);
    tokio::time::sleep(common::ms(1_000)).await;
    assert!(sim.rebuild_log().contains(&4));
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disk_failover_suspends_judgment() {
    let sim = SimCluster::new(4);
    let lifecycle = lifecycle_over(&sim);
    lifecycle.start();
    wait_running(&lifecycle).await;

    // Unreachable while its disk is relocating: no death verdict.
    sim.set_disk_failover(2, true);
    sim.set_reachable(2, false);
    tokio::time::sleep(common::ms(1_500)).await;
    assert!(sim.disable_log().is_empty());

    // Relocation ends while still unreachable: the death timer starts from
    // zero and runs to its verdict.
    sim.set_disk_failover(2, false);
    tokio::time::sleep(common::ms(1_500)).await;
    assert_eq!(sim.disable_log(), vec![2]);
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_existing_domain_accepted_within_dissent_tolerance() {
    let sim = SimCluster::new(8);
    // Long-running operations report progress over a few polls here, so the
    // drive loop sees Active reports before Completed.
    sim.set_monitor_ticks(3);

    // A first master establishes the domain and database, then steps down.
    let first = lifecycle_over(&sim);
    first.start();
    wait_running(&first).await;
    first.stop().await;

    // Two of eight agents deny the domain exists: still within the N-2
    // corroboration quorum, so the next master adopts it without drama.
    sim.set_deny_domain(7, true);
    sim.set_deny_domain(8, true);
    let second = lifecycle_over(&sim);
    second.start();
    wait_running(&second).await;
    assert!(sim.wipe_log().is_empty());
    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_escalation_wipe_survives_concurrent_health_checks() {
    let sim = SimCluster::new(8);

    // Establish the domain once, then step down.
    let first = lifecycle_over(&sim);
    first.start();
    wait_running(&first).await;
    first.stop().await;

    // Three of eight agents deny the domain: below the corroboration
    // quorum but not a majority, so every bootstrap attempt times out
    // until the third consecutive failure escalates to a full wipe.
    for node in 6..=8 {
        sim.set_deny_domain(node, true);
    }

    let second = lifecycle_over(&sim);
    second.start();

    // A watchdog-cadence health check runs alongside the whole time; it
    // must not interrupt the wipe once escalation kicks in.
    for _ in 0..1000 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = second.health_check();
        if !sim.wipe_log().is_empty() {
            break;
        }
    }
    assert_eq!(sim.wipe_log().len(), 8, "all nodes wiped in one pass");

    // The wipe removed the contested domain, so the next attempt
    // bootstraps from nothing and comes up clean.
    wait_running(&second).await;
    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_timeout_update_takes_effect_live() {
    let sim = SimCluster::new(4);
    let lifecycle = lifecycle_over(&sim);
    lifecycle.start();
    wait_running(&lifecycle).await;
    assert_eq!(lifecycle.current_phase(), ClusterPhase::Running);

    // Stretch the death window well past its configured value, then lose
    // a node. The steady loop reads the knobs every round, so the update
    // applies without a restart.
    let mut timeouts = lifecycle.timeouts();
    timeouts.node_death = Duration::from_secs(2);
    lifecycle.update_timeouts(timeouts);

    sim.set_reachable(2, false);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    // Past the original window, inside the updated one: no verdict yet.
    assert!(sim.disable_log().is_empty());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(sim.disable_log(), vec![2]);
    lifecycle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let sim = SimCluster::new(4);
    let lifecycle = lifecycle_over(&sim);
    lifecycle.start();
    lifecycle.start();
    wait_running(&lifecycle).await;
    assert!(lifecycle.is_started());
    lifecycle.stop().await;
    assert!(!lifecycle.is_started());
}
