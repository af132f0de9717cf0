//! Shared helpers for integration tests.

use std::time::Duration;
use warden::config::{Timeouts, WardenConfig};
use warden::types::NodeAddr;

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// All timers shrunk so paused-clock tests run through whole lifecycle
/// scenarios in simulated milliseconds.
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        phase: ms(500),
        wait_for_agents: ms(2_000),
        remote_call: ms(200),
        monitor_poll: ms(10),
        operation: ms(1_000),
        steady_check: ms(50),
        node_death: ms(300),
        node_wrong_state: ms(300),
        database_nonop_grace: ms(200),
        failure_backoff: ms(20),
        heartbeat_budget: ms(500),
        watchdog_poll: ms(20),
        doomsday: ms(3_000),
        external_op_wait: ms(5_000),
    }
}

pub fn fast_config(addrs: Vec<NodeAddr>) -> WardenConfig {
    let mut config = WardenConfig::development(addrs);
    config.timeouts = fast_timeouts();
    config.retry.backoff = ms(10);
    config
}
