//! Last-resort supervision of the lifecycle machine itself.
//!
//! The watchdog polls [`ClusterLifecycle::health_check`] on a fixed
//! cadence. A machine that stays out of RUNNING for the doomsday window
//! gets torn down, rebuilt from nothing and restarted over freshly wiped
//! nodes, at most once per stuck episode. A dead control task is fatal:
//! the watchdog reports it up and lets the process exit.

use crate::error::{Result, WardenError};
use crate::lifecycle::ClusterLifecycle;
use crate::shutdown::ShutdownCoordinator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Tracks how long the machine has been out of RUNNING and whether the
/// doomsday reset already fired for the current stuck episode.
#[derive(Debug)]
pub(crate) struct DoomsdayTracker {
    since: Option<Instant>,
    fired: bool,
}

impl DoomsdayTracker {
    pub(crate) fn new() -> Self {
        Self {
            since: None,
            fired: false,
        }
    }

    /// Feed one health observation. Returns true when the doomsday reset
    /// should run now; it will not return true again until the machine
    /// has been seen RUNNING in between.
    pub(crate) fn observe(&mut self, running: bool, now: Instant, doomsday: Duration) -> bool {
        if running {
            self.since = None;
            self.fired = false;
            return false;
        }
        let since = *self.since.get_or_insert(now);
        if !self.fired && now.duration_since(since) >= doomsday {
            self.fired = true;
            self.since = Some(now);
            return true;
        }
        false
    }

    /// Restart the episode clock after an externally requested reset.
    pub(crate) fn restart_episode(&mut self, now: Instant) {
        self.since = Some(now);
        self.fired = false;
    }
}

/// Handle for requesting a full wipe-and-restart from outside the
/// watchdog loop, e.g. from an operator action.
#[derive(Clone)]
pub struct ResetHandle {
    flag: Arc<AtomicBool>,
}

impl ResetHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

pub struct Watchdog {
    lifecycle: Arc<ClusterLifecycle>,
    force_reset: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn new(lifecycle: Arc<ClusterLifecycle>) -> Self {
        Self {
            lifecycle,
            force_reset: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn reset_handle(&self) -> ResetHandle {
        ResetHandle {
            flag: Arc::clone(&self.force_reset),
        }
    }

    /// Start the machine and supervise it until shutdown. Returns an error
    /// only for the unrecoverable case of a dead control task.
    pub async fn run(&self, shutdown: ShutdownCoordinator) -> Result<()> {
        self.lifecycle.start();
        let mut tracker = DoomsdayTracker::new();

        loop {
            let timeouts = self.lifecycle.timeouts();
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                _ = tokio::time::sleep(timeouts.watchdog_poll) => {}
            }

            if self.force_reset.swap(false, Ordering::SeqCst) {
                info!("Operator requested full reset");
                self.full_reset().await;
                tracker.restart_episode(Instant::now());
                continue;
            }

            match self.lifecycle.health_check() {
                Ok(running) => {
                    if tracker.observe(running, Instant::now(), timeouts.doomsday) {
                        error!(
                            doomsday_s = timeouts.doomsday.as_secs(),
                            "Machine stuck past the doomsday window, wiping and rebuilding"
                        );
                        self.full_reset().await;
                    }
                }
                Err(e @ WardenError::ControlTaskDead) => {
                    error!(error = %e, "Control task died, giving up");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "Health check failed"),
            }
        }

        if tokio::time::timeout(shutdown.timeout(), self.lifecycle.stop())
            .await
            .is_err()
        {
            warn!("Graceful stop exceeded the shutdown budget, forcing");
            self.lifecycle.force_stop();
        }
        Ok(())
    }

    /// Destroy the machine's in-memory state, wipe every node's engine
    /// state and bootstrap again from nothing.
    async fn full_reset(&self) {
        self.lifecycle.force_stop();
        self.lifecycle.rebuild().await;
        self.lifecycle.start();
        // The wipe rides on the freshly started machine. Unreachable nodes
        // only downgrade this to a plain restart from START.
        if let Err(e) = self.lifecycle.wipe_and_restart_all().await {
            warn!(error = %e, "Wipe during full reset incomplete");
        }
    }
}
