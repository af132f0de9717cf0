//! Long-running-operation monitors and the bounded drive loop.
//!
//! Create/initialize/start/upgrade/reconfigure are asynchronous on the engine
//! side: the agent hands back a monitor that is polled for progress. The
//! lifecycle machine drives every monitor through [`drive_to_completion`],
//! which owns the three ways such an operation can end early: an explicit
//! `Failed`/`Obsolete` report, a deadline with no observed progress, or an
//! interrupt from `health_check`/shutdown. On timeout the monitor's own
//! `cancel` is invoked so the remote side is not left with a stuck operation.

use crate::error::{Result, WardenError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of a long-running administrative operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    /// Still making progress.
    Active,
    Completed,
    Failed,
    /// A conflicting operation is already in flight elsewhere. Fatal to
    /// this attempt.
    Obsolete,
    Cancelled,
}

/// One progress observation from a monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub state: MonitorState,
    /// Progress percentage, 0..=100.
    pub percent: u8,
    pub message: String,
}

/// Handle to poll and cancel one long-running operation.
#[async_trait]
pub trait OpMonitor: Send + Sync {
    async fn poll(&self) -> Result<MonitorReport>;
    /// Cancel the operation on the remote side. Best effort.
    async fn cancel(&self);
}

/// Drive a monitor until it completes or the budget runs out.
///
/// Observed progress (a higher percentage than the last poll) resets the
/// deadline: a slow operation that keeps moving is never timed out. The
/// `beat` callback refreshes the control task's liveness heartbeat at every
/// blocking point.
pub async fn drive_to_completion(
    monitor: &dyn OpMonitor,
    what: &str,
    poll_interval: Duration,
    budget: Duration,
    interrupt: &Notify,
    mut beat: impl FnMut(),
) -> Result<()> {
    let mut deadline = Instant::now() + budget;
    let mut last_percent = 0u8;

    loop {
        beat();
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = interrupt.notified() => {
                warn!(operation = what, "Monitor wait interrupted, cancelling");
                monitor.cancel().await;
                return Err(WardenError::Interrupted);
            }
        }

        let report = match monitor.poll().await {
            Ok(r) => r,
            Err(e) => {
                // The poll itself failing says nothing about the remote
                // operation; cancel so it is not left running unobserved.
                monitor.cancel().await;
                return Err(e);
            }
        };

        match report.state {
            MonitorState::Completed => {
                info!(operation = what, "Operation completed");
                return Ok(());
            }
            MonitorState::Failed => {
                return Err(WardenError::OperationFailed(format!(
                    "{}: {}",
                    what, report.message
                )));
            }
            MonitorState::Obsolete => {
                return Err(WardenError::Obsolete(format!(
                    "{}: {}",
                    what, report.message
                )));
            }
            MonitorState::Cancelled => {
                return Err(WardenError::OperationFailed(format!(
                    "{}: cancelled remotely",
                    what
                )));
            }
            MonitorState::Active => {
                if report.percent > last_percent {
                    debug!(
                        operation = what,
                        percent = report.percent,
                        message = %report.message,
                        "Operation progress"
                    );
                    last_percent = report.percent;
                    deadline = Instant::now() + budget;
                }
                if Instant::now() >= deadline {
                    warn!(operation = what, "Operation deadline exceeded, cancelling");
                    monitor.cancel().await;
                    return Err(WardenError::Timeout(budget.as_millis() as u64));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// Scripted monitor that walks through a fixed report sequence.
    struct ScriptedMonitor {
        reports: Mutex<Vec<MonitorReport>>,
        polls: AtomicU32,
        cancelled: AtomicBool,
    }

    impl ScriptedMonitor {
        fn new(reports: Vec<MonitorReport>) -> Self {
            Self {
                reports: Mutex::new(reports),
                polls: AtomicU32::new(0),
                cancelled: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl OpMonitor for ScriptedMonitor {
        async fn poll(&self) -> Result<MonitorReport> {
            self.polls.fetch_add(1, Ordering::Relaxed);
            let mut reports = self.reports.lock();
            if reports.len() > 1 {
                Ok(reports.remove(0))
            } else {
                Ok(reports[0].clone())
            }
        }

        async fn cancel(&self) {
            self.cancelled.store(true, Ordering::Relaxed);
        }
    }

    fn report(state: MonitorState, percent: u8) -> MonitorReport {
        MonitorReport {
            state,
            percent,
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn test_drive_completes() {
        let monitor = ScriptedMonitor::new(vec![
            report(MonitorState::Active, 40),
            report(MonitorState::Active, 80),
            report(MonitorState::Completed, 100),
        ]);
        let interrupt = Notify::new();

        let result = drive_to_completion(
            &monitor,
            "create database",
            Duration::from_millis(5),
            Duration::from_secs(5),
            &interrupt,
            || {},
        )
        .await;

        assert!(result.is_ok());
        assert!(!monitor.cancelled.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_drive_fails_fast_on_failed_state() {
        let monitor = ScriptedMonitor::new(vec![report(MonitorState::Failed, 10)]);
        let interrupt = Notify::new();

        let result = drive_to_completion(
            &monitor,
            "start database",
            Duration::from_millis(5),
            Duration::from_secs(60),
            &interrupt,
            || {},
        )
        .await;

        // Fails immediately, well before the 60s budget
        assert!(matches!(result, Err(WardenError::OperationFailed(_))));
        assert_eq!(monitor.polls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_drive_obsolete_is_fatal() {
        let monitor = ScriptedMonitor::new(vec![report(MonitorState::Obsolete, 0)]);
        let interrupt = Notify::new();

        let result = drive_to_completion(
            &monitor,
            "upgrade",
            Duration::from_millis(5),
            Duration::from_secs(60),
            &interrupt,
            || {},
        )
        .await;

        assert!(matches!(result, Err(WardenError::Obsolete(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_timeout_cancels_monitor() {
        let monitor = ScriptedMonitor::new(vec![report(MonitorState::Active, 10)]);
        let interrupt = Notify::new();

        let result = drive_to_completion(
            &monitor,
            "initialize",
            Duration::from_millis(50),
            Duration::from_millis(200),
            &interrupt,
            || {},
        )
        .await;

        assert!(matches!(result, Err(WardenError::Timeout(_))));
        assert!(monitor.cancelled.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_deadline() {
        // Percent keeps climbing one per poll; the operation must survive
        // far past the nominal budget.
        let reports: Vec<_> = (1..=80)
            .map(|p| report(MonitorState::Active, p))
            .chain(std::iter::once(report(MonitorState::Completed, 100)))
            .collect();
        let monitor = ScriptedMonitor::new(reports);
        let interrupt = Notify::new();

        let result = drive_to_completion(
            &monitor,
            "create database",
            Duration::from_millis(50),
            Duration::from_millis(120),
            &interrupt,
            || {},
        )
        .await;

        assert!(result.is_ok());
        assert!(monitor.polls.load(Ordering::Relaxed) >= 80);
    }

    #[tokio::test]
    async fn test_interrupt_cancels_and_returns() {
        let monitor = Arc::new(ScriptedMonitor::new(vec![report(MonitorState::Active, 0)]));
        let interrupt = Arc::new(Notify::new());

        let m = Arc::clone(&monitor);
        let i = Arc::clone(&interrupt);
        let driver = tokio::spawn(async move {
            drive_to_completion(
                m.as_ref(),
                "start",
                Duration::from_secs(3600),
                Duration::from_secs(3600),
                &i,
                || {},
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupt.notify_waiters();

        let result = driver.await.unwrap();
        assert!(matches!(result, Err(WardenError::Interrupted)));
        assert!(monitor.cancelled.load(Ordering::Relaxed));
    }
}
