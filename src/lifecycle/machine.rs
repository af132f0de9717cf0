//! The master-resident control loop that bootstraps and babysits the
//! managed database.
//!
//! One control task walks the [`ClusterPhase`] order, talking to one agent
//! at a time. All shared lifecycle state sits behind a single async mutex:
//! phase handlers run serially on the control task, and externally invoked
//! operations (`recover_host`, `update_schema`, ...) take the same mutex so
//! they can never interleave with a bootstrap or recovery pass. The small
//! [`Pulse`] lives outside that mutex so `health_check` can detect a wedged
//! control task without blocking on it.

use crate::admin::monitor::drive_to_completion;
use crate::admin::retry::RetryHelper;
use crate::admin::{
    AdminConnection, AdminConnector, Credentials, DatabaseConfig, DatabaseHandle, DomainHandle,
    OpMonitor,
};
use crate::config::{Timeouts, TimeoutsHandle, WardenConfig};
use crate::error::{Result, WardenError};
use crate::lifecycle::status::{CoarseStatus, WardenStatus};
use crate::lifecycle::steady::NodeRecord;
use crate::lifecycle::{ClusterPhase, Pulse};
use crate::migrate::{RowStore, SchemaMigrator, StepResult};
use crate::types::{Endpoint, NodeId};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Collaborators injected into the lifecycle machine.
///
/// The machine is an explicitly constructed, explicitly owned component:
/// its caller (normally the watchdog) holds the one active instance.
pub struct WardenDeps {
    /// Factory for administrative agent connections.
    pub connector: Arc<dyn AdminConnector>,
    /// The engine's row-oriented data API, used by the schema migration.
    pub store: Arc<dyn RowStore>,
}

/// State owned by the control task and guarded by the single mutex.
pub(crate) struct Shared {
    /// The one live agent connection; replaced wholesale on failover.
    pub(crate) conn: Option<Box<dyn AdminConnection>>,
    pub(crate) domain: Option<Box<dyn DomainHandle>>,
    pub(crate) database: Option<Box<dyn DatabaseHandle>>,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) nodes: Vec<NodeRecord>,
    /// Consecutive failures since the last RUNNING.
    pub(crate) failures: u32,
    /// Round-robin cursor over the node list for failover.
    pub(crate) conn_cursor: usize,
    /// Endpoint derived in GetEndpoint, published only at Running.
    pub(crate) endpoint_candidate: Option<String>,
    /// Grace timer for a non-serving database in steady state.
    pub(crate) db_nonop_since: Option<Instant>,
    /// True while bootstrapping a domain/database that did not exist.
    pub(crate) initializing: bool,
}

impl Shared {
    fn new(config: &WardenConfig) -> Self {
        Self {
            conn: None,
            domain: None,
            database: None,
            credentials: None,
            nodes: config.nodes.iter().cloned().map(NodeRecord::new).collect(),
            failures: 0,
            conn_cursor: 0,
            endpoint_candidate: None,
            db_nonop_since: None,
            initializing: false,
        }
    }

    /// Drop the connection and every handle derived from it.
    fn drop_connection(&mut self) {
        self.database = None;
        self.domain = None;
        self.conn = None;
    }
}

pub(crate) struct LifecycleInner {
    pub(crate) config: WardenConfig,
    pub(crate) deps: WardenDeps,
    pub(crate) shared: AsyncMutex<Shared>,
    pub(crate) pulse: Pulse,
    pub(crate) interrupt: Notify,
    pub(crate) retry: RetryHelper,
    timeouts_rx: watch::Receiver<Timeouts>,
    timeouts_handle: TimeoutsHandle,
    phase_tx: watch::Sender<ClusterPhase>,
    status: parking_lot::RwLock<WardenStatus>,
    stop_requested: AtomicBool,
    restart_requested: AtomicBool,
    control_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Outcome of the quorum-flavored existence poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QuorumDecision {
    Exists,
    Absent,
    /// More than half deny existence: fatal to this attempt.
    MajorityNegative,
    /// Not enough corroboration either way yet.
    Inconclusive,
}

/// Decide from one polling round over all agents.
///
/// "Exists" needs at least `N-2` agreeing agents, "absent" needs all `N`,
/// and more than `N/2` negative answers fail the attempt outright.
/// Inherited tuning for this engine's administrative protocol; the
/// thresholds are preserved verbatim, not re-derived.
pub(crate) fn decide_presence(exists: usize, absent: usize, total: usize) -> QuorumDecision {
    let quorum = total.saturating_sub(2).max(1);
    if exists >= quorum {
        QuorumDecision::Exists
    } else if absent == total {
        QuorumDecision::Absent
    } else if absent > total / 2 {
        QuorumDecision::MajorityNegative
    } else {
        QuorumDecision::Inconclusive
    }
}

/// The cluster lifecycle state machine. One instance per cluster, active
/// only on the elected master node.
pub struct ClusterLifecycle {
    inner: Arc<LifecycleInner>,
}

impl ClusterLifecycle {
    pub fn new(config: WardenConfig, deps: WardenDeps) -> Self {
        let (timeouts_handle, timeouts_rx) = TimeoutsHandle::new(config.timeouts.clone());
        let (phase_tx, _) = watch::channel(ClusterPhase::Start);
        let status = WardenStatus::initial(config.nodes.len());
        let shared = Shared::new(&config);
        let retry = RetryHelper::new(config.retry.clone());
        Self {
            inner: Arc::new(LifecycleInner {
                config,
                deps,
                shared: AsyncMutex::new(shared),
                pulse: Pulse::new(),
                interrupt: Notify::new(),
                retry,
                timeouts_rx,
                timeouts_handle,
                phase_tx,
                status: parking_lot::RwLock::new(status),
                stop_requested: AtomicBool::new(false),
                restart_requested: AtomicBool::new(false),
                control_task: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Begin the control loop. Idempotent: ignored if already running.
    pub fn start(&self) {
        let mut task = self.inner.control_task.lock();
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                debug!("Lifecycle already running, start ignored");
                return;
            }
        }
        self.inner.stop_requested.store(false, Ordering::SeqCst);
        self.inner.pulse.beat();
        let inner = Arc::clone(&self.inner);
        info!(
            cluster_size = inner.config.nodes.len(),
            database = %inner.config.database_name,
            "Starting cluster lifecycle"
        );
        *task = Some(tokio::spawn(async move { inner.run_loop().await }));
    }

    /// Request clean shutdown and wait for the control loop to exit. Stops
    /// the database first when it is still running under this master.
    pub async fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.interrupt.notify_waiters();
        let task = self.inner.control_task.lock().take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Control task panicked during stop");
                }
            }
        }
    }

    /// Abandon graceful shutdown immediately.
    pub fn force_stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.control_task.lock().take() {
            handle.abort();
        }
        info!("Lifecycle force-stopped");
    }

    /// Reset all in-memory machine state. Only sound while stopped; the
    /// watchdog uses this as its "destroy and reconstruct" step.
    pub async fn rebuild(&self) {
        let mut shared = self.inner.shared.lock().await;
        *shared = Shared::new(&self.inner.config);
        *self.inner.status.write() = WardenStatus::initial(self.inner.config.nodes.len());
        self.inner.restart_requested.store(false, Ordering::SeqCst);
        let _ = self.inner.phase_tx.send(ClusterPhase::Start);
        info!("Lifecycle state rebuilt");
    }

    /// Whether the cluster is in the RUNNING state. As a side effect,
    /// interrupts the control task if it has blown its phase deadline or
    /// missed its liveness heartbeat; this is how a wedged remote call is
    /// unstuck without crashing the process.
    pub fn health_check(&self) -> Result<bool> {
        let finished = self
            .inner
            .control_task
            .lock()
            .as_ref()
            .map(|h| h.is_finished());
        match finished {
            Some(true) if !self.inner.stop_requested.load(Ordering::SeqCst) => {
                return Err(WardenError::ControlTaskDead);
            }
            None => return Ok(false),
            _ => {}
        }

        let budget = self.inner.timeouts_rx.borrow().heartbeat_budget;
        if self.inner.pulse.is_wedged(budget) {
            warn!("Control task wedged, interrupting its current wait");
            self.inner.interrupt.notify_waiters();
        }

        Ok(self.inner.status.read().is_running())
    }

    /// The published data-access connection string, if running.
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.inner.status.read().endpoint.clone()
    }

    /// Snapshot of the published status.
    pub fn status(&self) -> WardenStatus {
        self.inner.status.read().clone()
    }

    pub fn current_phase(&self) -> ClusterPhase {
        *self.inner.phase_tx.borrow()
    }

    /// Whether a control task exists and has not finished.
    pub fn is_started(&self) -> bool {
        self.inner
            .control_task
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Hot-reload the timing knobs.
    pub fn update_timeouts(&self, timeouts: Timeouts) {
        self.inner.timeouts_handle.update(timeouts);
    }

    /// Current timing knobs, including hot-reloaded values.
    pub fn timeouts(&self) -> Timeouts {
        self.inner.timeouts_rx.borrow().clone()
    }

    /// Block until the machine reaches `target`, bounded by `timeout`.
    pub async fn wait_until_phase(&self, target: ClusterPhase, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.phase_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|p| *p == target))
            .await
            .map_err(|_| WardenError::PhaseWaitTimeout(target.name().to_string()))?
            .map_err(|_| WardenError::ControlTaskDead)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Externally invoked administrative operations. Each waits for the
    // RUNNING state and holds the state mutex for its whole duration.
    // ------------------------------------------------------------------

    /// Run the schema migration against the live database.
    pub async fn update_schema(&self) -> Result<()> {
        self.wait_running().await?;
        let _shared = self.inner.shared.lock().await;
        let mut migrator = SchemaMigrator::new(
            Arc::clone(&self.inner.deps.store),
            self.inner.config.migration_batch_size,
            self.inner.config.schema_version,
        );
        migrator.resume_or_start().await?;
        while !matches!(migrator.run_step().await?, StepResult::Complete) {}
        self.inner.deps.store.apply_schema().await?;
        info!("Schema update complete");
        Ok(())
    }

    /// Wipe every node's local engine state and restart the bootstrap
    /// from scratch.
    pub async fn wipe_and_restart_all(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock().await;
        self.inner.wipe_all(&mut shared).await?;
        shared.failures = 0;
        shared.drop_connection();
        drop(shared);
        self.inner.restart_requested.store(true, Ordering::SeqCst);
        self.inner.interrupt.notify_waiters();
        info!("Full wipe issued, restart requested");
        Ok(())
    }

    /// Bring a previously disabled node back into the membership group.
    pub async fn recover_host(&self, node: NodeId) -> Result<()> {
        self.wait_running().await?;
        let mut shared = self.inner.shared.lock().await;
        let db = shared
            .database
            .as_ref()
            .ok_or_else(|| WardenError::Internal("no database handle while running".into()))?;
        self.inner.guarded(db.recover_host(node)).await?;
        let record = shared
            .nodes
            .iter_mut()
            .find(|r| r.addr.id == node)
            .ok_or(WardenError::NodeNotFound(node))?;
        record.mark_alive();
        record.disabled = false;
        info!(node, "Host recovered");
        Ok(())
    }

    /// Recover a node whose data files moved to a different disk: disable,
    /// repoint, then re-admit, all under the single-operation discipline.
    pub async fn recover_host_for_move(&self, node: NodeId, new_disk_index: u32) -> Result<()> {
        self.wait_running().await?;
        let mut shared = self.inner.shared.lock().await;
        {
            let db = shared
                .database
                .as_ref()
                .ok_or_else(|| WardenError::Internal("no database handle while running".into()))?;
            self.inner.guarded(db.disable_host(node)).await?;
            self.inner.guarded(db.set_paths(node, new_disk_index)).await?;
            self.inner.guarded(db.recover_host(node)).await?;
        }
        if let Some(record) = shared.nodes.iter_mut().find(|r| r.addr.id == node) {
            record.addr.disk_index = new_disk_index;
            record.bad_disk = false;
            record.mark_alive();
            record.disabled = false;
        }
        info!(node, new_disk_index, "Host recovered onto new disk");
        Ok(())
    }

    /// Disable a node so the engine stops waiting on it.
    pub async fn disable_host(&self, node: NodeId) -> Result<()> {
        self.wait_running().await?;
        let mut shared = self.inner.shared.lock().await;
        let db = shared
            .database
            .as_ref()
            .ok_or_else(|| WardenError::Internal("no database handle while running".into()))?;
        self.inner.guarded(db.disable_host(node)).await?;
        if let Some(record) = shared.nodes.iter_mut().find(|r| r.addr.id == node) {
            record.disabled = true;
        }
        info!(node, "Host disabled");
        Ok(())
    }

    async fn wait_running(&self) -> Result<()> {
        let budget = self.inner.timeouts_rx.borrow().external_op_wait;
        self.wait_until_phase(ClusterPhase::Running, budget).await
    }
}

impl LifecycleInner {
    pub(crate) fn timeouts(&self) -> Timeouts {
        self.timeouts_rx.borrow().clone()
    }

    fn set_phase(&self, phase: ClusterPhase) {
        let _ = self.phase_tx.send(phase);
        self.status.write().phase = phase;
    }

    pub(crate) fn publish<F: FnOnce(&mut WardenStatus)>(&self, f: F) {
        f(&mut self.status.write());
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Race a remote call against its timeout and the interrupt, refreshing
    /// the liveness heartbeat on both sides of the wait.
    pub(crate) async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.pulse.beat();
        let call_timeout = self.timeouts_rx.borrow().remote_call;
        let res = tokio::select! {
            res = tokio::time::timeout(call_timeout, fut) => match res {
                Ok(r) => r,
                Err(_) => Err(WardenError::Timeout(call_timeout.as_millis() as u64)),
            },
            _ = self.interrupt.notified() => Err(WardenError::Interrupted),
        };
        self.pulse.beat();
        res
    }

    /// Interruptible sleep. Returns `Err(Interrupted)` only when shutdown
    /// or a forced restart is pending; a bare interrupt just ends the wait
    /// early so the caller re-checks its loop conditions.
    pub(crate) async fn pause(&self, d: Duration) -> Result<()> {
        self.pulse.beat();
        tokio::select! {
            _ = tokio::time::sleep(d) => {}
            _ = self.interrupt.notified() => {}
        }
        self.pulse.beat();
        if self.stopping() || self.restart_requested.load(Ordering::SeqCst) {
            return Err(WardenError::Interrupted);
        }
        Ok(())
    }

    async fn run_loop(self: Arc<Self>) {
        let mut phase = ClusterPhase::Start;
        loop {
            if self.stopping() {
                break;
            }
            if self.restart_requested.swap(false, Ordering::SeqCst) {
                info!("Forced restart requested, returning to start");
                phase = ClusterPhase::Start;
            }

            self.set_phase(phase);
            let timeouts = self.timeouts();
            let budget = match phase {
                ClusterPhase::Running => None,
                ClusterPhase::WaitForAgents => Some(timeouts.wait_for_agents),
                ClusterPhase::SchemaMigrate => Some(timeouts.operation),
                _ => Some(timeouts.phase),
            };
            self.pulse.set_deadline(budget.map(|b| Instant::now() + b));
            self.pulse.beat();

            match self.run_phase(phase).await {
                Ok(next) => {
                    debug!(from = phase.name(), to = next.name(), "Phase complete");
                    phase = next;
                }
                Err(WardenError::Interrupted)
                    if self.stopping() || self.restart_requested.load(Ordering::SeqCst) =>
                {
                    continue;
                }
                Err(e) => {
                    phase = self.enter_failure(phase, e).await;
                }
            }
        }

        self.pulse.set_deadline(None);
        self.graceful_shutdown(phase).await;
        info!("Lifecycle control loop exited");
    }

    /// Stop the database on the way out when we were still running it.
    async fn graceful_shutdown(&self, last_phase: ClusterPhase) {
        if last_phase != ClusterPhase::Running {
            return;
        }
        let shared = self.shared.lock().await;
        if let Some(db) = shared.database.as_ref() {
            info!("Stopping database before shutdown");
            let call_timeout = self.timeouts_rx.borrow().remote_call;
            // Deliberately not interruptible: this is the last act.
            match tokio::time::timeout(call_timeout, db.stop()).await {
                Ok(Ok(())) => info!("Database stopped"),
                Ok(Err(e)) => warn!(error = %e, "Database stop failed during shutdown"),
                Err(_) => warn!("Database stop timed out during shutdown"),
            }
        }
    }

    async fn run_phase(&self, phase: ClusterPhase) -> Result<ClusterPhase> {
        match phase {
            ClusterPhase::Start => self.phase_start().await,
            ClusterPhase::WaitForAgents => self.phase_wait_for_agents().await,
            ClusterPhase::SetupCredentials => self.phase_setup_credentials().await,
            ClusterPhase::Connect => self.phase_connect().await,
            ClusterPhase::GetDomain => self.phase_get_domain().await,
            ClusterPhase::CreateDomain => self.phase_create_domain().await,
            ClusterPhase::GetDatabase => self.phase_get_database().await,
            ClusterPhase::CreateDatabase => self.phase_create_database().await,
            ClusterPhase::InitializeDatabase => self.phase_initialize_database().await,
            ClusterPhase::CheckDatabaseState => self.phase_check_database_state().await,
            ClusterPhase::GetEndpoint => self.phase_get_endpoint().await,
            ClusterPhase::SchemaMigrate => self.phase_schema_migrate().await,
            ClusterPhase::ApplySchema => self.phase_apply_schema().await,
            ClusterPhase::AboutToRun => self.phase_about_to_run().await,
            ClusterPhase::Running => self.phase_running().await,
            ClusterPhase::Failure => {
                // Failure is entered through enter_failure, never scheduled.
                Ok(ClusterPhase::Start)
            }
        }
    }

    /// Route a phase failure through FAILURE and decide on escalation.
    async fn enter_failure(&self, from: ClusterPhase, err: WardenError) -> ClusterPhase {
        error!(phase = from.name(), error = %err, "Phase failed");
        // The failed phase's deadline is spent. Disarm it so concurrent
        // health checks do not interrupt the escalation wipe or the backoff.
        self.pulse.set_deadline(None);
        self.pulse.beat();
        self.set_phase(ClusterPhase::Failure);
        self.publish(|s| {
            s.status = CoarseStatus::Failed;
            s.endpoint = None;
        });

        let threshold = self.config.escalation_threshold;
        let mut shared = self.shared.lock().await;
        shared.drop_connection();
        shared.endpoint_candidate = None;
        shared.db_nonop_since = None;

        if err.is_structural() {
            // Known to never self-heal: skip the quiet-retry grace.
            shared.failures = threshold;
        } else {
            shared.failures += 1;
        }

        if shared.failures >= threshold {
            warn!(
                failures = shared.failures,
                threshold, "Escalation threshold reached, wiping all nodes"
            );
            if let Err(e) = self.wipe_all(&mut shared).await {
                error!(error = %e, "Full wipe incomplete, restarting anyway");
            }
            shared.failures = 0;
        }
        drop(shared);

        let backoff = self.timeouts().failure_backoff;
        let _ = self.pause(backoff).await;
        ClusterPhase::Start
    }

    /// Wipe the local engine state of every node, best effort per node.
    pub(crate) async fn wipe_all(&self, shared: &mut Shared) -> Result<()> {
        let credentials = shared
            .credentials
            .clone()
            .unwrap_or_else(Credentials::generate);
        let mut wiped = 0usize;
        for addr in &self.config.nodes {
            let conn = match self
                .guarded(self.deps.connector.connect(addr, &credentials))
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(node = addr.id, error = %e, "Cannot reach agent for wipe");
                    continue;
                }
            };
            match self.guarded(conn.wipe_host(addr.id)).await {
                Ok(()) => {
                    wiped += 1;
                    info!(node = addr.id, "Node state wiped");
                }
                Err(e) => warn!(node = addr.id, error = %e, "Node wipe failed"),
            }
        }
        for record in &mut shared.nodes {
            record.reset();
        }
        if wiped == 0 {
            return Err(WardenError::Internal(
                "wipe reached no agents at all".into(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase handlers
    // ------------------------------------------------------------------

    async fn phase_start(&self) -> Result<ClusterPhase> {
        let mut shared = self.shared.lock().await;
        shared.drop_connection();
        shared.endpoint_candidate = None;
        shared.db_nonop_since = None;
        shared.initializing = false;
        self.publish(|s| {
            s.status = CoarseStatus::Connecting;
            s.endpoint = None;
            s.initializing = false;
        });
        Ok(ClusterPhase::WaitForAgents)
    }

    async fn phase_wait_for_agents(&self) -> Result<ClusterPhase> {
        let timeouts = self.timeouts();
        let deadline = Instant::now() + timeouts.wait_for_agents;
        let total = self.config.nodes.len();
        let quorum = self.config.exists_quorum();

        loop {
            let mut reachable = 0usize;
            for addr in &self.config.nodes {
                if self.guarded(self.deps.connector.ping(addr)).await.is_ok() {
                    reachable += 1;
                }
            }
            self.publish(|s| s.nodes_alive = reachable);

            if reachable == total {
                info!(reachable, total, "All agents reachable");
                return Ok(ClusterPhase::SetupCredentials);
            }
            if Instant::now() >= deadline {
                if reachable >= quorum {
                    warn!(
                        reachable,
                        total, "Agent wait deadline hit, proceeding with quorum"
                    );
                    return Ok(ClusterPhase::SetupCredentials);
                }
                return Err(WardenError::PhaseTimeout {
                    phase: "wait_for_agents".into(),
                    elapsed_ms: timeouts.wait_for_agents.as_millis() as u64,
                });
            }
            debug!(reachable, total, "Waiting for agents");
            self.pause(timeouts.monitor_poll).await?;
        }
    }

    async fn phase_setup_credentials(&self) -> Result<ClusterPhase> {
        let mut shared = self.shared.lock().await;
        if shared.credentials.is_none() {
            shared.credentials = Some(Credentials::generate());
            debug!("Domain credentials generated");
        }
        Ok(ClusterPhase::Connect)
    }

    async fn phase_connect(&self) -> Result<ClusterPhase> {
        let mut shared = self.shared.lock().await;
        let credentials = shared
            .credentials
            .clone()
            .ok_or_else(|| WardenError::Internal("connect before credentials".into()))?;
        let total = self.config.nodes.len();

        for _ in 0..total {
            let addr = self.config.nodes[shared.conn_cursor % total].clone();
            match self
                .guarded(self.deps.connector.connect(&addr, &credentials))
                .await
            {
                Ok(conn) => {
                    info!(node = addr.id, "Connected to administrative agent");
                    shared.conn = Some(conn);
                    return Ok(ClusterPhase::GetDomain);
                }
                Err(e) => {
                    debug!(node = addr.id, error = %e, "Agent connect failed, next");
                    shared.conn_cursor = (shared.conn_cursor + 1) % total;
                }
            }
        }
        Err(WardenError::LostConnection(
            "no administrative agent reachable".into(),
        ))
    }

    /// One polling round: ask every agent whether the domain exists.
    async fn poll_domain_presence(&self, credentials: &Credentials) -> (usize, usize) {
        let mut exists = 0usize;
        let mut absent = 0usize;
        for addr in &self.config.nodes {
            let conn = match self
                .guarded(self.deps.connector.connect(addr, credentials))
                .await
            {
                Ok(c) => c,
                Err(_) => continue,
            };
            match self.guarded(conn.get_domain()).await {
                Ok(_) => exists += 1,
                Err(e) if e.is_not_present() => absent += 1,
                Err(_) => {}
            }
        }
        (exists, absent)
    }

    /// One polling round: ask every agent whether the database exists.
    async fn poll_database_presence(&self, credentials: &Credentials) -> (usize, usize) {
        let mut exists = 0usize;
        let mut absent = 0usize;
        for addr in &self.config.nodes {
            let conn = match self
                .guarded(self.deps.connector.connect(addr, credentials))
                .await
            {
                Ok(c) => c,
                Err(_) => continue,
            };
            let domain = match self.guarded(conn.get_domain()).await {
                Ok(d) => d,
                Err(e) if e.is_not_present() => {
                    absent += 1;
                    continue;
                }
                Err(_) => continue,
            };
            match self
                .guarded(domain.get_database(&self.config.database_name))
                .await
            {
                Ok(_) => exists += 1,
                Err(e) if e.is_not_present() => absent += 1,
                Err(_) => {}
            }
        }
        (exists, absent)
    }

    /// Poll until the agents corroborate existence or absence, bounded by
    /// the phase budget.
    async fn quorum_poll(
        &self,
        what: &str,
        for_database: bool,
        credentials: &Credentials,
    ) -> Result<bool> {
        let timeouts = self.timeouts();
        let deadline = Instant::now() + timeouts.phase;
        let total = self.config.nodes.len();

        loop {
            let (exists, absent) = if for_database {
                self.poll_database_presence(credentials).await
            } else {
                self.poll_domain_presence(credentials).await
            };
            debug!(what, exists, absent, total, "Existence poll round");

            match decide_presence(exists, absent, total) {
                QuorumDecision::Exists => return Ok(true),
                QuorumDecision::Absent => return Ok(false),
                QuorumDecision::MajorityNegative => {
                    return Err(WardenError::MajorityDisagree {
                        negative: absent,
                        total,
                    })
                }
                QuorumDecision::Inconclusive => {
                    if Instant::now() >= deadline {
                        return Err(WardenError::PhaseTimeout {
                            phase: what.to_string(),
                            elapsed_ms: timeouts.phase.as_millis() as u64,
                        });
                    }
                    self.pause(timeouts.monitor_poll).await?;
                }
            }
        }
    }

    /// Advance to the next agent in round-robin order and only adopt it
    /// once it yields handles consistent with the current phase.
    pub(crate) async fn failover(
        &self,
        shared: &mut Shared,
        need_domain: bool,
        need_database: bool,
    ) -> Result<()> {
        let credentials = shared
            .credentials
            .clone()
            .ok_or_else(|| WardenError::Internal("failover before credentials".into()))?;
        let total = self.config.nodes.len();

        for _ in 0..total {
            shared.conn_cursor = (shared.conn_cursor + 1) % total;
            let addr = self.config.nodes[shared.conn_cursor].clone();
            let conn = match self
                .guarded(self.deps.connector.connect(&addr, &credentials))
                .await
            {
                Ok(c) => c,
                Err(WardenError::Interrupted) => return Err(WardenError::Interrupted),
                Err(_) => continue,
            };

            let domain = if need_domain || need_database {
                match self.guarded(conn.get_domain()).await {
                    Ok(d) => Some(d),
                    Err(WardenError::Interrupted) => return Err(WardenError::Interrupted),
                    Err(_) => continue,
                }
            } else {
                None
            };

            let database = if need_database {
                let d = domain.as_ref().expect("domain fetched above");
                match self
                    .guarded(d.get_database(&self.config.database_name))
                    .await
                {
                    Ok(db) => Some(db),
                    Err(WardenError::Interrupted) => return Err(WardenError::Interrupted),
                    Err(_) => continue,
                }
            } else {
                None
            };

            info!(node = addr.id, "Failed over to another agent");
            // Old connection and its handles dropped wholesale.
            shared.conn = Some(conn);
            shared.domain = domain;
            shared.database = database;
            return Ok(());
        }
        Err(WardenError::LostConnection(
            "failover exhausted every agent".into(),
        ))
    }

    async fn phase_get_domain(&self) -> Result<ClusterPhase> {
        let mut shared = self.shared.lock().await;
        let credentials = shared
            .credentials
            .clone()
            .ok_or_else(|| WardenError::Internal("get_domain before credentials".into()))?;

        if !self.quorum_poll("get_domain", false, &credentials).await? {
            info!("Domain absent on all agents, creating");
            return Ok(ClusterPhase::CreateDomain);
        }

        // Derive the handle from the adopted connection; fail over when the
        // current one cannot produce it.
        let derived = match shared.conn.as_ref() {
            Some(conn) => self.guarded(conn.get_domain()).await,
            None => Err(WardenError::LostConnection("no connection".into())),
        };
        match derived {
            Ok(domain) => shared.domain = Some(domain),
            Err(WardenError::Interrupted) => return Err(WardenError::Interrupted),
            Err(_) => self.failover(&mut shared, true, false).await?,
        }

        let members = {
            let domain = shared.domain.as_ref().expect("domain set above");
            self.retry
                .execute("domain members", || self.guarded(domain.members()))
                .await?
        };
        self.publish(|s| s.domain_empty = members.is_empty());
        Ok(ClusterPhase::GetDatabase)
    }

    async fn phase_create_domain(&self) -> Result<ClusterPhase> {
        let mut shared = self.shared.lock().await;
        shared.initializing = true;
        self.publish(|s| {
            s.status = CoarseStatus::Initializing;
            s.initializing = true;
        });
        let credentials = shared
            .credentials
            .clone()
            .ok_or_else(|| WardenError::Internal("create_domain before credentials".into()))?;
        let conn = shared
            .conn
            .as_ref()
            .ok_or_else(|| WardenError::LostConnection("no connection".into()))?;

        let members = self.config.nodes.clone();
        let domain = self
            .guarded(conn.create_domain(&credentials, &members))
            .await
            .map_err(|e| match e {
                WardenError::Interrupted => WardenError::Interrupted,
                // Creation failure never self-heals; escalate immediately.
                other => WardenError::Structural(format!("create domain: {}", other)),
            })?;
        info!(members = members.len(), "Domain created");
        shared.domain = Some(domain);
        self.publish(|s| s.domain_empty = false);
        Ok(ClusterPhase::GetDatabase)
    }

    async fn phase_get_database(&self) -> Result<ClusterPhase> {
        let mut shared = self.shared.lock().await;
        let credentials = shared
            .credentials
            .clone()
            .ok_or_else(|| WardenError::Internal("get_database before credentials".into()))?;

        if !self.quorum_poll("get_database", true, &credentials).await? {
            info!(database = %self.config.database_name, "Database absent, creating");
            return Ok(ClusterPhase::CreateDatabase);
        }

        let derived = match shared.domain.as_ref() {
            Some(domain) => {
                self.guarded(domain.get_database(&self.config.database_name))
                    .await
            }
            None => Err(WardenError::LostConnection("no domain handle".into())),
        };
        match derived {
            Ok(db) => shared.database = Some(db),
            Err(WardenError::Interrupted) => return Err(WardenError::Interrupted),
            Err(_) => {
                // In this phase a usable agent must re-derive both the
                // domain and the database before being adopted.
                self.failover(&mut shared, true, true).await?;
            }
        }
        Ok(ClusterPhase::CheckDatabaseState)
    }

    async fn phase_create_database(&self) -> Result<ClusterPhase> {
        let mut shared = self.shared.lock().await;
        shared.initializing = true;
        self.publish(|s| {
            s.status = CoarseStatus::Initializing;
            s.initializing = true;
        });

        let monitor = {
            let domain = shared
                .domain
                .as_ref()
                .ok_or_else(|| WardenError::LostConnection("no domain handle".into()))?;
            let db_config = DatabaseConfig {
                name: self.config.database_name.clone(),
                spare_count: WardenConfig::spare_count_for(self.config.nodes.len()),
            };
            self.guarded(domain.create_database(&db_config))
                .await
                .map_err(structuralize("create database"))?
        };
        self.drive(monitor.as_ref(), "create database")
            .await
            .map_err(structuralize("create database"))?;

        let database = {
            let domain = shared.domain.as_ref().expect("domain handle present");
            self.guarded(domain.get_database(&self.config.database_name))
                .await?
        };
        shared.database = Some(database);
        info!(database = %self.config.database_name, "Database created");
        Ok(ClusterPhase::InitializeDatabase)
    }

    async fn phase_initialize_database(&self) -> Result<ClusterPhase> {
        let shared = self.shared.lock().await;
        let monitor = {
            let db = shared
                .database
                .as_ref()
                .ok_or_else(|| WardenError::LostConnection("no database handle".into()))?;
            self.guarded(db.initialize())
                .await
                .map_err(structuralize("initialize database"))?
        };
        self.drive(monitor.as_ref(), "initialize database")
            .await
            .map_err(structuralize("initialize database"))?;
        Ok(ClusterPhase::CheckDatabaseState)
    }

    async fn phase_check_database_state(&self) -> Result<ClusterPhase> {
        use crate::admin::DatabaseState;
        let mut shared = self.shared.lock().await;
        let state = {
            let db = shared
                .database
                .as_ref()
                .ok_or_else(|| WardenError::LostConnection("no database handle".into()))?;
            match self
                .retry
                .execute("database state", || self.guarded(db.database_state()))
                .await
            {
                Ok(s) => s,
                Err(e) if e.triggers_failover() => {
                    self.failover(&mut shared, true, true).await?;
                    let db = shared.database.as_ref().expect("database after failover");
                    self.guarded(db.database_state()).await?
                }
                Err(e) => return Err(e),
            }
        };

        if state.is_serving() {
            return Ok(ClusterPhase::GetEndpoint);
        }
        match state {
            DatabaseState::Stopped => {
                info!("Database stopped, starting it");
                let monitor = {
                    let db = shared.database.as_ref().expect("database handle present");
                    self.guarded(db.start())
                        .await
                        .map_err(structuralize("start database"))?
                };
                self.drive(monitor.as_ref(), "start database")
                    .await
                    .map_err(structuralize("start database"))?;
                // Re-check so the serving state is confirmed, not assumed.
                Ok(ClusterPhase::CheckDatabaseState)
            }
            other => Err(WardenError::OperationFailed(format!(
                "database in state {:?}",
                other
            ))),
        }
    }

    async fn phase_get_endpoint(&self) -> Result<ClusterPhase> {
        let mut shared = self.shared.lock().await;
        let endpoint = {
            let db = shared
                .database
                .as_ref()
                .ok_or_else(|| WardenError::LostConnection("no database handle".into()))?;
            self.retry
                .execute("connection endpoint", || {
                    self.guarded(db.connection_endpoint())
                })
                .await?
        };
        if endpoint.is_empty() {
            return Err(WardenError::OperationFailed(
                "database reported empty endpoint".into(),
            ));
        }
        shared.endpoint_candidate = Some(endpoint);
        Ok(ClusterPhase::SchemaMigrate)
    }

    async fn phase_schema_migrate(&self) -> Result<ClusterPhase> {
        let shared = self.shared.lock().await;
        if !SchemaMigrator::needed(self.deps.store.as_ref(), self.config.schema_version).await? {
            return Ok(ClusterPhase::ApplySchema);
        }

        self.publish(|s| s.status = CoarseStatus::Upgrading);
        info!(
            target_version = self.config.schema_version,
            "Schema migration required"
        );
        let mut migrator = SchemaMigrator::new(
            Arc::clone(&self.deps.store),
            self.config.migration_batch_size,
            self.config.schema_version,
        );
        let budget = self.timeouts().operation;
        migrator.resume_or_start().await?;
        loop {
            self.pulse.beat();
            let step = tokio::select! {
                r = migrator.run_step() => r?,
                _ = self.interrupt.notified() => return Err(WardenError::Interrupted),
            };
            match step {
                StepResult::Complete => break,
                StepResult::Converted(n) => {
                    if n > 0 {
                        // Progress extends the phase deadline.
                        self.pulse.set_deadline(Some(Instant::now() + budget));
                    }
                }
            }
        }

        // Rows are converted; finish with the engine's own in-place upgrade.
        let monitor = {
            let db = shared
                .database
                .as_ref()
                .ok_or_else(|| WardenError::LostConnection("no database handle".into()))?;
            self.guarded(db.upgrade())
                .await
                .map_err(structuralize("upgrade database"))?
        };
        self.drive(monitor.as_ref(), "upgrade database")
            .await
            .map_err(structuralize("upgrade database"))?;
        Ok(ClusterPhase::ApplySchema)
    }

    async fn phase_apply_schema(&self) -> Result<ClusterPhase> {
        let _shared = self.shared.lock().await;
        self.publish(|s| s.status = CoarseStatus::SettingUp);
        self.deps.store.apply_schema().await?;
        Ok(ClusterPhase::AboutToRun)
    }

    async fn phase_about_to_run(&self) -> Result<ClusterPhase> {
        let shared = self.shared.lock().await;
        let db = shared
            .database
            .as_ref()
            .ok_or_else(|| WardenError::LostConnection("no database handle".into()))?;
        let state = self.guarded(db.database_state()).await?;
        if !state.is_serving() {
            return Err(WardenError::OperationFailed(format!(
                "database not serving at final check: {:?}",
                state
            )));
        }
        if shared.endpoint_candidate.as_deref().unwrap_or("").is_empty() {
            return Err(WardenError::Internal("no endpoint candidate".into()));
        }
        Ok(ClusterPhase::Running)
    }

    async fn phase_running(&self) -> Result<ClusterPhase> {
        {
            let mut shared = self.shared.lock().await;
            shared.failures = 0;
            shared.db_nonop_since = None;
            let endpoint = shared
                .endpoint_candidate
                .clone()
                .ok_or_else(|| WardenError::Internal("running without endpoint".into()))?;
            let alive = shared.nodes.iter().filter(|r| !r.confirmed_dead).count();
            // The endpoint becomes visible only here, inside the terminal
            // transition.
            self.publish(|s| {
                s.status = CoarseStatus::Running;
                s.endpoint = Some(Endpoint(endpoint.clone()));
                s.initializing = false;
                s.domain_empty = false;
                s.nodes_alive = alive;
                s.last_recreation = Some(chrono::Utc::now());
            });
            info!(endpoint = %endpoint, "Database running, endpoint published");
        }

        loop {
            let interval = self.timeouts().steady_check;
            self.pulse.set_deadline(None);
            self.pause(interval).await?;
            let mut shared = self.shared.lock().await;
            self.steady_check_once(&mut shared).await?;
        }
    }

    /// Drive one long-running operation with the configured cadence.
    pub(crate) async fn drive(&self, monitor: &dyn OpMonitor, what: &str) -> Result<()> {
        let timeouts = self.timeouts();
        drive_to_completion(
            monitor,
            what,
            timeouts.monitor_poll,
            timeouts.operation,
            &self.interrupt,
            || self.pulse.beat(),
        )
        .await
    }
}

/// Wrap a phase error as structural, leaving interrupts alone.
fn structuralize(what: &'static str) -> impl Fn(WardenError) -> WardenError {
    move |e| match e {
        WardenError::Interrupted => WardenError::Interrupted,
        other => WardenError::Structural(format!("{}: {}", what, other)),
    }
}
