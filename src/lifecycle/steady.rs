//! Steady-state supervision of a running database.
//!
//! Once RUNNING, the control loop calls [`LifecycleInner::steady_check_once`]
//! on a fixed cadence. It watches the database's serving state, runs
//! per-node death and wrong-state timers, disables nodes confirmed dead,
//! and re-admits restored nodes in even-sized groups.

use crate::admin::{DatabaseHandle, DatabaseState, EngineNodeState, NodeReport};
use crate::error::{Result, WardenError};
use crate::lifecycle::machine::{LifecycleInner, Shared};
use crate::types::{NodeAddr, NodeId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Supervision bookkeeping for one cluster node. Timers live here, across
/// check rounds; they never survive a wipe or a machine rebuild.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub addr: NodeAddr,
    /// When the node first stopped answering, if it currently does not.
    pub dead_since: Option<Instant>,
    /// When the node's engine first reported a non-running state.
    pub wrong_state_since: Option<Instant>,
    /// The death timer expired and the node was declared dead. Set at most
    /// once per outage.
    pub confirmed_dead: bool,
    /// The engine was told to stop waiting for this node.
    pub disabled: bool,
    /// A disk failover is in progress; supervision judgment is suspended.
    pub bad_disk: bool,
}

impl NodeRecord {
    pub fn new(addr: NodeAddr) -> Self {
        Self {
            addr,
            dead_since: None,
            wrong_state_since: None,
            confirmed_dead: false,
            disabled: false,
            bad_disk: false,
        }
    }

    /// The node answered and its engine is healthy: clear every timer and
    /// the death verdict.
    pub fn mark_alive(&mut self) {
        self.dead_since = None;
        self.wrong_state_since = None;
        self.confirmed_dead = false;
    }

    /// Back to the freshly constructed state. Used after a full wipe.
    pub fn reset(&mut self) {
        let addr = self.addr.clone();
        *self = NodeRecord::new(addr);
    }
}

/// Whether a timer that started at `since` has run for at least `timeout`.
/// The exact boundary counts as expired.
pub(crate) fn timer_expired(since: Option<Instant>, now: Instant, timeout: Duration) -> bool {
    match since {
        Some(started) => now.duration_since(started) >= timeout,
        None => false,
    }
}

/// Membership must stay even after a join; when the candidates would make
/// the total odd, the last candidate is dropped and waits for a partner.
pub(crate) fn trim_for_even_total(
    current_members: usize,
    mut candidates: Vec<NodeId>,
) -> Vec<NodeId> {
    if (current_members + candidates.len()) % 2 == 1 {
        candidates.pop();
    }
    candidates
}

impl LifecycleInner {
    async fn fetch_cluster_view(
        &self,
        db: &dyn DatabaseHandle,
    ) -> Result<(DatabaseState, Vec<NodeReport>)> {
        let state = self
            .retry
            .execute("database state", || self.guarded(db.database_state()))
            .await?;
        let reports = self
            .retry
            .execute("node statuses", || self.guarded(db.node_statuses()))
            .await?;
        Ok((state, reports))
    }

    /// One supervision round. Errors bubble into the FAILURE path.
    pub(crate) async fn steady_check_once(&self, shared: &mut Shared) -> Result<()> {
        let timeouts = self.timeouts();

        let (state, reports) = {
            let db = shared
                .database
                .as_ref()
                .ok_or_else(|| WardenError::LostConnection("no database handle".into()))?;
            match self.fetch_cluster_view(db.as_ref()).await {
                Ok(view) => view,
                Err(e) if e.triggers_failover() => {
                    warn!(error = %e, "Agent lost during steady check, failing over");
                    self.failover(shared, true, true).await?;
                    let db = shared.database.as_ref().expect("database after failover");
                    self.fetch_cluster_view(db.as_ref()).await?
                }
                Err(e) => return Err(e),
            }
        };

        // A database that stops serving gets a grace window to come back on
        // its own before we escalate.
        if !state.is_serving() {
            let since = *shared.db_nonop_since.get_or_insert_with(Instant::now);
            let elapsed = since.elapsed();
            if elapsed >= timeouts.database_nonop_grace {
                return Err(WardenError::OperationFailed(format!(
                    "database left serving state ({:?}) for {}s",
                    state,
                    elapsed.as_secs()
                )));
            }
            warn!(state = ?state, elapsed_s = elapsed.as_secs(), "Database not serving, in grace window");
            return Ok(());
        }
        shared.db_nonop_since = None;

        let by_id: HashMap<NodeId, &NodeReport> = reports.iter().map(|r| (r.id, r)).collect();
        let now = Instant::now();
        let mut newly_dead = Vec::new();
        let mut restarts = Vec::new();
        let mut rebuilds = Vec::new();
        let mut joinable = Vec::new();

        for record in &mut shared.nodes {
            let id = record.addr.id;
            let report = by_id.get(&id);

            if let Some(report) = report {
                if report.disk_failover_in_progress {
                    if !record.bad_disk {
                        info!(node = id, "Disk failover in progress, suspending judgment");
                    }
                    record.bad_disk = true;
                    continue;
                }
                record.bad_disk = false;

                if report.reachable && !report.member {
                    // A restored node waiting to rejoin. No timers apply.
                    record.dead_since = None;
                    record.wrong_state_since = None;
                    if !record.confirmed_dead || record.disabled {
                        joinable.push(id);
                    }
                    continue;
                }
            }

            let reachable = report.map(|r| r.reachable).unwrap_or(false);
            if !reachable {
                if record.dead_since.is_none() {
                    debug!(node = id, "Node unreachable, death timer started");
                    record.dead_since = Some(now);
                }
                if timer_expired(record.dead_since, now, timeouts.node_death)
                    && !record.confirmed_dead
                {
                    // The verdict is pronounced exactly once per outage.
                    record.confirmed_dead = true;
                    newly_dead.push(id);
                }
                continue;
            }
            record.dead_since = None;

            let engine_state = report.map(|r| r.engine_state).unwrap_or(EngineNodeState::Unknown);
            match engine_state {
                EngineNodeState::Running => record.mark_alive(),
                wrong => {
                    if record.wrong_state_since.is_none() {
                        debug!(node = id, state = ?wrong, "Engine in wrong state, timer started");
                        record.wrong_state_since = Some(now);
                    }
                    if timer_expired(record.wrong_state_since, now, timeouts.node_wrong_state) {
                        record.wrong_state_since = None;
                        // A cleanly stopped engine only needs a restart;
                        // anything murkier gets rebuilt from its peers.
                        if wrong == EngineNodeState::Stopped {
                            restarts.push(id);
                        } else {
                            rebuilds.push(id);
                        }
                    }
                }
            }
        }

        let alive = shared.nodes.iter().filter(|r| !r.confirmed_dead).count();
        self.publish(|s| s.nodes_alive = alive);

        for id in newly_dead {
            warn!(node = id, "Node confirmed dead, disabling");
            let db = shared.database.as_ref().expect("database handle present");
            if let Err(e) = self.guarded(db.disable_host(id)).await {
                warn!(node = id, error = %e, "Disable of dead node failed");
                // Roll the verdict back so the next round retries it.
                if let Some(r) = shared.nodes.iter_mut().find(|r| r.addr.id == id) {
                    r.confirmed_dead = false;
                }
            } else if let Some(r) = shared.nodes.iter_mut().find(|r| r.addr.id == id) {
                r.disabled = true;
            }
        }

        for id in restarts {
            info!(node = id, "Restarting stopped engine node");
            let db = shared.database.as_ref().expect("database handle present");
            self.guarded(db.restart_node(id)).await?;
        }
        for id in rebuilds {
            info!(node = id, "Rebuilding engine node from peers");
            let db = shared.database.as_ref().expect("database handle present");
            self.guarded(db.rebuild_node(id)).await?;
        }

        let members_now = reports.iter().filter(|r| r.member).count();
        self.admit_restored(shared, members_now, joinable).await?;
        Ok(())
    }

    /// Re-admit restored nodes, keeping the membership total even; the odd
    /// candidate out waits for a partner.
    async fn admit_restored(
        &self,
        shared: &mut Shared,
        members_now: usize,
        joinable: Vec<NodeId>,
    ) -> Result<()> {
        if joinable.is_empty() {
            return Ok(());
        }
        let join = trim_for_even_total(members_now, joinable);
        if join.is_empty() {
            return Ok(());
        }

        info!(nodes = ?join, "Re-admitting restored nodes");
        // Previously disabled nodes must be recovered engine-side before
        // they can rejoin the membership group.
        let needs_recover: Vec<NodeId> = shared
            .nodes
            .iter()
            .filter(|r| r.disabled && join.contains(&r.addr.id))
            .map(|r| r.addr.id)
            .collect();
        for id in needs_recover {
            let db = shared
                .database
                .as_ref()
                .ok_or_else(|| WardenError::LostConnection("no database handle".into()))?;
            self.guarded(db.recover_host(id)).await?;
        }
        let domain = shared
            .domain
            .as_ref()
            .ok_or_else(|| WardenError::LostConnection("no domain handle".into()))?;
        let monitor = self.guarded(domain.add_members(&join)).await?;
        self.drive(monitor.as_ref(), "add members").await?;

        let new_total = self.guarded(domain.members()).await?.len();
        let spares = crate::config::WardenConfig::spare_count_for(new_total);
        let db = shared
            .database
            .as_ref()
            .ok_or_else(|| WardenError::LostConnection("no database handle".into()))?;
        let monitor = self.guarded(db.reconfigure_spares(spares)).await?;
        self.drive(monitor.as_ref(), "reconfigure spares").await?;
        info!(new_total, spares, "Membership and spare count updated");

        for id in join {
            if let Some(r) = shared.nodes.iter_mut().find(|r| r.addr.id == id) {
                r.mark_alive();
                r.disabled = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(id: NodeId) -> NodeAddr {
        NodeAddr {
            id,
            host: format!("host{}", id),
            port: 7000,
            disk_index: 0,
        }
    }

    #[test]
    fn test_timer_expired_exact_boundary() {
        let timeout = Duration::from_secs(90);
        let start = Instant::now();
        // Exactly at the boundary counts as expired.
        assert!(timer_expired(Some(start), start + timeout, timeout));
        assert!(!timer_expired(
            Some(start),
            start + timeout - Duration::from_millis(1),
            timeout
        ));
        assert!(timer_expired(
            Some(start),
            start + timeout + Duration::from_millis(1),
            timeout
        ));
    }

    #[test]
    fn test_timer_not_running() {
        assert!(!timer_expired(None, Instant::now(), Duration::from_secs(1)));
    }

    #[test]
    fn test_trim_keeps_total_even() {
        // 7 members + 1 candidate = 8: the lone candidate goes in.
        assert_eq!(trim_for_even_total(7, vec![3]), vec![3]);
        // 8 members + 1 candidate would be odd: candidate waits.
        assert_eq!(trim_for_even_total(8, vec![5]), Vec::<NodeId>::new());
        // 7 members + 2 candidates would be odd: last one waits.
        assert_eq!(trim_for_even_total(7, vec![5, 6]), vec![5]);
        assert_eq!(trim_for_even_total(6, vec![1, 2]), vec![1, 2]);
    }

    #[test]
    fn test_mark_alive_clears_verdict() {
        let mut record = NodeRecord::new(addr(3));
        record.dead_since = Some(Instant::now());
        record.confirmed_dead = true;
        record.mark_alive();
        assert!(record.dead_since.is_none());
        assert!(!record.confirmed_dead);
    }

    #[test]
    fn test_reset_keeps_address() {
        let mut record = NodeRecord::new(addr(5));
        record.disabled = true;
        record.bad_disk = true;
        record.reset();
        assert_eq!(record.addr.id, 5);
        assert!(!record.disabled);
        assert!(!record.bad_disk);
    }
}
