//! In-process simulated engine cluster.
//!
//! Implements the whole administrative boundary ([`AdminConnector`] through
//! [`OpMonitor`]) and the migration [`RowStore`] against shared in-memory
//! state, with per-call failure injection. `wardend dev` runs the full
//! lifecycle against it, and the integration tests drive their cluster
//! scenarios through it.
//!
//! Holding the state lock across an await is never done here; every method
//! computes its answer under the lock, then optionally parks on an injected
//! "wedge" outside it.

use crate::admin::{
    AdminConnection, AdminConnector, Credentials, DatabaseConfig, DatabaseHandle, DatabaseState,
    DomainHandle, EngineNodeState, MonitorReport, MonitorState, NodeReport, OpMonitor,
};
use crate::error::{Result, WardenError};
use crate::migrate::{Checkpoint, PriorTable, Row, RowStore, TableLayout};
use crate::types::{NodeAddr, NodeId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Which error an injected failure produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedError {
    /// Retryable transient engine error.
    Transient,
    /// Generic non-retryable administrative failure.
    Failed,
    /// Lost connection, triggers failover.
    Lost,
}

impl InjectedError {
    fn into_error(self, op: &str) -> WardenError {
        match self {
            InjectedError::Transient => WardenError::Transient(format!("injected: {}", op)),
            InjectedError::Failed => WardenError::OperationFailed(format!("injected: {}", op)),
            InjectedError::Lost => WardenError::LostConnection(format!("injected: {}", op)),
        }
    }
}

#[derive(Debug, Clone)]
struct SimNode {
    addr: NodeAddr,
    reachable: bool,
    engine_state: EngineNodeState,
    member: bool,
    disabled: bool,
    disk_failover: bool,
    /// Answer "no domain" even while one exists, for quorum scenarios.
    deny_domain: bool,
}

#[derive(Debug, Clone)]
struct SimDatabase {
    name: String,
    state: DatabaseState,
    spare_count: u32,
    initialized: bool,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: BTreeMap<NodeId, SimNode>,
    domain_members: Option<BTreeSet<NodeId>>,
    database: Option<SimDatabase>,
    database_state_override: Option<DatabaseState>,
    /// op name -> (remaining forced failures, error kind)
    fail_counts: HashMap<String, (u32, InjectedError)>,
    /// ops that never return until the caller is interrupted
    wedged: HashSet<String>,
    /// polls a monitor stays Active before completing
    monitor_ticks: u32,

    wipe_log: Vec<NodeId>,
    disable_log: Vec<NodeId>,
    restart_log: Vec<NodeId>,
    rebuild_log: Vec<NodeId>,
    recover_log: Vec<NodeId>,
    add_members_log: Vec<Vec<NodeId>>,
}

impl SimState {
    fn node(&self, id: NodeId) -> Result<&SimNode> {
        self.nodes.get(&id).ok_or(WardenError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut SimNode> {
        self.nodes
            .get_mut(&id)
            .ok_or(WardenError::NodeNotFound(id))
    }

    fn take_failure(&mut self, op: &str) -> Option<WardenError> {
        if let Some((remaining, kind)) = self.fail_counts.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                let kind = *kind;
                return Some(kind.into_error(op));
            }
        }
        None
    }
}

/// A simulated engine cluster shared by connector, handles and row store.
#[derive(Clone)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
    store: Arc<SimStore>,
}

impl SimCluster {
    /// Build a cluster of `count` nodes with ids `1..=count`.
    pub fn new(count: usize) -> Self {
        let mut state = SimState::default();
        for i in 1..=count as u64 {
            let addr = NodeAddr {
                id: i,
                host: format!("node{}.sim", i),
                port: 7700,
                disk_index: 0,
            };
            state.nodes.insert(
                i,
                SimNode {
                    addr,
                    reachable: true,
                    engine_state: EngineNodeState::Running,
                    member: false,
                    disabled: false,
                    disk_failover: false,
                    deny_domain: false,
                },
            );
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            store: Arc::new(SimStore::default()),
        }
    }

    pub fn addrs(&self) -> Vec<NodeAddr> {
        self.state
            .lock()
            .nodes
            .values()
            .map(|n| n.addr.clone())
            .collect()
    }

    pub fn connector(&self) -> Arc<dyn AdminConnector> {
        Arc::new(SimConnector {
            state: Arc::clone(&self.state),
        })
    }

    pub fn store(&self) -> Arc<dyn RowStore> {
        Arc::clone(&self.store) as Arc<dyn RowStore>
    }

    /// The concrete store, for seeding prior-layout data.
    pub fn sim_store(&self) -> Arc<SimStore> {
        Arc::clone(&self.store)
    }

    // ---- failure injection ----

    pub fn set_reachable(&self, id: NodeId, reachable: bool) {
        if let Some(n) = self.state.lock().nodes.get_mut(&id) {
            n.reachable = reachable;
        }
    }

    pub fn set_engine_state(&self, id: NodeId, engine_state: EngineNodeState) {
        if let Some(n) = self.state.lock().nodes.get_mut(&id) {
            n.engine_state = engine_state;
        }
    }

    pub fn set_disk_failover(&self, id: NodeId, in_progress: bool) {
        if let Some(n) = self.state.lock().nodes.get_mut(&id) {
            n.disk_failover = in_progress;
        }
    }

    pub fn set_deny_domain(&self, id: NodeId, deny: bool) {
        if let Some(n) = self.state.lock().nodes.get_mut(&id) {
            n.deny_domain = deny;
        }
    }

    /// The next `times` calls of `op` fail with the given error kind.
    pub fn fail_next(&self, op: &str, times: u32, kind: InjectedError) {
        self.state
            .lock()
            .fail_counts
            .insert(op.to_string(), (times, kind));
    }

    /// Make `op` block forever (until the caller's wait is interrupted).
    pub fn wedge(&self, op: &str) {
        self.state.lock().wedged.insert(op.to_string());
    }

    pub fn unwedge(&self, op: &str) {
        self.state.lock().wedged.remove(op);
    }

    pub fn set_database_state(&self, state: Option<DatabaseState>) {
        self.state.lock().database_state_override = state;
    }

    pub fn set_monitor_ticks(&self, ticks: u32) {
        self.state.lock().monitor_ticks = ticks;
    }

    /// Bring a wiped node's agent back: reachable, engine running, not a
    /// member. This is what a restored-from-outage node looks like.
    pub fn restore_node(&self, id: NodeId) {
        if let Some(n) = self.state.lock().nodes.get_mut(&id) {
            n.reachable = true;
            n.engine_state = EngineNodeState::Running;
            n.member = false;
            n.disabled = false;
            n.disk_failover = false;
        }
    }

    // ---- introspection ----

    pub fn has_domain(&self) -> bool {
        self.state.lock().domain_members.is_some()
    }

    pub fn has_database(&self) -> bool {
        self.state.lock().database.is_some()
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .domain_members
            .as_ref()
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn spare_count(&self) -> Option<u32> {
        self.state.lock().database.as_ref().map(|d| d.spare_count)
    }

    /// Effective database state as an agent would report it.
    pub fn database_state(&self) -> Option<DatabaseState> {
        let s = self.state.lock();
        s.database_state_override
            .or_else(|| s.database.as_ref().map(|d| d.state))
    }

    pub fn wipe_log(&self) -> Vec<NodeId> {
        self.state.lock().wipe_log.clone()
    }

    pub fn disable_log(&self) -> Vec<NodeId> {
        self.state.lock().disable_log.clone()
    }

    pub fn restart_log(&self) -> Vec<NodeId> {
        self.state.lock().restart_log.clone()
    }

    pub fn rebuild_log(&self) -> Vec<NodeId> {
        self.state.lock().rebuild_log.clone()
    }

    pub fn add_members_log(&self) -> Vec<Vec<NodeId>> {
        self.state.lock().add_members_log.clone()
    }

    pub fn recover_log(&self) -> Vec<NodeId> {
        self.state.lock().recover_log.clone()
    }

    pub fn disk_index(&self, id: NodeId) -> Option<u32> {
        self.state
            .lock()
            .nodes
            .get(&id)
            .map(|n| n.addr.disk_index)
    }

    pub fn is_disabled(&self, id: NodeId) -> bool {
        self.state
            .lock()
            .nodes
            .get(&id)
            .map(|n| n.disabled)
            .unwrap_or(false)
    }
}

/// Check injection for `op`: forced failure, or park forever when wedged.
async fn gate(state: &Arc<Mutex<SimState>>, op: &str) -> Result<()> {
    let wedged = {
        let mut s = state.lock();
        if let Some(e) = s.take_failure(op) {
            return Err(e);
        }
        s.wedged.contains(op)
    };
    if wedged {
        std::future::pending::<()>().await;
    }
    Ok(())
}

struct SimConnector {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl AdminConnector for SimConnector {
    async fn connect(
        &self,
        addr: &NodeAddr,
        _credentials: &Credentials,
    ) -> Result<Box<dyn AdminConnection>> {
        gate(&self.state, "connect").await?;
        let reachable = self.state.lock().node(addr.id)?.reachable;
        if !reachable {
            return Err(WardenError::LostConnection(format!(
                "agent on {} unreachable",
                addr
            )));
        }
        Ok(Box::new(SimConnection {
            state: Arc::clone(&self.state),
            node: addr.clone(),
        }))
    }

    async fn ping(&self, addr: &NodeAddr) -> Result<()> {
        gate(&self.state, "ping").await?;
        let reachable = self.state.lock().node(addr.id)?.reachable;
        if reachable {
            Ok(())
        } else {
            Err(WardenError::LostConnection(format!(
                "agent on {} unreachable",
                addr
            )))
        }
    }
}

struct SimConnection {
    state: Arc<Mutex<SimState>>,
    node: NodeAddr,
}

impl SimConnection {
    /// A call through a connection whose agent went away mid-use.
    fn check_reachable(&self) -> Result<()> {
        let reachable = self.state.lock().node(self.node.id)?.reachable;
        if reachable {
            Ok(())
        } else {
            Err(WardenError::LostConnection(format!(
                "agent on {} went away",
                self.node
            )))
        }
    }
}

#[async_trait]
impl AdminConnection for SimConnection {
    fn peer(&self) -> NodeAddr {
        self.node.clone()
    }

    async fn get_domain(&self) -> Result<Box<dyn DomainHandle>> {
        gate(&self.state, "get_domain").await?;
        self.check_reachable()?;
        {
            let s = self.state.lock();
            let denies = s.node(self.node.id)?.deny_domain;
            if denies || s.domain_members.is_none() {
                return Err(WardenError::NotPresent("domain".into()));
            }
        }
        Ok(Box::new(SimDomainHandle {
            state: Arc::clone(&self.state),
            via: self.node.clone(),
        }))
    }

    async fn create_domain(
        &self,
        _credentials: &Credentials,
        members: &[NodeAddr],
    ) -> Result<Box<dyn DomainHandle>> {
        gate(&self.state, "create_domain").await?;
        self.check_reachable()?;
        {
            let mut s = self.state.lock();
            let ids: BTreeSet<NodeId> = members.iter().map(|a| a.id).collect();
            for id in &ids {
                if let Ok(n) = s.node_mut(*id) {
                    n.member = true;
                }
            }
            s.domain_members = Some(ids);
        }
        Ok(Box::new(SimDomainHandle {
            state: Arc::clone(&self.state),
            via: self.node.clone(),
        }))
    }

    async fn wipe_host(&self, node: NodeId) -> Result<()> {
        gate(&self.state, "wipe_host").await?;
        self.check_reachable()?;
        let mut s = self.state.lock();
        s.wipe_log.push(node);
        {
            let n = s.node_mut(node)?;
            n.member = false;
            n.disabled = false;
            n.engine_state = EngineNodeState::Running;
        }
        if let Some(members) = s.domain_members.as_mut() {
            members.remove(&node);
            if members.is_empty() {
                s.domain_members = None;
                s.database = None;
            }
        }
        Ok(())
    }
}

struct SimDomainHandle {
    state: Arc<Mutex<SimState>>,
    via: NodeAddr,
}

#[async_trait]
impl DomainHandle for SimDomainHandle {
    async fn get_database(&self, name: &str) -> Result<Box<dyn DatabaseHandle>> {
        gate(&self.state, "get_database").await?;
        {
            let s = self.state.lock();
            if s.node(self.via.id)?.deny_domain {
                return Err(WardenError::NotPresent("domain".into()));
            }
            match s.database.as_ref() {
                Some(db) if db.name == name => {}
                _ => return Err(WardenError::NotPresent(format!("database '{}'", name))),
            }
        }
        Ok(Box::new(SimDatabaseHandle {
            state: Arc::clone(&self.state),
        }))
    }

    async fn create_database(&self, config: &DatabaseConfig) -> Result<Box<dyn OpMonitor>> {
        gate(&self.state, "create_database").await?;
        let ticks = {
            let mut s = self.state.lock();
            s.database = Some(SimDatabase {
                name: config.name.clone(),
                state: DatabaseState::Stopped,
                spare_count: config.spare_count,
                initialized: false,
            });
            s.monitor_ticks
        };
        Ok(Box::new(SimMonitor::new(ticks)))
    }

    async fn members(&self) -> Result<Vec<NodeId>> {
        gate(&self.state, "members").await?;
        let s = self.state.lock();
        Ok(s.domain_members
            .as_ref()
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn add_members(&self, nodes: &[NodeId]) -> Result<Box<dyn OpMonitor>> {
        gate(&self.state, "add_members").await?;
        let ticks = {
            let mut s = self.state.lock();
            s.add_members_log.push(nodes.to_vec());
            for id in nodes {
                if let Ok(n) = s.node_mut(*id) {
                    n.member = true;
                }
            }
            if let Some(members) = s.domain_members.as_mut() {
                members.extend(nodes.iter().copied());
            }
            s.monitor_ticks
        };
        Ok(Box::new(SimMonitor::new(ticks)))
    }
}

struct SimDatabaseHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimDatabaseHandle {
    fn with_db<T>(&self, f: impl FnOnce(&mut SimDatabase) -> T) -> Result<T> {
        let mut s = self.state.lock();
        match s.database.as_mut() {
            Some(db) => Ok(f(db)),
            None => Err(WardenError::NotPresent("database".into())),
        }
    }
}

#[async_trait]
impl DatabaseHandle for SimDatabaseHandle {
    async fn initialize(&self) -> Result<Box<dyn OpMonitor>> {
        gate(&self.state, "initialize").await?;
        self.with_db(|db| db.initialized = true)?;
        let ticks = self.state.lock().monitor_ticks;
        Ok(Box::new(SimMonitor::new(ticks)))
    }

    async fn start(&self) -> Result<Box<dyn OpMonitor>> {
        gate(&self.state, "start").await?;
        self.with_db(|db| {
            if db.initialized {
                db.state = DatabaseState::Operational;
                Ok(())
            } else {
                Err(WardenError::OperationFailed(
                    "start before initialize".into(),
                ))
            }
        })??;
        let ticks = self.state.lock().monitor_ticks;
        Ok(Box::new(SimMonitor::new(ticks)))
    }

    async fn stop(&self) -> Result<()> {
        gate(&self.state, "stop").await?;
        self.with_db(|db| db.state = DatabaseState::Stopped)
    }

    async fn upgrade(&self) -> Result<Box<dyn OpMonitor>> {
        gate(&self.state, "upgrade").await?;
        let ticks = self.state.lock().monitor_ticks;
        Ok(Box::new(SimMonitor::new(ticks)))
    }

    async fn reconfigure_spares(&self, spare_count: u32) -> Result<Box<dyn OpMonitor>> {
        gate(&self.state, "reconfigure_spares").await?;
        self.with_db(|db| db.spare_count = spare_count)?;
        let ticks = self.state.lock().monitor_ticks;
        Ok(Box::new(SimMonitor::new(ticks)))
    }

    async fn database_state(&self) -> Result<DatabaseState> {
        gate(&self.state, "database_state").await?;
        let s = self.state.lock();
        if let Some(over) = s.database_state_override {
            return Ok(over);
        }
        match s.database.as_ref() {
            Some(db) => Ok(db.state),
            None => Err(WardenError::NotPresent("database".into())),
        }
    }

    async fn connection_endpoint(&self) -> Result<String> {
        gate(&self.state, "connection_endpoint").await?;
        self.with_db(|db| format!("engine://sim/{}", db.name))
    }

    async fn node_statuses(&self) -> Result<Vec<NodeReport>> {
        gate(&self.state, "node_statuses").await?;
        let s = self.state.lock();
        Ok(s.nodes
            .values()
            .map(|n| NodeReport {
                id: n.addr.id,
                reachable: n.reachable,
                engine_state: n.engine_state,
                member: n.member,
                disk_failover_in_progress: n.disk_failover,
            })
            .collect())
    }

    async fn restart_node(&self, node: NodeId) -> Result<()> {
        gate(&self.state, "restart_node").await?;
        let mut s = self.state.lock();
        s.restart_log.push(node);
        s.node_mut(node)?.engine_state = EngineNodeState::Running;
        Ok(())
    }

    async fn rebuild_node(&self, node: NodeId) -> Result<()> {
        gate(&self.state, "rebuild_node").await?;
        let mut s = self.state.lock();
        s.rebuild_log.push(node);
        s.node_mut(node)?.engine_state = EngineNodeState::Running;
        Ok(())
    }

    async fn recover_host(&self, node: NodeId) -> Result<()> {
        gate(&self.state, "recover_host").await?;
        let mut s = self.state.lock();
        s.recover_log.push(node);
        s.node_mut(node)?.disabled = false;
        Ok(())
    }

    async fn disable_host(&self, node: NodeId) -> Result<()> {
        gate(&self.state, "disable_host").await?;
        let mut s = self.state.lock();
        s.disable_log.push(node);
        {
            let n = s.node_mut(node)?;
            n.disabled = true;
            n.member = false;
        }
        if let Some(members) = s.domain_members.as_mut() {
            members.remove(&node);
        }
        Ok(())
    }

    async fn set_paths(&self, node: NodeId, disk_index: u32) -> Result<()> {
        gate(&self.state, "set_paths").await?;
        let mut s = self.state.lock();
        s.node_mut(node)?.addr.disk_index = disk_index;
        Ok(())
    }
}

/// Long-running-operation monitor: Active for a scripted number of polls,
/// then Completed.
struct SimMonitor {
    remaining: Mutex<u32>,
}

impl SimMonitor {
    fn new(ticks: u32) -> Self {
        Self {
            remaining: Mutex::new(ticks),
        }
    }
}

#[async_trait]
impl OpMonitor for SimMonitor {
    async fn poll(&self) -> Result<MonitorReport> {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            let done = 100 - *remaining * 10;
            Ok(MonitorReport {
                state: MonitorState::Active,
                percent: done.min(99) as u8,
                message: String::new(),
            })
        } else {
            Ok(MonitorReport {
                state: MonitorState::Completed,
                percent: 100,
                message: String::new(),
            })
        }
    }

    async fn cancel(&self) {}
}

/// In-memory [`RowStore`]: prior-layout tables, checkpoints, version marker.
#[derive(Default)]
pub struct SimStore {
    inner: Mutex<SimStoreInner>,
}

#[derive(Default)]
struct SimStoreInner {
    prior: Vec<PriorTable>,
    rows: HashMap<String, Vec<Row>>,
    converted: HashMap<String, Vec<Row>>,
    checkpoints: BTreeMap<String, Checkpoint>,
    dropped: Vec<String>,
    version: Option<u32>,
    schema_applied: bool,
}

impl SimStore {
    /// Seed one prior-layout table and its rows.
    pub fn seed_table(&self, prior: TableLayout, rows: Vec<Row>) {
        let mut inner = self.inner.lock();
        inner.rows.insert(prior.physical.clone(), rows);
        inner.prior.push(PriorTable {
            logical: prior.logical.clone(),
            layout: Some(prior),
        });
    }

    pub fn set_version(&self, version: Option<u32>) {
        self.inner.lock().version = version;
    }

    pub fn converted_rows(&self, physical: &str) -> Vec<Row> {
        self.inner
            .lock()
            .converted
            .get(physical)
            .cloned()
            .unwrap_or_default()
    }

    pub fn schema_applied(&self) -> bool {
        self.inner.lock().schema_applied
    }

    pub fn dropped_tables(&self) -> Vec<String> {
        self.inner.lock().dropped.clone()
    }
}

#[async_trait]
impl RowStore for SimStore {
    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.inner.lock().checkpoints.values().cloned().collect())
    }

    async fn put_checkpoints(&self, checkpoints: &[Checkpoint]) -> Result<()> {
        let mut inner = self.inner.lock();
        for checkpoint in checkpoints {
            inner
                .checkpoints
                .insert(checkpoint.table.clone(), checkpoint.clone());
        }
        Ok(())
    }

    async fn delete_checkpoint(&self, table: &str) -> Result<()> {
        self.inner.lock().checkpoints.remove(table);
        Ok(())
    }

    async fn snapshot_prior_tables(&self) -> Result<Vec<PriorTable>> {
        Ok(self.inner.lock().prior.clone())
    }

    async fn target_layout(&self, logical: &str) -> Result<TableLayout> {
        let inner = self.inner.lock();
        let prior = inner
            .prior
            .iter()
            .find(|t| t.logical == logical)
            .and_then(|t| t.layout.as_ref())
            .ok_or_else(|| WardenError::Migration(format!("no layout for '{}'", logical)))?;
        Ok(TableLayout {
            logical: prior.logical.clone(),
            physical: format!("{}_next", prior.physical),
            columns: prior.columns.clone(),
        })
    }

    async fn select_batch(
        &self,
        prior: &TableLayout,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let inner = self.inner.lock();
        let rows = inner.rows.get(&prior.physical).cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter(|r| after_key.map(|k| r.key.as_str() > k).unwrap_or(true))
            .take(limit)
            .collect())
    }

    async fn commit_batch(
        &self,
        target: &TableLayout,
        rows: Vec<Row>,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .converted
            .entry(target.physical.clone())
            .or_default()
            .extend(rows);
        inner
            .checkpoints
            .insert(checkpoint.table.clone(), checkpoint.clone());
        Ok(())
    }

    async fn drop_prior_tables(&self, physical: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        for name in physical {
            inner.rows.remove(name);
            inner.dropped.push(name.clone());
        }
        Ok(())
    }

    async fn version_marker(&self) -> Result<Option<u32>> {
        Ok(self.inner.lock().version)
    }

    async fn write_version_marker(&self, version: u32) -> Result<()> {
        self.inner.lock().version = Some(version);
        Ok(())
    }

    async fn apply_schema(&self) -> Result<()> {
        self.inner.lock().schema_applied = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials::generate()
    }

    #[tokio::test]
    async fn test_fresh_cluster_has_nothing() {
        let sim = SimCluster::new(4);
        let connector = sim.connector();
        let conn = connector
            .connect(&sim.addrs()[0], &credentials())
            .await
            .unwrap();
        assert!(matches!(
            conn.get_domain().await,
            Err(WardenError::NotPresent(_))
        ));
    }

    #[tokio::test]
    async fn test_create_domain_and_database() {
        let sim = SimCluster::new(4);
        let connector = sim.connector();
        let addrs = sim.addrs();
        let conn = connector.connect(&addrs[0], &credentials()).await.unwrap();
        let domain = conn.create_domain(&credentials(), &addrs).await.unwrap();
        assert_eq!(sim.members(), vec![1, 2, 3, 4]);

        let monitor = domain
            .create_database(&DatabaseConfig {
                name: "meta".into(),
                spare_count: 0,
            })
            .await
            .unwrap();
        let report = monitor.poll().await.unwrap();
        assert_eq!(report.state, MonitorState::Completed);

        let db = domain.get_database("meta").await.unwrap();
        assert_eq!(db.database_state().await.unwrap(), DatabaseState::Stopped);
        db.initialize().await.unwrap();
        db.start().await.unwrap();
        assert_eq!(
            db.database_state().await.unwrap(),
            DatabaseState::Operational
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_refuses_connect() {
        let sim = SimCluster::new(3);
        sim.set_reachable(2, false);
        let connector = sim.connector();
        let addrs = sim.addrs();
        assert!(matches!(
            connector.connect(&addrs[1], &credentials()).await,
            Err(WardenError::LostConnection(_))
        ));
        assert!(connector.connect(&addrs[0], &credentials()).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let sim = SimCluster::new(3);
        sim.fail_next("ping", 2, InjectedError::Transient);
        let connector = sim.connector();
        let addr = &sim.addrs()[0];
        assert!(matches!(
            connector.ping(addr).await,
            Err(WardenError::Transient(_))
        ));
        assert!(matches!(
            connector.ping(addr).await,
            Err(WardenError::Transient(_))
        ));
        assert!(connector.ping(addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_full_wipe_destroys_domain() {
        let sim = SimCluster::new(2);
        let connector = sim.connector();
        let addrs = sim.addrs();
        let conn = connector.connect(&addrs[0], &credentials()).await.unwrap();
        conn.create_domain(&credentials(), &addrs).await.unwrap();
        assert!(sim.has_domain());

        conn.wipe_host(1).await.unwrap();
        assert!(sim.has_domain());
        conn.wipe_host(2).await.unwrap();
        assert!(!sim.has_domain());
        assert_eq!(sim.wipe_log(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_wedged_op_never_returns() {
        let sim = SimCluster::new(2);
        sim.wedge("ping");
        let connector = sim.connector();
        let addr = &sim.addrs()[0];
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(20), connector.ping(addr)).await;
        assert!(result.is_err());
    }
}
