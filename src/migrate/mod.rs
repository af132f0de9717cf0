//! Resumable, checkpointed in-place schema migration.
//!
//! When the software version moves, rows of every logical table are copied
//! from the prior physical layout into the newly computed one, in bounded
//! batches, with a persisted per-table checkpoint (the last successfully
//! converted row key). The checkpoint set existing at all is itself the
//! signal that a migration is in progress: crash-resume needs no in-memory
//! state beyond re-reading it.
//!
//! A checkpoint row is deleted only on confirmed completion of its table's
//! conversion, and a batch's checkpoint is persisted in the same transaction
//! that commits the batch, never partially. Tables whose prior column names
//! are unknown at the old version are skipped; their rows cannot be mapped
//! and the limitation is accepted rather than guessed around.

use crate::error::{Result, WardenError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Physical column type in the engine's row store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    BigInt,
    Text,
    Blob,
    Timestamp,
    Boolean,
}

/// A single cell value, convertible between physical types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(i64),
    Boolean(bool),
}

impl Value {
    /// Convert this value to the target physical type.
    pub fn coerce(self, target: ColumnType) -> Result<Value> {
        let out = match (self, target) {
            (Value::Null, _) => Value::Null,
            (v @ Value::Integer(_), ColumnType::Integer | ColumnType::BigInt) => v,
            (Value::Integer(i), ColumnType::Text) => Value::Text(i.to_string()),
            (Value::Integer(i), ColumnType::Timestamp) => Value::Timestamp(i),
            (Value::Integer(i), ColumnType::Boolean) => Value::Boolean(i != 0),
            (v @ Value::Text(_), ColumnType::Text) => v,
            (Value::Text(s), ColumnType::Integer | ColumnType::BigInt) => {
                let i = s.parse::<i64>().map_err(|_| {
                    WardenError::Migration(format!("cannot convert '{}' to integer", s))
                })?;
                Value::Integer(i)
            }
            (Value::Text(s), ColumnType::Blob) => Value::Blob(s.into_bytes()),
            (v @ Value::Blob(_), ColumnType::Blob) => v,
            (v @ Value::Timestamp(_), ColumnType::Timestamp) => v,
            (Value::Timestamp(t), ColumnType::Integer | ColumnType::BigInt) => Value::Integer(t),
            (v @ Value::Boolean(_), ColumnType::Boolean) => v,
            (Value::Boolean(b), ColumnType::Integer | ColumnType::BigInt) => {
                Value::Integer(b as i64)
            }
            (v, t) => {
                return Err(WardenError::Migration(format!(
                    "unsupported conversion {:?} -> {:?}",
                    v, t
                )))
            }
        };
        Ok(out)
    }
}

/// One column of a physical table layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

/// Physical layout of one logical table at a given software version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    /// Logical attribute-table name.
    pub logical: String,
    /// Version-suffixed physical table name.
    pub physical: String,
    pub columns: Vec<ColumnDef>,
}

/// Prior-version table as seen when the migration snapshots the old schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorTable {
    pub logical: String,
    /// None when the prior column names are unknown; the table is skipped.
    pub layout: Option<TableLayout>,
}

/// Persisted migration checkpoint: one row per in-flight logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub table: String,
    /// Last successfully converted row key; None = not started.
    pub last_key: Option<String>,
}

/// One row streamed out of the prior layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Ordering key; batches resume strictly after the checkpointed key.
    pub key: String,
    /// Column name to value, in the prior layout's terms.
    pub columns: Vec<(String, Value)>,
}

impl Row {
    fn value_of(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }
}

/// Boundary to the engine's row-oriented data API, as used by the migration.
///
/// Implementations run `select_batch` as an outer join across the prior
/// layout ordered by row key, and `commit_batch` as a single bounded
/// transaction covering both the inserted rows and the checkpoint update.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>>;
    /// Persist the given checkpoints in one transaction, all or none.
    ///
    /// The migrator writes the full initial set this way; after a crash the
    /// store holds either no checkpoints or one per unfinished table, so a
    /// missing row can only mean the table's conversion completed.
    async fn put_checkpoints(&self, checkpoints: &[Checkpoint]) -> Result<()>;
    async fn delete_checkpoint(&self, table: &str) -> Result<()>;

    /// Snapshot the prior-version schema definitions.
    async fn snapshot_prior_tables(&self) -> Result<Vec<PriorTable>>;
    /// The freshly computed layout for a logical table.
    async fn target_layout(&self, logical: &str) -> Result<TableLayout>;

    /// Select up to `limit` not-yet-migrated rows strictly after `after_key`.
    async fn select_batch(
        &self,
        prior: &TableLayout,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Atomically insert converted rows and persist the new checkpoint.
    async fn commit_batch(
        &self,
        target: &TableLayout,
        rows: Vec<Row>,
        checkpoint: &Checkpoint,
    ) -> Result<()>;

    /// Drop the given prior physical tables once the migration finishes.
    async fn drop_prior_tables(&self, physical: &[String]) -> Result<()>;

    async fn version_marker(&self) -> Result<Option<u32>>;
    /// Write the version marker, atomically declaring the conversion done.
    async fn write_version_marker(&self, version: u32) -> Result<()>;

    /// Make sure the current logical schema's physical tables exist.
    async fn apply_schema(&self) -> Result<()>;
}

/// Outcome of one [`SchemaMigrator::run_step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Converted this many rows of the current table.
    Converted(usize),
    /// Nothing left anywhere; old tables dropped, version marker written.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MigrationState {
    NotStarted,
    InProgress,
    Complete,
}

struct PendingTable {
    prior: TableLayout,
    target: TableLayout,
    last_key: Option<String>,
}

/// Converts all rows of each logical table to the new layout, batch by
/// batch, surviving restart at any point.
pub struct SchemaMigrator {
    store: Arc<dyn RowStore>,
    batch_size: usize,
    target_version: u32,
    pending: VecDeque<PendingTable>,
    /// Prior physical tables to drop once everything is converted.
    drop_list: Vec<String>,
    state: MigrationState,
}

impl SchemaMigrator {
    pub fn new(store: Arc<dyn RowStore>, batch_size: usize, target_version: u32) -> Self {
        Self {
            store,
            batch_size,
            target_version,
            pending: VecDeque::new(),
            drop_list: Vec::new(),
            state: MigrationState::NotStarted,
        }
    }

    /// Whether a migration is needed at all: the version marker is behind
    /// the target, or checkpoints from an interrupted run exist.
    pub async fn needed(store: &dyn RowStore, target_version: u32) -> Result<bool> {
        if !store.list_checkpoints().await?.is_empty() {
            return Ok(true);
        }
        Ok(store.version_marker().await? != Some(target_version))
    }

    /// Inspect persisted checkpoints and either resume the in-flight
    /// migration or begin a fresh one.
    pub async fn resume_or_start(&mut self) -> Result<()> {
        let checkpoints = self.store.list_checkpoints().await?;
        let priors = self.store.snapshot_prior_tables().await?;

        let resuming = !checkpoints.is_empty();
        self.pending.clear();
        self.drop_list.clear();

        let mut initial = Vec::new();
        for prior in priors {
            let layout = match prior.layout {
                Some(l) => l,
                None => {
                    // Prior column names unknown at the old version; the
                    // rows cannot be mapped. Documented limitation.
                    warn!(table = %prior.logical, "Skipping table with unknown prior layout");
                    continue;
                }
            };

            let checkpoint = checkpoints.iter().find(|c| c.table == layout.logical);
            if resuming && checkpoint.is_none() {
                // The initial checkpoint set is written atomically, so a
                // missing row can only mean the interrupted run finished
                // this table and deleted it. Still drop its old table.
                self.drop_list.push(layout.physical.clone());
                continue;
            }

            let last_key = checkpoint.and_then(|c| c.last_key.clone());
            if !resuming {
                initial.push(Checkpoint {
                    table: layout.logical.clone(),
                    last_key: None,
                });
            }

            let target = self.store.target_layout(&layout.logical).await?;
            self.drop_list.push(layout.physical.clone());
            self.pending.push_back(PendingTable {
                prior: layout,
                target,
                last_key,
            });
        }

        if !initial.is_empty() {
            // One transaction marks the migration as in progress for every
            // table at once. A crash anywhere up to here leaves the store
            // checkpoint-free, and the next start begins fresh.
            self.store.put_checkpoints(&initial).await?;
        }

        if self.pending.is_empty() {
            self.finish().await?;
        } else {
            info!(
                tables = self.pending.len(),
                resuming, "Schema migration {}",
                if resuming { "resumed" } else { "started" }
            );
            self.state = MigrationState::InProgress;
        }
        Ok(())
    }

    /// Convert up to one batch of the current table.
    pub async fn run_step(&mut self) -> Result<StepResult> {
        if self.state == MigrationState::Complete {
            return Ok(StepResult::Complete);
        }
        if self.state == MigrationState::NotStarted {
            return Err(WardenError::Migration(
                "run_step before resume_or_start".into(),
            ));
        }

        let head = match self.pending.front_mut() {
            Some(t) => t,
            None => {
                self.finish().await?;
                return Ok(StepResult::Complete);
            }
        };

        let rows = self
            .store
            .select_batch(&head.prior, head.last_key.as_deref(), self.batch_size)
            .await?;

        if rows.is_empty() {
            // Table fully converted: drop it from the pending list and
            // delete its checkpoint so a resume never re-selects it.
            let done = self.pending.pop_front().expect("head exists");
            self.store.delete_checkpoint(&done.prior.logical).await?;
            info!(table = %done.prior.logical, "Table migration complete");

            if self.pending.is_empty() {
                self.finish().await?;
                return Ok(StepResult::Complete);
            }
            return Ok(StepResult::Converted(0));
        }

        let batch_last_key = rows.last().expect("non-empty").key.clone();
        let converted = convert_rows(rows, &head.prior, &head.target)?;
        let count = converted.len();

        let checkpoint = Checkpoint {
            table: head.prior.logical.clone(),
            last_key: Some(batch_last_key.clone()),
        };
        self.store
            .commit_batch(&head.target, converted, &checkpoint)
            .await?;
        head.last_key = Some(batch_last_key);

        debug!(
            table = %head.prior.logical,
            rows = count,
            "Migration batch committed"
        );
        Ok(StepResult::Converted(count))
    }

    pub fn is_complete(&self) -> bool {
        self.state == MigrationState::Complete
    }

    /// Logical tables still awaiting conversion.
    pub fn pending_tables(&self) -> Vec<String> {
        self.pending
            .iter()
            .map(|t| t.prior.logical.clone())
            .collect()
    }

    async fn finish(&mut self) -> Result<()> {
        if !self.drop_list.is_empty() {
            self.store.drop_prior_tables(&self.drop_list).await?;
        }
        self.store.write_version_marker(self.target_version).await?;
        self.state = MigrationState::Complete;
        info!(version = self.target_version, "Schema migration complete");
        Ok(())
    }
}

/// Convert a batch of prior-layout rows into the target layout.
fn convert_rows(rows: Vec<Row>, prior: &TableLayout, target: &TableLayout) -> Result<Vec<Row>> {
    rows.into_iter()
        .map(|row| {
            let columns = target
                .columns
                .iter()
                .map(|col| {
                    // Column carried over by name; columns new in the target
                    // layout start out null.
                    let value = match row.value_of(&col.name) {
                        Some(v) => v.clone().coerce(col.ty)?,
                        None => Value::Null,
                    };
                    Ok((col.name.clone(), value))
                })
                .collect::<Result<Vec<_>>>()
                .map_err(|e| {
                    WardenError::Migration(format!(
                        "row '{}' of {}: {}",
                        row.key, prior.logical, e
                    ))
                })?;
            Ok(Row {
                key: row.key,
                columns,
            })
        })
        .collect()
}
