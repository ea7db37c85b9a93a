//! Multi-table optimistic transactions

pub mod coordinator;
pub(crate) mod workspace;

pub use coordinator::{RecoveryReport, TransactionCoordinator};
pub use workspace::InsertRow;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{TableRecord, committed_tables};
use crate::error::{LakeError, LakeResult};
use crate::gc::ReadPin;
use crate::ids::{FileRef, SnapshotId, TxnId};
use crate::lakehouse::LakeContext;
use crate::manifest::{Expr, Predicate};
use crate::schema::SchemaChangeOp;
use crate::value::{Row, Value};

use workspace::TableWorkspace;

/// Snapshot each touched table advanced to
pub type SnapshotSet = BTreeMap<String, SnapshotId>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// A staged mutation against one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationOp {
    Insert {
        rows: Vec<InsertRow>,
    },
    Update {
        predicate: Predicate,
        assignments: Vec<(String, Expr)>,
    },
    Delete {
        predicate: Predicate,
    },
    SchemaChange(SchemaChangeOp),
}

impl MutationOp {
    pub fn insert(rows: Vec<InsertRow>) -> Self {
        MutationOp::Insert { rows }
    }

    pub fn insert_one(row: InsertRow) -> Self {
        MutationOp::Insert { rows: vec![row] }
    }

    pub fn update(predicate: Predicate, assignments: Vec<(&str, Expr)>) -> Self {
        MutationOp::Update {
            predicate,
            assignments: assignments
                .into_iter()
                .map(|(c, e)| (c.to_string(), e))
                .collect(),
        }
    }

    pub fn delete(predicate: Predicate) -> Self {
        MutationOp::Delete { predicate }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MutationOp::Insert { .. } => "INSERT",
            MutationOp::Update { .. } => "UPDATE",
            MutationOp::Delete { .. } => "DELETE",
            MutationOp::SchemaChange(op) => op.name(),
        }
    }

    /// A failure of this op ends the whole transaction
    fn aborts_on_failure(&self) -> bool {
        matches!(
            self,
            MutationOp::SchemaChange(SchemaChangeOp::ChangeType { .. })
        )
    }
}

/// Build an insert row from (column, value) pairs
pub fn record<I, K, V>(pairs: I) -> InsertRow
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Turn rows read from a table back into insert rows, e.g. to restore an
/// earlier version
pub fn rows_to_records(rows: Vec<Row>) -> Vec<InsertRow> {
    rows.into_iter().map(|r| r.data).collect()
}

/// A transaction over any number of tables.
///
/// Mutations are staged in memory; nothing reaches the catalog until
/// `commit`, which publishes one snapshot for every touched table or none
/// at all. Dropping an active transaction aborts it.
pub struct Transaction {
    id: TxnId,
    state: TransactionState,
    ctx: Arc<LakeContext>,
    /// Committed table records when the transaction began
    start: BTreeMap<String, TableRecord>,
    workspaces: BTreeMap<String, TableWorkspace>,
    pins: Vec<ReadPin>,
    commit_message: Option<String>,
}

impl Transaction {
    pub(crate) fn begin(ctx: Arc<LakeContext>) -> LakeResult<Self> {
        let start = committed_tables(ctx.backend.as_ref())?;
        let id = ctx.coordinator.begin();
        debug!(txn_id = %id, tables = start.len(), "Began transaction");
        Ok(Self {
            id,
            state: TransactionState::Active,
            ctx,
            start,
            workspaces: BTreeMap::new(),
            pins: Vec::new(),
            commit_message: None,
        })
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn set_commit_message(&mut self, message: impl Into<String>) {
        self.commit_message = Some(message.into());
    }

    /// Snapshot of `table` this transaction reads from (None: table absent)
    pub fn start_snapshot(&self, table: &str) -> Option<SnapshotId> {
        self.start
            .get(table)
            .filter(|r| !r.dropped)
            .map(|r| r.current_snapshot)
    }

    fn ensure_active(&self) -> LakeResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            state => Err(LakeError::Transaction(format!(
                "transaction {} is {:?}",
                self.id, state
            ))),
        }
    }

    fn workspace(&mut self, table: &str) -> LakeResult<&TableWorkspace> {
        if !self.workspaces.contains_key(table) {
            let start = self.start.get(table).cloned();
            if let Some(record) = start.as_ref().filter(|r| !r.dropped) {
                self.pins
                    .push(self.ctx.pins.pin(table, record.current_snapshot));
            }
            let ws = TableWorkspace::load(&self.ctx, table, start)?;
            self.workspaces.insert(table.to_string(), ws);
        }
        self.workspaces
            .get(table)
            .ok_or_else(|| LakeError::TableNotFound(table.to_string()))
    }

    /// Run `f` against a copy of the table's workspace; the copy replaces
    /// the workspace only if `f` succeeds
    pub(crate) fn with_workspace<R>(
        &mut self,
        table: &str,
        f: impl FnOnce(&mut TableWorkspace, &LakeContext, TxnId) -> LakeResult<R>,
    ) -> LakeResult<R> {
        self.ensure_active()?;
        let mut next = self.workspace(table)?.clone();
        let result = f(&mut next, &*self.ctx, self.id);
        if result.is_ok() {
            self.workspaces.insert(table.to_string(), next);
        }
        result
    }

    /// Stage a mutation, returning the number of rows it affected
    pub fn stage(&mut self, table: &str, op: MutationOp) -> LakeResult<u64> {
        let result = self.with_workspace(table, |ws, ctx, txn| match &op {
            MutationOp::Insert { rows } => ws.insert(ctx, txn, rows.clone()),
            MutationOp::Update {
                predicate,
                assignments,
            } => ws.update(ctx, txn, predicate, assignments),
            MutationOp::Delete { predicate } => ws.delete(ctx, txn, predicate),
            MutationOp::SchemaChange(change) => ws.change_schema(ctx, change).map(|_| 0),
        });

        match result {
            Ok(rows) => {
                debug!(txn_id = %self.id, table, op = op.name(), rows, "Staged mutation");
                Ok(rows)
            }
            Err(e) => {
                let fatal = matches!(
                    e,
                    LakeError::FileStore(_)
                        | LakeError::CatalogBackend(_)
                        | LakeError::DataFile(_)
                        | LakeError::Io(_)
                );
                if self.state == TransactionState::Active && (fatal || op.aborts_on_failure()) {
                    warn!(txn_id = %self.id, table, op = op.name(), error = %e, "Aborting transaction");
                    self.rollback();
                }
                Err(e)
            }
        }
    }

    pub fn insert(&mut self, table: &str, rows: Vec<InsertRow>) -> LakeResult<u64> {
        self.stage(table, MutationOp::insert(rows))
    }

    pub fn update(
        &mut self,
        table: &str,
        predicate: Predicate,
        assignments: Vec<(&str, Expr)>,
    ) -> LakeResult<u64> {
        self.stage(table, MutationOp::update(predicate, assignments))
    }

    pub fn delete(&mut self, table: &str, predicate: Predicate) -> LakeResult<u64> {
        self.stage(table, MutationOp::delete(predicate))
    }

    pub fn alter(&mut self, table: &str, op: SchemaChangeOp) -> LakeResult<()> {
        self.stage(table, MutationOp::SchemaChange(op)).map(|_| ())
    }

    /// Rows of `table` as this transaction sees them, staged changes included
    pub fn scan(&mut self, table: &str, predicate: &Predicate) -> LakeResult<Vec<Row>> {
        self.ensure_active()?;
        let ctx = Arc::clone(&self.ctx);
        self.workspace(table)?.scan(&ctx, predicate)
    }

    pub fn commit(mut self) -> LakeResult<SnapshotSet> {
        self.ensure_active()?;
        let tables: Vec<TableWorkspace> = std::mem::take(&mut self.workspaces)
            .into_values()
            .filter(|ws| ws.dirty)
            .collect();

        if tables.is_empty() {
            self.finish(TransactionState::Committed, &HashSet::new());
            debug!(txn_id = %self.id, "Committed empty transaction");
            return Ok(SnapshotSet::new());
        }

        let message = self.commit_message.take();
        let ctx = Arc::clone(&self.ctx);
        match ctx.coordinator.commit(&ctx, self.id, tables, message) {
            Ok((set, referenced)) => {
                self.finish(TransactionState::Committed, &referenced);
                Ok(set)
            }
            Err(e) => {
                warn!(txn_id = %self.id, error = %e, "Commit failed");
                self.finish(TransactionState::Aborted, &HashSet::new());
                Err(e)
            }
        }
    }

    pub fn abort(mut self) {
        if self.state == TransactionState::Active {
            self.rollback();
            info!(txn_id = %self.id, "Aborted transaction");
        }
    }

    fn rollback(&mut self) {
        self.workspaces.clear();
        self.finish(TransactionState::Aborted, &HashSet::new());
    }

    /// Delete staged files the catalog does not reference and release the
    /// transaction's pins
    fn finish(&mut self, state: TransactionState, keep: &HashSet<FileRef>) {
        self.state = state;
        self.pins.clear();
        for file in self.ctx.staging.release(self.id) {
            if keep.contains(&file) {
                continue;
            }
            if let Err(e) = self.ctx.store.delete(&file) {
                warn!(txn_id = %self.id, file = %file, error = %e, "Failed to delete staged file");
            }
        }
        self.ctx.coordinator.finish(self.id);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            debug!(txn_id = %self.id, "Transaction dropped while active");
            self.rollback();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("tables", &self.workspaces.keys().collect::<Vec<_>>())
            .finish()
    }
}
