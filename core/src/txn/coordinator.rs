//! Commit coordination: conflict detection, constraint validation and
//! publishing snapshots to the catalog

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::{
    BackendError, BackendResult, CatalogBackend, CommitBatch, Snapshot, SnapshotStatus, TableSwap,
    committed_table,
};
use crate::error::{LakeError, LakeResult};
use crate::ids::{ColumnId, FileRef, RowId, SnapshotId, TxnId};
use crate::lakehouse::LakeContext;
use crate::manifest::{Predicate, StoredRow};
use crate::schema::SchemaVersion;
use crate::txn::SnapshotSet;
use crate::txn::workspace::{PreparedTable, TableWorkspace};
use crate::value::Value;

const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Outcome of resolving pending snapshots left by interrupted commits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rolled_forward: Vec<SnapshotId>,
    pub rolled_back: Vec<SnapshotId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.rolled_forward.is_empty() && self.rolled_back.is_empty()
    }
}

/// Hands out transaction ids and turns staged workspaces into snapshots
pub struct TransactionCoordinator {
    next_txn_id: AtomicU64,
    active_transactions: RwLock<HashMap<TxnId, DateTime<Utc>>>,
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            active_transactions: RwLock::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> TxnId {
        let txn_id = TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        self.active_transactions.write().insert(txn_id, Utc::now());
        txn_id
    }

    pub fn finish(&self, txn_id: TxnId) {
        self.active_transactions.write().remove(&txn_id);
    }

    pub fn active_transaction_count(&self) -> usize {
        self.active_transactions.read().len()
    }

    /// Start time of the oldest transaction still running
    pub fn oldest_active(&self) -> Option<DateTime<Utc>> {
        self.active_transactions.read().values().min().copied()
    }

    /// Check, validate and publish the dirty workspaces of one transaction.
    ///
    /// Returns the snapshot set and the files the published manifests
    /// reference.
    pub(crate) fn commit(
        &self,
        ctx: &LakeContext,
        txn_id: TxnId,
        mut tables: Vec<TableWorkspace>,
        message: Option<String>,
    ) -> LakeResult<(SnapshotSet, HashSet<FileRef>)> {
        // Fixed order across transactions
        tables.sort_by(|a, b| a.name.cmp(&b.name));

        for ws in &tables {
            check_pointer(ctx.backend.as_ref(), ws)?;
        }
        for ws in &tables {
            validate_constraints(ctx, ws)?;
        }
        for ws in &mut tables {
            ws.seal();
        }
        let referenced = tables.iter().flat_map(|ws| ws.referenced_files()).collect();

        let set = self.publish(ctx, txn_id, &tables, message)?;
        Ok((set, referenced))
    }

    fn publish(
        &self,
        ctx: &LakeContext,
        txn_id: TxnId,
        tables: &[TableWorkspace],
        message: Option<String>,
    ) -> LakeResult<SnapshotSet> {
        let backend = ctx.backend.as_ref();
        let attempts = ctx.config.catalog.commit_retries;
        let mut backoff = Duration::from_millis(1);

        for attempt in 1..=attempts {
            for ws in tables {
                check_pointer(backend, ws)?;
            }

            let parent = backend.latest_committed()?;
            let snapshot_id = backend.allocate_snapshot_id()?;
            let two_phase = !backend.supports_atomic_batches();
            let batch = build_batch(tables, snapshot_id, parent.as_ref(), message.clone(), two_phase);

            let outcome = if two_phase {
                publish_two_phase(backend, &batch)
            } else {
                backend.commit_batch(&batch)
            };

            match outcome {
                Ok(()) => {
                    info!(
                        txn_id = %txn_id,
                        snapshot_id = %snapshot_id,
                        tables = ?batch.snapshot.changes.keys().collect::<Vec<_>>(),
                        two_phase,
                        "Committed snapshot"
                    );
                    return Ok(tables
                        .iter()
                        .map(|ws| (ws.name.clone(), snapshot_id))
                        .collect());
                }
                Err(BackendError::SnapshotOrder { .. }) | Err(BackendError::CommitInProgress(_)) => {
                    debug!(txn_id = %txn_id, snapshot_id = %snapshot_id, attempt, "Snapshot order moved, retrying");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(BackendError::SwapFailed { table, .. }) => {
                    if let Some(ws) = tables.iter().find(|ws| ws.name == table) {
                        check_pointer(backend, ws)?;
                    }
                    warn!(txn_id = %txn_id, table = %table, "Table pointer moved during publish");
                    return Err(LakeError::Conflict(format!(
                        "table '{}' changed while committing",
                        table
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(txn_id = %txn_id, attempts, "Gave up publishing snapshot");
        Err(LakeError::Conflict(format!(
            "snapshot could not be published after {} attempts",
            attempts
        )))
    }

    /// Resolve pending snapshots: roll forward those whose table swaps all
    /// landed, roll back the rest. Run while no other writer is active.
    pub fn recover(&self, backend: &dyn CatalogBackend) -> LakeResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for snapshot in backend.pending_snapshots()? {
            let SnapshotStatus::Pending { prior, .. } = &snapshot.status else {
                continue;
            };

            let mut swapped = Vec::new();
            for table in prior.keys() {
                let pointer = backend.get_table(table)?.map(|r| r.current_snapshot);
                if pointer == Some(snapshot.id) {
                    swapped.push(table.clone());
                }
            }

            if swapped.len() == prior.len() {
                backend.set_snapshot_committed(snapshot.id)?;
                info!(snapshot_id = %snapshot.id, tables = swapped.len(), "Rolled pending snapshot forward");
                report.rolled_forward.push(snapshot.id);
            } else {
                for table in &swapped {
                    let restore = prior.get(table).and_then(|r| r.as_ref());
                    backend.compare_and_swap_table(table, Some(snapshot.id), restore)?;
                }
                backend.discard_pending(snapshot.id)?;
                info!(snapshot_id = %snapshot.id, swapped = swapped.len(), "Rolled pending snapshot back");
                report.rolled_back.push(snapshot.id);
            }
        }
        Ok(report)
    }
}

/// Fail if the table's committed pointer moved since the transaction began
fn check_pointer(backend: &dyn CatalogBackend, ws: &TableWorkspace) -> LakeResult<()> {
    let current = committed_table(backend, &ws.name)?;
    let expected = ws.start.as_ref().map(|r| r.current_snapshot);
    let actual = current.as_ref().map(|r| r.current_snapshot);
    if actual == expected {
        return Ok(());
    }

    let schema_moved = match (&ws.start, &current) {
        (Some(start), Some(current)) => {
            start.schema_version != current.schema_version || start.dropped != current.dropped
        }
        _ => false,
    };
    let found = actual.map(|id| id.to_string()).unwrap_or_else(|| "none".into());
    let started = expected.map(|id| id.to_string()).unwrap_or_else(|| "none".into());
    warn!(table = %ws.name, expected = %started, actual = %found, schema_moved, "Commit conflict");

    if schema_moved {
        Err(LakeError::SchemaConflict(format!(
            "schema of table '{}' changed after the transaction began (snapshot {} -> {})",
            ws.name, started, found
        )))
    } else {
        Err(LakeError::Conflict(format!(
            "table '{}' was modified concurrently (snapshot {} -> {})",
            ws.name, started, found
        )))
    }
}

fn build_batch(
    tables: &[TableWorkspace],
    snapshot_id: SnapshotId,
    parent: Option<&Snapshot>,
    message: Option<String>,
    two_phase: bool,
) -> CommitBatch {
    let prepared: Vec<PreparedTable> = tables.iter().map(|ws| ws.prepare(snapshot_id)).collect();

    // Timestamps never go backwards along snapshot ids
    let now = Utc::now();
    let timestamp = parent.map_or(now, |p| now.max(p.timestamp));

    let status = if two_phase {
        SnapshotStatus::Pending {
            prior: tables
                .iter()
                .map(|ws| (ws.name.clone(), ws.start.clone()))
                .collect(),
            added_entries: prepared
                .iter()
                .flat_map(|p| p.new_entries.iter().map(|e| e.id))
                .collect(),
        }
    } else {
        SnapshotStatus::Committed
    };

    let mut snapshot = Snapshot {
        id: snapshot_id,
        parent_id: parent.map(|p| p.id),
        timestamp,
        schema_versions: BTreeMap::new(),
        changes: BTreeMap::new(),
        commit_message: message,
        status,
    };
    let mut batch = CommitBatch {
        snapshot: snapshot.clone(),
        manifests: Vec::with_capacity(prepared.len()),
        schemas: Vec::new(),
        entries: Vec::new(),
        swaps: Vec::with_capacity(prepared.len()),
    };
    for table in prepared {
        snapshot
            .schema_versions
            .insert(table.swap.table.clone(), table.manifest.schema_version);
        snapshot.changes.insert(table.swap.table.clone(), table.change);
        batch.manifests.push(table.manifest);
        batch.schemas.extend(table.schema);
        batch.entries.extend(table.new_entries);
        batch.swaps.push(table.swap);
    }
    batch.snapshot = snapshot;
    batch
}

/// Pending snapshot, one compare-and-swap per table, then the commit mark.
/// A failed swap puts back the pointers already moved.
fn publish_two_phase(backend: &dyn CatalogBackend, batch: &CommitBatch) -> BackendResult<()> {
    backend.put_pending(batch)?;

    let mut swapped: Vec<&TableSwap> = Vec::new();
    for swap in &batch.swaps {
        match backend.compare_and_swap_table(&swap.table, swap.expected, Some(&swap.new)) {
            Ok(true) => swapped.push(swap),
            Ok(false) => {
                let actual = backend
                    .get_table(&swap.table)
                    .ok()
                    .flatten()
                    .map(|r| r.current_snapshot);
                roll_back(backend, batch, &swapped);
                return Err(BackendError::SwapFailed {
                    table: swap.table.clone(),
                    expected: swap.expected,
                    actual,
                });
            }
            Err(e) => {
                roll_back(backend, batch, &swapped);
                return Err(e);
            }
        }
    }

    if let Err(e) = backend.set_snapshot_committed(batch.snapshot.id) {
        roll_back(backend, batch, &swapped);
        return Err(e);
    }
    Ok(())
}

fn roll_back(backend: &dyn CatalogBackend, batch: &CommitBatch, swapped: &[&TableSwap]) {
    let id = batch.snapshot.id;
    let SnapshotStatus::Pending { prior, .. } = &batch.snapshot.status else {
        return;
    };
    for swap in swapped {
        let restore = prior.get(&swap.table).and_then(|r| r.as_ref());
        match backend.compare_and_swap_table(&swap.table, Some(id), restore) {
            Ok(true) => {}
            Ok(false) => warn!(table = %swap.table, snapshot_id = %id, "Pointer moved before rollback"),
            Err(e) => warn!(table = %swap.table, snapshot_id = %id, error = %e, "Failed to restore pointer"),
        }
    }
    if let Err(e) = backend.discard_pending(id) {
        warn!(snapshot_id = %id, error = %e, "Pending snapshot left for recovery");
    }
}

/// Column values of a key as the current schema reads them: initial
/// defaults for columns the row predates, cast to the column's current type
fn key_values(row: &StoredRow, schema: &SchemaVersion, key: &[ColumnId]) -> LakeResult<Vec<Value>> {
    key.iter()
        .map(|id| {
            let column = schema.column_by_id(*id);
            let raw = match row.values.get(id) {
                Some(v) => v.clone(),
                None => column
                    .and_then(|c| c.initial_default.clone())
                    .unwrap_or(Value::Null),
            };
            match column {
                Some(c) => raw.cast_to(&c.data_type),
                None => Ok(raw),
            }
        })
        .collect()
}

/// Hashable form of a key; None if any part is NULL
fn key_of(
    row: &StoredRow,
    schema: &SchemaVersion,
    key: &[ColumnId],
) -> LakeResult<Option<Vec<String>>> {
    Ok(key_values(row, schema, key)?
        .iter()
        .map(|v| (!v.is_null()).then(|| v.canonical_key()))
        .collect())
}

fn duplicate(schema: &SchemaVersion, key: &[ColumnId], row: &StoredRow) -> LakeError {
    let kind = if key == schema.primary_key.as_slice() {
        "primary key"
    } else {
        "unique key"
    };
    let values = match key_values(row, schema, key) {
        Ok(values) => values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", "),
        Err(_) => format!("row {}", row.row_id),
    };
    LakeError::Validation(format!(
        "duplicate {} ({}) value ({}) in table '{}'",
        kind,
        schema.key_names(key),
        values,
        schema.table
    ))
}

/// Range of the new rows' first key column, used to skip entries that
/// cannot hold a colliding key
fn key_filter(schema: &SchemaVersion, key: &[ColumnId], rows: &[StoredRow]) -> Predicate {
    let Some(column) = key.first().and_then(|id| schema.column_by_id(*id)) else {
        return Predicate::All;
    };
    let mut min: Option<Value> = None;
    let mut max: Option<Value> = None;
    for value in rows.iter().filter_map(|r| r.values.get(&column.id)) {
        if value.is_null() {
            continue;
        }
        match (&min, &max) {
            (Some(lo), Some(hi)) => match (value.compare(lo), value.compare(hi)) {
                (Some(a), Some(b)) => {
                    if a.is_lt() {
                        min = Some(value.clone());
                    }
                    if b.is_gt() {
                        max = Some(value.clone());
                    }
                }
                _ => return Predicate::All,
            },
            _ => {
                min = Some(value.clone());
                max = Some(value.clone());
            }
        }
    }
    match (min, max) {
        (Some(lo), Some(hi)) => Predicate::ge(&column.name, lo).and(Predicate::le(&column.name, hi)),
        _ => Predicate::All,
    }
}

/// Primary key, unique and NOT NULL checks on the table's merged state
fn validate_constraints(ctx: &LakeContext, ws: &TableWorkspace) -> LakeResult<()> {
    let Some(schema) = ws.schema.as_ref() else {
        return Ok(());
    };
    if ws.needs_full_check {
        return validate_all(ctx, ws, schema);
    }

    let new_rows = ws.new_rows(ctx)?;
    if new_rows.is_empty() {
        return Ok(());
    }
    for key in schema.unique_keys() {
        let mut seen: HashMap<Vec<String>, RowId> = HashMap::new();
        for row in &new_rows {
            if let Some(k) = key_of(row, schema, &key)?
                && seen.insert(k, row.row_id).is_some()
            {
                return Err(duplicate(schema, &key, row));
            }
        }
        if seen.is_empty() {
            continue;
        }

        let filter = key_filter(schema, &key, &new_rows);
        for entry in ws.base_entries() {
            if !filter.may_match(schema, &entry.stats, entry.row_count) {
                continue;
            }
            for row in entry.load_rows(ctx.store.as_ref())? {
                if let Some(k) = key_of(&row, schema, &key)?
                    && seen.contains_key(&k)
                {
                    return Err(duplicate(schema, &key, &row));
                }
            }
        }
    }
    Ok(())
}

fn validate_all(ctx: &LakeContext, ws: &TableWorkspace, schema: &SchemaVersion) -> LakeResult<()> {
    let rows = ws.all_rows(ctx)?;
    let required: Vec<_> = schema.columns.iter().filter(|c| !c.nullable).collect();
    for row in &rows {
        for col in &required {
            let value = key_values(row, schema, &[col.id])?;
            if value.iter().any(Value::is_null) {
                return Err(LakeError::Validation(format!(
                    "column '{}' of table '{}' contains NULL (row {})",
                    col.name, schema.table, row.row_id
                )));
            }
        }
    }
    for key in schema.unique_keys() {
        let mut seen = HashSet::new();
        for row in &rows {
            if let Some(k) = key_of(row, schema, &key)?
                && !seen.insert(k)
            {
                return Err(duplicate(schema, &key, row));
            }
        }
    }
    debug!(table = %ws.name, rows = rows.len(), "Validated constraints on full table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_lifecycle() {
        let coordinator = TransactionCoordinator::new();
        let a = coordinator.begin();
        let b = coordinator.begin();
        assert_ne!(a, b);
        assert_eq!(coordinator.active_transaction_count(), 2);
        assert!(coordinator.oldest_active().is_some());

        coordinator.finish(a);
        coordinator.finish(b);
        assert_eq!(coordinator.active_transaction_count(), 0);
    }

    #[test]
    fn test_key_of_skips_nulls() {
        let schema = SchemaVersion::initial(
            "t",
            vec![
                crate::schema::ColumnDef::new("a", crate::value::DataType::Integer),
                crate::schema::ColumnDef::new("b", crate::value::DataType::Integer),
            ],
            vec![],
        )
        .unwrap();
        let row = StoredRow {
            row_id: RowId(1),
            values: BTreeMap::from([(ColumnId(1), Value::Integer(1)), (ColumnId(2), Value::Null)]),
        };
        assert!(key_of(&row, &schema, &[ColumnId(1)]).unwrap().is_some());
        assert!(
            key_of(&row, &schema, &[ColumnId(1), ColumnId(2)])
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_key_of_reads_values_in_the_current_type() {
        let stored = |row_id, value: Value| StoredRow {
            row_id: RowId(row_id),
            values: BTreeMap::from([(ColumnId(1), value)]),
        };
        let schema = |data_type| {
            SchemaVersion::initial(
                "t",
                vec![crate::schema::ColumnDef::new("a", data_type)],
                vec!["a".into()],
            )
            .unwrap()
        };

        // Written as INTEGER, read after a change to VARCHAR
        let text = schema(crate::value::DataType::Varchar);
        assert_eq!(
            key_of(&stored(1, Value::Integer(1)), &text, &[ColumnId(1)]).unwrap(),
            key_of(&stored(2, Value::from("1")), &text, &[ColumnId(1)]).unwrap()
        );

        // Written as VARCHAR, read after a change to INTEGER
        let int = schema(crate::value::DataType::Integer);
        assert_eq!(
            key_of(&stored(1, Value::from("01")), &int, &[ColumnId(1)]).unwrap(),
            key_of(&stored(2, Value::from("1")), &int, &[ColumnId(1)]).unwrap()
        );
    }
}
