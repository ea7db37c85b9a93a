//! Per-table staging area of a transaction

use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::catalog::{TableChange, TableRecord, TableSwap};
use crate::error::{LakeError, LakeResult};
use crate::ids::{EntryId, FileRef, RowId, SchemaVersionId, SnapshotId, TxnId};
use crate::lakehouse::LakeContext;
use crate::manifest::{
    DataEntry, EntryKind, Expr, InliningBuffer, Manifest, Predicate, StoredRow, TableStats,
};
use crate::schema::{SchemaChangeOp, SchemaVersion};
use crate::storage::encode_rows;
use crate::value::{Row, Value};

/// Column values of one inserted row, by column name
pub type InsertRow = BTreeMap<String, Value>;

/// A table's state as the owning transaction sees it.
///
/// Starts from the committed state recorded at `begin` and accumulates the
/// transaction's changes. Nothing here is visible to other transactions.
#[derive(Debug, Clone)]
pub(crate) struct TableWorkspace {
    pub name: String,
    /// Committed record at `begin` (None: table never existed)
    pub start: Option<TableRecord>,
    pub base_manifest: Option<Manifest>,
    base_ids: HashSet<EntryId>,
    /// Working schema; None while the table does not exist
    pub schema: Option<SchemaVersion>,
    pub live: Vec<DataEntry>,
    pub buffer: InliningBuffer,
    pub next_row_id: u64,
    pub change: TableChange,
    pub dirty: bool,
    pub schema_changed: bool,
    /// A constraint was added; every row is checked at commit
    pub needs_full_check: bool,
}

/// One table's share of a commit batch
#[derive(Debug, Clone)]
pub(crate) struct PreparedTable {
    pub manifest: Manifest,
    pub schema: Option<SchemaVersion>,
    pub new_entries: Vec<DataEntry>,
    pub swap: TableSwap,
    pub change: TableChange,
}

impl TableWorkspace {
    pub fn load(ctx: &LakeContext, name: &str, start: Option<TableRecord>) -> LakeResult<Self> {
        let mut ws = TableWorkspace {
            name: name.to_string(),
            next_row_id: start.as_ref().map(|r| r.next_row_id).unwrap_or(1),
            start: None,
            base_manifest: None,
            base_ids: HashSet::new(),
            schema: None,
            live: Vec::new(),
            buffer: InliningBuffer::new(&ctx.config.inlining),
            change: TableChange::default(),
            dirty: false,
            schema_changed: false,
            needs_full_check: false,
        };

        if let Some(record) = start.as_ref().filter(|r| !r.dropped) {
            let manifest = ctx
                .backend
                .get_manifest(name, record.current_snapshot)?
                .ok_or_else(|| {
                    LakeError::Conflict(format!(
                        "state of table '{}' at snapshot {} is gone",
                        name, record.current_snapshot
                    ))
                })?;
            let schema = ctx
                .backend
                .get_schema(name, record.schema_version)?
                .ok_or_else(|| {
                    LakeError::Conflict(format!(
                        "schema {} of table '{}' is gone",
                        record.schema_version, name
                    ))
                })?;
            ws.live = ctx.backend.get_entries(&manifest.entries)?;
            ws.base_ids = manifest.entries.iter().copied().collect();
            ws.change.prior_row_count = manifest.row_count();
            ws.base_manifest = Some(manifest);
            ws.schema = Some(schema);
        }
        ws.start = start;
        Ok(ws)
    }

    pub fn schema(&self) -> LakeResult<&SchemaVersion> {
        self.schema
            .as_ref()
            .ok_or_else(|| LakeError::TableNotFound(self.name.clone()))
    }

    fn exists_at_start(&self) -> bool {
        self.start.as_ref().is_some_and(|r| !r.dropped)
    }

    /// Rows and bytes already inline in the table
    fn carried_inline(&self) -> (usize, usize) {
        self.live
            .iter()
            .filter(|e| e.is_inline())
            .fold((0, 0), |(rows, bytes), e| {
                (rows + e.row_count as usize, bytes + e.byte_size() as usize)
            })
    }

    /// Every stored row the table holds in this transaction, in row id order
    pub fn all_rows(&self, ctx: &LakeContext) -> LakeResult<Vec<StoredRow>> {
        let mut rows = Vec::new();
        for entry in &self.live {
            rows.extend(entry.load_rows(ctx.store.as_ref())?);
        }
        rows.extend(self.buffer.rows().iter().cloned());
        rows.sort_by_key(|r| r.row_id);
        Ok(rows)
    }

    /// Rows this transaction wrote, either still buffered or already in a
    /// file it staged
    pub fn new_rows(&self, ctx: &LakeContext) -> LakeResult<Vec<StoredRow>> {
        let mut rows = Vec::new();
        for entry in self.live.iter().filter(|e| !self.base_ids.contains(&e.id)) {
            rows.extend(entry.load_rows(ctx.store.as_ref())?);
        }
        rows.extend(self.buffer.rows().iter().cloned());
        Ok(rows)
    }

    /// Entries from the start state that are still live
    pub fn base_entries(&self) -> impl Iterator<Item = &DataEntry> {
        self.live.iter().filter(|e| self.base_ids.contains(&e.id))
    }

    pub fn scan(&self, ctx: &LakeContext, predicate: &Predicate) -> LakeResult<Vec<Row>> {
        let schema = self.schema()?;
        let bound = predicate.bind(schema)?;
        let mut out = Vec::new();
        for stored in self.all_rows(ctx)? {
            let row = schema.project(&stored)?;
            if bound.matches(&row)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    pub(crate) fn write_file(
        &self,
        ctx: &LakeContext,
        txn: TxnId,
        rows: &[StoredRow],
    ) -> LakeResult<DataEntry> {
        let encoded = encode_rows(rows)?;
        let byte_size = encoded.data.len() as u64;
        let file_ref = ctx
            .staging
            .put(txn, ctx.store.as_ref(), &self.name, encoded.data)?;
        debug!(table = %self.name, %txn, file = %file_ref, rows = rows.len(), "Wrote data file");
        Ok(DataEntry {
            id: EntryId::new(),
            table: self.name.clone(),
            kind: EntryKind::File {
                file_ref,
                byte_size,
            },
            row_count: rows.len() as u64,
            stats: encoded.stats,
        })
    }

    /// Once the inline rows plus the buffer reach a limit, write them all as
    /// one file and empty the buffer
    fn maybe_flush(&mut self, ctx: &LakeContext, txn: TxnId) -> LakeResult<()> {
        let (carried_rows, carried_bytes) = self.carried_inline();
        if !self.buffer.should_flush(carried_rows, carried_bytes) {
            return Ok(());
        }
        let carried = carried_rows > 0;
        let mut rows = self.take_inline_rows();
        rows.extend(self.buffer.take());
        rows.sort_by_key(|r| r.row_id);

        let entry = self.write_file(ctx, txn, &rows)?;
        self.live.push(entry);
        if carried {
            self.change.inline_flushed = true;
        }
        Ok(())
    }

    /// Remove every inline entry from the live set, returning its rows
    pub(crate) fn take_inline_rows(&mut self) -> Vec<StoredRow> {
        let mut rows = Vec::new();
        self.live.retain(|entry| match &entry.kind {
            EntryKind::Inline { rows: inline } => {
                rows.extend(inline.iter().cloned());
                false
            }
            EntryKind::File { .. } => true,
        });
        rows
    }

    fn encode_values(
        &self,
        schema: &SchemaVersion,
        row_id: RowId,
        mut values: InsertRow,
        use_defaults: bool,
    ) -> LakeResult<StoredRow> {
        if let Some(unknown) = values.keys().find(|name| schema.column(name).is_err()) {
            return Err(LakeError::ColumnNotFound(format!("{}.{}", self.name, unknown)));
        }
        let mut stored = BTreeMap::new();
        for col in &schema.columns {
            let value = match values.remove(&col.name) {
                Some(v) => v.cast_to(&col.data_type)?,
                None if use_defaults => col.default.clone().unwrap_or(Value::Null),
                None => Value::Null,
            };
            if value.is_null() && !col.nullable {
                return Err(LakeError::Validation(format!(
                    "column '{}' of table '{}' cannot be NULL",
                    col.name, self.name
                )));
            }
            stored.insert(col.id, value);
        }
        Ok(StoredRow {
            row_id,
            values: stored,
        })
    }

    pub fn insert(&mut self, ctx: &LakeContext, txn: TxnId, rows: Vec<InsertRow>) -> LakeResult<u64> {
        let schema = self.schema()?.clone();
        let mut stored = Vec::with_capacity(rows.len());
        for values in rows {
            let row_id = RowId(self.next_row_id);
            stored.push(self.encode_values(&schema, row_id, values, true)?);
            self.next_row_id += 1;
        }

        let count = stored.len() as u64;
        if count == 0 {
            return Ok(0);
        }
        self.buffer.extend(stored);
        self.change.inserted += count;
        self.dirty = true;
        self.maybe_flush(ctx, txn)?;
        Ok(count)
    }

    pub fn update(
        &mut self,
        ctx: &LakeContext,
        txn: TxnId,
        predicate: &Predicate,
        assignments: &[(String, Expr)],
    ) -> LakeResult<u64> {
        let schema = self.schema()?.clone();
        if assignments.is_empty() {
            return Err(LakeError::InvalidInput("update without assignments".into()));
        }
        let mut targets = Vec::with_capacity(assignments.len());
        for (name, expr) in assignments {
            expr.validate(&schema)?;
            targets.push((schema.column(name)?.name.clone(), expr));
        }

        let updated = self.rewrite(ctx, txn, &schema, predicate, |row| {
            let mut next = row.clone();
            // Every expression sees the row as it was before the update
            for (column, expr) in &targets {
                next.insert(column.clone(), expr.eval(&row)?);
            }
            Ok(Some(next))
        })?;
        self.change.updated += updated;
        Ok(updated)
    }

    pub fn delete(&mut self, ctx: &LakeContext, txn: TxnId, predicate: &Predicate) -> LakeResult<u64> {
        let schema = self.schema()?.clone();
        let deleted = self.rewrite(ctx, txn, &schema, predicate, |_| Ok(None))?;
        self.change.deleted += deleted;
        Ok(deleted)
    }

    /// Copy-on-write over the live entries. An entry holding a matching row
    /// leaves the live set; its surviving rows move to the buffer. Entries
    /// whose stats rule the predicate out are not read.
    fn rewrite<F>(
        &mut self,
        ctx: &LakeContext,
        txn: TxnId,
        schema: &SchemaVersion,
        predicate: &Predicate,
        mut f: F,
    ) -> LakeResult<u64>
    where
        F: FnMut(Row) -> LakeResult<Option<Row>>,
    {
        let bound = predicate.bind(schema)?;
        let mut matched = 0u64;

        let mut apply = |rows: Vec<StoredRow>,
                         ws: &TableWorkspace|
         -> LakeResult<(bool, Vec<StoredRow>)> {
            let mut hit = false;
            let mut out = Vec::with_capacity(rows.len());
            for stored in rows {
                let row = schema.project(&stored)?;
                if !bound.matches(&row)? {
                    out.push(stored);
                    continue;
                }
                hit = true;
                matched += 1;
                if let Some(next) = f(row)? {
                    out.push(ws.encode_values(schema, stored.row_id, next.data, false)?);
                }
            }
            Ok((hit, out))
        };

        let mut kept = Vec::with_capacity(self.live.len());
        let mut moved = Vec::new();
        for entry in std::mem::take(&mut self.live) {
            if !bound.may_match(schema, &entry.stats, entry.row_count) {
                kept.push(entry);
                continue;
            }
            let rows = entry.load_rows(ctx.store.as_ref())?;
            let (hit, out) = apply(rows, self)?;
            if hit {
                moved.extend(out);
            } else {
                kept.push(entry);
            }
        }
        let buffered = self.buffer.take();
        let (_, mut rows) = apply(buffered, self)?;
        rows.extend(moved);
        rows.sort_by_key(|r| r.row_id);

        self.live = kept;
        self.buffer.replace(rows);
        if matched > 0 {
            self.dirty = true;
            self.maybe_flush(ctx, txn)?;
        }
        Ok(matched)
    }

    pub fn change_schema(&mut self, ctx: &LakeContext, op: &SchemaChangeOp) -> LakeResult<()> {
        match op {
            SchemaChangeOp::CreateTable {
                columns,
                primary_key,
            } => {
                if self.schema.is_some() {
                    return Err(LakeError::AlreadyExists(format!("table '{}'", self.name)));
                }
                let mut schema = SchemaVersion::initial(&self.name, columns.clone(), primary_key.clone())?;
                schema.version_id = SchemaVersionId(
                    self.start
                        .as_ref()
                        .map(|r| r.schema_version.0 + 1)
                        .unwrap_or(1),
                );
                self.schema = Some(schema);
                self.live.clear();
                self.buffer.take();
                self.change.created = true;
                self.change.dropped = false;
                self.schema_changed = true;
                self.dirty = true;
            }
            SchemaChangeOp::DropTable => {
                self.schema()?;
                self.schema = None;
                self.live.clear();
                self.buffer.take();
                self.needs_full_check = false;
                if self.exists_at_start() {
                    self.change = TableChange {
                        dropped: true,
                        prior_row_count: self.change.prior_row_count,
                        ..TableChange::default()
                    };
                    self.schema_changed = true;
                    self.dirty = true;
                } else {
                    // Created and dropped within this transaction
                    self.change = TableChange::default();
                    self.schema_changed = false;
                    self.dirty = false;
                }
            }
            SchemaChangeOp::ChangeType { column, data_type } => {
                let schema = self.schema()?;
                let id = schema.column(column)?.id;
                for stored in self.all_rows(ctx)? {
                    if let Some(value) = stored.values.get(&id) {
                        value.cast_to(data_type)?;
                    }
                }
                self.apply_column_change(op)?;
                // Distinct values can collide once cast, e.g. '1' and '01'
                let keyed = self
                    .schema()?
                    .unique_keys()
                    .iter()
                    .any(|key| key.contains(&id));
                if keyed {
                    self.needs_full_check = true;
                }
            }
            SchemaChangeOp::SetNotNull { .. } | SchemaChangeOp::AddUnique { .. } => {
                self.apply_column_change(op)?;
                self.needs_full_check = true;
            }
            _ => self.apply_column_change(op)?,
        }
        debug!(table = %self.name, op = op.name(), "Staged schema change");
        Ok(())
    }

    fn apply_column_change(&mut self, op: &SchemaChangeOp) -> LakeResult<()> {
        let current = self.schema()?;
        let mut next = current.apply(op)?;
        // All changes of one transaction collapse into one new version
        if !self.schema_changed {
            next.version_id = SchemaVersionId(current.version_id.0 + 1);
        }
        self.schema = Some(next);
        self.schema_changed = true;
        if !self.change.created {
            self.change.altered = true;
        }
        self.dirty = true;
        Ok(())
    }

    /// Move the buffered rows into one inline entry. Runs once, before the
    /// commit is published.
    pub fn seal(&mut self) {
        if !self.buffer.is_empty() {
            let rows = self.buffer.take();
            self.live.push(DataEntry::inline(&self.name, rows));
        }
    }

    /// File refs the published manifest will reference
    pub fn referenced_files(&self) -> HashSet<FileRef> {
        self.live
            .iter()
            .filter_map(|e| e.file_ref().cloned())
            .collect()
    }

    pub fn prepare(&self, snapshot_id: SnapshotId) -> PreparedTable {
        let dropped = self.schema.is_none();
        let schema_version = match (&self.schema, &self.start) {
            (Some(schema), _) => schema.version_id,
            (None, Some(start)) => start.schema_version,
            (None, None) => SchemaVersionId(1),
        };

        let stats = TableStats::from_entries(&self.live);
        let manifest = Manifest {
            table: self.name.clone(),
            snapshot_id,
            schema_version,
            entries: self.live.iter().map(|e| e.id).collect(),
            stats,
            dropped,
        };

        let schema = self
            .schema
            .as_ref()
            .filter(|_| self.schema_changed)
            .map(|s| SchemaVersion {
                valid_from_snapshot: snapshot_id,
                ..s.clone()
            });

        let created_snapshot = match &self.start {
            Some(start) if !self.change.created => start.created_snapshot,
            _ => snapshot_id,
        };
        let swap = TableSwap {
            table: self.name.clone(),
            expected: self.start.as_ref().map(|r| r.current_snapshot),
            new: TableRecord {
                name: self.name.clone(),
                current_snapshot: snapshot_id,
                created_snapshot,
                schema_version,
                next_row_id: self.next_row_id,
                dropped,
            },
        };

        let mut change = self.change.clone();
        change.row_count = manifest.row_count();

        PreparedTable {
            new_entries: self
                .live
                .iter()
                .filter(|e| !self.base_ids.contains(&e.id))
                .cloned()
                .collect(),
            manifest,
            schema,
            swap,
            change,
        }
    }
}
