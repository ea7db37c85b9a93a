//! Manifests: the data entries that make up a table at a snapshot

pub mod inline;
pub mod predicate;

pub use inline::InliningBuffer;
pub use predicate::{Expr, Predicate};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::LakeResult;
use crate::ids::{ColumnId, EntryId, FileRef, RowId, SchemaVersionId, SnapshotId};
use crate::storage::{DataFileError, FileStore, decode_rows};
use crate::value::Value;

/// A row as stored: values keyed by column id.
///
/// A missing key means the column did not exist when the row was written;
/// readers substitute the column's initial default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub row_id: RowId,
    pub values: BTreeMap<ColumnId, Value>,
}

impl StoredRow {
    pub fn estimated_size(&self) -> usize {
        8 + self
            .values
            .values()
            .map(|v| 4 + v.estimated_size())
            .sum::<usize>()
    }
}

/// Min/max/null statistics for one column of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ColumnStats {
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub null_count: u64,
    /// Rows that carry this column at all (including NULLs)
    pub value_count: u64,
}

impl ColumnStats {
    pub fn observe(&mut self, value: &Value) {
        self.value_count += 1;
        if value.is_null() {
            self.null_count += 1;
            return;
        }
        if self
            .min
            .as_ref()
            .is_none_or(|m| value.compare(m) == Some(Ordering::Less))
        {
            self.min = Some(value.clone());
        }
        if self
            .max
            .as_ref()
            .is_none_or(|m| value.compare(m) == Some(Ordering::Greater))
        {
            self.max = Some(value.clone());
        }
    }

    /// Merge statistics of two entries without rescanning rows
    pub fn combine(&self, other: &ColumnStats) -> ColumnStats {
        let pick = |a: &Option<Value>, b: &Option<Value>, want: Ordering| match (a, b) {
            (Some(x), Some(y)) => match x.compare(y) {
                Some(ord) if ord == want => Some(x.clone()),
                Some(_) => Some(y.clone()),
                // Incomparable after a type change: keep the left bound
                None => Some(x.clone()),
            },
            (Some(x), None) => Some(x.clone()),
            (None, y) => y.clone(),
        };
        ColumnStats {
            min: pick(&self.min, &other.min, Ordering::Less),
            max: pick(&self.max, &other.max, Ordering::Greater),
            null_count: self.null_count + other.null_count,
            value_count: self.value_count + other.value_count,
        }
    }
}

pub type EntryStats = BTreeMap<ColumnId, ColumnStats>;

pub fn compute_stats<'a>(rows: impl IntoIterator<Item = &'a StoredRow>) -> EntryStats {
    let mut stats = EntryStats::new();
    for row in rows {
        for (column, value) in &row.values {
            stats.entry(*column).or_default().observe(value);
        }
    }
    stats
}

pub fn combine_stats(a: &EntryStats, b: &EntryStats) -> EntryStats {
    let mut out = a.clone();
    for (column, stats) in b {
        let merged = match out.get(column) {
            Some(existing) => existing.combine(stats),
            None => stats.clone(),
        };
        out.insert(*column, merged);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Physical data file in the file store
    File { file_ref: FileRef, byte_size: u64 },
    /// Rows kept as catalog metadata
    Inline { rows: Vec<StoredRow> },
}

/// A file entry or an inline row set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    pub id: EntryId,
    pub table: String,
    pub kind: EntryKind,
    pub row_count: u64,
    pub stats: EntryStats,
}

impl DataEntry {
    pub fn file(table: &str, file_ref: FileRef, byte_size: u64, rows: &[StoredRow]) -> Self {
        Self {
            id: EntryId::new(),
            table: table.to_string(),
            kind: EntryKind::File {
                file_ref,
                byte_size,
            },
            row_count: rows.len() as u64,
            stats: compute_stats(rows),
        }
    }

    pub fn inline(table: &str, rows: Vec<StoredRow>) -> Self {
        let stats = compute_stats(&rows);
        Self {
            id: EntryId::new(),
            table: table.to_string(),
            row_count: rows.len() as u64,
            kind: EntryKind::Inline { rows },
            stats,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.kind, EntryKind::Inline { .. })
    }

    pub fn file_ref(&self) -> Option<&FileRef> {
        match &self.kind {
            EntryKind::File { file_ref, .. } => Some(file_ref),
            EntryKind::Inline { .. } => None,
        }
    }

    /// Materialize the entry's rows, reading the data file if needed
    pub fn load_rows(&self, store: &dyn FileStore) -> LakeResult<Vec<StoredRow>> {
        match &self.kind {
            EntryKind::Inline { rows } => Ok(rows.clone()),
            EntryKind::File { file_ref, .. } => {
                let data = store.get(file_ref)?;
                let rows = decode_rows(&data)?;
                if rows.len() as u64 != self.row_count {
                    return Err(DataFileError::Corrupt(format!(
                        "{} holds {} rows, catalog expects {}",
                        file_ref,
                        rows.len(),
                        self.row_count
                    ))
                    .into());
                }
                Ok(rows)
            }
        }
    }

    pub fn byte_size(&self) -> u64 {
        match &self.kind {
            EntryKind::File { byte_size, .. } => *byte_size,
            EntryKind::Inline { rows } => rows.iter().map(|r| r.estimated_size() as u64).sum(),
        }
    }
}

/// Aggregated statistics over a manifest's entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TableStats {
    pub row_count: u64,
    pub file_count: u64,
    pub inline_count: u64,
    pub byte_size: u64,
    pub columns: EntryStats,
}

impl TableStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DataEntry>) -> Self {
        entries
            .into_iter()
            .fold(TableStats::default(), |acc, e| acc.with_entry(e))
    }

    pub fn with_entry(mut self, entry: &DataEntry) -> Self {
        self.row_count += entry.row_count;
        self.byte_size += entry.byte_size();
        if entry.is_inline() {
            self.inline_count += 1;
        } else {
            self.file_count += 1;
        }
        self.columns = combine_stats(&self.columns, &entry.stats);
        self
    }
}

/// The content of one table at one snapshot.
///
/// Only written for snapshots that changed the table; readers carry the
/// previous manifest forward otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub table: String,
    pub snapshot_id: SnapshotId,
    pub schema_version: SchemaVersionId,
    pub entries: Vec<EntryId>,
    pub stats: TableStats,
    /// Tombstone written when the table is dropped
    #[serde(default)]
    pub dropped: bool,
}

impl Manifest {
    pub fn row_count(&self) -> u64 {
        self.stats.row_count
    }
}
