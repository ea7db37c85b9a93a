//! Rows persisted by catalog backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::ids::{EntryId, SchemaVersionId, SnapshotId};
use crate::manifest::{DataEntry, Manifest};
use crate::schema::SchemaVersion;

/// What a snapshot did to one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TableChange {
    pub inserted: u64,
    pub deleted: u64,
    pub updated: u64,
    pub created: bool,
    pub dropped: bool,
    /// Schema changed
    pub altered: bool,
    pub compacted: bool,
    pub inline_flushed: bool,
    /// Rows visible before this snapshot
    pub prior_row_count: u64,
    /// Rows visible after this snapshot
    pub row_count: u64,
}

impl TableChange {
    /// A delete that removed every row the table had, i.e. one without a predicate
    pub fn is_full_delete(&self) -> bool {
        self.deleted > 0 && self.deleted == self.prior_row_count
    }

    pub fn is_empty(&self) -> bool {
        *self
            == TableChange {
                prior_row_count: self.prior_row_count,
                row_count: self.row_count,
                ..TableChange::default()
            }
    }
}

impl fmt::Display for TableChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.created {
            parts.push("created".to_string());
        }
        if self.dropped {
            parts.push("dropped".to_string());
        }
        if self.altered {
            parts.push("altered".to_string());
        }
        if self.inserted > 0 {
            parts.push(format!("inserted {}", self.inserted));
        }
        if self.updated > 0 {
            parts.push(format!("updated {}", self.updated));
        }
        if self.deleted > 0 {
            parts.push(format!("deleted {}", self.deleted));
        }
        if self.compacted {
            parts.push("compacted".to_string());
        }
        if self.inline_flushed {
            parts.push("flushed inline rows".to_string());
        }
        if parts.is_empty() {
            parts.push("no changes".to_string());
        }
        f.write_str(&parts.join(", "))
    }
}

/// Catalog row describing a table's current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub name: String,
    /// Snapshot of the table's current manifest
    pub current_snapshot: SnapshotId,
    pub created_snapshot: SnapshotId,
    pub schema_version: SchemaVersionId,
    pub next_row_id: u64,
    #[serde(default)]
    pub dropped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    /// Written by the two-phase protocol; table pointers may be partially
    /// swapped. `prior` holds each touched table's record before the swap.
    Pending {
        prior: BTreeMap<String, Option<TableRecord>>,
        added_entries: Vec<EntryId>,
    },
    Committed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub parent_id: Option<SnapshotId>,
    pub timestamp: DateTime<Utc>,
    /// Schema version of each table this snapshot touched
    pub schema_versions: BTreeMap<String, SchemaVersionId>,
    pub changes: BTreeMap<String, TableChange>,
    #[serde(default)]
    pub commit_message: Option<String>,
    pub status: SnapshotStatus,
}

impl Snapshot {
    pub fn is_committed(&self) -> bool {
        self.status == SnapshotStatus::Committed
    }

    pub fn touches(&self, table: &str) -> bool {
        self.changes.contains_key(table)
    }
}

/// One table pointer swap inside a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSwap {
    pub table: String,
    /// Pointer the writer started from (None: table absent)
    pub expected: Option<SnapshotId>,
    pub new: TableRecord,
}

/// Everything one transaction publishes
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub snapshot: Snapshot,
    pub manifests: Vec<Manifest>,
    pub schemas: Vec<SchemaVersion>,
    pub entries: Vec<DataEntry>,
    pub swaps: Vec<TableSwap>,
}

/// Catalog rows removed by garbage collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgePlan {
    pub snapshots: Vec<SnapshotId>,
    pub manifests: Vec<(String, SnapshotId)>,
    pub schemas: Vec<(String, SchemaVersionId)>,
    pub entries: Vec<EntryId>,
    /// Dropped tables whose whole history expired
    pub tables: Vec<String>,
}

impl PurgePlan {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
            && self.manifests.is_empty()
            && self.schemas.is_empty()
            && self.entries.is_empty()
            && self.tables.is_empty()
    }
}
