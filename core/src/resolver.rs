//! Time travel: mapping versions and timestamps to (schema, manifest) pairs

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::catalog::{CatalogBackend, committed_table};
use crate::error::{LakeError, LakeResult};
use crate::gc::{PinRegistry, ReadPin};
use crate::ids::{EntryId, RowId, SnapshotId};
use crate::manifest::{DataEntry, Manifest, Predicate};
use crate::schema::SchemaVersion;
use crate::storage::FileStore;
use crate::value::Row;

const RESOLVE_ATTEMPTS: usize = 4;
const SNAPSHOT_PAGE: usize = 256;

/// Point in time to read a table at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsOf {
    Latest,
    Version(SnapshotId),
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for AsOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsOf::Latest => f.write_str("latest"),
            AsOf::Version(id) => write!(f, "version {}", id),
            AsOf::Timestamp(ts) => write!(f, "timestamp {}", ts.to_rfc3339()),
        }
    }
}

/// Greatest committed manifest of `table` at or before `at`
pub fn resolve_manifest_id(
    backend: &dyn CatalogBackend,
    table: &str,
    at: SnapshotId,
) -> LakeResult<SnapshotId> {
    let latest = backend
        .latest_committed()?
        .ok_or_else(|| LakeError::NoSnapshot("catalog has no snapshots".into()))?;
    if at > latest.id {
        return Err(LakeError::NoSnapshot(format!(
            "snapshot {} does not exist (latest is {})",
            at, latest.id
        )));
    }

    for id in backend.manifest_ids(table)?.into_iter().rev() {
        if id > at {
            continue;
        }
        match backend.get_snapshot(id)? {
            Some(s) if !s.is_committed() => continue,
            // A purged snapshot row still leaves its committed manifest
            _ => return Ok(id),
        }
    }

    Err(LakeError::NoSnapshot(format!(
        "table '{}' has no state at snapshot {}",
        table, at
    )))
}

/// Highest committed snapshot taken at or before `ts`
pub fn resolve_timestamp(backend: &dyn CatalogBackend, ts: DateTime<Utc>) -> LakeResult<SnapshotId> {
    let mut found = None;
    let mut cursor = None;
    'pages: loop {
        let page = backend.list_snapshots(cursor, SNAPSHOT_PAGE)?;
        let Some(last) = page.last() else { break };
        cursor = Some(last.id);
        for snapshot in &page {
            // Timestamps never decrease along snapshot ids
            if snapshot.timestamp > ts {
                break 'pages;
            }
            found = Some(snapshot.id);
        }
        if page.len() < SNAPSHOT_PAGE {
            break;
        }
    }
    found.ok_or_else(|| {
        LakeError::NoSnapshot(format!("no snapshot at or before {}", ts.to_rfc3339()))
    })
}

/// A pinned (schema, manifest) pair for one table at one point in time.
///
/// Files referenced by the manifest stay in the file store while the view
/// is alive.
pub struct TableView {
    pub table: String,
    pub requested: AsOf,
    /// Snapshot whose manifest this view reads
    pub snapshot_id: SnapshotId,
    pub schema: SchemaVersion,
    pub manifest: Manifest,
    pub entries: Vec<DataEntry>,
    store: Arc<dyn FileStore>,
    _pin: ReadPin,
}

impl TableView {
    pub fn row_count(&self) -> u64 {
        self.manifest.row_count()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema.column_names()
    }

    pub fn rows(&self) -> LakeResult<Vec<Row>> {
        self.scan(&Predicate::All)
    }

    /// Rows matching `predicate`, skipping entries whose stats rule it out
    pub fn scan(&self, predicate: &Predicate) -> LakeResult<Vec<Row>> {
        let bound = predicate.bind(&self.schema)?;
        let mut out = Vec::new();
        for entry in &self.entries {
            if !bound.may_match(&self.schema, &entry.stats, entry.row_count) {
                continue;
            }
            for stored in entry.load_rows(self.store.as_ref())? {
                let row = self.schema.project(&stored)?;
                if bound.matches(&row)? {
                    out.push(row);
                }
            }
        }
        out.sort_by_key(|r| r.row_id);
        Ok(out)
    }
}

impl fmt::Debug for TableView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableView")
            .field("table", &self.table)
            .field("requested", &self.requested)
            .field("snapshot_id", &self.snapshot_id)
            .field("schema_version", &self.schema.version_id)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Insert,
    Delete,
    UpdatePreimage,
    UpdatePostimage,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Delete => "delete",
            ChangeKind::UpdatePreimage => "update_preimage",
            ChangeKind::UpdatePostimage => "update_postimage",
        })
    }
}

/// One row-level delta
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    /// Snapshot that made the change
    pub snapshot_id: SnapshotId,
    pub kind: ChangeKind,
    pub row: Row,
}

/// Resolves table state at versions and timestamps
#[derive(Clone)]
pub struct Resolver {
    backend: Arc<dyn CatalogBackend>,
    store: Arc<dyn FileStore>,
    pins: Arc<PinRegistry>,
}

impl Resolver {
    pub fn new(
        backend: Arc<dyn CatalogBackend>,
        store: Arc<dyn FileStore>,
        pins: Arc<PinRegistry>,
    ) -> Self {
        Self {
            backend,
            store,
            pins,
        }
    }

    pub fn resolve(&self, table: &str, at: AsOf) -> LakeResult<TableView> {
        for _ in 0..RESOLVE_ATTEMPTS {
            let manifest_id = self.manifest_id(table, at)?;
            if let Some(view) = self.load_view(table, at, manifest_id)? {
                return Ok(view);
            }
            // Purged between resolution and pinning
            if !matches!(at, AsOf::Latest) {
                break;
            }
        }
        Err(LakeError::NoSnapshot(format!(
            "state of '{}' at {} is no longer retained",
            table, at
        )))
    }

    pub fn resolve_version(&self, table: &str, version: SnapshotId) -> LakeResult<TableView> {
        self.resolve(table, AsOf::Version(version))
    }

    pub fn resolve_timestamp(&self, table: &str, ts: DateTime<Utc>) -> LakeResult<TableView> {
        self.resolve(table, AsOf::Timestamp(ts))
    }

    fn manifest_id(&self, table: &str, at: AsOf) -> LakeResult<SnapshotId> {
        match at {
            AsOf::Latest => {
                let record = committed_table(self.backend.as_ref(), table)?
                    .filter(|r| !r.dropped)
                    .ok_or_else(|| LakeError::TableNotFound(table.to_string()))?;
                Ok(record.current_snapshot)
            }
            AsOf::Version(id) => resolve_manifest_id(self.backend.as_ref(), table, id),
            AsOf::Timestamp(ts) => {
                let id = resolve_timestamp(self.backend.as_ref(), ts)?;
                resolve_manifest_id(self.backend.as_ref(), table, id)
            }
        }
    }

    /// Pin, then confirm the manifest survived; None if it was purged
    fn load_view(
        &self,
        table: &str,
        requested: AsOf,
        manifest_id: SnapshotId,
    ) -> LakeResult<Option<TableView>> {
        let pin = self.pins.pin(table, manifest_id);
        let Some(manifest) = self.backend.get_manifest(table, manifest_id)? else {
            return Ok(None);
        };
        if manifest.dropped {
            return Err(match requested {
                AsOf::Latest => LakeError::TableNotFound(table.to_string()),
                _ => LakeError::NoSnapshot(format!(
                    "table '{}' was dropped at snapshot {}",
                    table, manifest_id
                )),
            });
        }
        let schema = self
            .backend
            .get_schema(table, manifest.schema_version)?
            .ok_or_else(|| {
                LakeError::NoSnapshot(format!(
                    "schema {} of '{}' was purged",
                    manifest.schema_version, table
                ))
            })?;
        let entries = self.backend.get_entries(&manifest.entries)?;

        debug!(table, snapshot_id = %manifest_id, %requested, "Resolved table view");
        Ok(Some(TableView {
            table: table.to_string(),
            requested,
            snapshot_id: manifest_id,
            schema,
            manifest,
            entries,
            store: Arc::clone(&self.store),
            _pin: pin,
        }))
    }

    /// Row-level deltas made by the snapshots after `from` up to and
    /// including `to`, in snapshot order.
    ///
    /// Entries shared by consecutive manifests are skipped without reading;
    /// only entries that differ are compared row by row.
    pub fn changes_between(
        &self,
        table: &str,
        from: SnapshotId,
        to: SnapshotId,
    ) -> LakeResult<Vec<RowChange>> {
        if from > to {
            return Err(LakeError::InvalidInput(format!(
                "change range {}..{} is reversed",
                from, to
            )));
        }

        let mut previous = match self.resolve(table, AsOf::Version(from)) {
            Ok(view) => Some(view),
            Err(LakeError::NoSnapshot(_)) => None,
            Err(e) => return Err(e),
        };
        // Validates `to` against the latest committed snapshot
        if let Err(e) = resolve_manifest_id(self.backend.as_ref(), table, to) {
            if previous.is_none() {
                return Err(e);
            }
        }

        let mut changes = Vec::new();
        for id in self.backend.manifest_ids(table)? {
            if id <= from || id > to {
                continue;
            }
            if self
                .backend
                .get_snapshot(id)?
                .is_some_and(|s| !s.is_committed())
            {
                continue;
            }
            let next = match self.resolve(table, AsOf::Version(id)) {
                Ok(view) => Some(view),
                Err(LakeError::NoSnapshot(_)) => None,
                Err(e) => return Err(e),
            };
            changes.extend(self.diff(previous.as_ref(), next.as_ref(), id)?);
            previous = next;
        }
        Ok(changes)
    }

    fn diff(
        &self,
        old: Option<&TableView>,
        new: Option<&TableView>,
        snapshot_id: SnapshotId,
    ) -> LakeResult<Vec<RowChange>> {
        let ids = |v: Option<&TableView>| -> HashSet<EntryId> {
            v.map(|v| v.entries.iter().map(|e| e.id).collect())
                .unwrap_or_default()
        };
        let (old_ids, new_ids) = (ids(old), ids(new));

        let changed_rows = |view: Option<&TableView>,
                            skip: &HashSet<EntryId>|
         -> LakeResult<BTreeMap<RowId, Row>> {
            let mut rows = BTreeMap::new();
            let Some(view) = view else {
                return Ok(rows);
            };
            for entry in view.entries.iter().filter(|e| !skip.contains(&e.id)) {
                for stored in entry.load_rows(self.store.as_ref())? {
                    rows.insert(stored.row_id, view.schema.project(&stored)?);
                }
            }
            Ok(rows)
        };
        let mut before = changed_rows(old, &new_ids)?;
        let after = changed_rows(new, &old_ids)?;

        let mut out = Vec::new();
        for (row_id, row) in after {
            match before.remove(&row_id) {
                Some(prev) if prev == row => {}
                Some(prev) => {
                    out.push(RowChange {
                        snapshot_id,
                        kind: ChangeKind::UpdatePreimage,
                        row: prev,
                    });
                    out.push(RowChange {
                        snapshot_id,
                        kind: ChangeKind::UpdatePostimage,
                        row,
                    });
                }
                None => out.push(RowChange {
                    snapshot_id,
                    kind: ChangeKind::Insert,
                    row,
                }),
            }
        }
        out.extend(before.into_values().map(|row| RowChange {
            snapshot_id,
            kind: ChangeKind::Delete,
            row,
        }));
        out.sort_by(|a, b| a.row.row_id.cmp(&b.row.row_id).then(a.kind.cmp(&b.kind)));
        Ok(out)
    }
}
