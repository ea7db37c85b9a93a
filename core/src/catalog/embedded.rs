//! Embedded catalog backend: in-memory rows, optionally persisted as JSON

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::catalog::backend::{BackendError, BackendResult, CatalogBackend};
use crate::catalog::records::{
    CommitBatch, PurgePlan, Snapshot, SnapshotStatus, TableRecord,
};
use crate::ids::{EntryId, SchemaVersionId, SnapshotId};
use crate::manifest::{DataEntry, Manifest};
use crate::schema::SchemaVersion;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogState {
    next_snapshot_id: u64,
    latest_committed: Option<SnapshotId>,
    snapshots: BTreeMap<SnapshotId, Snapshot>,
    tables: BTreeMap<String, TableRecord>,
    manifests: BTreeMap<String, BTreeMap<SnapshotId, Manifest>>,
    schemas: BTreeMap<String, BTreeMap<SchemaVersionId, SchemaVersion>>,
    entries: BTreeMap<EntryId, DataEntry>,
}

impl Default for CatalogState {
    fn default() -> Self {
        Self {
            next_snapshot_id: 1,
            latest_committed: None,
            snapshots: BTreeMap::new(),
            tables: BTreeMap::new(),
            manifests: BTreeMap::new(),
            schemas: BTreeMap::new(),
            entries: BTreeMap::new(),
        }
    }
}

impl CatalogState {
    fn check_order(&self, snapshot: &Snapshot) -> BackendResult<()> {
        let ordered = snapshot.parent_id == self.latest_committed
            && self.latest_committed.is_none_or(|latest| snapshot.id > latest);
        if ordered {
            Ok(())
        } else {
            Err(BackendError::SnapshotOrder {
                parent: snapshot.parent_id,
                latest: self.latest_committed,
            })
        }
    }

    fn pending_id(&self) -> Option<SnapshotId> {
        self.snapshots
            .values()
            .find(|s| !s.is_committed())
            .map(|s| s.id)
    }

    fn table_pointer(&self, table: &str) -> Option<SnapshotId> {
        self.tables.get(table).map(|t| t.current_snapshot)
    }

    fn write_rows(&mut self, batch: &CommitBatch) {
        for manifest in &batch.manifests {
            self.manifests
                .entry(manifest.table.clone())
                .or_default()
                .insert(manifest.snapshot_id, manifest.clone());
        }
        for schema in &batch.schemas {
            self.schemas
                .entry(schema.table.clone())
                .or_default()
                .insert(schema.version_id, schema.clone());
        }
        for entry in &batch.entries {
            self.entries.insert(entry.id, entry.clone());
        }
        self.snapshots
            .insert(batch.snapshot.id, batch.snapshot.clone());
    }
}

/// Catalog backend holding all rows in memory behind one lock.
///
/// With a path, every mutation is written to a JSON catalog file
/// (temp file, fsync, rename) before it becomes visible.
pub struct EmbeddedBackend {
    state: RwLock<CatalogState>,
    path: Option<PathBuf>,
    atomic_batches: bool,
}

impl EmbeddedBackend {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
            path: None,
            atomic_batches: true,
        }
    }

    /// Open a JSON catalog file, creating an empty catalog if it is missing
    pub fn open<P: AsRef<Path>>(path: P) -> BackendResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = Self::load(&path)?;
        info!(
            path = %path.display(),
            snapshots = state.snapshots.len(),
            tables = state.tables.len(),
            "Opened catalog file"
        );
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            atomic_batches: true,
        })
    }

    /// Disable `commit_batch`, leaving only per-row compare-and-swap
    pub fn with_atomic_batches(mut self, enabled: bool) -> Self {
        self.atomic_batches = enabled;
        self
    }

    fn load(path: &Path) -> BackendResult<CatalogState> {
        match File::open(path) {
            Ok(mut file) => {
                let mut contents = String::new();
                file.read_to_string(&mut contents)?;
                if contents.trim().is_empty() {
                    return Ok(CatalogState::default());
                }
                Ok(serde_json::from_str(&contents)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CatalogState::default()),
            Err(e) => Err(BackendError::Io(e)),
        }
    }

    fn save(path: &Path, state: &CatalogState) -> BackendResult<()> {
        let json = serde_json::to_vec(state)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("json.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Run `f` against the state. For file-backed catalogs the change is made
    /// on a copy and only installed once it is on disk. `f` must validate
    /// before it mutates.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut CatalogState) -> BackendResult<R>,
    ) -> BackendResult<R> {
        let mut state = self.state.write();
        match &self.path {
            None => f(&mut state),
            Some(path) => {
                let mut next = state.clone();
                let out = f(&mut next)?;
                Self::save(path, &next)?;
                *state = next;
                Ok(out)
            }
        }
    }
}

impl CatalogBackend for EmbeddedBackend {
    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("embedded catalog at {}", path.display()),
            None => "embedded in-memory catalog".to_string(),
        }
    }

    fn allocate_snapshot_id(&self) -> BackendResult<SnapshotId> {
        self.mutate(|state| {
            let id = SnapshotId(state.next_snapshot_id);
            state.next_snapshot_id += 1;
            Ok(id)
        })
    }

    fn latest_committed(&self) -> BackendResult<Option<Snapshot>> {
        let state = self.state.read();
        Ok(state
            .latest_committed
            .and_then(|id| state.snapshots.get(&id).cloned()))
    }

    fn get_snapshot(&self, id: SnapshotId) -> BackendResult<Option<Snapshot>> {
        Ok(self.state.read().snapshots.get(&id).cloned())
    }

    fn list_snapshots(
        &self,
        after: Option<SnapshotId>,
        limit: usize,
    ) -> BackendResult<Vec<Snapshot>> {
        let state = self.state.read();
        let start = after.map(|id| id.0 + 1).unwrap_or(0);
        Ok(state
            .snapshots
            .range(SnapshotId(start)..)
            .map(|(_, s)| s)
            .filter(|s| s.is_committed())
            .take(limit)
            .cloned()
            .collect())
    }

    fn pending_snapshots(&self) -> BackendResult<Vec<Snapshot>> {
        Ok(self
            .state
            .read()
            .snapshots
            .values()
            .filter(|s| !s.is_committed())
            .cloned()
            .collect())
    }

    fn get_table(&self, name: &str) -> BackendResult<Option<TableRecord>> {
        Ok(self.state.read().tables.get(name).cloned())
    }

    fn list_tables(&self) -> BackendResult<Vec<TableRecord>> {
        Ok(self.state.read().tables.values().cloned().collect())
    }

    fn get_manifest(&self, table: &str, id: SnapshotId) -> BackendResult<Option<Manifest>> {
        Ok(self
            .state
            .read()
            .manifests
            .get(table)
            .and_then(|m| m.get(&id))
            .cloned())
    }

    fn manifest_ids(&self, table: &str) -> BackendResult<Vec<SnapshotId>> {
        Ok(self
            .state
            .read()
            .manifests
            .get(table)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    fn get_schema(
        &self,
        table: &str,
        version: SchemaVersionId,
    ) -> BackendResult<Option<SchemaVersion>> {
        Ok(self
            .state
            .read()
            .schemas
            .get(table)
            .and_then(|s| s.get(&version))
            .cloned())
    }

    fn schema_versions(&self, table: &str) -> BackendResult<Vec<SchemaVersionId>> {
        Ok(self
            .state
            .read()
            .schemas
            .get(table)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default())
    }

    fn get_entries(&self, ids: &[EntryId]) -> BackendResult<Vec<DataEntry>> {
        let state = self.state.read();
        ids.iter()
            .map(|id| {
                state
                    .entries
                    .get(id)
                    .cloned()
                    .ok_or_else(|| BackendError::NotFound(format!("entry {}", id)))
            })
            .collect()
    }

    fn list_entries(&self) -> BackendResult<Vec<DataEntry>> {
        Ok(self.state.read().entries.values().cloned().collect())
    }

    fn supports_atomic_batches(&self) -> bool {
        self.atomic_batches
    }

    fn commit_batch(&self, batch: &CommitBatch) -> BackendResult<()> {
        if !self.atomic_batches {
            return Err(BackendError::Unsupported("atomic commit batches".into()));
        }

        self.mutate(|state| {
            if let Some(pending) = state.pending_id() {
                return Err(BackendError::CommitInProgress(pending));
            }
            state.check_order(&batch.snapshot)?;
            for swap in &batch.swaps {
                let actual = state.table_pointer(&swap.table);
                if actual != swap.expected {
                    return Err(BackendError::SwapFailed {
                        table: swap.table.clone(),
                        expected: swap.expected,
                        actual,
                    });
                }
            }

            let mut snapshot_batch = batch.clone();
            snapshot_batch.snapshot.status = SnapshotStatus::Committed;
            state.write_rows(&snapshot_batch);
            for swap in &batch.swaps {
                state.tables.insert(swap.table.clone(), swap.new.clone());
            }
            state.latest_committed = Some(batch.snapshot.id);
            Ok(())
        })?;

        debug!(snapshot_id = %batch.snapshot.id, tables = batch.swaps.len(), "Committed batch");
        Ok(())
    }

    fn put_pending(&self, batch: &CommitBatch) -> BackendResult<()> {
        if batch.snapshot.is_committed() {
            return Err(BackendError::Corrupt(format!(
                "snapshot {} is not marked pending",
                batch.snapshot.id
            )));
        }
        self.mutate(|state| {
            if let Some(pending) = state.pending_id() {
                return Err(BackendError::CommitInProgress(pending));
            }
            state.check_order(&batch.snapshot)?;
            state.write_rows(batch);
            Ok(())
        })
    }

    fn compare_and_swap_table(
        &self,
        table: &str,
        expected: Option<SnapshotId>,
        new: Option<&TableRecord>,
    ) -> BackendResult<bool> {
        self.mutate(|state| {
            if state.table_pointer(table) != expected {
                return Ok(false);
            }
            match new {
                Some(record) => {
                    state.tables.insert(table.to_string(), record.clone());
                }
                None => {
                    state.tables.remove(table);
                }
            }
            Ok(true)
        })
    }

    fn set_snapshot_committed(&self, id: SnapshotId) -> BackendResult<()> {
        self.mutate(|state| {
            let latest = state.latest_committed;
            let snapshot = state
                .snapshots
                .get_mut(&id)
                .ok_or_else(|| BackendError::NotFound(format!("snapshot {}", id)))?;
            if snapshot.is_committed() {
                return Ok(());
            }
            if snapshot.parent_id != latest {
                return Err(BackendError::SnapshotOrder {
                    parent: snapshot.parent_id,
                    latest,
                });
            }
            snapshot.status = SnapshotStatus::Committed;
            state.latest_committed = Some(id);
            Ok(())
        })
    }

    fn discard_pending(&self, id: SnapshotId) -> BackendResult<()> {
        self.mutate(|state| {
            let added_entries = match state.snapshots.get(&id).map(|s| &s.status) {
                Some(SnapshotStatus::Pending { added_entries, .. }) => added_entries.clone(),
                Some(SnapshotStatus::Committed) => {
                    return Err(BackendError::Corrupt(format!(
                        "snapshot {} is committed and cannot be discarded",
                        id
                    )));
                }
                None => return Ok(()),
            };

            state.snapshots.remove(&id);
            for manifests in state.manifests.values_mut() {
                manifests.remove(&id);
            }
            for schemas in state.schemas.values_mut() {
                schemas.retain(|_, s| s.valid_from_snapshot != id);
            }
            for entry in added_entries {
                state.entries.remove(&entry);
            }
            state.manifests.retain(|_, m| !m.is_empty());
            state.schemas.retain(|_, s| !s.is_empty());
            Ok(())
        })
    }

    fn purge(&self, plan: &PurgePlan) -> BackendResult<()> {
        if plan.is_empty() {
            return Ok(());
        }
        self.mutate(|state| {
            for id in &plan.snapshots {
                // The latest committed snapshot anchors ordering; never drop it
                if Some(*id) != state.latest_committed {
                    state.snapshots.remove(id);
                }
            }
            for (table, id) in &plan.manifests {
                if let Some(m) = state.manifests.get_mut(table) {
                    m.remove(id);
                }
            }
            for (table, version) in &plan.schemas {
                if let Some(s) = state.schemas.get_mut(table) {
                    s.remove(version);
                }
            }
            for id in &plan.entries {
                state.entries.remove(id);
            }
            for table in &plan.tables {
                state.tables.remove(table);
            }
            state.manifests.retain(|_, m| !m.is_empty());
            state.schemas.retain(|_, s| !s.is_empty());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::records::{TableChange, TableSwap};
    use chrono::Utc;

    fn batch(id: u64, parent: Option<u64>, expected: Option<u64>) -> CommitBatch {
        let record = TableRecord {
            name: "orders".into(),
            current_snapshot: SnapshotId(id),
            created_snapshot: SnapshotId(1),
            schema_version: SchemaVersionId(1),
            next_row_id: 1,
            dropped: false,
        };
        CommitBatch {
            snapshot: Snapshot {
                id: SnapshotId(id),
                parent_id: parent.map(SnapshotId),
                timestamp: Utc::now(),
                schema_versions: BTreeMap::new(),
                changes: BTreeMap::from([("orders".into(), TableChange::default())]),
                commit_message: None,
                status: SnapshotStatus::Committed,
            },
            manifests: Vec::new(),
            schemas: Vec::new(),
            entries: Vec::new(),
            swaps: vec![TableSwap {
                table: "orders".into(),
                expected: expected.map(SnapshotId),
                new: record,
            }],
        }
    }

    #[test]
    fn test_commit_batch_checks_order_and_pointer() {
        let backend = EmbeddedBackend::in_memory();
        let first = backend.allocate_snapshot_id().unwrap();
        assert_eq!(first, SnapshotId(1));
        backend.commit_batch(&batch(1, None, None)).unwrap();

        // Stale parent
        assert!(matches!(
            backend.commit_batch(&batch(2, None, Some(1))),
            Err(BackendError::SnapshotOrder { .. })
        ));
        // Stale table pointer
        assert!(matches!(
            backend.commit_batch(&batch(2, Some(1), None)),
            Err(BackendError::SwapFailed { .. })
        ));
        backend.commit_batch(&batch(2, Some(1), Some(1))).unwrap();
        assert_eq!(
            backend.latest_committed().unwrap().map(|s| s.id),
            Some(SnapshotId(2))
        );
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        {
            let backend = EmbeddedBackend::open(&path).unwrap();
            backend.allocate_snapshot_id().unwrap();
            backend.commit_batch(&batch(1, None, None)).unwrap();
            backend.allocate_snapshot_id().unwrap();
        }
        let reopened = EmbeddedBackend::open(&path).unwrap();
        assert_eq!(reopened.list_snapshots(None, 10).unwrap().len(), 1);
        assert_eq!(reopened.allocate_snapshot_id().unwrap(), SnapshotId(3));
        assert!(reopened.get_table("orders").unwrap().is_some());
    }

    #[test]
    fn test_two_phase_slot_is_exclusive() {
        let backend = EmbeddedBackend::in_memory().with_atomic_batches(false);
        let mut pending = batch(1, None, None);
        pending.snapshot.status = SnapshotStatus::Pending {
            prior: BTreeMap::from([("orders".into(), None)]),
            added_entries: Vec::new(),
        };
        backend.put_pending(&pending).unwrap();

        let mut other = pending.clone();
        other.snapshot.id = SnapshotId(2);
        assert!(matches!(
            backend.put_pending(&other),
            Err(BackendError::CommitInProgress(SnapshotId(1)))
        ));
        assert!(backend.list_snapshots(None, 10).unwrap().is_empty());

        backend.discard_pending(SnapshotId(1)).unwrap();
        assert!(backend.pending_snapshots().unwrap().is_empty());
        backend.put_pending(&other).unwrap();
    }
}
