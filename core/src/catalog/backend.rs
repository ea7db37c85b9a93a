//! Catalog backend contract

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::catalog::embedded::EmbeddedBackend;
use crate::catalog::records::{CommitBatch, PurgePlan, Snapshot, TableRecord};
use crate::ids::{EntryId, SchemaVersionId, SnapshotId};
use crate::manifest::{DataEntry, Manifest};
use crate::schema::SchemaVersion;

#[derive(Error, Debug)]
pub enum BackendError {
    /// The snapshot's parent is no longer the latest committed snapshot
    #[error("snapshot order violated: parent {parent:?}, latest committed {latest:?}")]
    SnapshotOrder {
        parent: Option<SnapshotId>,
        latest: Option<SnapshotId>,
    },

    /// Another two-phase commit holds the pending slot
    #[error("snapshot {0} is pending")]
    CommitInProgress(SnapshotId),

    #[error("table '{table}' moved: expected {expected:?}, found {actual:?}")]
    SwapFailed {
        table: String,
        expected: Option<SnapshotId>,
        actual: Option<SnapshotId>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("corrupt catalog: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Durable store for snapshot, table, manifest, schema and entry rows.
///
/// The only synchronization the engine needs is the per-table pointer
/// compare-and-swap; `commit_batch` bundles every swap of a transaction
/// when the backend can do that atomically.
pub trait CatalogBackend: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Allocate a fresh snapshot id. Ids are never handed out twice.
    fn allocate_snapshot_id(&self) -> BackendResult<SnapshotId>;

    fn latest_committed(&self) -> BackendResult<Option<Snapshot>>;

    fn get_snapshot(&self, id: SnapshotId) -> BackendResult<Option<Snapshot>>;

    /// Committed snapshots with id greater than `after`, ascending
    fn list_snapshots(&self, after: Option<SnapshotId>, limit: usize)
    -> BackendResult<Vec<Snapshot>>;

    fn pending_snapshots(&self) -> BackendResult<Vec<Snapshot>>;

    fn get_table(&self, name: &str) -> BackendResult<Option<TableRecord>>;

    fn list_tables(&self) -> BackendResult<Vec<TableRecord>>;

    fn get_manifest(&self, table: &str, id: SnapshotId) -> BackendResult<Option<Manifest>>;

    /// Ids of every stored manifest of `table`, ascending
    fn manifest_ids(&self, table: &str) -> BackendResult<Vec<SnapshotId>>;

    fn get_schema(
        &self,
        table: &str,
        version: SchemaVersionId,
    ) -> BackendResult<Option<SchemaVersion>>;

    fn schema_versions(&self, table: &str) -> BackendResult<Vec<SchemaVersionId>>;

    /// Fetch entries in the order given; missing ids are an error
    fn get_entries(&self, ids: &[EntryId]) -> BackendResult<Vec<DataEntry>>;

    fn list_entries(&self) -> BackendResult<Vec<DataEntry>>;

    /// Whether `commit_batch` is available
    fn supports_atomic_batches(&self) -> bool;

    /// Publish a whole transaction at once: write its rows, check the
    /// snapshot order and every pointer swap, then apply all or nothing.
    fn commit_batch(&self, batch: &CommitBatch) -> BackendResult<()>;

    /// Two-phase step 1: write the rows of a pending snapshot
    fn put_pending(&self, batch: &CommitBatch) -> BackendResult<()>;

    /// Swap one table pointer. `new == None` removes the table row.
    /// Returns false when the current pointer is not `expected`.
    fn compare_and_swap_table(
        &self,
        table: &str,
        expected: Option<SnapshotId>,
        new: Option<&TableRecord>,
    ) -> BackendResult<bool>;

    /// Two-phase step 3: mark a pending snapshot committed
    fn set_snapshot_committed(&self, id: SnapshotId) -> BackendResult<()>;

    /// Remove a pending snapshot and the rows it added
    fn discard_pending(&self, id: SnapshotId) -> BackendResult<()>;

    fn purge(&self, plan: &PurgePlan) -> BackendResult<()>;
}

/// Open a backend from a catalog URI.
///
/// `memory:` gives a fresh in-memory catalog; `file:<path>` or a bare path
/// gives a JSON catalog file.
pub fn open_backend(uri: &str) -> BackendResult<Arc<dyn CatalogBackend>> {
    let uri = uri.trim();
    if uri.is_empty() || uri == "memory" || uri == "memory:" || uri == ":memory:" {
        return Ok(Arc::new(EmbeddedBackend::in_memory()));
    }

    if let Some((scheme, rest)) = uri.split_once(':')
        && scheme.len() > 1
        && scheme.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return match scheme {
            "file" => {
                let path = rest.strip_prefix("//").unwrap_or(rest);
                Ok(Arc::new(EmbeddedBackend::open(Path::new(path))?))
            }
            other => Err(BackendError::Unsupported(format!(
                "catalog scheme '{}'",
                other
            ))),
        };
    }

    Ok(Arc::new(EmbeddedBackend::open(Path::new(uri))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_backend_uris() {
        assert!(open_backend("memory:").unwrap().describe().contains("memory"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let backend = open_backend(&format!("file:{}", path.display())).unwrap();
        assert!(backend.describe().contains("catalog.json"));

        assert!(matches!(
            open_backend("postgres://localhost/lake"),
            Err(BackendError::Unsupported(_))
        ));
    }
}
