//! Schema lookups against the catalog

use std::sync::Arc;

use crate::catalog::{CatalogBackend, committed_table};
use crate::error::{LakeError, LakeResult};
use crate::ids::{SchemaVersionId, SnapshotId};
use crate::resolver::resolve_manifest_id;
use crate::schema::{SchemaChangeOp, SchemaVersion};

/// Resolves table schemas: current, historical, and proposed
#[derive(Clone)]
pub struct SchemaRegistry {
    backend: Arc<dyn CatalogBackend>,
}

impl SchemaRegistry {
    pub fn new(backend: Arc<dyn CatalogBackend>) -> Self {
        Self { backend }
    }

    /// Schema of the table's latest committed version
    pub fn current_schema(&self, table: &str) -> LakeResult<SchemaVersion> {
        let record = committed_table(self.backend.as_ref(), table)?
            .filter(|r| !r.dropped)
            .ok_or_else(|| LakeError::TableNotFound(table.to_string()))?;
        self.get_version(table, record.schema_version)
    }

    /// Schema that was valid when `snapshot_id` was taken
    pub fn schema_as_of(&self, table: &str, snapshot_id: SnapshotId) -> LakeResult<SchemaVersion> {
        let manifest_id = resolve_manifest_id(self.backend.as_ref(), table, snapshot_id)?;
        let manifest = self
            .backend
            .get_manifest(table, manifest_id)?
            .ok_or_else(|| LakeError::NoSnapshot(format!("{} at {}", table, snapshot_id)))?;
        if manifest.dropped {
            return Err(LakeError::NoSnapshot(format!(
                "table '{}' was dropped at snapshot {}",
                table, manifest_id
            )));
        }
        self.get_version(table, manifest.schema_version)
    }

    pub fn get_version(&self, table: &str, version: SchemaVersionId) -> LakeResult<SchemaVersion> {
        self.backend.get_schema(table, version)?.ok_or_else(|| {
            LakeError::NoSnapshot(format!("schema {} of '{}' was purged", version, table))
        })
    }

    /// All stored versions of a table's schema, oldest first
    pub fn history(&self, table: &str) -> LakeResult<Vec<SchemaVersion>> {
        self.backend
            .schema_versions(table)?
            .into_iter()
            .map(|v| self.get_version(table, v))
            .collect()
    }

    /// Check a column change against the current schema and return the
    /// schema it would produce. Nothing is written; transactions stage the
    /// change and publish it at commit.
    pub fn propose_change(&self, table: &str, op: &SchemaChangeOp) -> LakeResult<SchemaVersion> {
        let current = self.current_schema(table)?;
        let mut next = current.apply(op)?;
        next.version_id = SchemaVersionId(current.version_id.0 + 1);
        Ok(next)
    }
}
