//! Entry point tying the catalog, file store and transactions together

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::{
    CatalogBackend, EmbeddedBackend, Snapshot, SnapshotIter, SnapshotScope, TableRecord,
    committed_tables, open_backend,
};
use crate::compactor::CompactionOutcome;
use crate::config::LakeConfig;
use crate::error::{LakeError, LakeResult};
use crate::gc::{GcReport, PinRegistry, StagedFiles, collector};
use crate::ids::SnapshotId;
use crate::maintenance::MaintenanceReport;
use crate::resolver::{self, AsOf, Resolver, RowChange, TableView};
use crate::schema::{SchemaChangeOp, SchemaRegistry, SchemaVersion};
use crate::storage::{FileStore, LocalFileStore, MemoryFileStore};
use crate::txn::{RecoveryReport, Transaction, TransactionCoordinator};

/// Shared state behind every handle to one lake
pub(crate) struct LakeContext {
    pub backend: Arc<dyn CatalogBackend>,
    pub store: Arc<dyn FileStore>,
    pub config: LakeConfig,
    pub pins: Arc<PinRegistry>,
    pub staging: StagedFiles,
    pub coordinator: TransactionCoordinator,
}

impl LakeContext {
    pub fn new(
        backend: Arc<dyn CatalogBackend>,
        store: Arc<dyn FileStore>,
        config: LakeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            store,
            config,
            pins: PinRegistry::new(),
            staging: StagedFiles::new(),
            coordinator: TransactionCoordinator::new(),
        })
    }
}

/// A lakehouse catalog: tables with snapshots, time travel and
/// multi-table transactions.
///
/// Cheap to clone; clones share the catalog, file store and pins.
#[derive(Clone)]
pub struct Lakehouse {
    ctx: Arc<LakeContext>,
    resolver: Resolver,
    schemas: SchemaRegistry,
}

impl Lakehouse {
    /// Open the catalog and file store named by `config`, then resolve any
    /// commit left pending by a crash
    pub fn open(config: LakeConfig) -> LakeResult<Self> {
        config.validate()?;
        let backend = open_backend(&config.catalog.uri)?;
        let store: Arc<dyn FileStore> = match &config.storage.data_dir {
            Some(dir) => Arc::new(LocalFileStore::new(dir)?),
            None => Arc::new(MemoryFileStore::new()),
        };
        let lake = Self::with_parts(backend, store, config)?;

        let report = lake.recover()?;
        info!(
            catalog = %lake.ctx.backend.describe(),
            rolled_forward = report.rolled_forward.len(),
            rolled_back = report.rolled_back.len(),
            "Opened lakehouse"
        );
        Ok(lake)
    }

    pub fn with_parts(
        backend: Arc<dyn CatalogBackend>,
        store: Arc<dyn FileStore>,
        config: LakeConfig,
    ) -> LakeResult<Self> {
        config.validate()?;
        let ctx = LakeContext::new(backend, store, config);
        Ok(Self {
            resolver: Resolver::new(
                Arc::clone(&ctx.backend),
                Arc::clone(&ctx.store),
                Arc::clone(&ctx.pins),
            ),
            schemas: SchemaRegistry::new(Arc::clone(&ctx.backend)),
            ctx,
        })
    }

    /// In-memory catalog and file store; `config.catalog` and
    /// `config.storage` are ignored
    pub fn in_memory(config: LakeConfig) -> LakeResult<Self> {
        Self::with_parts(
            Arc::new(EmbeddedBackend::in_memory()),
            Arc::new(MemoryFileStore::new()),
            config,
        )
    }

    pub fn config(&self) -> &LakeConfig {
        &self.ctx.config
    }

    pub fn backend(&self) -> Arc<dyn CatalogBackend> {
        Arc::clone(&self.ctx.backend)
    }

    pub fn store(&self) -> Arc<dyn FileStore> {
        Arc::clone(&self.ctx.store)
    }

    pub fn begin(&self) -> LakeResult<Transaction> {
        Transaction::begin(Arc::clone(&self.ctx))
    }

    pub fn active_transactions(&self) -> usize {
        self.ctx.coordinator.active_transaction_count()
    }

    /// Pinned view of `table` at a point in time
    pub fn query_at(&self, table: &str, at: AsOf) -> LakeResult<TableView> {
        self.resolver.resolve(table, at)
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Committed snapshots in ascending id order, fetched lazily
    pub fn list_snapshots(&self, scope: SnapshotScope) -> SnapshotIter {
        SnapshotIter::new(Arc::clone(&self.ctx.backend), scope)
    }

    pub fn latest_snapshot(&self) -> LakeResult<Option<Snapshot>> {
        Ok(self.ctx.backend.latest_committed()?)
    }

    /// Snapshot current at `ts`
    pub fn snapshot_at(&self, ts: DateTime<Utc>) -> LakeResult<SnapshotId> {
        resolver::resolve_timestamp(self.ctx.backend.as_ref(), ts)
    }

    /// Row-level deltas made after `from` up to and including `to`
    pub fn table_changes(
        &self,
        table: &str,
        from: SnapshotId,
        to: SnapshotId,
    ) -> LakeResult<Vec<RowChange>> {
        self.resolver.changes_between(table, from, to)
    }

    pub fn current_schema(&self, table: &str) -> LakeResult<SchemaVersion> {
        self.schemas.current_schema(table)
    }

    pub fn schema_as_of(&self, table: &str, snapshot_id: SnapshotId) -> LakeResult<SchemaVersion> {
        self.schemas.schema_as_of(table, snapshot_id)
    }

    pub fn schema_history(&self, table: &str) -> LakeResult<Vec<SchemaVersion>> {
        self.schemas.history(table)
    }

    /// Schema a column change would produce, without staging it
    pub fn propose_change(&self, table: &str, op: &SchemaChangeOp) -> LakeResult<SchemaVersion> {
        self.schemas.propose_change(table, op)
    }

    /// Committed records of the tables that currently exist
    pub fn list_tables(&self) -> LakeResult<Vec<TableRecord>> {
        Ok(committed_tables(self.ctx.backend.as_ref())?
            .into_values()
            .filter(|r| !r.dropped)
            .collect())
    }

    /// Write all of the table's inline rows into one file as a new snapshot
    pub fn flush_inlined(&self, table: &str) -> LakeResult<Option<CompactionOutcome>> {
        let mut txn = self.begin()?;
        txn.set_commit_message(format!("flush inlined rows of {}", table));
        let rows = txn.flush_inlined(table)?;
        if rows == 0 {
            txn.abort();
            return Ok(None);
        }
        let set = txn.commit()?;
        let outcome = set.get(table).map(|&snapshot_id| CompactionOutcome {
            table: table.to_string(),
            snapshot_id,
            entries_merged: 0,
            rows,
        });
        info!(table, rows, "Flushed inline rows");
        Ok(outcome)
    }

    /// Merge small entries of `table` if it has enough of them
    pub fn compact(&self, table: &str) -> LakeResult<Option<CompactionOutcome>> {
        let mut txn = self.begin()?;
        txn.set_commit_message(format!("compact {}", table));
        let (entries_merged, rows) = txn.compact(table)?;
        if entries_merged == 0 {
            txn.abort();
            return Ok(None);
        }
        let set = txn.commit()?;
        let outcome = set.get(table).map(|&snapshot_id| CompactionOutcome {
            table: table.to_string(),
            snapshot_id,
            entries_merged,
            rows,
        });
        info!(table, entries_merged, rows, "Compacted table");
        Ok(outcome)
    }

    /// Compact every table; a table that loses a race with a writer is
    /// skipped until the next pass
    pub fn compact_all(&self) -> LakeResult<Vec<CompactionOutcome>> {
        let mut outcomes = Vec::new();
        for record in self.list_tables()? {
            match self.compact(&record.name) {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) if e.is_retryable() || matches!(e, LakeError::TableNotFound(_)) => {
                    warn!(table = %record.name, error = %e, "Skipped compaction");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    pub fn collect_garbage(&self) -> LakeResult<GcReport> {
        collector::collect_garbage(&self.ctx)
    }

    /// What `collect_garbage` would remove right now
    pub fn plan_garbage(&self) -> LakeResult<GcReport> {
        collector::plan_garbage(&self.ctx)
    }

    /// Oldest snapshot inside the retention window
    pub fn retention_horizon(&self) -> LakeResult<Option<SnapshotId>> {
        collector::retained_from(&self.ctx)
    }

    /// One compaction pass over every table followed by garbage collection
    pub fn run_maintenance(&self) -> LakeResult<MaintenanceReport> {
        let compacted = self.compact_all()?;
        let gc = self.collect_garbage()?;
        Ok(MaintenanceReport { compacted, gc })
    }

    /// Resolve commits interrupted between their table swaps
    pub fn recover(&self) -> LakeResult<RecoveryReport> {
        self.ctx.coordinator.recover(self.ctx.backend.as_ref())
    }
}

impl std::fmt::Debug for Lakehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lakehouse")
            .field("catalog", &self.ctx.backend.describe())
            .field("active_transactions", &self.active_transactions())
            .finish()
    }
}
