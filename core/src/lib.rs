//! Lake - a lakehouse table catalog
//!
//! Tables are sets of immutable data files (plus small inlined row batches)
//! tracked by a catalog of snapshots. Every commit publishes one snapshot
//! across all tables it touched, so readers can travel back to any retained
//! version or timestamp.

pub mod catalog;
pub mod compactor;
pub mod config;
pub mod error;
pub mod gc;
pub mod ids;
pub mod lakehouse;
pub mod maintenance;
pub mod manifest;
pub mod resolver;
pub mod schema;
pub mod storage;
pub mod txn;
pub mod value;

#[cfg(test)]
mod tests;

pub use catalog::{
    CatalogBackend, EmbeddedBackend, Snapshot, SnapshotIter, SnapshotScope, TableRecord,
};
pub use compactor::CompactionOutcome;
pub use config::LakeConfig;
pub use error::{LakeError, LakeResult};
pub use gc::GcReport;
pub use ids::{EntryId, FileRef, RowId, SchemaVersionId, SnapshotId, TxnId};
pub use lakehouse::Lakehouse;
pub use maintenance::{MaintenanceReport, MaintenanceWorker};
pub use manifest::{Expr, Predicate};
pub use resolver::{AsOf, ChangeKind, RowChange, TableView};
pub use schema::{ColumnDef, SchemaChangeOp, SchemaVersion};
pub use storage::{FileStore, LocalFileStore, MemoryFileStore};
pub use txn::{
    InsertRow, MutationOp, RecoveryReport, SnapshotSet, Transaction, TransactionState, record,
    rows_to_records,
};
pub use value::{DataType, Row, Value};
