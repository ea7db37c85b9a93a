use pretty_assertions::assert_eq;
use std::sync::Arc;

use super::{create_orders, ids_at, order, seed};
use crate::catalog::{CatalogBackend, EmbeddedBackend};
use crate::config::LakeConfig;
use crate::error::LakeError;
use crate::ids::SnapshotId;
use crate::lakehouse::Lakehouse;
use crate::manifest::Predicate;
use crate::resolver::AsOf;
use crate::schema::SchemaChangeOp;
use crate::storage::{FileStore, MemoryFileStore};
use crate::value::Value;

struct Fixture {
    lake: Lakehouse,
    store: Arc<MemoryFileStore>,
    snapshots: Vec<SnapshotId>,
}

/// Keeps the newest two snapshots; every write of two or more rows goes to
/// a file.
fn lake() -> (Lakehouse, Arc<MemoryFileStore>) {
    let mut config = LakeConfig::default();
    config.inlining.row_limit = 2;
    config.retention.keep_snapshots = 2;
    config.retention.keep_for_secs = 0;
    let store = Arc::new(MemoryFileStore::new());
    let lake = Lakehouse::with_parts(
        Arc::new(EmbeddedBackend::in_memory()),
        Arc::clone(&store) as Arc<dyn FileStore>,
        config,
    )
    .unwrap();
    (lake, store)
}

/// s1 writes a file holding orders 1 and 2; s2 deletes order 1, which
/// moves order 2 inline and leaves the file referenced only by s1; s3 and
/// s4 add orders 3 and 4.
fn history() -> Fixture {
    let (lake, store) = lake();
    let mut snapshots = Vec::new();

    let mut txn = lake.begin().unwrap();
    txn.alter("orders", create_orders()).unwrap();
    txn.insert("orders", vec![order(1, "alice", 10), order(2, "bob", 20)])
        .unwrap();
    snapshots.push(txn.commit().unwrap()["orders"]);

    let mut txn = lake.begin().unwrap();
    txn.delete("orders", Predicate::eq("id", 1)).unwrap();
    snapshots.push(txn.commit().unwrap()["orders"]);

    for id in 3..=4 {
        let mut txn = lake.begin().unwrap();
        txn.insert("orders", vec![order(id, "carol", id * 10)]).unwrap();
        snapshots.push(txn.commit().unwrap()["orders"]);
    }

    Fixture {
        lake,
        store,
        snapshots,
    }
}

#[test]
fn test_collect_expires_old_snapshots_and_files() {
    let Fixture {
        lake,
        store,
        snapshots,
    } = history();
    assert_eq!(store.len(), 2);
    assert_eq!(lake.retention_horizon().unwrap(), Some(snapshots[2]));

    let planned = lake.plan_garbage().unwrap();
    assert_eq!(planned.files_deleted, 1);
    assert_eq!(store.len(), 2);

    let report = lake.collect_garbage().unwrap();
    assert_eq!(report.snapshots_expired, 2);
    assert_eq!(report.manifests_purged, 1);
    assert_eq!(report.entries_purged, 1);
    assert_eq!(report.files_deleted, 1);
    assert_eq!(report.skipped_pinned, 0);
    assert_eq!(store.len(), 1);

    assert!(matches!(
        lake.query_at("orders", AsOf::Version(snapshots[0])),
        Err(LakeError::NoSnapshot(_))
    ));
    assert_eq!(
        ids_at(&lake, "orders", AsOf::Latest, "id"),
        vec![Value::Integer(2), Value::Integer(3), Value::Integer(4)]
    );
    assert_eq!(
        lake.query_at("orders", AsOf::Version(snapshots[2])).unwrap().row_count(),
        2
    );

    // Nothing left to do
    assert!(lake.collect_garbage().unwrap().is_empty());
}

#[test]
fn test_pinned_version_survives_collection() {
    let Fixture {
        lake,
        store,
        snapshots,
    } = history();

    let view = lake.query_at("orders", AsOf::Version(snapshots[0])).unwrap();
    let report = lake.collect_garbage().unwrap();
    assert_eq!(report.skipped_pinned, 1);
    assert_eq!(report.files_deleted, 0);
    assert_eq!(store.len(), 2);
    assert_eq!(view.rows().unwrap().len(), 2);

    drop(view);
    let report = lake.collect_garbage().unwrap();
    assert_eq!(report.manifests_purged, 1);
    assert_eq!(report.files_deleted, 1);
    assert_eq!(store.len(), 1);
}

#[test]
fn test_collection_keeps_staged_files() {
    let Fixture { lake, store, .. } = history();

    // Flushes order 4 and the new rows into a file the catalog does not know yet
    let mut txn = lake.begin().unwrap();
    txn.insert("orders", vec![order(5, "dave", 50), order(6, "erin", 60)])
        .unwrap();
    let staged = store.len();
    lake.collect_garbage().unwrap();
    assert_eq!(store.len(), staged - 1);

    txn.commit().unwrap();
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 5);
}

#[test]
fn test_dropped_table_history_is_purged() {
    let (lake, store) = lake();
    let mut txn = lake.begin().unwrap();
    txn.alter("orders", create_orders()).unwrap();
    txn.alter("scratch", create_orders()).unwrap();
    txn.insert("scratch", vec![order(1, "tmp", 1), order(2, "tmp", 2)])
        .unwrap();
    txn.commit().unwrap();

    let mut txn = lake.begin().unwrap();
    txn.alter("scratch", SchemaChangeOp::DropTable).unwrap();
    txn.commit().unwrap();

    for id in 1..=2 {
        let mut txn = lake.begin().unwrap();
        txn.insert("orders", vec![order(id, "carol", id)]).unwrap();
        txn.commit().unwrap();
    }

    let report = lake.collect_garbage().unwrap();
    assert_eq!(report.tables_purged, 1);
    assert_eq!(report.schema_versions_purged, 1);
    assert_eq!(report.files_deleted, 1);
    // Left: the file orders flushed at the last snapshot
    assert_eq!(store.len(), 1);
    assert!(lake.backend().get_table("scratch").unwrap().is_none());
    assert!(lake.backend().manifest_ids("scratch").unwrap().is_empty());
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 2);
}

#[test]
fn test_orphan_files_are_swept() {
    let (lake, store) = lake();
    seed(&lake);
    let known = store.len();

    store.put("orders", bytes::Bytes::from_static(b"left by a crash")).unwrap();
    assert_eq!(store.len(), known + 1);

    let report = lake.collect_garbage().unwrap();
    assert_eq!(report.orphan_files_deleted, 1);
    assert_eq!(store.len(), known);
}
