use pretty_assertions::assert_eq;
use std::path::Path;

use super::recovery_tests::{stage_pending, swap};
use super::{ids_at, insert_order, seed};
use crate::catalog::CatalogBackend;
use crate::config::LakeConfig;
use crate::error::LakeError;
use crate::lakehouse::Lakehouse;
use crate::resolver::AsOf;
use crate::schema::{ColumnDef, SchemaChangeOp};
use crate::storage::FileStore;
use crate::txn::record;
use crate::value::{DataType, Value};

fn config(dir: &Path) -> LakeConfig {
    let mut config = LakeConfig::default();
    config.catalog.uri = format!("file:{}", dir.join("catalog.json").display());
    config.storage.data_dir = Some(dir.join("data"));
    config.inlining.row_limit = 2;
    config
}

#[test]
fn test_lake_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (first, second) = {
        let lake = Lakehouse::open(config(dir.path())).unwrap();
        let first = seed(&lake);
        let second = insert_order(&lake, 3, 30);
        (first, second)
    };

    let lake = Lakehouse::open(config(dir.path())).unwrap();
    assert_eq!(lake.latest_snapshot().unwrap().unwrap().id, second);
    assert_eq!(
        ids_at(&lake, "orders", AsOf::Latest, "id"),
        vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]
    );
    assert_eq!(
        lake.query_at("orders", AsOf::Version(first)).unwrap().row_count(),
        2
    );
    assert!(!lake.store().list().unwrap().is_empty());
    assert!(dir.path().join("catalog.json").is_file());

    // Ids keep increasing after reopen
    assert!(insert_order(&lake, 4, 40) > second);
}

#[test]
fn test_open_recovers_interrupted_commit() {
    let dir = tempfile::tempdir().unwrap();
    let pending = {
        let lake = Lakehouse::open(config(dir.path())).unwrap();
        seed(&lake);
        let backend = lake.backend();
        let batch = stage_pending(backend.as_ref(), &["inventory", "orders"]);
        swap(backend.as_ref(), &batch, "inventory");
        swap(backend.as_ref(), &batch, "orders");
        batch.snapshot.id
    };

    let lake = Lakehouse::open(config(dir.path())).unwrap();
    assert_eq!(lake.latest_snapshot().unwrap().unwrap().id, pending);
    assert!(lake.backend().pending_snapshots().unwrap().is_empty());
    assert_eq!(lake.query_at("inventory", AsOf::Latest).unwrap().row_count(), 2);
}

#[test]
fn test_catalog_without_files_is_readable() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.inlining.row_limit = 1_000;
    {
        let lake = Lakehouse::open(config.clone()).unwrap();
        seed(&lake);
    }
    // Inline rows live in the catalog itself
    std::fs::remove_dir_all(dir.path().join("data")).unwrap();

    let lake = Lakehouse::open(config).unwrap();
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 2);
    assert!(lake.store().list().unwrap().is_empty());
}

#[test]
fn test_non_finite_doubles_never_reach_the_catalog() {
    let dir = tempfile::tempdir().unwrap();
    {
        let lake = Lakehouse::open(config(dir.path())).unwrap();
        let mut txn = lake.begin().unwrap();
        txn.alter(
            "readings",
            SchemaChangeOp::CreateTable {
                columns: vec![ColumnDef::new("x", DataType::Double)],
                primary_key: Vec::new(),
            },
        )
        .unwrap();
        for bad in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let err = txn
                .insert("readings", vec![record([("x", Value::Double(bad))])])
                .unwrap_err();
            assert!(matches!(err, LakeError::Validation(_)), "{err}");
        }
        txn.insert("readings", vec![record([("x", Value::Double(1.5))])])
            .unwrap();
        txn.commit().unwrap();
    }

    // The single row is inlined into catalog.json
    let lake = Lakehouse::open(config(dir.path())).unwrap();
    assert_eq!(
        ids_at(&lake, "readings", AsOf::Latest, "x"),
        vec![Value::Double(1.5)]
    );
}
