use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;

use super::{create_orders, ids_at, in_memory, insert_order, order, seed, stock};
use crate::catalog::EmbeddedBackend;
use crate::config::LakeConfig;
use crate::error::LakeError;
use crate::ids::SchemaVersionId;
use crate::lakehouse::Lakehouse;
use crate::manifest::{Expr, Predicate};
use crate::resolver::AsOf;
use crate::schema::{ColumnDef, SchemaChangeOp};
use crate::storage::{FileStore, MemoryFileStore};
use crate::txn::{TransactionState, record};
use crate::value::{DataType, Value};

#[test]
fn test_commit_publishes_one_snapshot_for_every_table() {
    let lake = in_memory();
    let first = seed(&lake);

    let mut txn = lake.begin().unwrap();
    txn.insert("orders", vec![order(3, "carol", 30)]).unwrap();
    txn.update(
        "inventory",
        Predicate::eq("sku", "apple"),
        vec![("qty", Expr::col("qty").sub(Expr::lit(1)))],
    )
    .unwrap();
    let set = txn.commit().unwrap();

    assert_eq!(set.len(), 2);
    assert_eq!(set["orders"], set["inventory"]);
    let latest = lake.latest_snapshot().unwrap().unwrap();
    assert_eq!(latest.id, set["orders"]);
    assert_eq!(latest.parent_id, Some(first));
    assert_eq!(latest.changes["orders"].inserted, 1);
    assert_eq!(latest.changes["inventory"].updated, 1);
}

#[test]
fn test_duplicate_key_rolls_back_every_table() {
    let lake = in_memory();
    let first = seed(&lake);

    let mut txn = lake.begin().unwrap();
    txn.insert("orders", vec![order(3, "carol", 30)]).unwrap();
    txn.update(
        "inventory",
        Predicate::eq("sku", "apple"),
        vec![("qty", Expr::col("qty").sub(Expr::lit(1)))],
    )
    .unwrap();
    // Collides with a committed row; only detected at commit
    txn.insert("orders", vec![order(2, "dave", 40)]).unwrap();

    let err = txn.commit().unwrap_err();
    assert!(matches!(err, LakeError::Validation(_)), "{err}");
    assert!(err.to_string().contains("duplicate primary key"));

    assert_eq!(lake.latest_snapshot().unwrap().unwrap().id, first);
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 2);
    let apple = lake
        .query_at("inventory", AsOf::Latest)
        .unwrap()
        .scan(&Predicate::eq("sku", "apple"))
        .unwrap();
    assert_eq!(apple[0].get("qty"), Some(&Value::Integer(10)));
    assert_eq!(lake.active_transactions(), 0);
}

#[test]
fn test_duplicate_within_one_transaction() {
    let lake = in_memory();
    seed(&lake);

    let mut txn = lake.begin().unwrap();
    txn.insert("inventory", vec![stock("plum", 1), stock("plum", 2)])
        .unwrap();
    assert!(matches!(txn.commit(), Err(LakeError::Validation(_))));
}

#[test]
fn test_reads_see_own_writes() {
    let lake = in_memory();
    seed(&lake);

    let mut txn = lake.begin().unwrap();
    txn.insert("orders", vec![order(3, "carol", 30)]).unwrap();
    txn.delete("orders", Predicate::eq("id", 1)).unwrap();

    let staged = txn.scan("orders", &Predicate::All).unwrap();
    let ids: Vec<_> = staged.iter().map(|r| r.get("id").cloned()).collect();
    assert_eq!(ids, vec![Some(Value::Integer(2)), Some(Value::Integer(3))]);

    // Nothing is visible outside the transaction yet
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 2);
    txn.commit().unwrap();
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 2);
}

#[test]
fn test_concurrent_writers_on_one_table_conflict() {
    let lake = in_memory();
    seed(&lake);

    let mut first = lake.begin().unwrap();
    let mut second = lake.begin().unwrap();
    first.insert("orders", vec![order(3, "carol", 30)]).unwrap();
    second.insert("orders", vec![order(4, "dave", 40)]).unwrap();

    first.commit().unwrap();
    let err = second.commit().unwrap_err();
    assert!(matches!(err, LakeError::Conflict(_)), "{err}");
    assert!(err.is_retryable());
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 3);
}

#[test]
fn test_writers_on_different_tables_both_commit() {
    let lake = in_memory();
    seed(&lake);

    let mut first = lake.begin().unwrap();
    let mut second = lake.begin().unwrap();
    first.insert("orders", vec![order(3, "carol", 30)]).unwrap();
    second.insert("inventory", vec![stock("plum", 7)]).unwrap();

    let a = first.commit().unwrap()["orders"];
    let b = second.commit().unwrap()["inventory"];
    assert!(b > a);
}

#[test]
fn test_retrying_writers_on_threads() {
    let lake = in_memory();
    seed(&lake);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let lake = lake.clone();
            thread::spawn(move || {
                for attempt in 0..200 {
                    let mut txn = lake.begin().unwrap();
                    txn.insert("orders", vec![order(100 + worker, "eve", attempt)])
                        .unwrap();
                    match txn.commit() {
                        Ok(set) => return set["orders"],
                        Err(e) if e.is_retryable() => continue,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                panic!("writer {worker} never committed");
            })
        })
        .collect();

    let mut ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 6);
}

#[test]
fn test_schema_change_by_another_writer_is_a_schema_conflict() {
    let lake = in_memory();
    seed(&lake);

    let mut writer = lake.begin().unwrap();
    writer.insert("orders", vec![order(3, "carol", 30)]).unwrap();

    let mut alter = lake.begin().unwrap();
    alter
        .alter(
            "orders",
            SchemaChangeOp::AddColumn {
                column: ColumnDef::new("note", DataType::Varchar),
            },
        )
        .unwrap();
    alter.commit().unwrap();

    let err = writer.commit().unwrap_err();
    assert!(matches!(err, LakeError::SchemaConflict(_)), "{err}");
}

#[test]
fn test_failed_statement_keeps_transaction_open() {
    let lake = in_memory();
    seed(&lake);

    let mut txn = lake.begin().unwrap();
    let mut bad = order(3, "carol", 30);
    bad.insert("missing".to_string(), Value::Integer(1));
    let err = txn.insert("orders", vec![bad]).unwrap_err();
    assert!(matches!(err, LakeError::ColumnNotFound(_)));
    assert_eq!(txn.state(), TransactionState::Active);

    txn.insert("orders", vec![order(3, "carol", 30)]).unwrap();
    txn.commit().unwrap();
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 3);
}

#[test]
fn test_failed_type_change_aborts_transaction() {
    let lake = in_memory();
    seed(&lake);

    let mut txn = lake.begin().unwrap();
    txn.insert("orders", vec![order(3, "carol", 30)]).unwrap();
    let err = txn
        .alter(
            "orders",
            SchemaChangeOp::ChangeType {
                column: "customer".into(),
                data_type: DataType::Integer,
            },
        )
        .unwrap_err();
    assert!(matches!(err, LakeError::TypeMismatch { .. }));
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(matches!(
        txn.insert("orders", vec![order(4, "dave", 40)]),
        Err(LakeError::Transaction(_))
    ));
    assert_eq!(lake.active_transactions(), 0);
}

#[test]
fn test_abort_and_drop_leave_no_trace() {
    let mut config = LakeConfig::default();
    config.inlining.row_limit = 2;
    let store = Arc::new(MemoryFileStore::new());
    let lake = Lakehouse::with_parts(
        Arc::new(EmbeddedBackend::in_memory()),
        Arc::clone(&store) as Arc<dyn FileStore>,
        config,
    )
    .unwrap();
    let first = seed(&lake);
    let files_before = store.len();

    let mut txn = lake.begin().unwrap();
    txn.insert(
        "orders",
        (3..8).map(|id| order(id, "carol", id * 10)).collect(),
    )
    .unwrap();
    assert!(store.len() > files_before);
    txn.abort();
    assert_eq!(store.len(), files_before);

    {
        let mut dropped = lake.begin().unwrap();
        dropped
            .insert("orders", vec![order(9, "dave", 90), order(10, "erin", 100)])
            .unwrap();
    }
    assert_eq!(store.len(), files_before);
    assert_eq!(lake.latest_snapshot().unwrap().unwrap().id, first);
    assert_eq!(lake.active_transactions(), 0);
}

#[test]
fn test_empty_transaction_publishes_nothing() {
    let lake = in_memory();
    let first = seed(&lake);

    let mut txn = lake.begin().unwrap();
    txn.scan("orders", &Predicate::All).unwrap();
    assert!(txn.commit().unwrap().is_empty());
    assert_eq!(lake.latest_snapshot().unwrap().unwrap().id, first);
}

#[test]
fn test_drop_and_recreate_table() {
    let lake = in_memory();
    let first = seed(&lake);

    let mut txn = lake.begin().unwrap();
    txn.alter("orders", SchemaChangeOp::DropTable).unwrap();
    let dropped = txn.commit().unwrap()["orders"];
    assert!(lake.latest_snapshot().unwrap().unwrap().changes["orders"].dropped);

    assert!(matches!(
        lake.query_at("orders", AsOf::Latest),
        Err(LakeError::TableNotFound(_))
    ));
    assert!(matches!(
        lake.query_at("orders", AsOf::Version(dropped)),
        Err(LakeError::NoSnapshot(_))
    ));
    assert_eq!(
        lake.query_at("orders", AsOf::Version(first)).unwrap().row_count(),
        2
    );
    let names: Vec<_> = lake.list_tables().unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["inventory".to_string()]);

    let mut txn = lake.begin().unwrap();
    txn.alter("orders", create_orders()).unwrap();
    txn.insert("orders", vec![order(1, "frank", 5)]).unwrap();
    let recreated = txn.commit().unwrap()["orders"];

    let schema = lake.current_schema("orders").unwrap();
    assert_eq!(schema.version_id, SchemaVersionId(2));
    let table = lake
        .list_tables()
        .unwrap()
        .into_iter()
        .find(|t| t.name == "orders")
        .unwrap();
    assert_eq!(table.created_snapshot, recreated);
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 1);
}

#[test]
fn test_not_null_added_over_existing_nulls_fails_at_commit() {
    let lake = in_memory();
    seed(&lake);
    insert_order(&lake, 3, 30);

    let mut txn = lake.begin().unwrap();
    txn.update("orders", Predicate::eq("id", 3), vec![("amount", Expr::lit(Value::Null))])
        .unwrap();
    txn.alter(
        "orders",
        SchemaChangeOp::SetNotNull {
            column: "amount".into(),
        },
    )
    .unwrap();
    assert!(matches!(txn.commit(), Err(LakeError::Validation(_))));
    assert!(lake.current_schema("orders").unwrap().column("amount").unwrap().nullable);
}

#[test]
fn test_primary_key_stays_unique_across_type_change() {
    let lake = in_memory();
    seed(&lake);

    let mut txn = lake.begin().unwrap();
    txn.alter(
        "orders",
        SchemaChangeOp::ChangeType {
            column: "id".into(),
            data_type: DataType::Varchar,
        },
    )
    .unwrap();
    txn.commit().unwrap();

    // Old rows still hold INTEGER 1 on disk; it reads as '1' now
    let mut txn = lake.begin().unwrap();
    let mut row = order(3, "carol", 30);
    row.insert("id".into(), Value::from("1"));
    txn.insert("orders", vec![row]).unwrap();
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, LakeError::Validation(_)), "{err}");

    assert_eq!(
        ids_at(&lake, "orders", AsOf::Latest, "id"),
        vec![Value::from("1"), Value::from("2")]
    );
}

#[test]
fn test_type_change_that_merges_keys_fails() {
    let lake = in_memory();
    let mut txn = lake.begin().unwrap();
    txn.alter(
        "codes",
        SchemaChangeOp::CreateTable {
            columns: vec![ColumnDef::new("code", DataType::Varchar)],
            primary_key: vec!["code".into()],
        },
    )
    .unwrap();
    txn.insert("codes", vec![record([("code", "1")]), record([("code", "01")])])
        .unwrap();
    txn.commit().unwrap();

    let mut txn = lake.begin().unwrap();
    txn.alter(
        "codes",
        SchemaChangeOp::ChangeType {
            column: "code".into(),
            data_type: DataType::Integer,
        },
    )
    .unwrap();
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, LakeError::Validation(_)), "{err}");
    assert_eq!(
        lake.current_schema("codes").unwrap().column("code").unwrap().data_type,
        DataType::Varchar
    );
}

#[test]
fn test_out_of_range_values_are_rejected_without_aborting() {
    let lake = in_memory();
    seed(&lake);

    let mut txn = lake.begin().unwrap();
    let mut tiny = order(3, "carol", 0);
    tiny.insert(
        "amount".into(),
        Value::Decimal {
            mantissa: 1,
            scale: 20,
        },
    );
    let err = txn.insert("orders", vec![tiny]).unwrap_err();
    assert!(matches!(err, LakeError::InvalidInput(_)), "{err}");

    let mut huge = order(3, "carol", 0);
    huge.insert("amount".into(), Value::Double(1e20));
    let err = txn.insert("orders", vec![huge]).unwrap_err();
    assert!(matches!(err, LakeError::TypeMismatch { .. }), "{err}");

    assert_eq!(txn.state(), TransactionState::Active);
    txn.insert("orders", vec![order(3, "carol", 30)]).unwrap();
    txn.commit().unwrap();
    assert_eq!(lake.query_at("orders", AsOf::Latest).unwrap().row_count(), 3);
}
