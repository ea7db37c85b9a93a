//! End-to-end scenarios against a whole lakehouse

mod gc_tests;
mod persistence_tests;
mod transaction_tests;

use crate::config::LakeConfig;
use crate::ids::SnapshotId;
use crate::lakehouse::Lakehouse;
use crate::manifest::Predicate;
use crate::resolver::AsOf;
use crate::schema::{ColumnDef, SchemaChangeOp};
use crate::txn::{InsertRow, record};
use crate::value::{DataType, Value};

pub(crate) fn create_orders() -> SchemaChangeOp {
    SchemaChangeOp::CreateTable {
        columns: vec![
            ColumnDef::new("id", DataType::Integer),
            ColumnDef::new("customer", DataType::Varchar).not_null(),
            ColumnDef::new("amount", DataType::Integer),
        ],
        primary_key: vec!["id".into()],
    }
}

pub(crate) fn create_inventory() -> SchemaChangeOp {
    SchemaChangeOp::CreateTable {
        columns: vec![
            ColumnDef::new("sku", DataType::Varchar),
            ColumnDef::new("qty", DataType::Integer),
        ],
        primary_key: vec!["sku".into()],
    }
}

pub(crate) fn order(id: i64, customer: &str, amount: i64) -> InsertRow {
    record([
        ("id", Value::Integer(id)),
        ("customer", Value::from(customer)),
        ("amount", Value::Integer(amount)),
    ])
}

pub(crate) fn stock(sku: &str, qty: i64) -> InsertRow {
    record([("sku", Value::from(sku)), ("qty", Value::Integer(qty))])
}

/// Both tables with two rows each, committed as one snapshot
pub(crate) fn seed(lake: &Lakehouse) -> SnapshotId {
    let mut txn = lake.begin().unwrap();
    txn.alter("orders", create_orders()).unwrap();
    txn.alter("inventory", create_inventory()).unwrap();
    txn.insert("orders", vec![order(1, "alice", 10), order(2, "bob", 20)])
        .unwrap();
    txn.insert("inventory", vec![stock("apple", 10), stock("pear", 5)])
        .unwrap();
    txn.commit().unwrap()["orders"]
}

pub(crate) fn in_memory() -> Lakehouse {
    Lakehouse::in_memory(LakeConfig::default()).unwrap()
}

/// Insert one order in its own transaction
pub(crate) fn insert_order(lake: &Lakehouse, id: i64, amount: i64) -> SnapshotId {
    let mut txn = lake.begin().unwrap();
    txn.insert("orders", vec![order(id, "carol", amount)]).unwrap();
    txn.commit().unwrap()["orders"]
}

pub(crate) fn ids_at(lake: &Lakehouse, table: &str, at: AsOf, column: &str) -> Vec<Value> {
    lake.query_at(table, at)
        .unwrap()
        .scan(&Predicate::All)
        .unwrap()
        .into_iter()
        .map(|r| r.get(column).cloned().unwrap_or(Value::Null))
        .collect()
}
