use colored::Colorize;
use lake_core::{
    AsOf, ColumnDef, DataType, Expr, LakeConfig, LakeError, Lakehouse, Predicate, SchemaChangeOp,
    Value, record,
};

use crate::display::{heading, note, print_view, step};

pub fn run(config: &LakeConfig) -> anyhow::Result<()> {
    heading("Transaction rollback");
    let lake = Lakehouse::in_memory(config.clone())?;

    let mut txn = lake.begin()?;
    txn.set_commit_message("create orders and inventory");
    txn.alter(
        "orders",
        SchemaChangeOp::CreateTable {
            columns: vec![
                ColumnDef::new("id", DataType::Integer),
                ColumnDef::new("customer", DataType::Varchar).not_null(),
                ColumnDef::new("amount", DataType::Integer),
            ],
            primary_key: vec!["id".into()],
        },
    )?;
    txn.alter(
        "inventory",
        SchemaChangeOp::CreateTable {
            columns: vec![
                ColumnDef::new("sku", DataType::Varchar),
                ColumnDef::new("qty", DataType::Integer),
            ],
            primary_key: vec!["sku".into()],
        },
    )?;
    txn.insert(
        "orders",
        vec![record([
            ("id", Value::from(1)),
            ("customer", "alice".into()),
            ("amount", 10.into()),
        ])],
    )?;
    txn.insert(
        "inventory",
        vec![record([("sku", Value::from("apple")), ("qty", 10.into())])],
    )?;
    let created = txn.commit()?;
    step("Created orders and inventory");
    note("snapshot", created["orders"]);
    print_view(&lake.query_at("orders", AsOf::Latest)?)?;
    print_view(&lake.query_at("inventory", AsOf::Latest)?)?;

    step("BEGIN; insert order 2; take one apple; insert order 2 again; COMMIT");
    let mut txn = lake.begin()?;
    txn.insert(
        "orders",
        vec![record([
            ("id", Value::from(2)),
            ("customer", "bob".into()),
            ("amount", 20.into()),
        ])],
    )?;
    txn.update(
        "inventory",
        Predicate::eq("sku", "apple"),
        vec![("qty", Expr::col("qty").sub(Expr::lit(1)))],
    )?;
    txn.insert(
        "orders",
        vec![record([
            ("id", Value::from(2)),
            ("customer", "bob".into()),
            ("amount", 25.into()),
        ])],
    )?;
    match txn.commit() {
        Err(e @ LakeError::Validation(_)) => {
            println!("   {} {}", "commit rejected:".bright_yellow(), e);
        }
        Err(e) => return Err(e.into()),
        Ok(set) => anyhow::bail!("duplicate key committed as {:?}", set),
    }

    step("Both tables are exactly as before");
    let orders = lake.query_at("orders", AsOf::Latest)?;
    let inventory = lake.query_at("inventory", AsOf::Latest)?;
    print_view(&orders)?;
    print_view(&inventory)?;
    anyhow::ensure!(
        orders.snapshot_id == created["orders"] && inventory.snapshot_id == created["inventory"],
        "a failed commit moved a table pointer"
    );

    step("An explicit abort is just as clean");
    let mut txn = lake.begin()?;
    txn.delete("orders", Predicate::All)?;
    txn.abort();
    note("orders rows", lake.query_at("orders", AsOf::Latest)?.row_count());
    note(
        "latest snapshot",
        lake.latest_snapshot()?.map(|s| s.id.to_string()).unwrap_or_default(),
    );
    Ok(())
}
