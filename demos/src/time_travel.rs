use std::time::Duration;

use chrono::Utc;
use comfy_table::{Table, presets::UTF8_FULL};
use lake_core::{
    AsOf, ColumnDef, DataType, Expr, LakeConfig, Lakehouse, Predicate, SchemaChangeOp, Value,
    record, rows_to_records,
};

use crate::display::{heading, note, print_snapshots, print_view, step};

const CUSTOMERS: [(&str, &str); 5] = [
    ("Ada", "London"),
    ("Grace", "New York"),
    ("Linus", "Helsinki"),
    ("Barbara", "Boston"),
    ("Ken", "Berkeley"),
];

pub fn run(config: &LakeConfig) -> anyhow::Result<()> {
    heading("Time travel");
    let lake = Lakehouse::in_memory(config.clone())?;

    let mut txn = lake.begin()?;
    txn.set_commit_message("load customers");
    txn.alter(
        "customers",
        SchemaChangeOp::CreateTable {
            columns: vec![
                ColumnDef::new("id", DataType::Integer),
                ColumnDef::new("name", DataType::Varchar).not_null(),
                ColumnDef::new("city", DataType::Varchar),
                ColumnDef::new("visits", DataType::Integer).with_default(0),
            ],
            primary_key: vec!["id".into()],
        },
    )?;
    let rows = CUSTOMERS
        .iter()
        .enumerate()
        .map(|(i, (name, city))| {
            record([
                ("id", Value::from(i as i64 + 1)),
                ("name", (*name).into()),
                ("city", (*city).into()),
            ])
        })
        .collect();
    txn.insert("customers", rows)?;
    let loaded = txn.commit()?["customers"];
    let loaded_at = Utc::now();
    step("Loaded five customers");
    print_view(&lake.query_at("customers", AsOf::Latest)?)?;

    std::thread::sleep(Duration::from_millis(10));
    let mut txn = lake.begin()?;
    txn.set_commit_message("count a visit");
    txn.update(
        "customers",
        Predicate::lt("id", 3),
        vec![("visits", Expr::col("visits").add(Expr::lit(1)))],
    )?;
    let counted = txn.commit()?["customers"];

    let mut txn = lake.begin()?;
    txn.set_commit_message("oops");
    txn.delete("customers", Predicate::All)?;
    txn.commit()?;
    step("DELETE FROM customers (no predicate)");
    note("rows now", lake.query_at("customers", AsOf::Latest)?.row_count());

    step("Reading the table as it was when loaded");
    print_view(&lake.query_at("customers", AsOf::Version(loaded))?)?;
    note(
        "rows at load time (by timestamp)",
        lake.query_at("customers", AsOf::Timestamp(loaded_at))?
            .row_count(),
    );

    step("INSERT INTO customers SELECT * FROM customers AT (VERSION => before the delete)");
    let before = lake.query_at("customers", AsOf::Version(counted))?;
    let expected = before.row_count();
    let mut txn = lake.begin()?;
    txn.set_commit_message("restore customers");
    txn.insert("customers", rows_to_records(before.rows()?))?;
    let restored = txn.commit()?["customers"];
    drop(before);
    print_view(&lake.query_at("customers", AsOf::Latest)?)?;
    anyhow::ensure!(
        lake.query_at("customers", AsOf::Latest)?.row_count() == expected,
        "restore did not bring back every row"
    );

    step("Row changes from load to restore");
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["snapshot", "change", "id", "name", "visits"]);
    for change in lake.table_changes("customers", loaded, restored)? {
        let get = |c: &str| change.row.get(c).map(|v| v.to_string()).unwrap_or_default();
        table.add_row(vec![
            change.snapshot_id.to_string(),
            change.kind.to_string(),
            get("id"),
            get("name"),
            get("visits"),
        ]);
    }
    println!("{table}");

    step("Snapshot history");
    print_snapshots(&lake)?;
    Ok(())
}
