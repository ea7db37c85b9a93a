use std::path::Path;

use comfy_table::{Table, presets::UTF8_FULL};
use lake_core::{
    AsOf, ColumnDef, DataType, Expr, FileStore, LakeConfig, LakeResult, Lakehouse, Predicate,
    SchemaChangeOp, SnapshotScope, Value, record,
};

use crate::display::{heading, note, print_view, step};

/// Identical workload for every catalog: create, load, update, delete
fn workload(lake: &Lakehouse) -> LakeResult<()> {
    let mut txn = lake.begin()?;
    txn.alter(
        "accounts",
        SchemaChangeOp::CreateTable {
            columns: vec![
                ColumnDef::new("id", DataType::Integer),
                ColumnDef::new("owner", DataType::Varchar).not_null(),
                ColumnDef::new(
                    "balance",
                    DataType::Decimal {
                        precision: 12,
                        scale: 2,
                    },
                ),
            ],
            primary_key: vec!["id".into()],
        },
    )?;
    txn.insert(
        "accounts",
        (1..=4)
            .map(|id| {
                record([
                    ("id", Value::from(id)),
                    ("owner", format!("owner-{id}").into()),
                    (
                        "balance",
                        Value::Decimal {
                            mantissa: i64::from(id) * 10_000,
                            scale: 2,
                        },
                    ),
                ])
            })
            .collect(),
    )?;
    txn.commit()?;

    let mut txn = lake.begin()?;
    txn.update(
        "accounts",
        Predicate::eq("id", 1),
        vec![("balance", Expr::col("balance").add(Expr::lit(25)))],
    )?;
    txn.delete("accounts", Predicate::eq("id", 4))?;
    txn.commit()?;
    Ok(())
}

fn file_config(base: &LakeConfig, dir: &Path) -> LakeConfig {
    let mut config = base.clone();
    config.catalog.uri = format!("file:{}", dir.join("catalog.json").display());
    config.storage.data_dir = Some(dir.join("data"));
    config
}

pub fn run(config: &LakeConfig) -> anyhow::Result<()> {
    heading("Catalog portability");
    let dir = tempfile::tempdir()?;

    step("Running the same workload on two catalogs");
    let memory = Lakehouse::in_memory(config.clone())?;
    workload(&memory)?;
    {
        let file = Lakehouse::open(file_config(config, dir.path()))?;
        workload(&file)?;
        note("file catalog", format!("{:?}", file));
    }

    step("Reopening the file catalog from disk");
    let reopened = Lakehouse::open(file_config(config, dir.path()))?;
    print_view(&reopened.query_at("accounts", AsOf::Latest)?)?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["catalog", "latest snapshot", "rows", "rows at first snapshot", "files"]);
    for (name, lake) in [("memory", &memory), ("file", &reopened)] {
        let latest = lake
            .latest_snapshot()?
            .ok_or_else(|| anyhow::anyhow!("{name} catalog has no snapshots"))?;
        let first = lake
            .list_snapshots(SnapshotScope::All)
            .next()
            .transpose()?
            .map(|s| s.id)
            .ok_or_else(|| anyhow::anyhow!("{name} catalog has no snapshots"))?;
        table.add_row(vec![
            name.to_string(),
            latest.id.to_string(),
            lake.query_at("accounts", AsOf::Latest)?.row_count().to_string(),
            lake.query_at("accounts", AsOf::Version(first))?
                .row_count()
                .to_string(),
            lake.store().list()?.len().to_string(),
        ]);
    }
    println!("{table}");

    let rows = |lake: &Lakehouse| -> anyhow::Result<Vec<Vec<Value>>> {
        Ok(lake
            .query_at("accounts", AsOf::Latest)?
            .rows()?
            .into_iter()
            .map(|r| r.data.into_values().collect())
            .collect())
    };
    anyhow::ensure!(
        rows(&memory)? == rows(&reopened)?,
        "catalogs disagree after the same workload"
    );
    note("result", "identical table state on both catalogs");
    Ok(())
}
