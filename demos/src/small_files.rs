use lake_core::{
    ColumnDef, DataType, FileStore, LakeConfig, Lakehouse, SchemaChangeOp, Value, record,
};

use crate::display::{heading, note, print_layout, step};

const INSERTS: i64 = 100;

pub fn run(config: &LakeConfig) -> anyhow::Result<()> {
    heading("Small files");
    let lake = Lakehouse::in_memory(config.clone())?;
    note("inline row limit", lake.config().inlining.row_limit);

    let mut txn = lake.begin()?;
    txn.alter(
        "readings",
        SchemaChangeOp::CreateTable {
            columns: vec![
                ColumnDef::new("sensor", DataType::Integer),
                ColumnDef::new("celsius", DataType::Double),
            ],
            primary_key: Vec::new(),
        },
    )?;
    txn.commit()?;

    step(&format!("{INSERTS} single-row INSERT transactions"));
    for i in 0..INSERTS {
        let mut txn = lake.begin()?;
        txn.insert(
            "readings",
            vec![record([
                ("sensor", Value::from(i % 4)),
                ("celsius", Value::from(18.0 + (i % 7) as f64 * 0.5)),
            ])],
        )?;
        txn.commit()?;
    }
    print_layout(&lake, "readings")?;

    step("Flushing inlined rows");
    match lake.flush_inlined("readings")? {
        Some(outcome) => note("rows written to one file", outcome.rows),
        None => note("rows written", 0),
    }
    print_layout(&lake, "readings")?;
    let files = lake.store().list()?.len();
    anyhow::ensure!(
        files <= 1,
        "{INSERTS} small writes left {files} physical files"
    );

    step("Maintenance pass");
    let report = lake.run_maintenance()?;
    note("tables compacted", report.compacted.len());
    note("snapshots expired", report.gc.snapshots_expired);
    note("files deleted", report.gc.files_deleted);
    print_layout(&lake, "readings")?;
    Ok(())
}
