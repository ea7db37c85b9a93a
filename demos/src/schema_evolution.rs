use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use comfy_table::{Table, presets::UTF8_FULL};
use lake_core::{
    AsOf, ColumnDef, DataType, LakeConfig, LakeResult, Lakehouse, SchemaChangeOp, SnapshotId,
    Value, record,
};
use tracing::debug;

use crate::display::{heading, note, print_view, step};

#[derive(Debug, Default)]
struct WriterStats {
    written: u64,
    retried: u64,
}

/// Insert events one transaction at a time until told to stop, starting
/// over whenever the schema or another writer got in the way
fn background_writer(lake: Lakehouse, stop: Arc<AtomicBool>) -> LakeResult<WriterStats> {
    let mut stats = WriterStats::default();
    let mut next_id = 100i64;
    while !stop.load(Ordering::Relaxed) {
        let mut txn = lake.begin()?;
        txn.insert(
            "events",
            vec![record([
                ("id", Value::from(next_id)),
                ("kind", "heartbeat".into()),
            ])],
        )?;
        match txn.commit() {
            Ok(_) => {
                stats.written += 1;
                next_id += 1;
            }
            Err(e) if e.is_retryable() => {
                debug!(error = %e, "Writer retrying");
                stats.retried += 1;
            }
            Err(e) => return Err(e),
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok(stats)
}

fn alter(lake: &Lakehouse, op: SchemaChangeOp) -> LakeResult<SnapshotId> {
    let message = op.name().to_lowercase();
    loop {
        let mut txn = lake.begin()?;
        txn.set_commit_message(message.clone());
        txn.alter("events", op.clone())?;
        match txn.commit() {
            Ok(set) => return Ok(set["events"]),
            Err(e) if e.is_retryable() => continue,
            Err(e) => return Err(e),
        }
    }
}

pub async fn run(config: &LakeConfig) -> anyhow::Result<()> {
    heading("Schema evolution");
    let lake = Lakehouse::in_memory(config.clone())?;

    let mut txn = lake.begin()?;
    txn.alter(
        "events",
        SchemaChangeOp::CreateTable {
            columns: vec![
                ColumnDef::new("id", DataType::Integer),
                ColumnDef::new("kind", DataType::Varchar).not_null(),
                ColumnDef::new("payload", DataType::Json),
            ],
            primary_key: vec!["id".into()],
        },
    )?;
    txn.insert(
        "events",
        vec![
            record([
                ("id", Value::from(1)),
                ("kind", "signup".into()),
                ("payload", Value::Json(r#"{"plan":"free"}"#.into())),
            ]),
            record([("id", Value::from(2)), ("kind", "login".into())]),
        ],
    )?;
    txn.commit()?;

    step("Starting a background writer");
    let stop = Arc::new(AtomicBool::new(false));
    let writer = tokio::task::spawn_blocking({
        let lake = lake.clone();
        let stop = Arc::clone(&stop);
        move || background_writer(lake, stop)
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    step("ALTER TABLE events ADD COLUMN priority INTEGER DEFAULT 5");
    let added = alter(
        &lake,
        SchemaChangeOp::AddColumn {
            column: ColumnDef::new("priority", DataType::Integer).with_default(5),
        },
    )?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    step("ALTER TABLE events RENAME COLUMN payload TO detail");
    alter(
        &lake,
        SchemaChangeOp::RenameColumn {
            from: "payload".into(),
            to: "detail".into(),
        },
    )?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    step("ALTER TABLE events ALTER COLUMN id TYPE BIGINT");
    alter(
        &lake,
        SchemaChangeOp::ChangeType {
            column: "id".into(),
            data_type: DataType::BigInt,
        },
    )?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    stop.store(true, Ordering::Relaxed);
    let stats = writer.await??;
    note("background rows written", stats.written);
    note("background retries", stats.retried);

    step("Schema history");
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["version", "valid from", "columns"]);
    for version in lake.schema_history("events")? {
        table.add_row(vec![
            version.version_id.to_string(),
            version.valid_from_snapshot.to_string(),
            version
                .columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.data_type))
                .collect::<Vec<_>>()
                .join(", "),
        ]);
    }
    println!("{table}");

    step("Just before and at the ADD COLUMN snapshot");
    let before = lake.query_at("events", AsOf::Version(SnapshotId(added.0 - 1)))?;
    note("columns", before.column_names().join(", "));
    let at = lake.query_at("events", AsOf::Version(added))?;
    note("columns", at.column_names().join(", "));
    let priorities = at
        .rows()?
        .iter()
        .filter_map(|r| r.get("priority").and_then(Value::as_i64))
        .collect::<Vec<_>>();
    anyhow::ensure!(
        priorities.iter().all(|&p| p == 5),
        "pre-existing rows should read the default priority"
    );

    print_view(&lake.query_at("events", AsOf::Latest)?)?;
    Ok(())
}
