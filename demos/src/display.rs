use colored::Colorize;
use comfy_table::{Table, presets::UTF8_FULL};
use lake_core::{AsOf, FileStore, Lakehouse, Row, SnapshotScope, TableView, Value};

pub fn heading(title: &str) {
    println!("\n{}", format!("== {title} ==").bright_green().bold());
}

pub fn step(text: &str) {
    println!("{} {}", "->".bright_cyan(), text);
}

pub fn note(label: &str, value: impl std::fmt::Display) {
    println!("   {}: {}", label, value.to_string().bright_cyan());
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "NULL".to_string(),
        Some(v) => v.to_string(),
    }
}

pub fn rows_table(columns: &[&str], rows: &[Row]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(columns.to_vec());
    for row in rows {
        table.add_row(columns.iter().map(|c| cell(row.get(c))).collect::<Vec<_>>());
    }
    table
}

/// Print every row the view can see
pub fn print_view(view: &TableView) -> anyhow::Result<()> {
    let rows = view.rows()?;
    println!(
        "   {} @ snapshot {} (schema v{}, {} rows)",
        view.table.bright_white(),
        view.snapshot_id,
        view.schema.version_id,
        rows.len()
    );
    println!("{}", rows_table(&view.column_names(), &rows));
    Ok(())
}

pub fn print_snapshots(lake: &Lakehouse) -> anyhow::Result<()> {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["snapshot", "parent", "tables", "message"]);
    for snapshot in lake.list_snapshots(SnapshotScope::All) {
        let snapshot = snapshot?;
        table.add_row(vec![
            snapshot.id.to_string(),
            snapshot
                .parent_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            snapshot.changes.keys().cloned().collect::<Vec<_>>().join(", "),
            snapshot.commit_message.unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Entry layout of a table: how many entries are inline and how many are
/// files
pub fn print_layout(lake: &Lakehouse, table_name: &str) -> anyhow::Result<()> {
    let view = lake.query_at(table_name, AsOf::Latest)?;
    let inline = view.entries.iter().filter(|e| e.is_inline()).count();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["table", "rows", "inline entries", "file entries", "files in store"]);
    table.add_row(vec![
        table_name.to_string(),
        view.row_count().to_string(),
        inline.to_string(),
        (view.entries.len() - inline).to_string(),
        lake.store().list()?.len().to_string(),
    ]);
    println!("{table}");
    Ok(())
}
