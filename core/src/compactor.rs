//! Compaction of small entries and explicit inline flushes.
//!
//! Both run as ordinary transactions: they publish a new manifest for the
//! current snapshot and leave every older manifest pointing at the entries
//! it always had.

use tracing::debug;

use crate::config::CompactionConfig;
use crate::error::LakeResult;
use crate::ids::{SnapshotId, TxnId};
use crate::lakehouse::LakeContext;
use crate::manifest::StoredRow;
use crate::txn::Transaction;
use crate::txn::workspace::TableWorkspace;

/// A compaction or flush that produced a new snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub table: String,
    pub snapshot_id: SnapshotId,
    /// Entries replaced by the new file
    pub entries_merged: usize,
    pub rows: u64,
}

/// Merge up to `max_entries_per_merge` small entries into one file once the
/// table has more than `min_small_entries` of them. Returns (entries, rows)
/// merged.
fn compact_workspace(
    ws: &mut TableWorkspace,
    ctx: &LakeContext,
    txn: TxnId,
    config: &CompactionConfig,
) -> LakeResult<(usize, u64)> {
    ws.schema()?;
    let small: Vec<usize> = ws
        .live
        .iter()
        .enumerate()
        .filter(|(_, e)| e.row_count < config.small_entry_rows)
        .map(|(i, _)| i)
        .collect();
    if small.len() <= config.min_small_entries || small.len() < 2 {
        return Ok((0, 0));
    }

    let chosen: Vec<usize> = small
        .into_iter()
        .take(config.max_entries_per_merge)
        .collect();
    let mut rows: Vec<StoredRow> = Vec::new();
    for &i in &chosen {
        rows.extend(ws.live[i].load_rows(ctx.store.as_ref())?);
    }
    rows.sort_by_key(|r| r.row_id);

    let merged = ws.write_file(ctx, txn, &rows)?;
    let mut index = 0;
    ws.live.retain(|_| {
        let keep = !chosen.contains(&index);
        index += 1;
        keep
    });
    ws.live.push(merged);
    ws.change.compacted = true;
    ws.dirty = true;
    debug!(table = %ws.name, entries = chosen.len(), rows = rows.len(), "Staged compaction");
    Ok((chosen.len(), rows.len() as u64))
}

/// Write every inline row of the table (and anything still buffered) into
/// exactly one file
fn flush_workspace(ws: &mut TableWorkspace, ctx: &LakeContext, txn: TxnId) -> LakeResult<u64> {
    ws.schema()?;
    let mut rows = ws.take_inline_rows();
    rows.extend(ws.buffer.take());
    if rows.is_empty() {
        return Ok(0);
    }
    rows.sort_by_key(|r| r.row_id);

    let entry = ws.write_file(ctx, txn, &rows)?;
    ws.live.push(entry);
    ws.change.inline_flushed = true;
    ws.dirty = true;
    debug!(table = %ws.name, rows = rows.len(), "Staged inline flush");
    Ok(rows.len() as u64)
}

impl Transaction {
    /// Stage a compaction of `table`; returns (entries, rows) merged
    pub fn compact(&mut self, table: &str) -> LakeResult<(usize, u64)> {
        self.with_workspace(table, |ws, ctx, txn| {
            compact_workspace(ws, ctx, txn, &ctx.config.compaction)
        })
    }

    /// Stage a flush of the table's inline rows; returns the rows written
    pub fn flush_inlined(&mut self, table: &str) -> LakeResult<u64> {
        self.with_workspace(table, flush_workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LakeConfig;
    use crate::lakehouse::Lakehouse;
    use crate::manifest::Predicate;
    use crate::resolver::AsOf;
    use crate::schema::{ColumnDef, SchemaChangeOp};
    use crate::txn::record;
    use crate::value::DataType;

    fn lake(min_small_entries: usize) -> Lakehouse {
        let mut config = LakeConfig::default();
        config.compaction.min_small_entries = min_small_entries;
        config.compaction.max_entries_per_merge = 3;
        let lake = Lakehouse::in_memory(config).unwrap();
        let mut txn = lake.begin().unwrap();
        txn.alter(
            "metrics",
            SchemaChangeOp::CreateTable {
                columns: vec![ColumnDef::new("v", DataType::Integer)],
                primary_key: vec![],
            },
        )
        .unwrap();
        txn.commit().unwrap();
        for v in 0..5 {
            let mut txn = lake.begin().unwrap();
            txn.insert("metrics", vec![record([("v", v)])]).unwrap();
            txn.commit().unwrap();
        }
        lake
    }

    #[test]
    fn test_compaction_merges_up_to_k_entries() {
        let lake = lake(2);
        let before = lake.query_at("metrics", AsOf::Latest).unwrap();
        assert_eq!(before.entries.len(), 5);

        let outcome = lake.compact("metrics").unwrap().unwrap();
        assert_eq!(outcome.entries_merged, 3);
        assert_eq!(outcome.rows, 3);

        let after = lake.query_at("metrics", AsOf::Latest).unwrap();
        assert_eq!(after.entries.len(), 3);
        assert_eq!(after.rows().unwrap(), before.rows().unwrap());

        // History still points at the pre-compaction entries
        let old = lake
            .query_at("metrics", AsOf::Version(before.snapshot_id))
            .unwrap();
        assert_eq!(old.entries.len(), 5);
        let change = &lake.latest_snapshot().unwrap().unwrap().changes["metrics"];
        assert!(change.compacted);
        assert_eq!(change.inserted, 0);
    }

    #[test]
    fn test_compaction_below_threshold_is_skipped() {
        let lake = lake(8);
        assert!(lake.compact("metrics").unwrap().is_none());
    }

    #[test]
    fn test_flush_writes_one_file() {
        let lake = lake(8);
        let outcome = lake.flush_inlined("metrics").unwrap().unwrap();
        assert_eq!(outcome.rows, 5);

        let view = lake.query_at("metrics", AsOf::Latest).unwrap();
        assert_eq!(view.entries.len(), 1);
        assert!(!view.entries[0].is_inline());
        assert_eq!(view.scan(&Predicate::ge("v", 3)).unwrap().len(), 2);
        assert!(lake.flush_inlined("metrics").unwrap().is_none());
    }
}
