//! Buffer for rows written by a transaction that have not reached a file yet

use crate::config::InliningConfig;
use crate::manifest::StoredRow;

/// Accumulates a transaction's new rows for one table.
///
/// While the table's inline rows plus the buffer stay below the limits the
/// rows are published as an inline row set; once a limit is reached they
/// are written out as exactly one file and the buffer is emptied.
#[derive(Debug, Clone)]
pub struct InliningBuffer {
    row_limit: usize,
    byte_limit: usize,
    rows: Vec<StoredRow>,
    bytes: usize,
}

impl InliningBuffer {
    pub fn new(config: &InliningConfig) -> Self {
        Self {
            row_limit: config.row_limit,
            byte_limit: config.byte_limit,
            rows: Vec::new(),
            bytes: 0,
        }
    }

    pub fn push(&mut self, row: StoredRow) {
        self.bytes += row.estimated_size();
        self.rows.push(row);
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = StoredRow>) {
        for row in rows {
            self.push(row);
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    pub fn rows(&self) -> &[StoredRow] {
        &self.rows
    }

    /// Whether the buffer together with rows already inline in the table
    /// has reached a limit
    pub fn should_flush(&self, carried_rows: usize, carried_bytes: usize) -> bool {
        !self.rows.is_empty()
            && (self.rows.len() + carried_rows >= self.row_limit
                || self.bytes + carried_bytes >= self.byte_limit)
    }

    /// Replace the buffered rows, e.g. after an update rewrote them
    pub fn replace(&mut self, rows: Vec<StoredRow>) {
        self.bytes = rows.iter().map(StoredRow::estimated_size).sum();
        self.rows = rows;
    }

    pub fn take(&mut self) -> Vec<StoredRow> {
        self.bytes = 0;
        std::mem::take(&mut self.rows)
    }
}
