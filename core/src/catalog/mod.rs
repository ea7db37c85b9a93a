//! Catalog rows, the backend contract, and committed-state helpers

pub mod backend;
pub mod embedded;
pub mod records;

pub use backend::{BackendError, BackendResult, CatalogBackend, open_backend};
pub use embedded::EmbeddedBackend;
pub use records::{
    CommitBatch, PurgePlan, Snapshot, SnapshotStatus, TableChange, TableRecord, TableSwap,
};

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::error::{LakeError, LakeResult};
use crate::ids::SnapshotId;

const POINTER_READ_ATTEMPTS: usize = 8;
const DEFAULT_PAGE_SIZE: usize = 64;

/// Read a table's committed record.
///
/// A pointer that names a pending snapshot is not visible yet; the record
/// saved in that snapshot's `prior` map is returned instead.
pub fn committed_table(
    backend: &dyn CatalogBackend,
    name: &str,
) -> LakeResult<Option<TableRecord>> {
    for _ in 0..POINTER_READ_ATTEMPTS {
        let Some(record) = backend.get_table(name)? else {
            return Ok(None);
        };
        match backend.get_snapshot(record.current_snapshot)? {
            Some(snapshot) => match snapshot.status {
                SnapshotStatus::Committed => return Ok(Some(record)),
                SnapshotStatus::Pending { mut prior, .. } => {
                    return Ok(prior.remove(name).flatten());
                }
            },
            // Pending snapshot discarded between the two reads; read again
            None => continue,
        }
    }
    Err(LakeError::Conflict(format!(
        "pointer of table '{}' kept moving while being read",
        name
    )))
}

/// Committed records of every table, keyed by name
pub fn committed_tables(
    backend: &dyn CatalogBackend,
) -> LakeResult<BTreeMap<String, TableRecord>> {
    let mut out = BTreeMap::new();
    for record in backend.list_tables()? {
        if let Some(committed) = committed_table(backend, &record.name)? {
            out.insert(committed.name.clone(), committed);
        }
    }
    // Tables whose first version is still pending have no committed record
    Ok(out)
}

/// Which snapshots a listing covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotScope {
    All,
    /// Only snapshots that changed this table
    Table(String),
}

/// Lazy, paged iterator over committed snapshots in ascending id order.
///
/// Yields the snapshots committed up to the end of the listing; `restart`
/// begins again from the first one.
pub struct SnapshotIter {
    backend: Arc<dyn CatalogBackend>,
    scope: SnapshotScope,
    page_size: usize,
    cursor: Option<SnapshotId>,
    buffer: VecDeque<Snapshot>,
    exhausted: bool,
}

impl SnapshotIter {
    pub fn new(backend: Arc<dyn CatalogBackend>, scope: SnapshotScope) -> Self {
        Self {
            backend,
            scope,
            page_size: DEFAULT_PAGE_SIZE,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> LakeResult<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let page = self.backend.list_snapshots(self.cursor, self.page_size)?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.cursor = Some(last.id);
            }
            self.buffer.extend(page.into_iter().filter(|s| match &self.scope {
                SnapshotScope::All => true,
                SnapshotScope::Table(table) => s.touches(table),
            }));
        }
        Ok(())
    }
}

impl Iterator for SnapshotIter {
    type Item = LakeResult<Snapshot>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            self.exhausted = true;
            return Some(Err(e));
        }
        self.buffer.pop_front().map(Ok)
    }
}
