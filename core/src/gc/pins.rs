//! Read pins and staged-file tracking that keep data alive while in use

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::LakeResult;
use crate::ids::{FileRef, SnapshotId, TxnId};
use crate::storage::FileStore;

pub type PinKey = (String, SnapshotId);

/// Counts open readers per (table, manifest snapshot).
///
/// Garbage collection holds the registry lock while it plans and purges, so
/// a pin is either taken before the plan (and respected) or after the purge
/// (and the reader sees the manifest is gone).
#[derive(Default)]
pub struct PinRegistry {
    pins: Mutex<HashMap<PinKey, usize>>,
}

impl PinRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pin(self: &Arc<Self>, table: &str, manifest_id: SnapshotId) -> ReadPin {
        let key = (table.to_string(), manifest_id);
        *self.pins.lock().entry(key.clone()).or_insert(0) += 1;
        ReadPin {
            registry: Arc::clone(self),
            key,
        }
    }

    /// Lock the registry; no pin can be taken or released while held
    pub fn lock(&self) -> MutexGuard<'_, HashMap<PinKey, usize>> {
        self.pins.lock()
    }

    pub fn is_pinned(&self, table: &str, manifest_id: SnapshotId) -> bool {
        self.pins
            .lock()
            .contains_key(&(table.to_string(), manifest_id))
    }

    fn release(&self, key: &PinKey) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                pins.remove(key);
            }
        }
    }
}

/// Releases its pin on drop
pub struct ReadPin {
    registry: Arc<PinRegistry>,
    key: PinKey,
}

impl ReadPin {
    pub fn manifest_id(&self) -> SnapshotId {
        self.key.1
    }
}

impl std::fmt::Debug for ReadPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReadPin({}@{})", self.key.0, self.key.1)
    }
}

impl Drop for ReadPin {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

/// Files written by live transactions that the catalog does not know yet.
///
/// Writers hold the gate shared across `put` and registration; the orphan
/// sweep holds it exclusively, so it never sees a written but unregistered
/// file.
#[derive(Default)]
pub struct StagedFiles {
    gate: RwLock<()>,
    files: DashMap<TxnId, Vec<FileRef>>,
}

impl StagedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        txn: TxnId,
        store: &dyn FileStore,
        table: &str,
        data: Bytes,
    ) -> LakeResult<FileRef> {
        let _gate = self.gate.read();
        let file = store.put(table, data)?;
        self.files.entry(txn).or_default().push(file.clone());
        Ok(file)
    }

    /// Forget a transaction's files, returning them
    pub fn release(&self, txn: TxnId) -> Vec<FileRef> {
        self.files.remove(&txn).map(|(_, f)| f).unwrap_or_default()
    }

    pub fn staged(&self) -> HashSet<FileRef> {
        self.files
            .iter()
            .flat_map(|e| e.value().clone())
            .collect()
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write()
    }
}
