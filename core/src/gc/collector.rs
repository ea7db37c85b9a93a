//! Garbage collection of expired snapshots, manifests, entries and files

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{PurgePlan, SnapshotIter, SnapshotScope};
use crate::error::LakeResult;
use crate::gc::PinKey;
use crate::gc::policy::RetentionPolicy;
use crate::ids::{EntryId, FileRef, SchemaVersionId, SnapshotId};
use crate::lakehouse::LakeContext;

/// What a collection removed (or, for a dry run, would remove)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub snapshots_expired: usize,
    pub manifests_purged: usize,
    pub entries_purged: usize,
    pub schema_versions_purged: usize,
    pub tables_purged: usize,
    pub files_deleted: usize,
    pub bytes_reclaimed: u64,
    pub orphan_files_deleted: usize,
    /// Expired manifests kept because an open read pinned them
    pub skipped_pinned: usize,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        *self
            == GcReport {
                skipped_pinned: self.skipped_pinned,
                ..GcReport::default()
            }
    }
}

impl fmt::Display for GcReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} snapshots expired, {} manifests, {} entries, {} schema versions purged, \
             {} files deleted ({} bytes), {} orphans, {} pinned",
            self.snapshots_expired,
            self.manifests_purged,
            self.entries_purged,
            self.schema_versions_purged,
            self.files_deleted,
            self.bytes_reclaimed,
            self.orphan_files_deleted,
            self.skipped_pinned
        )
    }
}

#[derive(Debug, Default)]
struct GcPlan {
    purge: PurgePlan,
    files: Vec<(FileRef, u64)>,
    skipped_pinned: usize,
}

impl GcPlan {
    fn report(&self) -> GcReport {
        GcReport {
            snapshots_expired: self.purge.snapshots.len(),
            manifests_purged: self.purge.manifests.len(),
            entries_purged: self.purge.entries.len(),
            schema_versions_purged: self.purge.schemas.len(),
            tables_purged: self.purge.tables.len(),
            files_deleted: self.files.len(),
            bytes_reclaimed: self.files.iter().map(|(_, size)| size).sum(),
            orphan_files_deleted: 0,
            skipped_pinned: self.skipped_pinned,
        }
    }
}

/// Work out what has left the retention window.
///
/// A table keeps every manifest at or above the horizon, the last one below
/// it (its state at the horizon) and any pinned one. A dropped table whose
/// tombstone is below the horizon loses its whole history.
fn plan(
    ctx: &LakeContext,
    pins: &HashMap<PinKey, usize>,
    now: DateTime<Utc>,
) -> LakeResult<GcPlan> {
    let backend = ctx.backend.as_ref();
    let mut plan = GcPlan::default();

    if !backend.pending_snapshots()?.is_empty() {
        debug!("Commit in progress, skipping garbage collection");
        return Ok(plan);
    }

    let snapshots = SnapshotIter::new(Arc::clone(&ctx.backend), SnapshotScope::All)
        .collect::<LakeResult<Vec<_>>>()?;
    let policy = RetentionPolicy::from_config(&ctx.config.retention);
    let Some(horizon) = policy.horizon(&snapshots, now) else {
        return Ok(plan);
    };
    plan.purge.snapshots = snapshots
        .iter()
        .map(|s| s.id)
        .filter(|id| *id < horizon)
        .collect();

    let mut referenced: HashSet<EntryId> = HashSet::new();
    let mut candidates: HashSet<EntryId> = HashSet::new();

    for record in backend.list_tables()? {
        let table = &record.name;
        let history_expired = record.dropped && record.current_snapshot < horizon;

        let mut keep = BTreeSet::new();
        if !history_expired {
            let ids = backend.manifest_ids(table)?;
            keep.extend(ids.iter().copied().filter(|id| *id >= horizon));
            if let Some(at_horizon) = ids.iter().copied().filter(|id| *id < horizon).max() {
                keep.insert(at_horizon);
            }
        }

        let mut kept_versions: BTreeSet<SchemaVersionId> = BTreeSet::new();
        for id in backend.manifest_ids(table)? {
            let Some(manifest) = backend.get_manifest(table, id)? else {
                continue;
            };
            let pinned = pins.contains_key(&(table.clone(), id));
            if keep.contains(&id) || pinned {
                if pinned && !keep.contains(&id) {
                    plan.skipped_pinned += 1;
                }
                kept_versions.insert(manifest.schema_version);
                referenced.extend(manifest.entries.iter().copied());
            } else {
                candidates.extend(manifest.entries.iter().copied());
                plan.purge.manifests.push((table.clone(), id));
            }
        }

        let table_gone = history_expired && kept_versions.is_empty();
        if !table_gone {
            kept_versions.insert(record.schema_version);
        }
        for version in backend.schema_versions(table)? {
            if !kept_versions.contains(&version) {
                plan.purge.schemas.push((table.clone(), version));
            }
        }
        if table_gone {
            plan.purge.tables.push(table.clone());
        }
    }

    let expired: Vec<EntryId> = candidates
        .into_iter()
        .filter(|id| !referenced.contains(id))
        .collect();
    for entry in backend.get_entries(&expired)? {
        if let Some(file) = entry.file_ref() {
            plan.files.push((file.clone(), entry.byte_size()));
        }
    }
    plan.purge.entries = expired;
    Ok(plan)
}

/// Dry run: what `collect_garbage` would remove now
pub(crate) fn plan_garbage(ctx: &LakeContext) -> LakeResult<GcReport> {
    let pins = ctx.pins.lock();
    Ok(plan(ctx, &pins, Utc::now())?.report())
}

pub(crate) fn collect_garbage(ctx: &LakeContext) -> LakeResult<GcReport> {
    let plan = {
        // No reader can pin a manifest between planning and purging
        let pins = ctx.pins.lock();
        let plan = plan(ctx, &pins, Utc::now())?;
        ctx.backend.purge(&plan.purge)?;
        plan
    };

    let mut report = plan.report();
    report.files_deleted = 0;
    report.bytes_reclaimed = 0;
    // Catalog rows are gone first, so no manifest names a missing file
    for (file, size) in &plan.files {
        match ctx.store.delete(file) {
            Ok(Some(_)) => {
                report.files_deleted += 1;
                report.bytes_reclaimed += size;
            }
            Ok(None) => {}
            Err(e) => warn!(file = %file, error = %e, "Failed to delete expired file"),
        }
    }
    report.orphan_files_deleted = delete_orphans(ctx)?;

    if report.is_empty() {
        debug!(skipped_pinned = report.skipped_pinned, "Nothing to collect");
    } else {
        info!(
            snapshots = report.snapshots_expired,
            manifests = report.manifests_purged,
            entries = report.entries_purged,
            files = report.files_deleted,
            bytes = report.bytes_reclaimed,
            orphans = report.orphan_files_deleted,
            "Collected garbage"
        );
    }
    Ok(report)
}

/// Delete files neither the catalog nor a live transaction knows about
fn delete_orphans(ctx: &LakeContext) -> LakeResult<usize> {
    let _gate = ctx.staging.exclusive();
    // Staged set first: a file leaves it only after its commit is visible
    let staged = ctx.staging.staged();
    let known: HashSet<FileRef> = ctx
        .backend
        .list_entries()?
        .iter()
        .filter_map(|e| e.file_ref().cloned())
        .collect();

    let mut deleted = 0;
    for file in ctx.store.list()? {
        if known.contains(&file) || staged.contains(&file) {
            continue;
        }
        match ctx.store.delete(&file) {
            Ok(Some(_)) => {
                debug!(file = %file, "Deleted orphan file");
                deleted += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(file = %file, error = %e, "Failed to delete orphan file"),
        }
    }
    Ok(deleted)
}

/// Snapshots a reader can still resolve: the horizon and everything after it
pub(crate) fn retained_from(ctx: &LakeContext) -> LakeResult<Option<SnapshotId>> {
    let snapshots = SnapshotIter::new(Arc::clone(&ctx.backend), SnapshotScope::All)
        .collect::<LakeResult<Vec<_>>>()?;
    Ok(RetentionPolicy::from_config(&ctx.config.retention).horizon(&snapshots, Utc::now()))
}
