//! Snapshot retention window

use chrono::{DateTime, Duration, Utc};

use crate::catalog::Snapshot;
use crate::config::RetentionConfig;
use crate::ids::SnapshotId;

// Largest span chrono can represent, in seconds
const MAX_KEEP_SECS: i64 = i64::MAX / 1000;

/// Decides which committed snapshots are still inside the retention window.
///
/// A snapshot is retained if it is among the newest `keep_snapshots` or was
/// taken within `keep_for` of now. The latest snapshot is always retained.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub keep_snapshots: usize,
    pub keep_for: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &RetentionConfig) -> Self {
        Self {
            keep_snapshots: config.keep_snapshots.max(1),
            keep_for: Duration::seconds(
                i64::try_from(config.keep_for_secs)
                    .unwrap_or(i64::MAX)
                    .min(MAX_KEEP_SECS),
            ),
        }
    }

    /// Oldest retained snapshot. `snapshots` is the committed history in
    /// ascending id order; every snapshot below the horizon has expired.
    pub fn horizon(&self, snapshots: &[Snapshot], now: DateTime<Utc>) -> Option<SnapshotId> {
        let latest = snapshots.last()?;
        let by_count = snapshots[snapshots.len().saturating_sub(self.keep_snapshots)].id;

        let cutoff = now.checked_sub_signed(self.keep_for);
        let by_time = match cutoff {
            Some(cutoff) => snapshots
                .iter()
                .find(|s| s.timestamp >= cutoff)
                .map(|s| s.id)
                .unwrap_or(latest.id),
            // Window reaches before any representable time
            None => snapshots[0].id,
        };
        Some(by_count.min(by_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SnapshotStatus;
    use std::collections::BTreeMap;

    fn snapshot(id: u64, age_secs: i64, now: DateTime<Utc>) -> Snapshot {
        Snapshot {
            id: SnapshotId(id),
            parent_id: id.checked_sub(1).filter(|p| *p > 0).map(SnapshotId),
            timestamp: now - Duration::seconds(age_secs),
            schema_versions: BTreeMap::new(),
            changes: BTreeMap::new(),
            commit_message: None,
            status: SnapshotStatus::Committed,
        }
    }

    #[test]
    fn test_either_bound_retains() {
        let now = Utc::now();
        let history: Vec<_> = (1..=6).map(|i| snapshot(i, (7 - i as i64) * 100, now)).collect();

        let by_count = RetentionPolicy {
            keep_snapshots: 2,
            keep_for: Duration::zero(),
        };
        assert_eq!(by_count.horizon(&history, now), Some(SnapshotId(5)));

        let by_time = RetentionPolicy {
            keep_snapshots: 2,
            keep_for: Duration::seconds(450),
        };
        // Snapshots 3..=6 are younger than 450s
        assert_eq!(by_time.horizon(&history, now), Some(SnapshotId(3)));
    }

    #[test]
    fn test_latest_always_retained() {
        let now = Utc::now();
        let history = vec![snapshot(1, 1000, now)];
        let policy = RetentionPolicy {
            keep_snapshots: 1,
            keep_for: Duration::zero(),
        };
        assert_eq!(policy.horizon(&history, now), Some(SnapshotId(1)));
        assert_eq!(policy.horizon(&[], now), None);
    }
}
