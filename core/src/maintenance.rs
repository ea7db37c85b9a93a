//! Background compaction and garbage collection

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compactor::CompactionOutcome;
use crate::gc::GcReport;
use crate::lakehouse::Lakehouse;

/// Shortest period between passes; tokio rejects a zero interval
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Result of one compaction + GC pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub compacted: Vec<CompactionOutcome>,
    pub gc: GcReport,
}

/// Periodically compacts every table and collects garbage.
///
/// Catalog and file store calls block, so each pass runs on the blocking
/// pool. Stop it with `stop` or by cancelling its shutdown token.
pub struct MaintenanceWorker {
    shutdown_token: CancellationToken,
    handle: JoinHandle<()>,
    passes: Arc<AtomicU64>,
}

impl MaintenanceWorker {
    /// Spawn on the current tokio runtime using `maintenance.interval_secs`
    pub fn spawn(lake: Lakehouse) -> Self {
        let period = Duration::from_secs(lake.config().maintenance.interval_secs);
        Self::with_interval(lake, period)
    }

    pub fn with_interval(lake: Lakehouse, period: Duration) -> Self {
        let period = period.max(MIN_INTERVAL);
        let shutdown_token = CancellationToken::new();
        let passes = Arc::new(AtomicU64::new(0));

        let token = shutdown_token.clone();
        let counter = Arc::clone(&passes);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "Maintenance worker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pass_lake = lake.clone();
                        match tokio::task::spawn_blocking(move || pass_lake.run_maintenance()).await {
                            Ok(Ok(report)) => {
                                debug!(
                                    compacted = report.compacted.len(),
                                    files_deleted = report.gc.files_deleted,
                                    "Maintenance pass finished"
                                );
                            }
                            Ok(Err(e)) => warn!(error = %e, "Maintenance pass failed"),
                            Err(e) => warn!(error = %e, "Maintenance task panicked"),
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = token.cancelled() => {
                        break;
                    }
                }
            }

            info!("Maintenance worker stopped");
        });

        Self {
            shutdown_token,
            handle,
            passes,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Passes completed so far
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Cancel and wait for the current pass to finish
    pub async fn stop(self) {
        self.shutdown_token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Maintenance worker ended abnormally");
        }
    }
}
