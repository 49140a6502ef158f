use chrono::{DateTime, Utc};
use std::sync::Arc;
use store::PersistentStore;
use tasks::TaskId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{CompactionOutcome, CompactionScheduler, Result, SyncConfig};

/// Result of one maintenance pass
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceReport {
    pub compaction: CompactionOutcome,
    pub orphans_removed: Vec<TaskId>,
}

/// Idle-time housekeeping: ledger compaction and orphan cleanup.
#[derive(Clone)]
pub struct MaintenanceRunner {
    store: Arc<PersistentStore>,
    compaction: CompactionScheduler,
    config: SyncConfig,
}

impl MaintenanceRunner {
    pub fn new(store: Arc<PersistentStore>, config: SyncConfig) -> Self {
        Self {
            compaction: CompactionScheduler::new(store.clone()),
            store,
            config,
        }
    }

    /// One pass. Yields to the scheduler between compaction and cleanup so
    /// foreground work is not held up.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let compaction = self
            .compaction
            .compact_if_due(self.config.retention_days, now)
            .await?;
        tokio::task::yield_now().await;
        let orphans_removed = self
            .store
            .cleanup_orphans(now, self.config.orphan_threshold())
            .await?;
        Ok(MaintenanceReport {
            compaction,
            orphans_removed,
        })
    }

    /// Runs a pass every `maintenance_interval_secs` until `shutdown`
    /// flips to true or its sender is dropped. Failed passes are logged and
    /// retried on the next tick.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.maintenance_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.config.maintenance_interval(), "maintenance started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once(Utc::now()).await {
                            Ok(report) => debug!(
                                orphans = report.orphans_removed.len(),
                                compaction = ?report.compaction,
                                "maintenance pass done"
                            ),
                            Err(e) => warn!(error = %e, "maintenance pass failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("maintenance stopped");
        })
    }
}
