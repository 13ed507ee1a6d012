//! ReaperLoop: periodic recovery of expired leases.
//!
//! `LeaseManager::recover` resets or exhausts every expired lease. An
//! exhausted subtask fails its workflow in the same store transaction, so a
//! root never stays parked after its subtask ran out of tries.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::builder::App;
use crate::domain::StoreError;
use crate::ports::RecoverReport;

pub struct ReaperLoop {
    app: Arc<App>,
}

impl ReaperLoop {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    /// One recovery sweep. Safe to run concurrently from several processes.
    pub async fn sweep(&self) -> Result<RecoverReport, StoreError> {
        self.app.lease.recover().await
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.app.settings.recover_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "recovery sweep failed");
                    }
                }
            }
        }
        tracing::debug!("reaper loop stopped");
    }
}
