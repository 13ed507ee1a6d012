//! Lease manager: claim, renew, recover, plus lease keep-alive while an
//! executor runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::domain::{DispatchError, ItemId, StatusEvent, StoreError, WorkItem, WorkerId};
use crate::ports::{
    EXHAUSTED_MESSAGE, EventSink, RecoverReport, WorkStore, exhausted_reason, notify,
};

pub struct LeaseManager {
    store: Arc<dyn WorkStore>,
    events: Arc<dyn EventSink>,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn WorkStore>,
        events: Arc<dyn EventSink>,
        lease_duration: Duration,
        renew_interval: Duration,
    ) -> Self {
        Self {
            store,
            events,
            lease_duration,
            renew_interval,
        }
    }

    /// Lease the next eligible item for `worker`.
    pub async fn claim(&self, worker: &WorkerId) -> Result<Option<WorkItem>, StoreError> {
        let Some(item) = self.store.claim(worker, self.lease_duration).await? else {
            return Ok(None);
        };
        tracing::info!(
            item_id = %item.id,
            kind = %item.kind,
            type_or_agent = %item.type_or_agent,
            try_count = item.try_count,
            worker = %worker,
            "claimed work item"
        );
        notify(self.events.as_ref(), StatusEvent::running(item.id)).await;
        Ok(Some(item))
    }

    /// Extend the lease on `id`. False means `worker` no longer owns it.
    pub async fn renew(&self, id: ItemId, worker: &WorkerId) -> Result<bool, StoreError> {
        self.store.renew(id, worker, self.lease_duration).await
    }

    /// One recovery sweep over expired leases.
    pub async fn recover(&self) -> Result<RecoverReport, StoreError> {
        let report = self.store.recover().await?;
        if report.is_empty() {
            return Ok(report);
        }

        tracing::info!(
            reset = report.reset.len(),
            exhausted = report.exhausted.len(),
            "recovered expired leases"
        );
        for id in &report.reset {
            notify(self.events.as_ref(), StatusEvent::pending(*id)).await;
        }
        for item in &report.exhausted {
            tracing::warn!(item_id = %item.id, kind = %item.kind, "retry budget exhausted");
            notify(
                self.events.as_ref(),
                StatusEvent::error(item.id, EXHAUSTED_MESSAGE),
            )
            .await;
        }
        for root_id in &report.failed_roots {
            let Some(subtask) = report
                .exhausted
                .iter()
                .find(|item| item.parent_id == Some(*root_id))
            else {
                continue;
            };
            tracing::warn!(root_id = %root_id, subtask_id = %subtask.id, "workflow failed");
            notify(
                self.events.as_ref(),
                StatusEvent::error(*root_id, exhausted_reason(subtask.id)),
            )
            .await;
        }
        Ok(report)
    }

    /// Drive `work` to completion while renewing the lease on `id`.
    ///
    /// If a renewal reports the lease as lost, `work` is dropped and
    /// `LeaseLost` is returned. Renewal errors are logged and retried on the
    /// next tick.
    pub async fn hold<F>(&self, id: ItemId, worker: &WorkerId, work: F) -> Result<F::Output, DispatchError>
    where
        F: Future,
    {
        tokio::pin!(work);
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.renew_interval, self.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = ticker.tick() => match self.renew(id, worker).await {
                    Ok(true) => tracing::debug!(item_id = %id, worker = %worker, "lease renewed"),
                    Ok(false) => {
                        tracing::warn!(item_id = %id, worker = %worker, "lease lost, abandoning item");
                        return Err(DispatchError::LeaseLost(id));
                    }
                    Err(e) => tracing::error!(item_id = %id, error = %e, "lease renewal failed"),
                },
            }
        }
    }
}
