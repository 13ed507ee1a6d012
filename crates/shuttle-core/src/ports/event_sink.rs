//! EventSink port - status notifications to the outside world.
//!
//! Notifications are fire-and-forget: a failing sink is logged and never
//! rolls back or blocks a state transition.

use async_trait::async_trait;

use crate::domain::StatusEvent;

#[derive(Debug, thiserror::Error)]
#[error("event sink failed: {0}")]
pub struct SinkError(pub String);

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: StatusEvent) -> Result<(), SinkError>;
}

/// Emit `event`, logging instead of propagating failures.
pub async fn notify(sink: &dyn EventSink, event: StatusEvent) {
    let item_id = event.item_id;
    let status = event.status;
    if let Err(e) = sink.emit(event).await {
        tracing::warn!(item_id = %item_id, status = %status, error = %e, "status notification failed");
    }
}
