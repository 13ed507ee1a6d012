//! Status notification sinks.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::StatusEvent;
use crate::ports::{EventSink, SinkError};

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn emit(&self, _event: StatusEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Logs every event at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: StatusEvent) -> Result<(), SinkError> {
        match &event.error {
            Some(error) => tracing::info!(
                item_id = %event.item_id,
                status = %event.status,
                error = %error,
                "status changed"
            ),
            None => tracing::info!(item_id = %event.item_id, status = %event.status, "status changed"),
        }
        Ok(())
    }
}

/// Fans events out to in-process subscribers (websocket bridges, tests).
///
/// Having no subscriber is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<StatusEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: StatusEvent) -> Result<(), SinkError> {
        // send only fails when nobody listens
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ItemId, ItemStatus};
    use crate::ports::notify;

    #[tokio::test]
    async fn broadcast_delivers_to_subscribers() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();
        let id = ItemId::from_ulid(ulid::Ulid::new());

        notify(&sink, StatusEvent::running(id)).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.item_id, id);
        assert_eq!(event.status, ItemStatus::Running);
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_ok() {
        let sink = BroadcastEventSink::new(1);
        let id = ItemId::from_ulid(ulid::Ulid::new());
        assert!(sink.emit(StatusEvent::pending(id)).await.is_ok());
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn emit(&self, _event: StatusEvent) -> Result<(), SinkError> {
            Err(SinkError("socket closed".into()))
        }
    }

    #[tokio::test]
    async fn notify_swallows_sink_failures() {
        let id = ItemId::from_ulid(ulid::Ulid::new());
        notify(&FailingSink, StatusEvent::error(id, "boom")).await;
    }
}
