use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use quorum_types::{EventKind, OrchestrationEvent};

const BUS_CAPACITY: usize = 2048;

/// Typed pub/sub over the closed [`OrchestrationEvent`] set.
///
/// Publish never blocks and never fails: events published with no
/// subscribers are dropped, and a slow subscriber lags rather than
/// back-pressuring the publisher. Subscriber errors stay on the subscriber
/// side of the channel, so one failing consumer cannot affect another or
/// the publisher.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<RwLock<Option<broadcast::Sender<OrchestrationEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx: Arc::new(RwLock::new(Some(tx))),
        }
    }

    pub fn publish(&self, event: OrchestrationEvent) {
        if let Ok(guard) = self.tx.read() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    /// Subscribe to every event kind. Events published before this call are
    /// not replayed.
    pub fn subscribe(&self) -> EventStream {
        self.stream(None)
    }

    /// Subscribe to a single event kind.
    pub fn subscribe_kind(&self, kind: EventKind) -> EventStream {
        self.stream(Some(kind))
    }

    fn stream(&self, filter: Option<EventKind>) -> EventStream {
        let rx = self
            .tx
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|tx| tx.subscribe()));
        EventStream { rx, filter }
    }

    /// Close the bus. Outstanding subscribers observe end-of-stream once
    /// they drain their buffers.
    pub fn close(&self) {
        if let Ok(mut guard) = self.tx.write() {
            guard.take();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy sequence of events, optionally filtered to one kind. Ends when the
/// bus closes.
pub struct EventStream {
    rx: Option<broadcast::Receiver<OrchestrationEvent>>,
    filter: Option<EventKind>,
}

impl EventStream {
    /// Next matching event, or `None` at end-of-stream.
    pub async fn next(&mut self) -> Option<OrchestrationEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if self.filter.is_none() || self.filter == Some(event.kind()) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "quorum.bus",
                        skipped,
                        "subscriber lagged behind the event bus"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Non-suspending poll used by tests and drain loops.
    pub fn try_next(&mut self) -> Option<OrchestrationEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if self.filter.is_none() || self.filter == Some(event.kind()) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(task_id: &str) -> OrchestrationEvent {
        OrchestrationEvent::TaskCreated {
            task_id: task_id.to_string(),
            title: "t".to_string(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        bus.publish(created("t1"));
        bus.publish(created("t2"));

        assert_eq!(stream.next().await.unwrap().task_id(), Some("t1"));
        assert_eq!(stream.next().await.unwrap().task_id(), Some("t2"));
    }

    #[tokio::test]
    async fn filtered_subscription_skips_other_kinds() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe_kind(EventKind::WorkflowStarted);

        bus.publish(created("t1"));
        bus.publish(OrchestrationEvent::WorkflowStarted {
            task_id: "t1".to_string(),
            strategy: quorum_types::RoutingStrategy::Solo,
        });

        let event = stream.next().await.unwrap();
        assert_eq!(event.kind(), EventKind::WorkflowStarted);
        assert!(stream.try_next().is_none());
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(created("early"));
        let mut stream = bus.subscribe();
        bus.publish(created("late"));
        assert_eq!(stream.next().await.unwrap().task_id(), Some("late"));
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        bus.publish(created("t1"));
        bus.close();

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        // Publishing after close is a no-op.
        bus.publish(created("t2"));
    }
}
