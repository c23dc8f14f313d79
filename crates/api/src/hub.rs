//! The progress hub: fans broker progress events out to WebSocket
//! subscribers.
//!
//! Subscribers are mpsc channels, not sockets — the WebSocket handlers in
//! `api::ws` forward from their channel to the peer. That keeps delivery
//! decoupled from socket I/O and makes the fan-out logic testable. A sink
//! whose receiver is gone is pruned on the next write; one slow or dead
//! subscriber never affects the others.

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lineguard_core::models::ProgressEvent;

type Sink = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    per_task: HashMap<Uuid, HashMap<u64, Sink>>,
    history: HashMap<u64, Sink>,
}

/// Handle returned by subscribe; identifies the sink for unsubscription
#[derive(Debug, Clone)]
pub(crate) struct SubscriberId {
    id: u64,
    task_id: Option<Uuid>,
}

#[derive(Default)]
pub(crate) struct ProgressHub {
    inner: Mutex<Registry>,
}

impl ProgressHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a sink for one task's events, or for every event when
    /// `task_id` is `None` (the history view).
    pub(crate) fn subscribe(
        &self,
        task_id: Option<Uuid>,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.inner.lock().expect("hub registry poisoned");
        registry.next_id += 1;
        let id = registry.next_id;
        match task_id {
            Some(task_id) => {
                registry.per_task.entry(task_id).or_default().insert(id, tx);
            }
            None => {
                registry.history.insert(id, tx);
            }
        }
        (SubscriberId { id, task_id }, rx)
    }

    pub(crate) fn unsubscribe(&self, subscriber: &SubscriberId) {
        let mut registry = self.inner.lock().expect("hub registry poisoned");
        match subscriber.task_id {
            Some(task_id) => {
                if let Some(sinks) = registry.per_task.get_mut(&task_id) {
                    sinks.remove(&subscriber.id);
                    if sinks.is_empty() {
                        registry.per_task.remove(&task_id);
                    }
                }
            }
            None => {
                registry.history.remove(&subscriber.id);
            }
        }
    }

    /// Deliver an event to the task's subscribers and every history
    /// subscriber. Sinks that fail to accept the write are dropped.
    pub(crate) fn fanout(&self, event: &ProgressEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize progress event: {}", e);
                return;
            }
        };

        let mut registry = self.inner.lock().expect("hub registry poisoned");

        if let Some(sinks) = registry.per_task.get_mut(&event.task_id) {
            sinks.retain(|_, sink| sink.send(payload.clone()).is_ok());
            if sinks.is_empty() {
                registry.per_task.remove(&event.task_id);
            }
        }

        registry
            .history
            .retain(|_, sink| sink.send(payload.clone()).is_ok());
    }

    #[cfg(test)]
    fn subscriber_counts(&self, task_id: Uuid) -> (usize, usize) {
        let registry = self.inner.lock().unwrap();
        (
            registry.per_task.get(&task_id).map_or(0, HashMap::len),
            registry.history.len(),
        )
    }
}

/// Long-running consumer on the progress fan-out subject.
///
/// Each API instance holds one transient subscription and forwards every
/// parseable event to its local hub; unparseable messages are dropped.
pub(crate) async fn run_updates_consumer(
    nats_client: async_nats::Client,
    updates_subject: String,
    hub: std::sync::Arc<ProgressHub>,
) {
    let mut subscriber = match nats_client.subscribe(updates_subject.clone()).await {
        Ok(subscriber) => subscriber,
        Err(e) => {
            error!(
                "Failed to subscribe to progress subject '{}': {}",
                updates_subject, e
            );
            return;
        }
    };

    info!("Progress consumer listening on '{}'", updates_subject);

    while let Some(message) = subscriber.next().await {
        match serde_json::from_slice::<ProgressEvent>(&message.payload) {
            Ok(event) => {
                debug!(
                    task_id = %event.task_id,
                    processed = event.processed_files,
                    "forwarding progress event"
                );
                hub.fanout(&event);
            }
            Err(e) => {
                warn!("Dropping malformed progress message: {}", e);
            }
        }
    }

    warn!("Progress subscription closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineguard_core::models::AnalysisStatus;

    fn event_for(task_id: Uuid) -> ProgressEvent {
        ProgressEvent {
            task_id,
            status: AnalysisStatus::Processing,
            processed_files: 1,
            total_files: 10,
            failed_files: 0,
            defects_found: 0,
            message: None,
        }
    }

    #[tokio::test]
    async fn test_fanout_reaches_task_and_history_subscribers() {
        let hub = ProgressHub::new();
        let task_id = Uuid::new_v4();

        let (_a, mut rx_a) = hub.subscribe(Some(task_id));
        let (_b, mut rx_b) = hub.subscribe(Some(task_id));
        let (_h, mut rx_h) = hub.subscribe(None);

        hub.fanout(&event_for(task_id));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_h.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_other_task_events_reach_only_history() {
        let hub = ProgressHub::new();
        let subscribed_task = Uuid::new_v4();

        let (_a, mut rx_a) = hub.subscribe(Some(subscribed_task));
        let (_h, mut rx_h) = hub.subscribe(None);

        hub.fanout(&event_for(Uuid::new_v4()));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_h.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dead_sinks_are_pruned() {
        let hub = ProgressHub::new();
        let task_id = Uuid::new_v4();

        let (_kept, _rx_kept) = hub.subscribe(Some(task_id));
        let (_dead, rx_dead) = hub.subscribe(Some(task_id));
        drop(rx_dead);

        hub.fanout(&event_for(task_id));

        let (per_task, _) = hub.subscriber_counts(task_id);
        assert_eq!(per_task, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_sink() {
        let hub = ProgressHub::new();
        let task_id = Uuid::new_v4();

        let (subscriber, _rx) = hub.subscribe(Some(task_id));
        hub.unsubscribe(&subscriber);

        let (per_task, _) = hub.subscriber_counts(task_id);
        assert_eq!(per_task, 0);
    }

    #[tokio::test]
    async fn test_event_payload_is_json() {
        let hub = ProgressHub::new();
        let task_id = Uuid::new_v4();
        let (_s, mut rx) = hub.subscribe(Some(task_id));

        hub.fanout(&event_for(task_id));

        let payload = rx.try_recv().unwrap();
        let parsed: ProgressEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.task_id, task_id);
    }
}
