//! Host-level notifications emitted by the supervisor.
//!
//! A closed enum of event kinds plus a small bus: collaborators (UI layer,
//! logging) subscribe and receive every event over an unbounded channel.
//! Delivery is at-least-once and ordered within an app; events for
//! different apps carry no ordering guarantee relative to each other.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use appdock_types::{AppId, LogLevel};

/// A notification the host surfaces to its collaborators.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// An app pushed a UI mutation.
    UiUpdate { app_id: AppId, payload: Value },
    /// An app emitted a log line.
    AppLog {
        app_id: AppId,
        level: LogLevel,
        message: String,
        data: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    /// An app reported a fatal error; its instance moved to `error`.
    AppError { app_id: AppId, error: String },
    /// The context itself failed (channel closed, task panic).
    WorkerError { app_id: AppId, error: String },
    /// A message with no recognized type and no pending correlation.
    AppMessage {
        app_id: AppId,
        message_type: String,
        payload: Value,
    },
    /// The app's cleanup hook failed during shutdown.
    CleanupError { app_id: AppId, error: String },
}

/// Subscriber registry. Dead subscribers are pruned on send.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<HostEvent>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Every event emitted after this call is
    /// delivered to the returned receiver.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HostEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn emit(&self, event: HostEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn every_subscriber_receives_every_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(HostEvent::UiUpdate {
            app_id: AppId::from("a"),
            payload: json!({"panel": 1}),
        });

        assert!(matches!(first.recv().await, Some(HostEvent::UiUpdate { .. })));
        assert!(matches!(second.recv().await, Some(HostEvent::UiUpdate { .. })));
    }

    #[tokio::test]
    async fn events_stay_ordered_per_app() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.emit(HostEvent::AppMessage {
                app_id: AppId::from("a"),
                message_type: "seq".to_string(),
                payload: json!(i),
            });
        }
        for i in 0..5 {
            match rx.recv().await {
                Some(HostEvent::AppMessage { payload, .. }) => assert_eq!(payload, json!(i)),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.emit(HostEvent::WorkerError {
            app_id: AppId::from("a"),
            error: "gone".to_string(),
        });
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
