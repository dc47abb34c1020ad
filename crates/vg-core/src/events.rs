//! Domain event bus for the approval engine.
//!
//! The engine emits lifecycle events; delivery to humans (email, chat,
//! websocket) is owned by external consumers that subscribe here. The bus
//! keeps a bounded in-memory history so late subscribers and diagnostics can
//! replay recent activity.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors that can occur on the event bus.
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(String),
}

/// Lifecycle events emitted by the approval engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApprovalEvent {
    /// A new request entered the approval chain.
    RequestCreated {
        request_id: Uuid,
        workflow_id: Uuid,
        requester: String,
    },

    /// A step reached quorum and the request moved forward.
    StepAdvanced {
        request_id: Uuid,
        from_step: u32,
        to_step: u32,
    },

    /// Every step approved.
    RequestApproved { request_id: Uuid },

    /// Rejected on some step.
    RequestRejected {
        request_id: Uuid,
        step_order: u32,
        rejected_by: String,
        reason: Option<String>,
    },

    /// The escalation ceiling was reached without a decision.
    RequestExpired { request_id: Uuid, step_order: u32 },

    /// Withdrawn before a decision.
    RequestCancelled {
        request_id: Uuid,
        cancelled_by: String,
    },

    /// Approval authority reassigned after a timeout or manual trigger.
    Escalated {
        request_id: Uuid,
        step_order: u32,
        level: u32,
        escalated_to: String,
    },
}

impl ApprovalEvent {
    /// The request this event concerns.
    pub fn request_id(&self) -> Uuid {
        match self {
            ApprovalEvent::RequestCreated { request_id, .. }
            | ApprovalEvent::StepAdvanced { request_id, .. }
            | ApprovalEvent::RequestApproved { request_id }
            | ApprovalEvent::RequestRejected { request_id, .. }
            | ApprovalEvent::RequestExpired { request_id, .. }
            | ApprovalEvent::RequestCancelled { request_id, .. }
            | ApprovalEvent::Escalated { request_id, .. } => *request_id,
        }
    }

    /// Event type as a string for logging and metrics.
    pub fn event_type(&self) -> &'static str {
        match self {
            ApprovalEvent::RequestCreated { .. } => "request_created",
            ApprovalEvent::StepAdvanced { .. } => "step_advanced",
            ApprovalEvent::RequestApproved { .. } => "request_approved",
            ApprovalEvent::RequestRejected { .. } => "request_rejected",
            ApprovalEvent::RequestExpired { .. } => "request_expired",
            ApprovalEvent::RequestCancelled { .. } => "request_cancelled",
            ApprovalEvent::Escalated { .. } => "escalated",
        }
    }

    /// Returns true for events that must not be dropped on a slow subscriber.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ApprovalEvent::RequestExpired { .. } | ApprovalEvent::Escalated { .. }
        )
    }
}

/// Central event bus connecting the engine to notification consumers.
pub struct EventBus {
    /// Broadcast channel for all events.
    broadcast_tx: broadcast::Sender<ApprovalEvent>,
    /// Named subscribers with dedicated channels.
    subscribers: Arc<RwLock<HashMap<String, mpsc::Sender<ApprovalEvent>>>>,
    /// Bounded history of recent events.
    history: Arc<RwLock<Vec<ApprovalEvent>>>,
    /// Maximum history entries to keep.
    history_size: usize,
    /// Counter for dropped non-critical events.
    dropped_events: AtomicU64,
}

impl EventBus {
    /// Creates a new event bus with the given broadcast capacity.
    pub fn new(capacity: usize) -> Self {
        Self::with_history_size(capacity, 1000)
    }

    /// Creates a new event bus with a custom history size.
    pub fn with_history_size(capacity: usize, history_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);
        Self {
            broadcast_tx,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(Vec::with_capacity(history_size))),
            history_size,
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Number of non-critical events dropped on full subscriber channels.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Publishes an event to the broadcast channel and all named subscribers.
    ///
    /// Critical events (expiry, escalation) are delivered with a blocking
    /// send and timeout; everything else is dropped if a subscriber is full.
    pub async fn publish(&self, event: ApprovalEvent) {
        debug!(event_type = event.event_type(), request_id = %event.request_id(), "Publishing event");

        {
            let mut history = self.history.write().await;
            if history.len() >= self.history_size {
                history.remove(0);
            }
            history.push(event.clone());
        }

        // No broadcast receivers is fine; events still land in history.
        let _ = self.broadcast_tx.send(event.clone());

        let subscribers = self.subscribers.read().await;
        let is_critical = event.is_critical();

        for (name, tx) in subscribers.iter() {
            if is_critical {
                match tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    tx.send(event.clone()),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        error!(subscriber = %name, "Failed to deliver critical event: channel closed");
                    }
                    Err(_) => {
                        error!(subscriber = %name, "Timeout delivering critical event");
                    }
                }
            } else if tx.try_send(event.clone()).is_err() {
                let dropped = self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    warn!(subscriber = %name, total_dropped = dropped, "Event dropped");
                }
            }
        }
    }

    /// Subscribes to the broadcast channel.
    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Registers a named subscriber with a dedicated channel.
    pub async fn register_subscriber(
        &self,
        name: &str,
        buffer_size: usize,
    ) -> mpsc::Receiver<ApprovalEvent> {
        let (tx, rx) = mpsc::channel(buffer_size);
        self.subscribers
            .write()
            .await
            .insert(name.to_string(), tx);
        info!(subscriber = %name, "Registered subscriber");
        rx
    }

    /// Unregisters a named subscriber.
    pub async fn unregister_subscriber(&self, name: &str) -> Result<(), EventBusError> {
        if self.subscribers.write().await.remove(name).is_some() {
            info!(subscriber = %name, "Unregistered subscriber");
            Ok(())
        } else {
            Err(EventBusError::SubscriberNotFound(name.to_string()))
        }
    }

    /// Gets recent events, newest first when limited.
    pub async fn get_history(&self, limit: Option<usize>) -> Vec<ApprovalEvent> {
        let history = self.history.read().await;
        match limit {
            Some(n) => history.iter().rev().take(n).cloned().collect(),
            None => history.clone(),
        }
    }

    /// Gets recorded events for one request.
    pub async fn events_for_request(&self, request_id: Uuid) -> Vec<ApprovalEvent> {
        let history = self.history.read().await;
        history
            .iter()
            .filter(|e| e.request_id() == request_id)
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created_event(request_id: Uuid) -> ApprovalEvent {
        ApprovalEvent::RequestCreated {
            request_id,
            workflow_id: Uuid::new_v4(),
            requester: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivery() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_broadcast();

        bus.publish(created_event(Uuid::new_v4())).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "request_created");
    }

    #[tokio::test]
    async fn test_named_subscriber_delivery() {
        let bus = EventBus::new(16);
        let mut rx = bus.register_subscriber("notifier", 8).await;

        let request_id = Uuid::new_v4();
        bus.publish(created_event(request_id)).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.request_id(), request_id);
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let bus = EventBus::with_history_size(16, 3);

        for _ in 0..5 {
            bus.publish(created_event(Uuid::new_v4())).await;
        }

        let history = bus.get_history(None).await;
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn test_events_for_request() {
        let bus = EventBus::new(16);
        let request_id = Uuid::new_v4();

        bus.publish(created_event(request_id)).await;
        bus.publish(created_event(Uuid::new_v4())).await;
        bus.publish(ApprovalEvent::RequestApproved { request_id })
            .await;

        let events = bus.events_for_request(request_id).await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_unregister_subscriber() {
        let bus = EventBus::new(16);
        let _rx = bus.register_subscriber("notifier", 8).await;

        assert!(bus.unregister_subscriber("notifier").await.is_ok());
        assert!(matches!(
            bus.unregister_subscriber("notifier").await,
            Err(EventBusError::SubscriberNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_non_critical_events_dropped_when_full() {
        let bus = EventBus::new(16);
        let _rx = bus.register_subscriber("slow", 1).await;

        // Fill the channel, then overflow with another non-critical event.
        bus.publish(created_event(Uuid::new_v4())).await;
        bus.publish(created_event(Uuid::new_v4())).await;

        assert_eq!(bus.dropped_event_count(), 1);
    }

    #[test]
    fn test_critical_events() {
        assert!(ApprovalEvent::RequestExpired {
            request_id: Uuid::new_v4(),
            step_order: 1
        }
        .is_critical());
        assert!(!ApprovalEvent::RequestApproved {
            request_id: Uuid::new_v4()
        }
        .is_critical());
    }
}
