use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::assignment::Assignment;
use crate::models::ids::{DriverId, OrderId};
use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    StatusChanged {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        driver_id: Option<DriverId>,
        at: DateTime<Utc>,
    },
    DriverAssigned(Assignment),
    NoDriverAvailable {
        order_id: OrderId,
        at: DateTime<Utc>,
    },
}

impl DeliveryEvent {
    pub fn order_id(&self) -> &OrderId {
        match self {
            DeliveryEvent::StatusChanged { order_id, .. }
            | DeliveryEvent::NoDriverAvailable { order_id, .. } => order_id,
            DeliveryEvent::DriverAssigned(assignment) => &assignment.order_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: DeliveryEvent) -> Result<(), NotifyError>;
}

/// Publishes events to in-process subscribers (websocket clients, tests).
pub struct BroadcastNotifier {
    tx: broadcast::Sender<DeliveryEvent>,
}

impl BroadcastNotifier {
    pub fn new(buffer: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, event: DeliveryEvent) -> Result<(), NotifyError> {
        // No subscribers is not a failure.
        if let Err(err) = self.tx.send(event) {
            debug!(order_id = %err.0.order_id(), "no event subscribers");
        }
        Ok(())
    }
}

/// Sends `event` with a bounded wait, logging rather than propagating failures.
pub async fn publish(notifier: &Arc<dyn Notifier>, event: DeliveryEvent, timeout: Duration) {
    let order_id = event.order_id().clone();
    match tokio::time::timeout(timeout, notifier.notify(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(order_id = %order_id, error = %err, "notification failed"),
        Err(_) => warn!(order_id = %order_id, "notification timed out"),
    }
}

/// Delivers each event to every inner notifier; the first failure is reported
/// after all have been tried.
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, event: DeliveryEvent) -> Result<(), NotifyError> {
        let mut first_err = None;
        for target in &self.targets {
            if let Err(err) = target.notify(event.clone()).await {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
