use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::ids::{DriverId, OrderId};
use crate::models::order::{Order, OrderStatus};
use crate::models::principal::Principal;
use crate::models::tracking::TrackingEntry;
use crate::observability::metrics::Metrics;
use crate::store::{OrderStore, TrackingStore};

/// Positions of one order sorted by `recorded_at`, then arrival. Iterating
/// again yields the same sequence.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(transparent)]
pub struct Trail(Vec<TrackingEntry>);

impl Trail {
    pub fn iter(&self) -> std::slice::Iter<'_, TrackingEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Trail {
    type Item = &'a TrackingEntry;
    type IntoIter = std::slice::Iter<'a, TrackingEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Out-of-order arrivals are tolerated; readers always see timestamp order.
pub fn sort_trail(entries: &mut [TrackingEntry]) {
    entries.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.seq.cmp(&b.seq)));
}

pub struct TrackingLog {
    orders: Arc<dyn OrderStore>,
    entries: Arc<dyn TrackingStore>,
    live_tx: broadcast::Sender<TrackingEntry>,
    metrics: Metrics,
}

impl TrackingLog {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        entries: Arc<dyn TrackingStore>,
        metrics: Metrics,
        buffer: usize,
    ) -> Self {
        let (live_tx, _unused_rx) = broadcast::channel(buffer.max(1));
        Self {
            orders,
            entries,
            live_tx,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackingEntry> {
        self.live_tx.subscribe()
    }

    pub async fn append(
        &self,
        principal: &Principal,
        order_id: &OrderId,
        location: GeoPoint,
        recorded_at: DateTime<Utc>,
    ) -> Result<TrackingEntry, AppError> {
        let order = self.load(order_id).await?;
        let driver_id = self.trackable_driver(&order)?;
        if !(principal.is_privileged() || principal.is_assigned_driver_of(&order)) {
            return Err(AppError::Forbidden(format!(
                "{} {} is not the driver of order {order_id}",
                principal.role, principal.id
            )));
        }

        self.write(order_id, driver_id, location, recorded_at).await
    }

    /// Feed from driver position updates. Returns `OrderNotTrackable` when the
    /// order is not out for delivery with this driver.
    pub async fn append_for_driver(
        &self,
        driver_id: &DriverId,
        order_id: &OrderId,
        location: GeoPoint,
        recorded_at: DateTime<Utc>,
    ) -> Result<TrackingEntry, AppError> {
        let order = self.load(order_id).await?;
        let assigned = self.trackable_driver(&order)?;
        if &assigned != driver_id {
            self.metrics
                .tracking_entries_total
                .with_label_values(&["rejected"])
                .inc();
            return Err(AppError::OrderNotTrackable(order_id.clone()));
        }

        self.write(order_id, assigned, location, recorded_at).await
    }

    pub async fn latest(
        &self,
        principal: &Principal,
        order_id: &OrderId,
    ) -> Result<Option<TrackingEntry>, AppError> {
        let order = self.load(order_id).await?;
        principal.require_party_to(&order)?;

        let entries = self.entries.entries(order_id).await?;
        Ok(entries
            .into_iter()
            .max_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.seq.cmp(&b.seq))))
    }

    pub async fn trail(&self, principal: &Principal, order_id: &OrderId) -> Result<Trail, AppError> {
        let order = self.load(order_id).await?;
        principal.require_party_to(&order)?;

        let mut entries = self.entries.entries(order_id).await?;
        sort_trail(&mut entries);
        Ok(Trail(entries))
    }

    async fn load(&self, order_id: &OrderId) -> Result<Order, AppError> {
        self.orders
            .get(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    fn trackable_driver(&self, order: &Order) -> Result<DriverId, AppError> {
        match (&order.status, &order.assigned_driver) {
            (OrderStatus::OutForDelivery, Some(driver_id)) => Ok(driver_id.clone()),
            _ => {
                self.metrics
                    .tracking_entries_total
                    .with_label_values(&["rejected"])
                    .inc();
                Err(AppError::OrderNotTrackable(order.id.clone()))
            }
        }
    }

    async fn write(
        &self,
        order_id: &OrderId,
        driver_id: DriverId,
        location: GeoPoint,
        recorded_at: DateTime<Utc>,
    ) -> Result<TrackingEntry, AppError> {
        if !location.is_valid() {
            return Err(AppError::BadRequest(format!("invalid position {location:?}")));
        }

        let entry = self
            .entries
            .append(TrackingEntry {
                order_id: order_id.clone(),
                driver_id,
                location,
                recorded_at,
                received_at: Utc::now(),
                seq: 0,
            })
            .await?;

        // The order may have left `OutForDelivery` between the check and the write.
        let current = self.load(order_id).await?;
        let still_tracking = current.status == OrderStatus::OutForDelivery
            && current.assigned_driver.as_ref() == Some(&entry.driver_id);
        if !still_tracking {
            if let Err(err) = self.entries.remove(order_id, entry.seq).await {
                warn!(order_id = %order_id, seq = entry.seq, error = %err, "failed to drop late tracking entry");
            }
            self.metrics
                .tracking_entries_total
                .with_label_values(&["rejected"])
                .inc();
            return Err(AppError::OrderNotTrackable(order_id.clone()));
        }

        self.metrics
            .tracking_entries_total
            .with_label_values(&["accepted"])
            .inc();
        if self.live_tx.send(entry.clone()).is_err() {
            debug!(order_id = %order_id, "no live tracking subscribers");
        }

        Ok(entry)
    }
}
