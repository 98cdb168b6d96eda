use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::models::ids::{DriverId, OrderId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DriverStatus {
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Driver {
    pub id: DriverId,
    /// `None` until the driver's client reports a first position.
    pub location: Option<GeoPoint>,
    pub status: DriverStatus,
    /// Order holding the reservation while the driver is `Busy`.
    pub active_order: Option<OrderId>,
    /// Token of the reservation write that made the driver `Busy`.
    pub reservation_id: Option<Uuid>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Driver {
    pub fn new(id: DriverId, location: Option<GeoPoint>, now: DateTime<Utc>) -> Self {
        let status = if location.is_some() {
            DriverStatus::Available
        } else {
            DriverStatus::Offline
        };

        Self {
            id,
            location,
            status,
            active_order: None,
            reservation_id: None,
            reserved_at: None,
            last_active_at: now,
            created_at: now,
        }
    }

    pub fn is_reserved_for(&self, order_id: &OrderId) -> bool {
        self.status == DriverStatus::Busy && self.active_order.as_ref() == Some(order_id)
    }
}

/// Conditional status write: applied only when the stored status equals `expected`.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub expected: DriverStatus,
    pub next: DriverStatus,
    pub active_order: Option<OrderId>,
    pub reservation_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn reserve(order_id: OrderId, at: DateTime<Utc>) -> Self {
        Self {
            expected: DriverStatus::Available,
            next: DriverStatus::Busy,
            active_order: Some(order_id),
            reservation_id: Some(Uuid::new_v4()),
            at,
        }
    }
}
