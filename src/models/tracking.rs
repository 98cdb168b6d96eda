use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::models::ids::{DriverId, OrderId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingEntry {
    pub order_id: OrderId,
    pub driver_id: DriverId,
    pub location: GeoPoint,
    /// Time the driver's client took the fix.
    pub recorded_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    /// Store-assigned arrival sequence; breaks ties between equal `recorded_at`.
    pub seq: u64,
}
