use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ids::{DriverId, OrderId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub id: Uuid,
    pub order_id: OrderId,
    pub driver_id: DriverId,
    pub distance_m: f64,
    /// Reservation attempts made before this driver was claimed, including the winning one.
    pub attempts: u32,
    pub assigned_at: DateTime<Utc>,
}
