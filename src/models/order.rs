use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::models::ids::{DriverId, OrderId, RestaurantId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Prepared,
    OutForDelivery,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Prepared,
        OrderStatus::OutForDelivery,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];

    pub const fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// States in which an order must reference a driver.
    pub const fn has_driver(self) -> bool {
        matches!(self, OrderStatus::OutForDelivery | OrderStatus::Delivered)
    }

    pub const fn label(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Prepared => "prepared",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentMethod {
    Card,
    #[serde(rename = "Cash on Delivery", alias = "CashOnDelivery")]
    CashOnDelivery,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub restaurant_id: RestaurantId,
    pub customer_id: String,
    pub status: OrderStatus,
    pub assigned_driver: Option<DriverId>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the store on every successful write.
    pub version: u64,
}

impl Order {
    pub fn new(
        id: OrderId,
        restaurant_id: RestaurantId,
        customer_id: impl Into<String>,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        payment_method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            restaurant_id,
            customer_id: customer_id.into(),
            status: OrderStatus::Pending,
            assigned_driver: None,
            pickup,
            dropoff,
            payment_method,
            payment_status: PaymentStatus::Pending,
            cancellation_reason: None,
            created_at: now,
            assigned_at: None,
            delivered_at: None,
            cancelled_at: None,
            version: 0,
        }
    }

    pub fn is_assignable(&self) -> bool {
        self.status == OrderStatus::Prepared && self.assigned_driver.is_none()
    }
}
