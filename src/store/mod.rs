//! Storage seams for drivers, orders, tracking entries and restaurant profiles.
//!
//! The coordination logic never holds in-process locks across calls; every
//! write that can race is expressed as a conditional update here:
//!
//! - drivers: [`DriverStore::compare_and_set_status`], [`DriverStore::release`] and
//!   [`DriverStore::release_reservation`]
//! - orders: [`OrderStore::compare_and_swap`] against the order's `version`
//!
//! [`memory::MemoryStore`] implements all of them over `DashMap`, where each
//! conditional update runs under the entry's shard lock.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::models::driver::{Driver, StatusChange};
use crate::models::ids::{DriverId, OrderId, RestaurantId};
use crate::models::order::Order;
use crate::models::restaurant::Restaurant;
use crate::models::tracking::TrackingEntry;

use self::memory::MemoryStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out: {0}")]
    Timeout(String),
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T> {
    /// The condition held; carries the record as written.
    Applied(T),
    /// The condition did not hold; carries the record as currently stored.
    Conflict(T),
    Missing,
}

impl<T> CasOutcome<T> {
    pub const fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

#[async_trait]
pub trait DriverStore: Send + Sync {
    /// Inserts `driver` unless a record with the same id exists; returns the stored record.
    async fn insert_if_absent(&self, driver: Driver) -> Result<Driver, StoreError>;

    async fn get(&self, id: &DriverId) -> Result<Option<Driver>, StoreError>;

    async fn list(&self) -> Result<Vec<Driver>, StoreError>;

    async fn set_location(
        &self,
        id: &DriverId,
        location: GeoPoint,
        at: DateTime<Utc>,
    ) -> Result<Option<Driver>, StoreError>;

    /// Atomically applies `change` iff the stored status equals `change.expected`.
    async fn compare_and_set_status(
        &self,
        id: &DriverId,
        change: StatusChange,
    ) -> Result<CasOutcome<Driver>, StoreError>;

    /// Atomically returns the driver to `Available` iff it is `Busy` for `order_id`.
    async fn release(
        &self,
        id: &DriverId,
        order_id: &OrderId,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome<Driver>, StoreError>;

    /// Atomically returns the driver to `Available` iff it is still held by the
    /// reservation `reservation_id`.
    async fn release_reservation(
        &self,
        id: &DriverId,
        reservation_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome<Driver>, StoreError>;

    /// The driver currently `Busy` for `order_id`, if any.
    async fn reserved_for(&self, order_id: &OrderId) -> Result<Option<Driver>, StoreError>;

    /// Available drivers with a known position within `radius_m` of `center`, unordered.
    async fn available_within(
        &self,
        center: GeoPoint,
        radius_m: f64,
    ) -> Result<Vec<Driver>, StoreError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Returns `false` when an order with the same id already exists.
    async fn insert(&self, order: Order) -> Result<bool, StoreError>;

    async fn get(&self, id: &OrderId) -> Result<Option<Order>, StoreError>;

    async fn list(&self) -> Result<Vec<Order>, StoreError>;

    /// Writes `next` iff the stored version equals `expected_version`; the
    /// written record carries `expected_version + 1`.
    async fn compare_and_swap(
        &self,
        next: Order,
        expected_version: u64,
    ) -> Result<CasOutcome<Order>, StoreError>;
}

#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Appends an entry, assigning its arrival sequence number.
    async fn append(&self, entry: TrackingEntry) -> Result<TrackingEntry, StoreError>;

    /// Entries for one order in arrival order.
    async fn entries(&self, order_id: &OrderId) -> Result<Vec<TrackingEntry>, StoreError>;

    /// Drops the entry with sequence `seq`; returns whether it existed.
    async fn remove(&self, order_id: &OrderId, seq: u64) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait RestaurantDirectory: Send + Sync {
    async fn get(&self, id: &RestaurantId) -> Result<Option<Restaurant>, StoreError>;

    async fn upsert(&self, restaurant: Restaurant) -> Result<Restaurant, StoreError>;
}

/// Handles to every backend the services need.
#[derive(Clone)]
pub struct Stores {
    pub drivers: Arc<dyn DriverStore>,
    pub orders: Arc<dyn OrderStore>,
    pub tracking: Arc<dyn TrackingStore>,
    pub restaurants: Arc<dyn RestaurantDirectory>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self::from_memory(Arc::new(MemoryStore::new()))
    }

    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            drivers: store.clone(),
            orders: store.clone(),
            tracking: store.clone(),
            restaurants: store,
        }
    }
}
