use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{CasOutcome, DriverStore, OrderStore, RestaurantDirectory, StoreError, TrackingStore};
use crate::geo::{haversine_m, GeoPoint};
use crate::models::driver::{Driver, DriverStatus, StatusChange};
use crate::models::ids::{DriverId, OrderId, RestaurantId};
use crate::models::order::Order;
use crate::models::restaurant::Restaurant;
use crate::models::tracking::TrackingEntry;

#[derive(Debug, Default)]
pub struct MemoryStore {
    drivers: DashMap<DriverId, Driver>,
    orders: DashMap<OrderId, Order>,
    tracking: DashMap<OrderId, Vec<TrackingEntry>>,
    restaurants: DashMap<RestaurantId, Restaurant>,
    tracking_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DriverStore for MemoryStore {
    async fn insert_if_absent(&self, driver: Driver) -> Result<Driver, StoreError> {
        let stored = match self.drivers.entry(driver.id.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => slot.insert(driver).clone(),
        };
        Ok(stored)
    }

    async fn get(&self, id: &DriverId) -> Result<Option<Driver>, StoreError> {
        Ok(self.drivers.get(id).map(|entry| entry.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Driver>, StoreError> {
        Ok(self
            .drivers
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn set_location(
        &self,
        id: &DriverId,
        location: GeoPoint,
        at: DateTime<Utc>,
    ) -> Result<Option<Driver>, StoreError> {
        Ok(self.drivers.get_mut(id).map(|mut driver| {
            driver.location = Some(location);
            driver.last_active_at = driver.last_active_at.max(at);
            driver.clone()
        }))
    }

    async fn compare_and_set_status(
        &self,
        id: &DriverId,
        change: StatusChange,
    ) -> Result<CasOutcome<Driver>, StoreError> {
        let Some(mut driver) = self.drivers.get_mut(id) else {
            return Ok(CasOutcome::Missing);
        };

        if driver.status != change.expected {
            return Ok(CasOutcome::Conflict(driver.clone()));
        }

        driver.status = change.next;
        driver.reserved_at = change.active_order.as_ref().map(|_| change.at);
        driver.active_order = change.active_order;
        driver.reservation_id = change.reservation_id;
        driver.last_active_at = driver.last_active_at.max(change.at);
        Ok(CasOutcome::Applied(driver.clone()))
    }

    async fn release(
        &self,
        id: &DriverId,
        order_id: &OrderId,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome<Driver>, StoreError> {
        let Some(mut driver) = self.drivers.get_mut(id) else {
            return Ok(CasOutcome::Missing);
        };

        if !driver.is_reserved_for(order_id) {
            return Ok(CasOutcome::Conflict(driver.clone()));
        }

        free(&mut driver, at);
        Ok(CasOutcome::Applied(driver.clone()))
    }

    async fn release_reservation(
        &self,
        id: &DriverId,
        reservation_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome<Driver>, StoreError> {
        let Some(mut driver) = self.drivers.get_mut(id) else {
            return Ok(CasOutcome::Missing);
        };

        if driver.status != DriverStatus::Busy || driver.reservation_id != Some(reservation_id) {
            return Ok(CasOutcome::Conflict(driver.clone()));
        }

        free(&mut driver, at);
        Ok(CasOutcome::Applied(driver.clone()))
    }

    async fn reserved_for(&self, order_id: &OrderId) -> Result<Option<Driver>, StoreError> {
        Ok(self
            .drivers
            .iter()
            .find(|entry| entry.value().is_reserved_for(order_id))
            .map(|entry| entry.value().clone()))
    }

    async fn available_within(
        &self,
        center: GeoPoint,
        radius_m: f64,
    ) -> Result<Vec<Driver>, StoreError> {
        Ok(self
            .drivers
            .iter()
            .filter_map(|entry| {
                let driver = entry.value();
                let location = driver.location?;
                let in_range = driver.status == DriverStatus::Available
                    && haversine_m(&center, &location) <= radius_m;

                in_range.then(|| driver.clone())
            })
            .collect())
    }
}

fn free(driver: &mut Driver, at: DateTime<Utc>) {
    driver.status = DriverStatus::Available;
    driver.active_order = None;
    driver.reservation_id = None;
    driver.reserved_at = None;
    driver.last_active_at = driver.last_active_at.max(at);
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert(&self, order: Order) -> Result<bool, StoreError> {
        match self.orders.entry(order.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(order);
                Ok(true)
            }
        }
    }

    async fn get(&self, id: &OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(id).map(|entry| entry.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn compare_and_swap(
        &self,
        mut next: Order,
        expected_version: u64,
    ) -> Result<CasOutcome<Order>, StoreError> {
        let Some(mut current) = self.orders.get_mut(&next.id) else {
            return Ok(CasOutcome::Missing);
        };

        if current.version != expected_version {
            return Ok(CasOutcome::Conflict(current.clone()));
        }

        next.version = expected_version.saturating_add(1);
        *current = next.clone();
        Ok(CasOutcome::Applied(next))
    }
}

#[async_trait]
impl TrackingStore for MemoryStore {
    async fn append(&self, mut entry: TrackingEntry) -> Result<TrackingEntry, StoreError> {
        entry.seq = self.tracking_seq.fetch_add(1, Ordering::Relaxed);
        self.tracking
            .entry(entry.order_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(entry)
    }

    async fn entries(&self, order_id: &OrderId) -> Result<Vec<TrackingEntry>, StoreError> {
        Ok(self
            .tracking
            .get(order_id)
            .map(|entries| entries.value().clone())
            .unwrap_or_default())
    }

    async fn remove(&self, order_id: &OrderId, seq: u64) -> Result<bool, StoreError> {
        let Some(mut entries) = self.tracking.get_mut(order_id) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|entry| entry.seq != seq);
        Ok(entries.len() != before)
    }
}

#[async_trait]
impl RestaurantDirectory for MemoryStore {
    async fn get(&self, id: &RestaurantId) -> Result<Option<Restaurant>, StoreError> {
        Ok(self.restaurants.get(id).map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, restaurant: Restaurant) -> Result<Restaurant, StoreError> {
        self.restaurants
            .insert(restaurant.id.clone(), restaurant.clone());
        Ok(restaurant)
    }
}
