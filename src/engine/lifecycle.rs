use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::state_machine::{self, Transition};
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::ids::{OrderId, RestaurantId};
use crate::models::order::{Order, PaymentMethod, PaymentStatus};
use crate::models::principal::{Principal, Role};
use crate::notify::{self, DeliveryEvent, Notifier};
use crate::observability::metrics::Metrics;
use crate::store::{CasOutcome, DriverStore, OrderStore, RestaurantDirectory};

/// Order handed over by the order/cart service at checkout.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub id: Option<OrderId>,
    pub restaurant_id: RestaurantId,
    pub customer_id: Option<String>,
    /// Defaults to the restaurant's registered location.
    pub pickup: Option<GeoPoint>,
    pub dropoff: GeoPoint,
    pub payment_method: PaymentMethod,
}

pub struct OrderLifecycle {
    orders: Arc<dyn OrderStore>,
    drivers: Arc<dyn DriverStore>,
    restaurants: Arc<dyn RestaurantDirectory>,
    notifier: Arc<dyn Notifier>,
    metrics: Metrics,
    max_cas_retries: u32,
    notify_timeout: Duration,
}

impl OrderLifecycle {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        drivers: Arc<dyn DriverStore>,
        restaurants: Arc<dyn RestaurantDirectory>,
        notifier: Arc<dyn Notifier>,
        metrics: Metrics,
        max_cas_retries: u32,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            orders,
            drivers,
            restaurants,
            notifier,
            metrics,
            max_cas_retries,
            notify_timeout,
        }
    }

    pub async fn create_order(&self, principal: &Principal, new: NewOrder) -> Result<Order, AppError> {
        let customer_id = match principal.role {
            Role::Customer => principal.id.clone(),
            Role::Admin | Role::System => new
                .customer_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| AppError::BadRequest("customer_id is required".to_string()))?,
            _ => {
                return Err(AppError::Forbidden(format!(
                    "{} {} cannot create orders",
                    principal.role, principal.id
                )));
            }
        };

        let pickup = match new.pickup {
            Some(point) => point,
            None => {
                self.restaurants
                    .get(&new.restaurant_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::BadRequest(format!(
                            "restaurant {} is unknown and no pickup was given",
                            new.restaurant_id
                        ))
                    })?
                    .location
            }
        };
        if !pickup.is_valid() || !new.dropoff.is_valid() {
            return Err(AppError::BadRequest("invalid pickup or dropoff point".to_string()));
        }

        let order = Order::new(
            new.id.unwrap_or_else(|| OrderId::new(Uuid::new_v4().to_string())),
            new.restaurant_id,
            customer_id,
            pickup,
            new.dropoff,
            new.payment_method,
            Utc::now(),
        );

        if !self.orders.insert(order.clone()).await? {
            return Err(AppError::Conflict(format!("order {} already exists", order.id)));
        }

        info!(order_id = %order.id, restaurant_id = %order.restaurant_id, "order created");
        Ok(order)
    }

    pub async fn get(&self, principal: &Principal, order_id: &OrderId) -> Result<Order, AppError> {
        let order = self.load(order_id).await?;
        principal.require_party_to(&order)?;
        Ok(order)
    }

    pub async fn confirm(&self, principal: &Principal, order_id: &OrderId) -> Result<Order, AppError> {
        self.transition(order_id, &Transition::Confirm, |order| {
            principal.require_restaurant_of(order)
        })
        .await
    }

    pub async fn start_preparing(&self, principal: &Principal, order_id: &OrderId) -> Result<Order, AppError> {
        self.transition(order_id, &Transition::StartPreparing, |order| {
            principal.require_restaurant_of(order)
        })
        .await
    }

    pub async fn mark_prepared(&self, principal: &Principal, order_id: &OrderId) -> Result<Order, AppError> {
        self.transition(order_id, &Transition::MarkPrepared, |order| {
            principal.require_restaurant_of(order)
        })
        .await
    }

    pub async fn mark_delivered(&self, principal: &Principal, order_id: &OrderId) -> Result<Order, AppError> {
        self.transition(order_id, &Transition::Deliver, |order| {
            if principal.is_assigned_driver_of(order) {
                Ok(())
            } else {
                principal.require_restaurant_of(order)
            }
        })
        .await
    }

    /// Customer, restaurant or admin cancellation; for the assigned driver this
    /// is a rejection of the delivery.
    pub async fn cancel(
        &self,
        principal: &Principal,
        order_id: &OrderId,
        reason: &str,
    ) -> Result<Order, AppError> {
        let transition = Transition::Cancel {
            reason: reason.to_string(),
        };
        self.transition(order_id, &transition, |order| {
            if principal.is_customer_of(order) || principal.is_assigned_driver_of(order) {
                Ok(())
            } else {
                principal.require_restaurant_of(order)
            }
        })
        .await
    }

    /// Written on behalf of the payment service, or by the driver collecting cash.
    /// Never changes the delivery status.
    pub async fn update_payment_status(
        &self,
        principal: &Principal,
        order_id: &OrderId,
        status: PaymentStatus,
    ) -> Result<Order, AppError> {
        for _ in 0..=self.max_cas_retries {
            let current = self.load(order_id).await?;
            let collecting_cash = principal.is_assigned_driver_of(&current)
                && current.payment_method == PaymentMethod::CashOnDelivery;
            if !collecting_cash {
                principal.require_privileged()?;
            }
            if current.payment_status == status {
                return Ok(current);
            }

            let mut next = current.clone();
            next.payment_status = status;
            match self.orders.compare_and_swap(next, current.version).await? {
                CasOutcome::Applied(written) => {
                    info!(order_id = %order_id, payment_status = ?status, "payment status updated");
                    return Ok(written);
                }
                CasOutcome::Conflict(_) => continue,
                CasOutcome::Missing => return Err(not_found(order_id)),
            }
        }

        Err(AppError::Conflict(format!("order {order_id} changed concurrently")))
    }

    async fn transition<F>(
        &self,
        order_id: &OrderId,
        transition: &Transition,
        authorize: F,
    ) -> Result<Order, AppError>
    where
        F: Fn(&Order) -> Result<(), AppError> + Send + Sync,
    {
        for _ in 0..=self.max_cas_retries {
            let current = self.load(order_id).await?;
            authorize(&current)?;

            let next = state_machine::apply(&current, transition, Utc::now())?;
            match self.orders.compare_and_swap(next, current.version).await? {
                CasOutcome::Applied(written) => {
                    self.record_committed(&current, &written).await;
                    return Ok(written);
                }
                CasOutcome::Conflict(latest) => {
                    debug!(order_id = %order_id, version = latest.version, "order version moved; retrying");
                }
                CasOutcome::Missing => return Err(not_found(order_id)),
            }
        }

        Err(AppError::Conflict(format!("order {order_id} changed concurrently")))
    }

    /// Side effects of a committed transition: metrics, driver release on
    /// terminal states, notification. None of these can undo the commit.
    pub(crate) async fn record_committed(&self, before: &Order, after: &Order) {
        self.metrics
            .order_transitions_total
            .with_label_values(&[after.status.label()])
            .inc();
        info!(
            order_id = %after.id,
            from = ?before.status,
            to = ?after.status,
            driver_id = ?after.assigned_driver.as_ref().map(ToString::to_string),
            "order transitioned"
        );

        if after.status.is_terminal() {
            if let Some(driver_id) = before.assigned_driver.as_ref() {
                match self.drivers.release(driver_id, &after.id, Utc::now()).await {
                    Ok(CasOutcome::Applied(_)) => {
                        info!(order_id = %after.id, driver_id = %driver_id, "driver released");
                    }
                    Ok(_) => {
                        debug!(order_id = %after.id, driver_id = %driver_id, "driver no longer held by order");
                    }
                    Err(err) => {
                        warn!(order_id = %after.id, driver_id = %driver_id, error = %err, "driver release failed; left for reconciler");
                    }
                }
            }
        }

        let event = DeliveryEvent::StatusChanged {
            order_id: after.id.clone(),
            from: before.status,
            to: after.status,
            driver_id: after
                .assigned_driver
                .clone()
                .or_else(|| before.assigned_driver.clone()),
            at: Utc::now(),
        };
        notify::publish(&self.notifier, event, self.notify_timeout).await;
    }

    async fn load(&self, order_id: &OrderId) -> Result<Order, AppError> {
        self.orders
            .get(order_id)
            .await?
            .ok_or_else(|| not_found(order_id))
    }
}

fn not_found(order_id: &OrderId) -> AppError {
    AppError::NotFound(format!("order {order_id} not found"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::{NewOrder, OrderLifecycle};
    use crate::error::AppError;
    use crate::geo::GeoPoint;
    use crate::models::driver::{Driver, DriverStatus, StatusChange};
    use crate::models::ids::{DriverId, OrderId, RestaurantId};
    use crate::models::order::{Order, OrderStatus, PaymentMethod, PaymentStatus};
    use crate::models::principal::{Principal, Role};
    use crate::models::restaurant::Restaurant;
    use crate::notify::BroadcastNotifier;
    use crate::observability::metrics::Metrics;
    use crate::store::memory::MemoryStore;
    use crate::store::{DriverStore, OrderStore, RestaurantDirectory};

    fn lifecycle(store: &Arc<MemoryStore>) -> OrderLifecycle {
        OrderLifecycle::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(BroadcastNotifier::new(16)),
            Metrics::new(),
            3,
            Duration::from_millis(100),
        )
    }

    fn restaurant() -> Principal {
        Principal::new("r-1", Role::Restaurant)
    }

    async fn seed(store: &MemoryStore, status: OrderStatus, method: PaymentMethod) -> OrderId {
        let mut order = Order::new(
            OrderId::from("o-1"),
            RestaurantId::from("r-1"),
            "c-1",
            GeoPoint::new(6.9271, 79.8612),
            GeoPoint::new(6.93, 79.87),
            method,
            Utc::now(),
        );
        order.status = status;
        if status.has_driver() {
            order.assigned_driver = Some(DriverId::from("d-1"));
            store
                .insert_if_absent(Driver::new(
                    DriverId::from("d-1"),
                    Some(GeoPoint::new(6.9271, 79.8612)),
                    Utc::now(),
                ))
                .await
                .unwrap();
            store
                .compare_and_set_status(
                    &DriverId::from("d-1"),
                    StatusChange::reserve(order.id.clone(), Utc::now()),
                )
                .await
                .unwrap();
        }
        store.insert(order.clone()).await.unwrap();
        order.id
    }

    #[tokio::test]
    async fn restaurant_walks_order_to_prepared() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(&store);
        let id = seed(&store, OrderStatus::Pending, PaymentMethod::Card).await;

        lifecycle.confirm(&restaurant(), &id).await.unwrap();
        lifecycle.start_preparing(&restaurant(), &id).await.unwrap();
        let prepared = lifecycle.mark_prepared(&restaurant(), &id).await.unwrap();

        assert_eq!(prepared.status, OrderStatus::Prepared);
        assert_eq!(prepared.version, 3);
    }

    #[tokio::test]
    async fn skipping_a_state_is_rejected_and_leaves_order_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(&store);
        let id = seed(&store, OrderStatus::Pending, PaymentMethod::Card).await;

        let err = lifecycle.mark_prepared(&restaurant(), &id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        let order = OrderStore::get(store.as_ref(), &id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.version, 0);
    }

    #[tokio::test]
    async fn other_restaurant_cannot_advance_order() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(&store);
        let id = seed(&store, OrderStatus::Pending, PaymentMethod::Card).await;

        let err = lifecycle
            .confirm(&Principal::new("r-2", Role::Restaurant), &id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn cancelling_out_for_delivery_releases_driver() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(&store);
        let id = seed(&store, OrderStatus::OutForDelivery, PaymentMethod::Card).await;

        let cancelled = lifecycle
            .cancel(&Principal::new("c-1", Role::Customer), &id, "changed my mind")
            .await
            .unwrap();

        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled.assigned_driver.is_none());
        let driver = DriverStore::get(store.as_ref(), &DriverId::from("d-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(driver.status, DriverStatus::Available);
        assert!(driver.active_order.is_none());
    }

    #[tokio::test]
    async fn cash_on_delivery_delivery_waits_for_payment() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(&store);
        let id = seed(&store, OrderStatus::OutForDelivery, PaymentMethod::CashOnDelivery).await;
        let driver = Principal::new("d-1", Role::Delivery);

        let err = lifecycle.mark_delivered(&driver, &id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        lifecycle
            .update_payment_status(&driver, &id, PaymentStatus::Completed)
            .await
            .unwrap();
        let delivered = lifecycle.mark_delivered(&driver, &id).await.unwrap();

        assert_eq!(delivered.status, OrderStatus::Delivered);
        assert_eq!(delivered.assigned_driver, Some(DriverId::from("d-1")));
        assert!(delivered.delivered_at.is_some());
    }

    #[tokio::test]
    async fn customers_cannot_mark_payment() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(&store);
        let id = seed(&store, OrderStatus::OutForDelivery, PaymentMethod::CashOnDelivery).await;

        let err = lifecycle
            .update_payment_status(
                &Principal::new("c-1", Role::Customer),
                &id,
                PaymentStatus::Completed,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn create_order_defaults_pickup_to_restaurant_location() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(&store);
        store
            .upsert(Restaurant {
                id: RestaurantId::from("r-1"),
                name: "Hoppers".to_string(),
                location: GeoPoint::new(6.9271, 79.8612),
                delivery_radius_m: None,
            })
            .await
            .unwrap();

        let order = lifecycle
            .create_order(
                &Principal::new("c-1", Role::Customer),
                NewOrder {
                    id: Some(OrderId::from("o-7")),
                    restaurant_id: RestaurantId::from("r-1"),
                    customer_id: None,
                    pickup: None,
                    dropoff: GeoPoint::new(6.93, 79.87),
                    payment_method: PaymentMethod::Card,
                },
            )
            .await
            .unwrap();

        assert_eq!(order.pickup, GeoPoint::new(6.9271, 79.8612));
        assert_eq!(order.customer_id, "c-1");
        assert_eq!(order.status, OrderStatus::Pending);
    }
}
