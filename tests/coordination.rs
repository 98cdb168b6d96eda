use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use delivery_coordinator::config::Config;
use delivery_coordinator::engine::assignment::{run_dispatch_worker, AssignmentOutcome};
use delivery_coordinator::engine::lifecycle::NewOrder;
use delivery_coordinator::engine::queue::{enqueue_dispatch, DispatchRequest};
use delivery_coordinator::engine::reconcile::release_orphaned_reservations;
use delivery_coordinator::error::AppError;
use delivery_coordinator::geo::GeoPoint;
use delivery_coordinator::models::driver::{Driver, DriverStatus, StatusChange};
use delivery_coordinator::models::ids::{DriverId, OrderId, RestaurantId};
use delivery_coordinator::models::order::{Order, OrderStatus, PaymentMethod, PaymentStatus};
use delivery_coordinator::models::principal::{Principal, Role};
use delivery_coordinator::notify::DeliveryEvent;
use delivery_coordinator::state::AppState;
use delivery_coordinator::store::memory::MemoryStore;
use delivery_coordinator::store::{CasOutcome, DriverStore, OrderStore, StoreError, Stores};
use tokio::sync::mpsc;
use tokio::time::sleep;
use uuid::Uuid;

const PICKUP: GeoPoint = GeoPoint::new(6.9271, 79.8612);

fn config() -> Config {
    Config {
        notify_timeout: Duration::from_millis(100),
        reservation_timeout: Duration::from_millis(100),
        redispatch_delay: Duration::from_millis(20),
        ..Config::default()
    }
}

fn restaurant() -> Principal {
    Principal::new("r-1", Role::Restaurant)
}

fn customer() -> Principal {
    Principal::new("c-1", Role::Customer)
}

fn setup() -> (Arc<AppState>, mpsc::Receiver<DispatchRequest>) {
    let (state, rx) = AppState::new(config());
    (Arc::new(state), rx)
}

fn setup_with(stores: Stores) -> Arc<AppState> {
    let (state, _rx) = AppState::with_stores(config(), stores, None);
    Arc::new(state)
}

async fn add_driver(state: &AppState, id: &str, lat: f64) {
    state
        .registry
        .upsert_driver(
            &Principal::new(id, Role::Delivery),
            &DriverId::from(id),
            Some(GeoPoint::new(lat, PICKUP.lng)),
        )
        .await
        .unwrap();
}

async fn prepared_order(state: &AppState, id: &str, payment_method: PaymentMethod) -> OrderId {
    let order = state
        .lifecycle
        .create_order(
            &customer(),
            NewOrder {
                id: Some(OrderId::from(id)),
                restaurant_id: RestaurantId::from("r-1"),
                customer_id: None,
                pickup: Some(PICKUP),
                dropoff: GeoPoint::new(6.94, 79.87),
                payment_method,
            },
        )
        .await
        .unwrap();

    state.lifecycle.confirm(&restaurant(), &order.id).await.unwrap();
    state.lifecycle.start_preparing(&restaurant(), &order.id).await.unwrap();
    state.lifecycle.mark_prepared(&restaurant(), &order.id).await.unwrap();
    order.id
}

async fn driver(state: &AppState, id: &str) -> Driver {
    state.registry.get_by_id(&DriverId::from(id)).await.unwrap()
}

async fn order(state: &AppState, id: &OrderId) -> Order {
    state.stores.orders.get(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn nearest_available_driver_is_assigned() {
    let (state, _rx) = setup();
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;

    let outcome = state.coordinator.assign(&restaurant(), &order_id).await.unwrap();
    assert!(matches!(outcome, AssignmentOutcome::Assigned(_)));
    assert_eq!(outcome.driver_id().as_str(), "d-1");

    let d1 = driver(&state, "d-1").await;
    assert_eq!(d1.status, DriverStatus::Busy);
    assert_eq!(d1.active_order, Some(order_id.clone()));

    let o1 = order(&state, &order_id).await;
    assert_eq!(o1.status, OrderStatus::OutForDelivery);
    assert_eq!(o1.assigned_driver, Some(DriverId::from("d-1")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_orders_racing_for_one_driver() {
    for _ in 0..20 {
        let (state, _rx) = setup();
        add_driver(&state, "d-1", PICKUP.lat).await;
        let o1 = prepared_order(&state, "o-1", PaymentMethod::Card).await;
        let o2 = prepared_order(&state, "o-2", PaymentMethod::Card).await;

        let first = {
            let state = state.clone();
            let o1 = o1.clone();
            tokio::spawn(async move { state.coordinator.assign(&restaurant(), &o1).await })
        };
        let second = {
            let state = state.clone();
            let o2 = o2.clone();
            tokio::spawn(async move { state.coordinator.assign(&restaurant(), &o2).await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        let assigned = results.iter().filter(|r| r.is_ok()).count();
        let no_driver = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::NoDriverAvailable(_))))
            .count();
        assert_eq!((assigned, no_driver), (1, 1));

        let orders = [order(&state, &o1).await, order(&state, &o2).await];
        let out: Vec<&Order> = orders
            .iter()
            .filter(|o| o.status == OrderStatus::OutForDelivery)
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].assigned_driver, Some(DriverId::from("d-1")));
        assert!(orders
            .iter()
            .any(|o| o.status == OrderStatus::Prepared && o.assigned_driver.is_none()));

        let d1 = driver(&state, "d-1").await;
        assert_eq!(d1.active_order, Some(out[0].id.clone()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_orders_never_share_a_driver() {
    let (state, _rx) = setup();
    for i in 0..5 {
        add_driver(&state, &format!("d-{i}"), PICKUP.lat + f64::from(i) * 0.001).await;
    }
    let mut order_ids = Vec::new();
    for i in 0..20 {
        order_ids.push(prepared_order(&state, &format!("o-{i}"), PaymentMethod::Card).await);
    }

    let handles: Vec<_> = order_ids
        .iter()
        .cloned()
        .map(|order_id| {
            let state = state.clone();
            tokio::spawn(async move { state.coordinator.assign(&restaurant(), &order_id).await })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => winners.push(outcome.driver_id().clone()),
            Err(AppError::NoDriverAvailable(_)) => {}
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    winners.sort();
    winners.dedup();
    assert_eq!(winners.len(), 5);

    for id in &order_ids {
        let o = order(&state, id).await;
        if let Some(driver_id) = &o.assigned_driver {
            let d = state.registry.get_by_id(driver_id).await.unwrap();
            assert_eq!(d.active_order.as_ref(), Some(id));
        } else {
            assert_eq!(o.status, OrderStatus::Prepared);
        }
    }
}

#[tokio::test]
async fn second_assign_is_a_no_op() {
    let (state, _rx) = setup();
    add_driver(&state, "d-1", PICKUP.lat).await;
    add_driver(&state, "d-2", PICKUP.lat + 0.001).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;
    let mut events = state.events.subscribe();

    let first = state.coordinator.assign(&restaurant(), &order_id).await.unwrap();
    let second = state.coordinator.assign(&restaurant(), &order_id).await.unwrap();

    assert!(matches!(first, AssignmentOutcome::Assigned(_)));
    assert!(matches!(second, AssignmentOutcome::AlreadyAssigned { .. }));
    assert_eq!(first.driver_id(), second.driver_id());
    assert_eq!(driver(&state, "d-2").await.status, DriverStatus::Available);
    assert_eq!(state.coordinator.assignment_count(), 1);

    let mut assigned_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DeliveryEvent::DriverAssigned(_)) {
            assigned_events += 1;
        }
    }
    assert_eq!(assigned_events, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_triggers_hold_one_driver() {
    let (state, _rx) = setup();
    for i in 0..4 {
        add_driver(&state, &format!("d-{i}"), PICKUP.lat + f64::from(i) * 0.001).await;
    }
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;
    let mut events = state.events.subscribe();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let state = state.clone();
            let order_id = order_id.clone();
            tokio::spawn(async move { state.coordinator.assign(&restaurant(), &order_id).await })
        })
        .collect();

    let mut drivers = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(AssignmentOutcome::InProgress { .. }) => {}
            Ok(outcome) => drivers.push(outcome.driver_id().clone()),
            Err(err) => panic!("duplicate trigger failed: {err}"),
        }
    }
    drivers.sort();
    drivers.dedup();
    assert_eq!(drivers.len(), 1);
    assert_eq!(
        order(&state, &order_id).await.assigned_driver.as_ref(),
        Some(&drivers[0])
    );

    let busy = state
        .stores
        .drivers
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.status == DriverStatus::Busy)
        .count();
    assert_eq!(busy, 1);
    assert_eq!(state.coordinator.assignment_count(), 1);

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, DeliveryEvent::NoDriverAvailable { .. }),
            "duplicate trigger reported no driver"
        );
    }
}

#[tokio::test]
async fn trigger_finding_its_order_already_held_is_in_progress() {
    let (state, _rx) = setup();
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;
    state
        .stores
        .drivers
        .compare_and_set_status(
            &DriverId::from("d-1"),
            StatusChange::reserve(order_id.clone(), Utc::now()),
        )
        .await
        .unwrap();
    let mut events = state.events.subscribe();

    let outcome = state.coordinator.assign(&restaurant(), &order_id).await.unwrap();

    assert!(matches!(outcome, AssignmentOutcome::InProgress { .. }));
    assert_eq!(outcome.driver_id().as_str(), "d-1");
    assert!(events.try_recv().is_err());
    assert_eq!(order(&state, &order_id).await.status, OrderStatus::Prepared);
}

#[tokio::test]
async fn customer_cancellation_frees_driver() {
    let (state, _rx) = setup();
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;
    state.coordinator.assign(&restaurant(), &order_id).await.unwrap();

    let cancelled = state
        .lifecycle
        .cancel(&customer(), &order_id, "changed my mind")
        .await
        .unwrap();

    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.assigned_driver, None);
    let d1 = driver(&state, "d-1").await;
    assert_eq!(d1.status, DriverStatus::Available);
    assert_eq!(d1.active_order, None);
}

#[tokio::test]
async fn delivered_order_frees_driver() {
    let (state, _rx) = setup();
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;
    state.coordinator.assign(&restaurant(), &order_id).await.unwrap();

    state
        .lifecycle
        .mark_delivered(&Principal::new("d-1", Role::Delivery), &order_id)
        .await
        .unwrap();

    assert_eq!(driver(&state, "d-1").await.status, DriverStatus::Available);
}

#[tokio::test]
async fn cash_order_needs_payment_before_delivery() {
    let (state, _rx) = setup();
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::CashOnDelivery).await;
    state.coordinator.assign(&restaurant(), &order_id).await.unwrap();
    let d1 = Principal::new("d-1", Role::Delivery);

    let err = state.lifecycle.mark_delivered(&d1, &order_id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
    assert_eq!(order(&state, &order_id).await.status, OrderStatus::OutForDelivery);

    state
        .lifecycle
        .update_payment_status(&d1, &order_id, PaymentStatus::Completed)
        .await
        .unwrap();
    let delivered = state.lifecycle.mark_delivered(&d1, &order_id).await.unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);
    assert!(delivered.delivered_at.is_some());
}

#[tokio::test]
async fn tracking_only_once_out_for_delivery() {
    let (state, _rx) = setup();
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;
    let d1 = Principal::new("d-1", Role::Delivery);

    let err = state
        .tracking
        .append(&d1, &order_id, GeoPoint::new(6.93, 79.862), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::OrderNotTrackable(_)));

    state.coordinator.assign(&restaurant(), &order_id).await.unwrap();
    let entry = state
        .tracking
        .append(&d1, &order_id, GeoPoint::new(6.93, 79.862), Utc::now())
        .await
        .unwrap();
    assert_eq!(entry.driver_id.as_str(), "d-1");
}

#[tokio::test]
async fn assigning_an_unprepared_order_is_rejected() {
    let (state, _rx) = setup();
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order = state
        .lifecycle
        .create_order(
            &customer(),
            NewOrder {
                id: Some(OrderId::from("o-1")),
                restaurant_id: RestaurantId::from("r-1"),
                customer_id: None,
                pickup: Some(PICKUP),
                dropoff: GeoPoint::new(6.94, 79.87),
                payment_method: PaymentMethod::Card,
            },
        )
        .await
        .unwrap();

    let err = state.coordinator.assign(&restaurant(), &order.id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
    assert_eq!(driver(&state, "d-1").await.status, DriverStatus::Available);
}

#[tokio::test]
async fn drivers_outside_radius_are_not_considered() {
    let (state, _rx) = setup();
    add_driver(&state, "far", PICKUP.lat + 0.1).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;

    let err = state.coordinator.assign(&restaurant(), &order_id).await.unwrap_err();
    assert!(matches!(err, AppError::NoDriverAvailable(_)));
    assert_eq!(driver(&state, "far").await.status, DriverStatus::Available);
}

/// Order store whose dispatch writes fail while `fail_dispatch` is set.
struct FlakyOrders {
    inner: Arc<dyn OrderStore>,
    fail_dispatch: AtomicBool,
}

#[async_trait]
impl OrderStore for FlakyOrders {
    async fn insert(&self, order: Order) -> Result<bool, StoreError> {
        self.inner.insert(order).await
    }

    async fn get(&self, id: &OrderId) -> Result<Option<Order>, StoreError> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<Order>, StoreError> {
        self.inner.list().await
    }

    async fn compare_and_swap(
        &self,
        next: Order,
        expected_version: u64,
    ) -> Result<CasOutcome<Order>, StoreError> {
        if next.status == OrderStatus::OutForDelivery && self.fail_dispatch.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected".to_string()));
        }
        self.inner.compare_and_swap(next, expected_version).await
    }
}

#[tokio::test]
async fn failed_order_write_releases_reserved_driver() {
    let memory = Arc::new(MemoryStore::new());
    let orders = Arc::new(FlakyOrders {
        inner: memory.clone(),
        fail_dispatch: AtomicBool::new(true),
    });
    let state = setup_with(Stores {
        drivers: memory.clone(),
        orders: orders.clone(),
        tracking: memory.clone(),
        restaurants: memory,
    });
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;

    let err = state.coordinator.assign(&restaurant(), &order_id).await.unwrap_err();
    assert!(matches!(err, AppError::Store(_)));
    assert_eq!(driver(&state, "d-1").await.status, DriverStatus::Available);
    assert_eq!(order(&state, &order_id).await.status, OrderStatus::Prepared);

    orders.fail_dispatch.store(false, Ordering::SeqCst);
    let outcome = state.coordinator.assign(&restaurant(), &order_id).await.unwrap();
    assert_eq!(outcome.driver_id().as_str(), "d-1");
}

/// Driver store that runs a hook right after a reservation lands, and can
/// stall reservations past the coordinator's timeout.
struct HookedDrivers {
    inner: Arc<dyn DriverStore>,
    orders: Arc<dyn OrderStore>,
    cancel_after_reserve: bool,
    slow_driver: Option<DriverId>,
    /// Delays the first reservation before it reaches the store.
    stall_first_reservation: AtomicBool,
}

#[async_trait]
impl DriverStore for HookedDrivers {
    async fn insert_if_absent(&self, driver: Driver) -> Result<Driver, StoreError> {
        self.inner.insert_if_absent(driver).await
    }

    async fn get(&self, id: &DriverId) -> Result<Option<Driver>, StoreError> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<Driver>, StoreError> {
        self.inner.list().await
    }

    async fn set_location(
        &self,
        id: &DriverId,
        location: GeoPoint,
        at: DateTime<Utc>,
    ) -> Result<Option<Driver>, StoreError> {
        self.inner.set_location(id, location, at).await
    }

    async fn compare_and_set_status(
        &self,
        id: &DriverId,
        change: StatusChange,
    ) -> Result<CasOutcome<Driver>, StoreError> {
        let reserving_for = change.active_order.clone();
        if reserving_for.is_some() && self.stall_first_reservation.swap(false, Ordering::SeqCst) {
            sleep(Duration::from_millis(400)).await;
        }
        let outcome = self.inner.compare_and_set_status(id, change).await?;

        if let (true, Some(order_id)) = (outcome.is_applied(), reserving_for) {
            if self.slow_driver.as_ref() == Some(id) {
                sleep(Duration::from_millis(500)).await;
            }
            if self.cancel_after_reserve {
                if let Some(current) = self.orders.get(&order_id).await? {
                    let mut next = current.clone();
                    next.status = OrderStatus::Cancelled;
                    next.cancellation_reason = Some("customer left".to_string());
                    next.cancelled_at = Some(Utc::now());
                    self.orders.compare_and_swap(next, current.version).await?;
                }
            }
        }
        Ok(outcome)
    }

    async fn release(
        &self,
        id: &DriverId,
        order_id: &OrderId,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome<Driver>, StoreError> {
        self.inner.release(id, order_id, at).await
    }

    async fn release_reservation(
        &self,
        id: &DriverId,
        reservation_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome<Driver>, StoreError> {
        self.inner.release_reservation(id, reservation_id, at).await
    }

    async fn reserved_for(&self, order_id: &OrderId) -> Result<Option<Driver>, StoreError> {
        self.inner.reserved_for(order_id).await
    }

    async fn available_within(
        &self,
        center: GeoPoint,
        radius_m: f64,
    ) -> Result<Vec<Driver>, StoreError> {
        self.inner.available_within(center, radius_m).await
    }
}

fn hooked(
    cancel_after_reserve: bool,
    slow_driver: Option<&str>,
    stall_first_reservation: bool,
) -> Arc<AppState> {
    let memory = Arc::new(MemoryStore::new());
    let drivers = Arc::new(HookedDrivers {
        inner: memory.clone(),
        orders: memory.clone(),
        cancel_after_reserve,
        slow_driver: slow_driver.map(DriverId::from),
        stall_first_reservation: AtomicBool::new(stall_first_reservation),
    });
    setup_with(Stores {
        drivers,
        orders: memory.clone(),
        tracking: memory.clone(),
        restaurants: memory,
    })
}

#[tokio::test]
async fn cancellation_during_assignment_rolls_back_reservation() {
    let state = hooked(true, None, false);
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;

    let err = state.coordinator.assign(&restaurant(), &order_id).await.unwrap_err();
    assert!(matches!(err, AppError::OrderNoLongerAssignable(_)));

    let d1 = driver(&state, "d-1").await;
    assert_eq!(d1.status, DriverStatus::Available);
    assert_eq!(d1.active_order, None);
    let o1 = order(&state, &order_id).await;
    assert_eq!(o1.status, OrderStatus::Cancelled);
    assert_eq!(o1.assigned_driver, None);
}

#[tokio::test]
async fn timed_out_reservation_is_released_and_next_candidate_used() {
    let state = hooked(false, Some("slow"), false);
    add_driver(&state, "slow", PICKUP.lat).await;
    add_driver(&state, "fast", PICKUP.lat + 0.01).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;

    let outcome = state.coordinator.assign(&restaurant(), &order_id).await.unwrap();
    assert_eq!(outcome.driver_id().as_str(), "fast");

    let slow = driver(&state, "slow").await;
    assert_eq!(slow.status, DriverStatus::Available);
    assert_eq!(slow.active_order, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_trigger_leaves_sibling_assignment_intact() {
    let state = hooked(false, None, true);
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;

    let stalled = {
        let state = state.clone();
        let order_id = order_id.clone();
        tokio::spawn(async move { state.coordinator.assign(&restaurant(), &order_id).await })
    };
    sleep(Duration::from_millis(30)).await;

    let winner = state.coordinator.assign(&restaurant(), &order_id).await.unwrap();
    assert!(matches!(winner, AssignmentOutcome::Assigned(_)));
    assert_eq!(winner.driver_id().as_str(), "d-1");

    let late = stalled.await.unwrap().unwrap();
    assert!(matches!(late, AssignmentOutcome::AlreadyAssigned { .. }));
    assert_eq!(late.driver_id().as_str(), "d-1");

    let d1 = driver(&state, "d-1").await;
    assert_eq!(d1.status, DriverStatus::Busy);
    assert_eq!(d1.active_order, Some(order_id.clone()));
    let o1 = order(&state, &order_id).await;
    assert_eq!(o1.status, OrderStatus::OutForDelivery);
    assert_eq!(o1.assigned_driver, Some(DriverId::from("d-1")));
}

#[tokio::test]
async fn reconciler_releases_reservation_of_cancelled_order() {
    let (state, _rx) = setup();
    add_driver(&state, "d-1", PICKUP.lat).await;
    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;

    // Reservation whose commit never happened, then the order is cancelled.
    state
        .stores
        .drivers
        .compare_and_set_status(
            &DriverId::from("d-1"),
            StatusChange::reserve(order_id.clone(), Utc::now()),
        )
        .await
        .unwrap();
    state
        .lifecycle
        .cancel(&customer(), &order_id, "too slow")
        .await
        .unwrap();
    assert_eq!(driver(&state, "d-1").await.status, DriverStatus::Busy);

    let released = release_orphaned_reservations(
        &state.stores.drivers,
        &state.stores.orders,
        &state.metrics,
        state.config.stale_reservation,
    )
    .await
    .unwrap();

    assert_eq!(released, 1);
    assert_eq!(driver(&state, "d-1").await.status, DriverStatus::Available);
}

async fn wait_for_status(state: &AppState, order_id: &OrderId, status: OrderStatus) -> Order {
    for _ in 0..200 {
        let current = order(state, order_id).await;
        if current.status == status {
            return current;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("order {order_id} never reached {status:?}");
}

#[tokio::test]
async fn dispatch_worker_assigns_queued_orders() {
    let (state, rx) = setup();
    tokio::spawn(run_dispatch_worker(state.clone(), rx));
    add_driver(&state, "d-1", PICKUP.lat).await;

    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;
    enqueue_dispatch(&state, DispatchRequest::new(order_id.clone()))
        .await
        .unwrap();

    let assigned = wait_for_status(&state, &order_id, OrderStatus::OutForDelivery).await;
    assert_eq!(assigned.assigned_driver, Some(DriverId::from("d-1")));
    assert_eq!(state.coordinator.assignment_count(), 1);
}

#[tokio::test]
async fn dispatch_worker_retries_when_no_driver() {
    let (state, rx) = setup();
    tokio::spawn(run_dispatch_worker(state.clone(), rx));

    let order_id = prepared_order(&state, "o-1", PaymentMethod::Card).await;
    enqueue_dispatch(&state, DispatchRequest::new(order_id.clone()))
        .await
        .unwrap();
    sleep(Duration::from_millis(5)).await;
    add_driver(&state, "d-1", PICKUP.lat).await;

    let assigned = wait_for_status(&state, &order_id, OrderStatus::OutForDelivery).await;
    assert_eq!(assigned.assigned_driver, Some(DriverId::from("d-1")));
}
