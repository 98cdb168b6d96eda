use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::lifecycle::OrderLifecycle;
use crate::engine::matcher::{Candidate, GeoMatcher, TieBreak};
use crate::engine::queue::{enqueue_dispatch, DispatchRequest};
use crate::engine::state_machine::{self, Transition};
use crate::error::AppError;
use crate::models::assignment::Assignment;
use crate::models::driver::StatusChange;
use crate::models::ids::{DriverId, OrderId, RestaurantId};
use crate::models::order::Order;
use crate::models::principal::Principal;
use crate::notify::{self, DeliveryEvent, Notifier};
use crate::observability::metrics::Metrics;
use crate::state::AppState;
use crate::store::{CasOutcome, DriverStore, OrderStore, RestaurantDirectory, Stores};

const RELEASE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Assigned(Assignment),
    /// The order already has a driver; nothing was reserved or notified.
    AlreadyAssigned { order_id: OrderId, driver_id: DriverId },
    /// Another trigger holds a driver for this order and has not committed yet.
    InProgress { order_id: OrderId, driver_id: DriverId },
}

impl AssignmentOutcome {
    pub fn driver_id(&self) -> &DriverId {
        match self {
            AssignmentOutcome::Assigned(assignment) => &assignment.driver_id,
            AssignmentOutcome::AlreadyAssigned { driver_id, .. }
            | AssignmentOutcome::InProgress { driver_id, .. } => driver_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub default_radius_m: f64,
    pub tie_break: TieBreak,
    pub max_candidates: usize,
    pub reservation_timeout: Duration,
    pub candidate_query_timeout: Duration,
    pub max_cas_retries: u32,
    pub notify_timeout: Duration,
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_radius_m: config.default_delivery_radius_m,
            tie_break: config.tie_break,
            max_candidates: config.max_candidates,
            reservation_timeout: config.reservation_timeout,
            candidate_query_timeout: config.candidate_query_timeout,
            max_cas_retries: config.max_cas_retries,
            notify_timeout: config.notify_timeout,
        }
    }
}

enum Claim {
    Reserved(Uuid),
    Lost,
}

pub struct AssignmentCoordinator {
    orders: Arc<dyn OrderStore>,
    drivers: Arc<dyn DriverStore>,
    restaurants: Arc<dyn RestaurantDirectory>,
    matcher: GeoMatcher,
    lifecycle: Arc<OrderLifecycle>,
    notifier: Arc<dyn Notifier>,
    metrics: Metrics,
    assignments: DashMap<OrderId, Assignment>,
    settings: CoordinatorSettings,
}

impl AssignmentCoordinator {
    pub fn new(
        stores: &Stores,
        lifecycle: Arc<OrderLifecycle>,
        notifier: Arc<dyn Notifier>,
        metrics: Metrics,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            orders: stores.orders.clone(),
            drivers: stores.drivers.clone(),
            restaurants: stores.restaurants.clone(),
            matcher: GeoMatcher::new(
                stores.drivers.clone(),
                settings.tie_break,
                settings.max_candidates,
            ),
            lifecycle,
            notifier,
            metrics,
            assignments: DashMap::new(),
            settings,
        }
    }

    pub fn assignments(&self) -> Vec<Assignment> {
        let mut all: Vec<Assignment> = self
            .assignments
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at));
        all
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    /// Finds and claims a driver for a `Prepared` order. Safe to call
    /// repeatedly and concurrently for the same order.
    pub async fn assign(
        &self,
        principal: &Principal,
        order_id: &OrderId,
    ) -> Result<AssignmentOutcome, AppError> {
        let start = Instant::now();
        let result = self.try_assign(principal, order_id).await;

        let outcome = match &result {
            Ok(AssignmentOutcome::Assigned(_)) => "assigned",
            Ok(AssignmentOutcome::AlreadyAssigned { .. }) => "already_assigned",
            Ok(AssignmentOutcome::InProgress { .. }) => "in_progress",
            Err(AppError::NoDriverAvailable(_)) => "no_driver",
            Err(AppError::OrderNoLongerAssignable(_)) => "no_longer_assignable",
            Err(_) => "error",
        };
        self.metrics
            .assignment_latency_seconds
            .with_label_values(&[outcome])
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .assignments_total
            .with_label_values(&[outcome])
            .inc();

        result
    }

    async fn try_assign(
        &self,
        principal: &Principal,
        order_id: &OrderId,
    ) -> Result<AssignmentOutcome, AppError> {
        let order = self.load(order_id).await?;
        principal.require_restaurant_of(&order)?;
        if let Some(outcome) = already_assigned(&order) {
            debug!(order_id = %order_id, "order already has a driver");
            return Ok(outcome);
        }
        if !order.is_assignable() {
            return Err(AppError::InvalidTransition(format!(
                "order {order_id} is {:?}, expected Prepared",
                order.status
            )));
        }

        let radius_m = self.delivery_radius(&order.restaurant_id).await;
        let candidates = match timeout(
            self.settings.candidate_query_timeout,
            self.matcher.find_candidates(order.pickup, radius_m),
        )
        .await
        {
            Ok(found) => found?,
            Err(_) => {
                warn!(order_id = %order_id, "candidate query timed out");
                return self.exhausted(order_id).await;
            }
        };

        debug!(order_id = %order_id, candidates = candidates.len(), radius_m, "candidates found");

        let mut attempts = 0u32;
        for candidate in candidates {
            attempts = attempts.saturating_add(1);
            let claim = self.claim(&candidate.driver_id, order_id).await;
            match claim {
                Claim::Reserved(reservation_id) => {
                    return self.commit(order_id, candidate, reservation_id, attempts).await;
                }
                Claim::Lost => continue,
            }
        }

        self.exhausted(order_id).await
    }

    /// No candidate could be claimed. A sibling trigger for the same order may
    /// have won or may still hold a driver; only a driverless order is reported.
    async fn exhausted(&self, order_id: &OrderId) -> Result<AssignmentOutcome, AppError> {
        let order = self.load(order_id).await?;
        if let Some(outcome) = already_assigned(&order) {
            info!(order_id = %order_id, "order assigned by a concurrent trigger");
            return Ok(outcome);
        }
        if !order.is_assignable() {
            return Err(AppError::OrderNoLongerAssignable(order_id.clone()));
        }
        if let Some(holder) = self.drivers.reserved_for(order_id).await? {
            info!(order_id = %order_id, driver_id = %holder.id, "assignment in progress on another trigger");
            return Ok(AssignmentOutcome::InProgress {
                order_id: order_id.clone(),
                driver_id: holder.id,
            });
        }

        Err(self.no_driver(order_id).await)
    }

    async fn claim(&self, driver_id: &DriverId, order_id: &OrderId) -> Claim {
        let reservation_id = Uuid::new_v4();
        let change = StatusChange {
            reservation_id: Some(reservation_id),
            ..StatusChange::reserve(order_id.clone(), Utc::now())
        };
        match timeout(
            self.settings.reservation_timeout,
            self.drivers.compare_and_set_status(driver_id, change),
        )
        .await
        {
            Ok(Ok(CasOutcome::Applied(_))) => {
                debug!(order_id = %order_id, driver_id = %driver_id, "driver reserved");
                Claim::Reserved(reservation_id)
            }
            Ok(Ok(CasOutcome::Conflict(current))) => {
                self.metrics.reservation_conflicts_total.inc();
                debug!(
                    order_id = %order_id,
                    driver_id = %driver_id,
                    status = ?current.status,
                    "driver claimed concurrently; trying next candidate"
                );
                Claim::Lost
            }
            Ok(Ok(CasOutcome::Missing)) => Claim::Lost,
            Ok(Err(err)) => {
                warn!(order_id = %order_id, driver_id = %driver_id, error = %err, "reservation failed");
                Claim::Lost
            }
            Err(_) => {
                warn!(order_id = %order_id, driver_id = %driver_id, "reservation timed out");
                // The write may still land; only this token's reservation is undone.
                self.rollback(driver_id, reservation_id, order_id).await;
                Claim::Lost
            }
        }
    }

    async fn commit(
        &self,
        order_id: &OrderId,
        candidate: Candidate,
        reservation_id: Uuid,
        attempts: u32,
    ) -> Result<AssignmentOutcome, AppError> {
        let driver_id = candidate.driver_id.clone();
        let transition = Transition::Dispatch {
            driver_id: driver_id.clone(),
        };

        for _ in 0..=self.settings.max_cas_retries {
            let current = match self.orders.get(order_id).await {
                Ok(Some(order)) => order,
                Ok(None) => {
                    self.rollback(&driver_id, reservation_id, order_id).await;
                    return Err(AppError::NotFound(format!("order {order_id} not found")));
                }
                Err(err) => {
                    self.rollback(&driver_id, reservation_id, order_id).await;
                    return Err(err.into());
                }
            };

            if !current.is_assignable() {
                self.rollback(&driver_id, reservation_id, order_id).await;
                if let Some(outcome) = already_assigned(&current) {
                    info!(order_id = %order_id, "order assigned by a concurrent trigger");
                    return Ok(outcome);
                }
                info!(order_id = %order_id, status = ?current.status, "order changed during assignment");
                return Err(AppError::OrderNoLongerAssignable(order_id.clone()));
            }

            let next = match state_machine::apply(&current, &transition, Utc::now()) {
                Ok(next) => next,
                Err(err) => {
                    self.rollback(&driver_id, reservation_id, order_id).await;
                    return Err(err.into());
                }
            };

            match self.orders.compare_and_swap(next, current.version).await {
                Ok(CasOutcome::Applied(written)) => {
                    return Ok(self.finish(&current, &written, candidate, attempts).await);
                }
                Ok(CasOutcome::Conflict(_)) => continue,
                Ok(CasOutcome::Missing) => {
                    self.rollback(&driver_id, reservation_id, order_id).await;
                    return Err(AppError::NotFound(format!("order {order_id} not found")));
                }
                Err(err) => {
                    self.rollback(&driver_id, reservation_id, order_id).await;
                    return Err(err.into());
                }
            }
        }

        self.rollback(&driver_id, reservation_id, order_id).await;
        Err(AppError::Conflict(format!(
            "order {order_id} kept changing during assignment"
        )))
    }

    async fn finish(
        &self,
        before: &Order,
        after: &Order,
        candidate: Candidate,
        attempts: u32,
    ) -> AssignmentOutcome {
        let assignment = Assignment {
            id: Uuid::new_v4(),
            order_id: after.id.clone(),
            driver_id: candidate.driver_id,
            distance_m: candidate.distance_m,
            attempts,
            assigned_at: after.assigned_at.unwrap_or_else(Utc::now),
        };
        self.assignments
            .insert(assignment.order_id.clone(), assignment.clone());

        info!(
            order_id = %assignment.order_id,
            driver_id = %assignment.driver_id,
            distance_m = assignment.distance_m,
            attempts,
            "order assigned"
        );

        self.lifecycle.record_committed(before, after).await;
        notify::publish(
            &self.notifier,
            DeliveryEvent::DriverAssigned(assignment.clone()),
            self.settings.notify_timeout,
        )
        .await;

        AssignmentOutcome::Assigned(assignment)
    }

    /// Undoes one reservation. A driver since claimed by any other trigger,
    /// including one for the same order, is left alone.
    async fn rollback(&self, driver_id: &DriverId, reservation_id: Uuid, order_id: &OrderId) {
        for attempt in 1..=RELEASE_ATTEMPTS {
            match self
                .drivers
                .release_reservation(driver_id, reservation_id, Utc::now())
                .await
            {
                Ok(CasOutcome::Applied(_)) => {
                    info!(order_id = %order_id, driver_id = %driver_id, "reservation rolled back");
                    return;
                }
                Ok(_) => {
                    debug!(order_id = %order_id, driver_id = %driver_id, "no reservation to roll back");
                    return;
                }
                Err(err) => {
                    warn!(order_id = %order_id, driver_id = %driver_id, attempt, error = %err, "rollback failed");
                }
            }
        }
        error!(order_id = %order_id, driver_id = %driver_id, "reservation left for reconciler");
    }

    async fn no_driver(&self, order_id: &OrderId) -> AppError {
        info!(order_id = %order_id, "no driver available");
        notify::publish(
            &self.notifier,
            DeliveryEvent::NoDriverAvailable {
                order_id: order_id.clone(),
                at: Utc::now(),
            },
            self.settings.notify_timeout,
        )
        .await;
        AppError::NoDriverAvailable(order_id.clone())
    }

    async fn delivery_radius(&self, restaurant_id: &RestaurantId) -> f64 {
        match self.restaurants.get(restaurant_id).await {
            Ok(Some(restaurant)) => restaurant
                .delivery_radius_m
                .filter(|radius| radius.is_finite() && *radius > 0.0)
                .unwrap_or(self.settings.default_radius_m),
            Ok(None) => self.settings.default_radius_m,
            Err(err) => {
                warn!(restaurant_id = %restaurant_id, error = %err, "restaurant lookup failed; using default radius");
                self.settings.default_radius_m
            }
        }
    }

    async fn load(&self, order_id: &OrderId) -> Result<Order, AppError> {
        self.orders
            .get(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }
}

fn already_assigned(order: &Order) -> Option<AssignmentOutcome> {
    match (&order.assigned_driver, order.status.has_driver()) {
        (Some(driver_id), true) => Some(AssignmentOutcome::AlreadyAssigned {
            order_id: order.id.clone(),
            driver_id: driver_id.clone(),
        }),
        _ => None,
    }
}

/// Drains the dispatch queue, assigning orders concurrently. Requests that
/// find no driver are re-queued after a delay, a bounded number of times.
pub async fn run_dispatch_worker(state: Arc<AppState>, mut dispatch_rx: mpsc::Receiver<DispatchRequest>) {
    info!("dispatch worker started");
    let permits = Arc::new(Semaphore::new(state.config.dispatch_concurrency));
    let principal = Principal::system("dispatch-worker");

    while let Some(request) = dispatch_rx.recv().await {
        state.metrics.dispatch_queue_depth.dec();

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let state = state.clone();
        let principal = principal.clone();

        tokio::spawn(async move {
            let result = state.coordinator.assign(&principal, &request.order_id).await;
            drop(permit);

            match result {
                Ok(_) => {}
                Err(AppError::NoDriverAvailable(_))
                    if request.attempt.saturating_add(1) < state.config.max_redispatch_attempts =>
                {
                    sleep(state.config.redispatch_delay).await;
                    let retry = DispatchRequest {
                        order_id: request.order_id.clone(),
                        attempt: request.attempt.saturating_add(1),
                    };
                    info!(order_id = %retry.order_id, attempt = retry.attempt, "re-queueing dispatch");
                    if let Err(err) = enqueue_dispatch(&state, retry).await {
                        error!(order_id = %request.order_id, error = %err, "failed to re-queue dispatch");
                    }
                }
                Err(err) => {
                    warn!(order_id = %request.order_id, error = %err, "dispatch request dropped");
                }
            }
        });
    }

    warn!("dispatch worker stopped: queue channel closed");
}
