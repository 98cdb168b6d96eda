use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::models::driver::{Driver, DriverStatus};
use crate::models::order::Order;
use crate::observability::metrics::Metrics;
use crate::state::AppState;
use crate::store::{CasOutcome, DriverStore, OrderStore};

fn is_orphaned(driver: &Driver, order: Option<&Order>, stale_after: Duration, now: DateTime<Utc>) -> bool {
    let Some(order) = order else {
        return true;
    };

    if order.status.is_terminal() {
        return true;
    }

    match &order.assigned_driver {
        Some(assigned) => assigned != &driver.id,
        None => {
            // Reservation not yet committed; give the coordinator time to finish.
            let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
            driver
                .reserved_at
                .map_or(true, |reserved_at| now.signed_duration_since(reserved_at) > stale_after)
        }
    }
}

/// Frees drivers left `Busy` for an order that no longer references them.
pub async fn release_orphaned_reservations(
    drivers: &Arc<dyn DriverStore>,
    orders: &Arc<dyn OrderStore>,
    metrics: &Metrics,
    stale_after: Duration,
) -> Result<usize, AppError> {
    let now = Utc::now();
    let mut released = 0;

    for driver in drivers.list().await? {
        if driver.status != DriverStatus::Busy {
            continue;
        }
        let Some(order_id) = driver.active_order.clone() else {
            warn!(driver_id = %driver.id, "busy driver without an order reference");
            continue;
        };

        let order = orders.get(&order_id).await?;
        if !is_orphaned(&driver, order.as_ref(), stale_after, now) {
            continue;
        }

        if let CasOutcome::Applied(_) = drivers.release(&driver.id, &order_id, now).await? {
            released += 1;
            metrics.orphaned_reservations_released_total.inc();
            warn!(driver_id = %driver.id, order_id = %order_id, "released orphaned reservation");
        }
    }

    Ok(released)
}

pub async fn run_reconciler(state: Arc<AppState>) {
    info!(interval_secs = state.config.reconcile_interval.as_secs(), "reconciler started");
    let mut ticker = interval(state.config.reconcile_interval);

    loop {
        ticker.tick().await;
        if let Err(err) = release_orphaned_reservations(
            &state.stores.drivers,
            &state.stores.orders,
            &state.metrics,
            state.config.stale_reservation,
        )
        .await
        {
            error!(error = %err, "reconcile pass failed");
        }
    }
}
