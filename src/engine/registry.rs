use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::engine::matcher::{rank, Candidate, TieBreak};
use crate::engine::tracking::TrackingLog;
use crate::error::AppError;
use crate::geo::{haversine_m, GeoPoint};
use crate::models::driver::{Driver, DriverStatus, StatusChange};
use crate::models::ids::DriverId;
use crate::models::principal::Principal;
use crate::store::{CasOutcome, DriverStore};

const MAX_STATUS_RETRIES: u32 = 3;

pub struct DriverRegistry {
    drivers: Arc<dyn DriverStore>,
    tracking: Arc<TrackingLog>,
    tie_break: TieBreak,
}

impl DriverRegistry {
    pub fn new(drivers: Arc<dyn DriverStore>, tracking: Arc<TrackingLog>, tie_break: TieBreak) -> Self {
        Self {
            drivers,
            tracking,
            tie_break,
        }
    }

    /// Idempotent registration. An existing record is returned untouched.
    pub async fn upsert_driver(
        &self,
        principal: &Principal,
        driver_id: &DriverId,
        initial_position: Option<GeoPoint>,
    ) -> Result<Driver, AppError> {
        principal.require_driver(driver_id)?;
        if let Some(position) = initial_position {
            validate_position(&position)?;
        }

        let driver = self
            .drivers
            .insert_if_absent(Driver::new(driver_id.clone(), initial_position, Utc::now()))
            .await?;

        debug!(driver_id = %driver.id, status = ?driver.status, "driver ensured");
        Ok(driver)
    }

    /// Toggles between `Available` and `Offline`. `Busy` is owned by the
    /// reservation path and cannot be set or cleared here.
    pub async fn update_status(
        &self,
        principal: &Principal,
        driver_id: &DriverId,
        status: DriverStatus,
    ) -> Result<Driver, AppError> {
        principal.require_driver(driver_id)?;
        if status == DriverStatus::Busy {
            return Err(AppError::BadRequest(
                "busy is set only by order assignment".to_string(),
            ));
        }

        for _ in 0..MAX_STATUS_RETRIES {
            let current = self.get_by_id(driver_id).await?;

            if current.status == status {
                return Ok(current);
            }
            if current.status == DriverStatus::Busy {
                let order = current
                    .active_order
                    .as_ref()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string);
                return Err(AppError::Conflict(format!(
                    "driver {driver_id} is busy with order {order}"
                )));
            }
            if status == DriverStatus::Available && current.location.is_none() {
                return Err(AppError::BadRequest(format!(
                    "driver {driver_id} has no known position"
                )));
            }

            let change = StatusChange {
                expected: current.status,
                next: status,
                active_order: None,
                reservation_id: None,
                at: Utc::now(),
            };
            match self.drivers.compare_and_set_status(driver_id, change).await? {
                CasOutcome::Applied(driver) => {
                    info!(driver_id = %driver_id, from = ?current.status, to = ?status, "driver status updated");
                    return Ok(driver);
                }
                CasOutcome::Conflict(_) => continue,
                CasOutcome::Missing => {
                    return Err(AppError::NotFound(format!("driver {driver_id} not found")));
                }
            }
        }

        Err(AppError::Conflict(format!(
            "driver {driver_id} status changed concurrently"
        )))
    }

    /// Always accepted. While the driver holds an out-for-delivery order the
    /// position is also appended to that order's tracking log. Activity is
    /// stamped with the server's receive time; `recorded_at` only orders the trail.
    pub async fn update_position(
        &self,
        principal: &Principal,
        driver_id: &DriverId,
        position: GeoPoint,
        recorded_at: DateTime<Utc>,
    ) -> Result<Driver, AppError> {
        principal.require_driver(driver_id)?;
        validate_position(&position)?;

        let driver = self
            .drivers
            .set_location(driver_id, position, Utc::now())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;

        if let Some(order_id) = driver.active_order.as_ref() {
            match self
                .tracking
                .append_for_driver(driver_id, order_id, position, recorded_at)
                .await
            {
                Ok(_) => {}
                Err(AppError::OrderNotTrackable(_)) => {
                    debug!(driver_id = %driver_id, order_id = %order_id, "position not tracked");
                }
                Err(err) => {
                    warn!(driver_id = %driver_id, order_id = %order_id, error = %err, "failed to record tracking entry");
                }
            }
        }

        Ok(driver)
    }

    pub async fn get_by_id(&self, driver_id: &DriverId) -> Result<Driver, AppError> {
        self.drivers
            .get(driver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))
    }

    pub async fn list(&self, principal: &Principal) -> Result<Vec<Driver>, AppError> {
        principal.require_privileged()?;
        let mut drivers = self.drivers.list().await?;
        drivers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(drivers)
    }

    /// Available drivers within `radius_m`, in the same order the matcher
    /// offers them.
    pub async fn query_available_near(
        &self,
        point: GeoPoint,
        radius_m: f64,
    ) -> Result<Vec<(Driver, f64)>, AppError> {
        validate_position(&point)?;
        if !(radius_m.is_finite() && radius_m > 0.0) {
            return Err(AppError::BadRequest(format!("invalid search radius {radius_m}")));
        }
        let mut by_id: HashMap<DriverId, Driver> = HashMap::new();
        let mut candidates = Vec::new();
        for driver in self.drivers.available_within(point, radius_m).await? {
            let Some(location) = driver.location else {
                continue;
            };
            candidates.push(Candidate {
                driver_id: driver.id.clone(),
                distance_m: haversine_m(&point, &location),
                last_active_at: driver.last_active_at,
            });
            by_id.insert(driver.id.clone(), driver);
        }

        Ok(rank(candidates, self.tie_break, usize::MAX)
            .into_iter()
            .filter_map(|candidate| {
                let driver = by_id.remove(&candidate.driver_id)?;
                Some((driver, candidate.distance_m))
            })
            .collect())
    }
}

fn validate_position(position: &GeoPoint) -> Result<(), AppError> {
    if position.is_valid() {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("invalid position {position:?}")))
    }
}
