use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;
use crate::geo::{haversine_m, GeoPoint};
use crate::models::driver::Driver;
use crate::models::ids::DriverId;
use crate::store::DriverStore;

/// Ordering among drivers at the same distance (centimeter resolution).
/// Driver id is always the last key so the ranking is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    MostRecentlyActive,
    DriverId,
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "recent" | "most_recently_active" => Ok(TieBreak::MostRecentlyActive),
            "driver_id" | "id" => Ok(TieBreak::DriverId),
            other => Err(format!("unknown tie break {other}, expected recent/driver_id")),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Candidate {
    pub driver_id: DriverId,
    pub distance_m: f64,
    pub last_active_at: DateTime<Utc>,
}

impl Candidate {
    fn from_driver(driver: &Driver, location: &GeoPoint, pickup: &GeoPoint) -> Self {
        Self {
            driver_id: driver.id.clone(),
            distance_m: haversine_m(pickup, location),
            last_active_at: driver.last_active_at,
        }
    }

    fn distance_cm(&self) -> i64 {
        (self.distance_m * 100.0).round() as i64
    }
}

/// Ranked candidates from a single query. Consumed once; query again for fresh state.
#[derive(Debug)]
pub struct Candidates {
    inner: std::vec::IntoIter<Candidate>,
}

impl Candidates {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl Iterator for Candidates {
    type Item = Candidate;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

pub struct GeoMatcher {
    drivers: Arc<dyn DriverStore>,
    tie_break: TieBreak,
    max_candidates: usize,
}

impl GeoMatcher {
    pub fn new(drivers: Arc<dyn DriverStore>, tie_break: TieBreak, max_candidates: usize) -> Self {
        Self {
            drivers,
            tie_break,
            max_candidates,
        }
    }

    pub async fn find_candidates(&self, pickup: GeoPoint, radius_m: f64) -> Result<Candidates, AppError> {
        if !pickup.is_valid() {
            return Err(AppError::BadRequest(format!("invalid pickup point {pickup:?}")));
        }
        if !(radius_m.is_finite() && radius_m > 0.0) {
            return Err(AppError::BadRequest(format!("invalid search radius {radius_m}")));
        }

        let nearby = self.drivers.available_within(pickup, radius_m).await?;
        let candidates = nearby
            .iter()
            .filter_map(|driver| {
                let location = driver.location?;
                let candidate = Candidate::from_driver(driver, &location, &pickup);
                (candidate.distance_m <= radius_m).then_some(candidate)
            })
            .collect();

        Ok(Candidates {
            inner: rank(candidates, self.tie_break, self.max_candidates).into_iter(),
        })
    }
}

pub fn rank(mut candidates: Vec<Candidate>, tie_break: TieBreak, limit: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| compare(a, b, tie_break));
    candidates.truncate(limit);
    candidates
}

fn compare(a: &Candidate, b: &Candidate, tie_break: TieBreak) -> Ordering {
    let by_distance = a.distance_cm().cmp(&b.distance_cm());
    let by_policy = match tie_break {
        TieBreak::MostRecentlyActive => b.last_active_at.cmp(&a.last_active_at),
        TieBreak::DriverId => Ordering::Equal,
    };

    by_distance
        .then(by_policy)
        .then_with(|| a.driver_id.cmp(&b.driver_id))
}
