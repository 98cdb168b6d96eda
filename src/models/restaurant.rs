use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::models::ids::RestaurantId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Restaurant {
    pub id: RestaurantId,
    pub name: String,
    pub location: GeoPoint,
    /// Falls back to the configured default radius when absent.
    pub delivery_radius_m: Option<f64>,
}
