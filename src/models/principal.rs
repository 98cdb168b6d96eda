use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::ids::DriverId;
use crate::models::order::Order;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Restaurant,
    Delivery,
    Admin,
    /// Internal callers such as the dispatch worker and the payment webhook.
    System,
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "restaurant" => Ok(Role::Restaurant),
            "delivery" => Ok(Role::Delivery),
            "admin" => Ok(Role::Admin),
            "system" => Ok(Role::System),
            other => Err(AppError::Unauthorized(format!("unknown role: {other}"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Role::Customer => "customer",
            Role::Restaurant => "restaurant",
            Role::Delivery => "delivery",
            Role::Admin => "admin",
            Role::System => "system",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn system(component: &str) -> Self {
        Self::new(component, Role::System)
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Admin | Role::System)
    }

    pub fn require_privileged(&self) -> Result<(), AppError> {
        if self.is_privileged() {
            Ok(())
        } else {
            Err(self.forbidden("requires admin role"))
        }
    }

    /// Drivers may only act on their own record.
    pub fn require_driver(&self, driver_id: &DriverId) -> Result<(), AppError> {
        if self.is_privileged() || (self.role == Role::Delivery && self.id == driver_id.as_str()) {
            Ok(())
        } else {
            Err(self.forbidden(&format!("cannot act for driver {driver_id}")))
        }
    }

    pub fn owns_restaurant_of(&self, order: &Order) -> bool {
        self.role == Role::Restaurant && self.id == order.restaurant_id.as_str()
    }

    pub fn is_assigned_driver_of(&self, order: &Order) -> bool {
        self.role == Role::Delivery
            && order
                .assigned_driver
                .as_ref()
                .is_some_and(|driver| driver.as_str() == self.id)
    }

    pub fn is_customer_of(&self, order: &Order) -> bool {
        self.role == Role::Customer && self.id == order.customer_id
    }

    pub fn require_restaurant_of(&self, order: &Order) -> Result<(), AppError> {
        if self.is_privileged() || self.owns_restaurant_of(order) {
            Ok(())
        } else {
            Err(self.forbidden(&format!("not the restaurant for order {}", order.id)))
        }
    }

    /// Anyone party to the order: its customer, restaurant, assigned driver, or an admin.
    pub fn require_party_to(&self, order: &Order) -> Result<(), AppError> {
        if self.is_privileged()
            || self.is_customer_of(order)
            || self.owns_restaurant_of(order)
            || self.is_assigned_driver_of(order)
        {
            Ok(())
        } else {
            Err(self.forbidden(&format!("not a party to order {}", order.id)))
        }
    }

    fn forbidden(&self, detail: &str) -> AppError {
        AppError::Forbidden(format!("{} {} {detail}", self.role, self.id))
    }
}
