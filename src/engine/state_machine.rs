use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::ids::DriverId;
use crate::models::order::{Order, OrderStatus, PaymentMethod, PaymentStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Confirm,
    StartPreparing,
    MarkPrepared,
    /// Driver reserved by the assignment coordinator.
    Dispatch { driver_id: DriverId },
    Deliver,
    Cancel { reason: String },
}

impl Transition {
    pub const fn target(&self) -> OrderStatus {
        match self {
            Transition::Confirm => OrderStatus::Confirmed,
            Transition::StartPreparing => OrderStatus::Preparing,
            Transition::MarkPrepared => OrderStatus::Prepared,
            Transition::Dispatch { .. } => OrderStatus::OutForDelivery,
            Transition::Deliver => OrderStatus::Delivered,
            Transition::Cancel { .. } => OrderStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot move order from {from:?} to {to:?}")]
    NotAllowed { from: OrderStatus, to: OrderStatus },

    #[error("order already has driver {0} assigned")]
    DriverAlreadyAssigned(DriverId),

    #[error("cash on delivery payment has not been collected (payment status {0:?})")]
    PaymentNotCollected(PaymentStatus),

    #[error("cancellation requires a non-empty reason")]
    MissingReason,
}

/// Whether the status graph has an edge `from -> to`, ignoring guards.
pub const fn is_allowed(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;

    match (from, to) {
        (Pending, Confirmed)
        | (Confirmed, Preparing)
        | (Preparing, Prepared)
        | (Prepared, OutForDelivery)
        | (OutForDelivery, Delivered) => true,
        (from, Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

/// Returns the next order, or an error leaving `order` untouched. Persisting is the caller's job.
pub fn apply(order: &Order, transition: &Transition, at: DateTime<Utc>) -> Result<Order, TransitionError> {
    let to = transition.target();
    if !is_allowed(order.status, to) {
        return Err(TransitionError::NotAllowed {
            from: order.status,
            to,
        });
    }

    let mut next = order.clone();
    next.status = to;

    match transition {
        Transition::Confirm | Transition::StartPreparing | Transition::MarkPrepared => {}
        Transition::Dispatch { driver_id } => {
            if let Some(existing) = &order.assigned_driver {
                return Err(TransitionError::DriverAlreadyAssigned(existing.clone()));
            }
            next.assigned_driver = Some(driver_id.clone());
            next.assigned_at = Some(at);
        }
        Transition::Deliver => {
            if order.payment_method == PaymentMethod::CashOnDelivery
                && order.payment_status != PaymentStatus::Completed
            {
                return Err(TransitionError::PaymentNotCollected(order.payment_status));
            }
            next.delivered_at = Some(at);
        }
        Transition::Cancel { reason } => {
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(TransitionError::MissingReason);
            }
            next.cancellation_reason = Some(reason.to_string());
            next.cancelled_at = Some(at);
            next.assigned_driver = None;
        }
    }

    Ok(next)
}
