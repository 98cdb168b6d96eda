use crate::error::AppError;
use crate::models::ids::OrderId;
use crate::state::AppState;

/// "Notify delivery agents" trigger for one order.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub order_id: OrderId,
    /// Zero for the first trigger; bumped on each re-queue.
    pub attempt: u32,
}

impl DispatchRequest {
    pub fn new(order_id: OrderId) -> Self {
        Self {
            order_id,
            attempt: 0,
        }
    }
}

pub async fn enqueue_dispatch(state: &AppState, request: DispatchRequest) -> Result<(), AppError> {
    // Counted before sending so the worker's decrement never runs first.
    state.metrics.dispatch_queue_depth.inc();
    state.dispatch_tx.send(request).await.map_err(|err| {
        state.metrics.dispatch_queue_depth.dec();
        AppError::Internal(format!("dispatch queue send failed: {err}"))
    })
}
