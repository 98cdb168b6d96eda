use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::engine::assignment::{AssignmentCoordinator, CoordinatorSettings};
use crate::engine::lifecycle::OrderLifecycle;
use crate::engine::queue::DispatchRequest;
use crate::engine::registry::DriverRegistry;
use crate::engine::tracking::TrackingLog;
use crate::notify::{BroadcastNotifier, FanoutNotifier, Notifier};
use crate::observability::metrics::Metrics;
use crate::store::Stores;

pub struct AppState {
    pub config: Config,
    pub stores: Stores,
    pub registry: DriverRegistry,
    pub lifecycle: Arc<OrderLifecycle>,
    pub coordinator: AssignmentCoordinator,
    pub tracking: Arc<TrackingLog>,
    pub events: Arc<BroadcastNotifier>,
    pub dispatch_tx: mpsc::Sender<DispatchRequest>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config) -> (Self, mpsc::Receiver<DispatchRequest>) {
        Self::with_stores(config, Stores::in_memory(), None)
    }

    /// `notifier` receives every event in addition to the in-process broadcast.
    pub fn with_stores(
        config: Config,
        stores: Stores,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> (Self, mpsc::Receiver<DispatchRequest>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_size);
        let metrics = Metrics::new();

        let events = Arc::new(BroadcastNotifier::new(config.event_buffer_size));
        let broadcast: Arc<dyn Notifier> = events.clone();
        let notifier: Arc<dyn Notifier> = match notifier {
            Some(extra) => Arc::new(FanoutNotifier::new(vec![broadcast, extra])),
            None => broadcast,
        };

        let tracking = Arc::new(TrackingLog::new(
            stores.orders.clone(),
            stores.tracking.clone(),
            metrics.clone(),
            config.event_buffer_size,
        ));
        let registry = DriverRegistry::new(
            stores.drivers.clone(),
            tracking.clone(),
            config.tie_break,
        );
        let lifecycle = Arc::new(OrderLifecycle::new(
            stores.orders.clone(),
            stores.drivers.clone(),
            stores.restaurants.clone(),
            notifier.clone(),
            metrics.clone(),
            config.max_cas_retries,
            config.notify_timeout,
        ));
        let coordinator = AssignmentCoordinator::new(
            &stores,
            lifecycle.clone(),
            notifier,
            metrics.clone(),
            CoordinatorSettings::from(&config),
        );

        (
            Self {
                config,
                stores,
                registry,
                lifecycle,
                coordinator,
                tracking,
                events,
                dispatch_tx,
                metrics,
            },
            dispatch_rx,
        )
    }
}
