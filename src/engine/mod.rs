pub mod assignment;
pub mod lifecycle;
pub mod matcher;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod state_machine;
pub mod tracking;
