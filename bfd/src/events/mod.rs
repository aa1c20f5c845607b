//! Lifecycle event fan-out

pub mod bus;
pub mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use types::SchedulerEvent;
