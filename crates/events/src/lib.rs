//! Notification transport for job lifecycle events.
//!
//! The bus only distributes messages; status records in the job store remain
//! the source of truth.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
