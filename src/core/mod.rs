//! Core loop building blocks - events and timers
//!
//! These modules carry no domain state; the service wires them together.

pub mod event_bus;
pub mod sync_events;
pub mod timer;

// Re-exports for convenience
pub use event_bus::{BoxedEvent, EventBus, downcast_event};
pub use timer::Timer;
