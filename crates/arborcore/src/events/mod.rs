// crates/arborcore/src/events/mod.rs

mod bus;
mod event;
mod observer;

pub use bus::{BusMessage, EventBus};
pub use event::WorkflowEvent;
pub use observer::WorkflowObserver;
