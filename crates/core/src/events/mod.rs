//! # Events
//!
//! Typed pub/sub used by every kernel component to report progress.

pub mod bus;
pub mod event;

pub use bus::{DeadLetter, EventBus, EventBusStats, EventFilter, EventHandler, SubscriptionId};
pub use event::{Event, EventKind};
