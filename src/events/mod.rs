//! Event Bus (C6).

pub mod bus;
pub mod payload;

pub use bus::{EventBus, Subscription, TopicFilter};
pub use payload::{Event, EventPayload};
