//! Progress events.
//!
//! The [`EventBus`] keeps one append-only log per task and serves it to
//! subscribers as a resumable stream. [`EventSink`]s observe every
//! published event for logging or analytics.

mod bus;
mod sink;

pub use bus::{EventBus, EventStream};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
