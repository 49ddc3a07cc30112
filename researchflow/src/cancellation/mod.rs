//! Cooperative cancellation.
//!
//! Cancelling a task never force-terminates a capability call: the token is
//! handed to every invocation and capabilities observe it at their own pace.

mod token;

pub use token::{CancelCallback, CancellationToken};
