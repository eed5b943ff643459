//! Reconnect policy and failure bookkeeping.
//!
//! - [`ReconnectPolicy`]: pure `attempt_count -> delay` function
//! - [`RetryState`]: attempt count and next eligible time
//! - [`FailureHistory`]: bounded, timestamped failure log
//!
//! Each state machine (network associator, channel supervisor) owns its own
//! `RetryState` and `FailureHistory` and consults a shared policy value.

mod history;
mod policy;

pub use history::{FailureEvent, FailureHistory, FailureKind, FailureLayer};
pub use policy::{ReconnectPolicy, RetryState};
