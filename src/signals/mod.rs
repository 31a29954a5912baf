//! Request lifecycle signals.
//!
//! Handlers registered through a [`SignalWrapper`] report each call to a
//! [`SignalBus`] as started, then either finished or failed.

mod bus;
mod wrapper;

pub use bus::{BoxError, LifecycleEvent, Receiver, RequestInfo, Signal, SignalBus};
pub use wrapper::{with_signals, SignalWrapper};
