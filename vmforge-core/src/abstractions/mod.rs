//! Abstractions over time and cancellation so lifecycle code can be tested
//! deterministically.

pub mod cancel;
pub mod time;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use time::{Clock, MockClock, SystemClock};
