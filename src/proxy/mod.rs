//! The connection-steering engine.
//!
//! ## Architecture
//!
//! ```text
//! authenticated socket -> Trafficker -> AdmissionLimiter (admit)
//!                                    -> GroupTracker     (select least-connections)
//!                                    -> dial_with_backoff
//!                                    -> pump              (until either side closes)
//!                                    -> GroupTracker / AdmissionLimiter (decrement)
//! ```
//!
//! Orthogonally, the health monitor probes every upstream each tick and
//! reconciles its membership in the group tracker's heap.

mod dial;
mod heap;
mod health;
mod limiter;
mod pump;
mod tracker;
mod trafficker;

pub use dial::dial_with_backoff;
pub use limiter::AdmissionLimiter;
pub use pump::{bidirectional, is_benign_close, DirectionOutcome, PumpOutcome};
pub use tracker::GroupTracker;
pub use trafficker::Trafficker;
