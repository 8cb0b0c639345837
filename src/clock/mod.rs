//! Clock recovery
//!
//! Reconciles the host wall clock with the bus sequence counter (and, for
//! asynchronous endpoints, with the device's own sample clock).

pub mod feedback;
pub mod filter;
pub mod recovery;

pub use feedback::{decode_feedback, FeedbackTracker};
pub use filter::{DampedFilter, FilterState, FilterUpdate};
pub use recovery::{Anchor, AnchorReader, ClockRecovery};
