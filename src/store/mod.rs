//! Crash-recoverable persistence: queued values, job records, and the
//! single polled state event.

pub mod jobs;
pub mod values;

pub use jobs::{JobStore, StateEvent, StateName, StoreError};
