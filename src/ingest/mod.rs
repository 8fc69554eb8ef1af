//! Multi-source streaming ingestion.
//!
//! [`StreamController`] runs at most one streaming fetch at a time, restarting it
//! with exponential backoff after transport failures and accumulating articles
//! across sources and retries.

mod backoff;
mod controller;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use controller::{
    StreamController, StreamOutcome, StreamProgress, StreamSnapshot, StreamStatus, StreamUpdate,
};
