//! Channel delivery workers.
//!
//! One worker pool per channel consumes that channel's queue, claims
//! the notification record, renders it, hands it to the transport, and
//! maps the outcome back onto the state machine with retry/backoff and
//! dead-letter semantics.

pub mod backoff;
pub mod worker;

pub use backoff::ExponentialBackoff;
pub use worker::{DeliveryDisposition, DeliveryWorker, WorkerPool};
