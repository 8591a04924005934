//! Consumer Callbacks and Verdicts
//!
//! The queue does not know what processing a record means. Applications
//! supply a [`Consumer`] through configuration; for every delivered record
//! it returns a [`Verdict`] that drives acknowledgement, permit release,
//! and retry scheduling. An optional [`Expiration`] callback observes
//! records that exhausted their retry budget.

use async_trait::async_trait;

/// Outcome of processing a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The record was processed. Its spill entry (if any) is acknowledged
    /// and one admission permit is released.
    Success,
    /// Processing failed and the record should be retried later. The
    /// admission permit is retained until the record reaches a terminal
    /// verdict, so records stuck in retry still count against
    /// `max_queue_size`.
    FailRequeue,
    /// Processing failed and the record should be discarded. The spill
    /// entry is acknowledged and the permit released.
    FailNoQueue,
}

/// Processing callback invoked by the worker pool.
///
/// The queue retains ownership of the record so it can be re-queued on
/// [`Verdict::FailRequeue`]; consumers receive a shared reference.
///
/// A panic inside `consume` is caught, logged, and treated as
/// [`Verdict::FailNoQueue`]. It is never promoted to a queue error.
#[async_trait]
pub trait Consumer<T>: Send + Sync {
    async fn consume(&self, record: &T) -> Verdict;
}

/// Callback invoked when a record exceeds the configured `max_tries`.
///
/// The record is terminal at this point, so it is handed over by value.
#[async_trait]
pub trait Expiration<T>: Send + Sync {
    async fn expired(&self, record: T);
}
