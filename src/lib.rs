//! spoolq: Embedded Persistent FIFO Work Queue
//!
//! A fast, single-process work queue that survives restarts. Producers
//! submit records; a pool of workers consumes them. When a worker is idle
//! the record is handed over directly without touching disk; when all
//! workers are busy the record spills to an embedded LMDB store and is
//! drained back out in FIFO order. Failed records retry with fixed or
//! exponential backoff, and a bounded admission semaphore keeps the
//! total number of live records under control.
//!
//! # Architecture
//!
//! ```text
//! producer ──▶ admission semaphore ──▶ submit path
//!                                        │
//!                     spill empty? ──────┤
//!                    ┌── yes: offer ─────┴── no: append ──┐
//!                    ▼                                    ▼
//!             transfer channel ◀───── pump ◀────── spill store (LMDB)
//!                    │
//!                    ▼
//!               worker pool ──▶ verdict: Success | FailRequeue | FailNoQueue
//!                                  │            │
//!                                  │            ▼
//!                                  │      retry scheduler (backoff heap)
//!                                  ▼
//!                          ack spill entry, release permit
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use spoolq::{Consumer, QueueConfig, SpoolQueue, Verdict};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Job {
//!     id: u64,
//! }
//!
//! struct JobConsumer;
//!
//! #[async_trait]
//! impl Consumer<Job> for JobConsumer {
//!     async fn consume(&self, job: &Job) -> Verdict {
//!         println!("processing job {}", job.id);
//!         Verdict::Success
//!     }
//! }
//!
//! # async fn example() -> Result<(), spoolq::QueueError> {
//! let config = QueueConfig::new("jobs", "/var/lib/myapp/queue", Arc::new(JobConsumer))
//!     .max_queue_size(10_000)
//!     .workers(4);
//! let queue = SpoolQueue::new(config)?;
//! queue.start().await?;
//!
//! queue.submit(Job { id: 1 })?;
//!
//! // ... later
//! queue.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Delivery contract
//!
//! Within one producer, records are delivered in submit order; when the
//! spill store is nonempty, the queue drains it before accepting new
//! fast-path hand-offs so FIFO order holds across the spill boundary.
//! Delivery is at-most-once per successful in-memory consume and
//! at-least-once across a crash: a spill entry is only removed after its
//! verdict, so an interrupted process re-delivers whatever was in flight.

mod channel;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
mod processor;
mod queue;
mod retry;
mod semaphore;
mod store;
mod worker;

pub use codec::{Codec, Envelope, JsonCodec};
pub use config::QueueConfig;
pub use consumer::{Consumer, Expiration, Verdict};
pub use error::{QueueError, QueueResult};
pub use processor::FatalError;
pub use queue::SpoolQueue;
pub use retry::RetryAlgorithm;
