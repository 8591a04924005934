//! Queue Configuration
//!
//! A consuming builder gathering everything the queue needs before
//! `start()`: identity (name and directory), the consumer callback, and
//! the admission/retry/storage tuning knobs. Validation happens in
//! `SpoolQueue::new` before any side effect, so a misconfigured queue
//! never touches the filesystem.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Codec, JsonCodec};
use crate::consumer::{Consumer, Expiration};
use crate::error::{QueueError, QueueResult};
use crate::retry::RetryAlgorithm;

/// Default admission ceiling: effectively unbounded.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = usize::MAX >> 3;

/// Default LMDB map size (1 GiB). The map is sparse, so this is an upper
/// bound on store growth rather than an allocation.
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

/// Configuration for a [`SpoolQueue`](crate::SpoolQueue).
pub struct QueueConfig<T> {
    pub(crate) queue_name: String,
    pub(crate) queue_path: PathBuf,
    pub(crate) consumer: Arc<dyn Consumer<T>>,
    pub(crate) expiration: Option<Arc<dyn Expiration<T>>>,
    pub(crate) codec: Arc<dyn Codec<T>>,
    pub(crate) max_queue_size: usize,
    pub(crate) max_tries: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) max_retry_delay: Duration,
    pub(crate) retry_algorithm: RetryAlgorithm,
    pub(crate) persist_retry_delay: Duration,
    pub(crate) workers: usize,
    pub(crate) map_size: usize,
}

impl<T> QueueConfig<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start a configuration with the required fields and the default
    /// JSON codec. `queue_name` doubles as the map name inside the
    /// store, so it must be unique among queues sharing a directory.
    pub fn new(
        queue_name: impl Into<String>,
        queue_path: impl Into<PathBuf>,
        consumer: Arc<dyn Consumer<T>>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            queue_path: queue_path.into(),
            consumer,
            expiration: None,
            codec: Arc::new(JsonCodec::new()),
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_tries: 0,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            retry_algorithm: RetryAlgorithm::Fixed,
            persist_retry_delay: Duration::from_secs(1),
            workers: default_workers(),
            map_size: DEFAULT_MAP_SIZE,
        }
    }
}

impl<T> QueueConfig<T> {
    /// Callback invoked when a record exceeds `max_tries`.
    pub fn expiration(mut self, expiration: Arc<dyn Expiration<T>>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Replace the default JSON codec.
    pub fn codec(mut self, codec: Arc<dyn Codec<T>>) -> Self {
        self.codec = codec;
        self
    }

    /// Admission ceiling. Note that `start()` pre-acquires one permit per
    /// entry already on disk (capped at this ceiling), so a queue
    /// restarted on top of a large backlog accepts no new submits until
    /// the backlog drains.
    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Retry cap for records whose consumer returns `FailRequeue`.
    /// Zero means retry forever.
    pub fn max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Base delay between in-memory retries.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Upper bound for exponential backoff.
    pub fn max_retry_delay(mut self, max_retry_delay: Duration) -> Self {
        self.max_retry_delay = max_retry_delay;
        self
    }

    pub fn retry_algorithm(mut self, retry_algorithm: RetryAlgorithm) -> Self {
        self.retry_algorithm = retry_algorithm;
        self
    }

    /// Interval between idempotent rescans of the spill store.
    pub fn persist_retry_delay(mut self, persist_retry_delay: Duration) -> Self {
        self.persist_retry_delay = persist_retry_delay;
        self
    }

    /// Worker pool size. Defaults to the available parallelism.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// LMDB map size in bytes; the hard ceiling on store growth.
    /// Exceeding it surfaces as `QueueError::NoSpace`.
    pub fn map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    pub(crate) fn validate(&self) -> QueueResult<()> {
        if self.queue_name.is_empty() {
            return Err(QueueError::invalid_arg("queue_name cannot be empty"));
        }
        if self.queue_path.as_os_str().is_empty() {
            return Err(QueueError::invalid_arg("queue_path cannot be empty"));
        }
        if self.max_queue_size == 0 {
            return Err(QueueError::invalid_arg("max_queue_size must be at least 1"));
        }
        if self.workers == 0 {
            return Err(QueueError::invalid_arg("workers must be at least 1"));
        }
        if self.map_size == 0 {
            return Err(QueueError::invalid_arg("map_size must be nonzero"));
        }
        if self.retry_algorithm == RetryAlgorithm::Exponential
            && self.max_retry_delay < self.retry_delay
        {
            return Err(QueueError::invalid_arg(
                "max_retry_delay must be at least retry_delay for exponential backoff",
            ));
        }
        if self.persist_retry_delay.is_zero() {
            return Err(QueueError::invalid_arg(
                "persist_retry_delay must be nonzero",
            ));
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
