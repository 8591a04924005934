//! Public Queue API
//!
//! [`SpoolQueue`] is the embedding application's handle: configure,
//! start, submit, stop. Admission control lives here so a full queue is
//! rejected before any serialization or disk work happens. The handle is
//! cheaply cloneable; clones share the same queue.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::processor::{FatalError, QueueProcessor};
use crate::semaphore::{Acquire, AdjustableSemaphore};

const CREATED: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;
const STOPPING: u8 = 3;
const STOPPED: u8 = 4;

struct Inner<T> {
    state: AtomicU8,
    config: QueueConfig<T>,
    permits: Arc<AdjustableSemaphore>,
    processor: RwLock<Option<Arc<QueueProcessor<T>>>>,
    fatal_tx: watch::Sender<Option<FatalError>>,
    fatal_rx: watch::Receiver<Option<FatalError>>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

/// Embedded persistent FIFO work queue.
///
/// A queue instance moves through `Created -> Started -> Stopping ->
/// Stopped` exactly once; restart the application on the same
/// `queue_path` to resume a stopped queue's backlog.
pub struct SpoolQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SpoolQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SpoolQueue<T>
where
    T: Send + Sync + 'static,
{
    /// Validate the configuration and build a queue in the `Created`
    /// state. Nothing touches the filesystem until `start()`.
    pub fn new(config: QueueConfig<T>) -> QueueResult<Self> {
        config.validate()?;
        let permits = Arc::new(AdjustableSemaphore::new(config.max_queue_size));
        let (fatal_tx, fatal_rx) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(CREATED),
                config,
                permits,
                processor: RwLock::new(None),
                fatal_tx,
                fatal_rx,
                signal_task: Mutex::new(None),
            }),
        })
    }

    /// Open the spill store, account for any on-disk backlog, and launch
    /// the worker pool, retry scheduler, and pump. Fails with
    /// `AlreadyStarted` unless the queue is still `Created`.
    pub async fn start(&self) -> QueueResult<()> {
        self.inner
            .state
            .compare_exchange(CREATED, STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| QueueError::AlreadyStarted)?;

        let processor = match QueueProcessor::start(
            &self.inner.config,
            Arc::clone(&self.inner.permits),
            self.inner.fatal_tx.clone(),
        ) {
            Ok(processor) => processor,
            Err(err) => {
                // Leave the queue usable for another start attempt.
                self.inner.state.store(CREATED, Ordering::SeqCst);
                return Err(err);
            }
        };

        *self.inner.processor.write().unwrap() = Some(Arc::new(processor));
        self.install_signal_watcher();
        self.inner.state.store(STARTED, Ordering::SeqCst);
        log::info!("queue '{}' started", self.inner.config.queue_name);
        Ok(())
    }

    /// Stop the queue: refuse new submits, let in-flight records finish,
    /// persist pending retries, and join every background task.
    /// Idempotent; a no-op before `start()`.
    pub async fn stop(&self) {
        stop_inner(&self.inner).await;
        if let Some(task) = self.inner.signal_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Submit a record without waiting. Fails with `QueueFull` when no
    /// admission permit is immediately available.
    pub fn submit(&self, record: T) -> QueueResult<()> {
        let processor = self.processor()?;
        if !self.inner.permits.try_acquire() {
            return Err(QueueError::QueueFull {
                max_size: self.inner.permits.max(),
            });
        }
        self.finish_submit(&processor, record)
    }

    /// Submit a record, waiting up to `timeout` for an admission permit.
    /// A waiter cancelled by `stop()` mid-wait fails with `Interrupted`;
    /// submitting to a queue that already stopped fails with `Stopped`.
    pub async fn submit_timeout(&self, record: T, timeout: Duration) -> QueueResult<()> {
        let processor = self.processor()?;
        match self.inner.permits.acquire_timeout(timeout).await {
            Acquire::Acquired => {}
            Acquire::TimedOut => {
                return Err(QueueError::QueueFull {
                    max_size: self.inner.permits.max(),
                })
            }
            Acquire::Closed => return Err(QueueError::Interrupted),
        }
        self.finish_submit(&processor, record)
    }

    /// Permit already held; release it when the hand-off fails so no
    /// partial submit leaks admission capacity.
    fn finish_submit(&self, processor: &QueueProcessor<T>, record: T) -> QueueResult<()> {
        match processor.submit(record) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.permits.release();
                Err(err)
            }
        }
    }

    /// Number of entries currently in the spill store.
    pub fn size(&self) -> QueueResult<u64> {
        self.processor()?.size()
    }

    /// Number of records waiting out a retry delay.
    pub fn retry_len(&self) -> usize {
        self.inner
            .processor
            .read()
            .unwrap()
            .as_ref()
            .map(|p| p.retry_len())
            .unwrap_or(0)
    }

    /// Currently available admission permits.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available()
    }

    /// Resize the admission ceiling at runtime. Shrinking never cancels
    /// permits already handed out; they drain naturally.
    pub fn set_max_queue_size(&self, max_queue_size: usize) -> QueueResult<()> {
        if max_queue_size == 0 {
            return Err(QueueError::invalid_arg("max_queue_size must be at least 1"));
        }
        self.inner.permits.set_max(max_queue_size);
        Ok(())
    }

    /// Watch channel carrying the first fatal background error, if any.
    /// A value change means the queue began shutting itself down.
    pub fn fatal_errors(&self) -> watch::Receiver<Option<FatalError>> {
        self.inner.fatal_rx.clone()
    }

    fn processor(&self) -> QueueResult<Arc<QueueProcessor<T>>> {
        match self.inner.state.load(Ordering::SeqCst) {
            CREATED | STARTING => Err(QueueError::NotStarted),
            STARTED => self
                .inner
                .processor
                .read()
                .unwrap()
                .clone()
                .ok_or(QueueError::Stopped),
            _ => Err(QueueError::Stopped),
        }
    }

    /// Install the process shutdown watcher. One idempotent watcher per
    /// queue instance, armed at first start and disarmed by `stop()`.
    fn install_signal_watcher(&self) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            shutdown_signal().await;
            log::info!(
                "shutdown signal received, stopping queue '{}'",
                inner.config.queue_name
            );
            stop_inner(&inner).await;
        });
        *self.inner.signal_task.lock().unwrap() = Some(task);
    }
}

async fn stop_inner<T>(inner: &Inner<T>)
where
    T: Send + Sync + 'static,
{
    if inner
        .state
        .compare_exchange(STARTED, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    // Wake blocked submitters first; they observe `Interrupted`.
    inner.permits.close();

    let processor = inner.processor.write().unwrap().take();
    if let Some(processor) = processor {
        processor.stop().await;
    }

    inner.state.store(STOPPED, Ordering::SeqCst);
    log::info!("queue '{}' stopped", inner.config.queue_name);
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
