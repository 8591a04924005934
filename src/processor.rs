//! Queue Processor
//!
//! The orchestrator gluing the other components together. It owns the
//! spill store, the transfer channel, and the background tasks (pump,
//! workers, retry timekeeper, rescan timer), and enforces the two rules
//! that carry the queue's contracts:
//!
//! - fast path only when the spill store is empty, so FIFO order is
//!   preserved whenever anything is on disk;
//! - a spill entry is removed only after its verdict, so a crash can
//!   duplicate work but never lose it.
//!
//! Shutdown is cooperative: intake closes first, workers drain what was
//! already handed off, then pending retries are persisted back to disk.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::channel::{Delivery, TransferChannel};
use crate::codec::{Codec, Envelope};
use crate::config::QueueConfig;
use crate::consumer::Verdict;
use crate::error::{QueueError, QueueResult};
use crate::retry::{RetryHandle, RetryPolicy};
use crate::semaphore::AdjustableSemaphore;
use crate::store::SpillStore;
use crate::worker;

/// Unrecoverable failure in a background task, published on the queue's
/// fatal-error channel. Observing one means the queue has begun shutting
/// itself down.
#[derive(Debug, Clone)]
pub struct FatalError {
    pub task: &'static str,
    pub message: String,
}

/// State shared by the submit path and every background task.
pub(crate) struct Shared<T> {
    name: String,
    pub(crate) store: SpillStore,
    pub(crate) channel: Arc<TransferChannel<T>>,
    pub(crate) permits: Arc<AdjustableSemaphore>,
    codec: Arc<dyn Codec<T>>,
    pub(crate) retry: RetryHandle<T>,
    /// Spill keys currently travelling through the channel or a worker,
    /// so the pump never offers the same entry twice concurrently.
    inflight: Mutex<HashSet<u64>>,
    pump_notify: Notify,
    rescan_requested: AtomicBool,
    rescan_period: std::time::Duration,
    stopping: AtomicBool,
    fatal_tx: watch::Sender<Option<FatalError>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<T> Shared<T>
where
    T: Send + Sync + 'static,
{
    /// Submit path: serialize first, then fast-path offer only while the
    /// spill store is empty, otherwise durable append. The caller already
    /// holds an admission permit.
    pub(crate) fn submit(&self, record: T) -> QueueResult<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }

        let envelope = Envelope::new(record);
        let bytes = self.codec.encode(&envelope)?;

        if self.store.is_empty()? {
            let delivery = Delivery {
                envelope,
                spill_key: None,
            };
            if self.channel.offer(delivery).is_ok() {
                return Ok(());
            }
        }

        self.store.append(&bytes)?;
        self.pump_notify.notify_one();
        Ok(())
    }

    /// Apply a worker's verdict. The spill entry is removed durably
    /// before the permit release or retry hand-off becomes observable.
    pub(crate) fn handle_verdict(&self, delivery: Delivery<T>, verdict: Verdict) -> QueueResult<()> {
        let Delivery { envelope, spill_key } = delivery;
        if let Some(key) = spill_key {
            self.store.remove(key)?;
            self.clear_inflight(key);
        }
        match verdict {
            Verdict::Success | Verdict::FailNoQueue => {
                self.permits.release();
            }
            Verdict::FailRequeue => {
                // Permit retained; the record's lifecycle moves to the
                // retry scheduler.
                self.retry.schedule(envelope);
            }
        }
        Ok(())
    }

    /// Next spill entry the pump should offer, skipping keys already in
    /// flight.
    fn next_spill_entry(&self, cursor: &mut Option<u64>) -> QueueResult<Option<(u64, Vec<u8>)>> {
        loop {
            match self.store.next_after(*cursor)? {
                Some((key, bytes)) => {
                    if self.is_inflight(key) {
                        *cursor = Some(key);
                        continue;
                    }
                    return Ok(Some((key, bytes)));
                }
                None => return Ok(None),
            }
        }
    }

    fn is_inflight(&self, key: u64) -> bool {
        self.inflight.lock().unwrap().contains(&key)
    }

    fn mark_inflight(&self, key: u64) {
        self.inflight.lock().unwrap().insert(key);
    }

    fn clear_inflight(&self, key: u64) {
        self.inflight.lock().unwrap().remove(&key);
    }

    fn request_rescan(&self) {
        self.rescan_requested.store(true, Ordering::Release);
        self.pump_notify.notify_one();
    }

    fn take_rescan(&self) -> bool {
        self.rescan_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Stop intake and wake everything that might be blocked. Safe to
    /// call from any task; only the first call has an effect.
    pub(crate) fn begin_stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("queue '{}' stopping", self.name);
        self.channel.close();
        self.pump_notify.notify_one();
        let _ = self.shutdown_tx.send(());
    }

    /// Publish a fatal background failure and begin shutdown.
    pub(crate) fn report_fatal(&self, task: &'static str, message: String) {
        log::error!("queue '{}': fatal error in {} task: {}", self.name, task, message);
        self.fatal_tx.send_replace(Some(FatalError { task, message }));
        self.begin_stop();
    }
}

/// Single task draining the spill store into the transfer channel in key
/// order. Entries recovered with a nonzero try count belong to the retry
/// scheduler instead of the channel.
async fn pump<T>(shared: Arc<Shared<T>>)
where
    T: Send + Sync + 'static,
{
    let mut cursor: Option<u64> = None;
    loop {
        if shared.is_stopping() {
            break;
        }
        let next = match shared.next_spill_entry(&mut cursor) {
            Ok(next) => next,
            Err(err) => {
                shared.report_fatal("pump", format!("spill scan failed: {err}"));
                break;
            }
        };
        match next {
            Some((key, bytes)) => {
                cursor = Some(key);
                let envelope = match shared.codec.decode(&bytes) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        // A corrupt entry would wedge the scan forever;
                        // drop it and keep the queue moving.
                        log::warn!("dropping undecodable spill entry {}: {}", key, err);
                        if let Err(err) = shared.store.remove(key) {
                            shared.report_fatal("pump", format!("remove failed: {err}"));
                            break;
                        }
                        continue;
                    }
                };
                if envelope.try_count() > 0 {
                    if let Err(err) = shared.store.remove(key) {
                        shared.report_fatal("pump", format!("remove failed: {err}"));
                        break;
                    }
                    shared.retry.schedule(envelope);
                } else {
                    shared.mark_inflight(key);
                    let delivery = Delivery {
                        envelope,
                        spill_key: Some(key),
                    };
                    if shared.channel.put(delivery).await.is_err() {
                        // Channel closed: the entry stays on disk for the
                        // next start.
                        shared.clear_inflight(key);
                        break;
                    }
                }
            }
            None => {
                shared.pump_notify.notified().await;
                if shared.take_rescan() {
                    cursor = None;
                }
            }
        }
    }
    log::trace!("pump stopped");
}

/// Coarse timer rewinding the pump's cursor so long-lived spill entries
/// are re-offered. The rescan itself is idempotent.
async fn rescan_timer<T>(shared: Arc<Shared<T>>)
where
    T: Send + Sync + 'static,
{
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(shared.rescan_period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => shared.request_rescan(),
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Spawn `fut` and escalate a panic into a fatal error plus shutdown.
fn spawn_supervised<T, F>(shared: &Arc<Shared<T>>, task: &'static str, fut: F) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let inner = tokio::spawn(fut);
        match inner.await {
            Ok(()) => {}
            Err(err) if err.is_panic() => {
                shared.report_fatal(task, format!("{task} task panicked"));
            }
            Err(_) => {}
        }
    })
}

pub(crate) struct QueueProcessor<T> {
    shared: Arc<Shared<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    retry_join: Mutex<Option<JoinHandle<Vec<Envelope<T>>>>>,
    stopped: AtomicBool,
}

impl<T> QueueProcessor<T>
where
    T: Send + Sync + 'static,
{
    /// Open the store, account for the on-disk backlog, and launch the
    /// background tasks.
    pub(crate) fn start(
        config: &QueueConfig<T>,
        permits: Arc<AdjustableSemaphore>,
        fatal_tx: watch::Sender<Option<FatalError>>,
    ) -> QueueResult<Self> {
        let store = SpillStore::open(&config.queue_path, &config.queue_name, config.map_size)?;
        let spill_count = store.len()?;

        // Admission accounting must match on-disk reality before any
        // submit is accepted.
        let acquired = permits.acquire_many_now(spill_count as usize);
        if acquired > 0 {
            log::debug!(
                "queue '{}' recovered {} spilled entries ({} permits)",
                config.queue_name,
                spill_count,
                acquired
            );
        }

        let channel = Arc::new(TransferChannel::new(config.workers));
        let policy = RetryPolicy {
            algorithm: config.retry_algorithm,
            retry_delay: config.retry_delay,
            max_retry_delay: config.max_retry_delay,
        };
        let (retry, retry_join) = crate::retry::spawn_scheduler(
            policy,
            config.max_tries,
            config.expiration.clone(),
            Arc::clone(&channel),
            Arc::clone(&permits),
        );

        let (shutdown_tx, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            name: config.queue_name.clone(),
            store,
            channel,
            permits,
            codec: Arc::clone(&config.codec),
            retry,
            inflight: Mutex::new(HashSet::new()),
            pump_notify: Notify::new(),
            rescan_requested: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            fatal_tx,
            shutdown_tx,
            rescan_period: config.persist_retry_delay,
        });

        let mut tasks = Vec::with_capacity(config.workers + 2);
        for index in 0..config.workers {
            let consumer = Arc::clone(&config.consumer);
            tasks.push(spawn_supervised(
                &shared,
                "worker",
                worker::run(Arc::clone(&shared), consumer, index),
            ));
        }
        tasks.push(spawn_supervised(&shared, "pump", pump(Arc::clone(&shared))));
        tasks.push(spawn_supervised(
            &shared,
            "rescan",
            rescan_timer(Arc::clone(&shared)),
        ));

        log::debug!(
            "queue '{}' started ({} workers, {} spilled entries)",
            shared.name,
            config.workers,
            spill_count
        );

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
            retry_join: Mutex::new(Some(retry_join)),
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn submit(&self, record: T) -> QueueResult<()> {
        self.shared.submit(record)
    }

    pub(crate) fn size(&self) -> QueueResult<u64> {
        self.shared.store.len()
    }

    pub(crate) fn retry_len(&self) -> usize {
        self.shared.retry.len()
    }

    /// Orderly shutdown: stop intake, drain workers, persist pending
    /// retries, and join every task. Idempotent.
    pub(crate) async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.begin_stop();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }

        // Workers are done; nothing can post to the scheduler anymore.
        self.shared.retry.close();
        let retry_join = self.retry_join.lock().unwrap().take();
        if let Some(join) = retry_join {
            match join.await {
                Ok(leftovers) => {
                    for envelope in leftovers {
                        match self.shared.codec.encode(&envelope) {
                            Ok(bytes) => {
                                if let Err(err) = self.shared.store.append(&bytes) {
                                    log::error!("failed to persist pending retry: {err}");
                                }
                            }
                            Err(err) => {
                                log::error!("failed to serialize pending retry: {err}");
                            }
                        }
                    }
                }
                Err(err) if err.is_panic() => {
                    self.shared
                        .report_fatal("retry", "retry scheduler panicked".to_string());
                }
                Err(_) => {}
            }
        }

        log::debug!("queue '{}' stopped", self.shared.name);
    }
}
