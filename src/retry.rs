//! Retry Scheduling
//!
//! Failed records wait out their backoff delay in an in-memory min-heap
//! served by a single timekeeper task. When a deadline passes, the record
//! re-enters the transfer channel directly; the admission permit was
//! never released, so the requeue path bypasses the semaphore. Records
//! that exhaust `max_tries` are handed to the optional expiration
//! callback and discarded.
//!
//! On shutdown the timekeeper drains its heap and inbox and returns the
//! pending envelopes to the orchestrator, which persists them back to
//! the spill store with their try counts preserved.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::{Delivery, TransferChannel};
use crate::codec::Envelope;
use crate::consumer::Expiration;
use crate::semaphore::AdjustableSemaphore;

/// Backoff shape for in-memory retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAlgorithm {
    /// Every retry waits `retry_delay`.
    Fixed,
    /// Retry `k` waits `min(max_retry_delay, retry_delay * 2^k)`.
    Exponential,
}

/// Delay policy applied to records awaiting another attempt.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub algorithm: RetryAlgorithm,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the next attempt for a record that has failed
    /// `try_count` times. Exponential growth saturates instead of
    /// overflowing.
    pub fn delay_for(&self, try_count: u32) -> Duration {
        match self.algorithm {
            RetryAlgorithm::Fixed => self.retry_delay,
            RetryAlgorithm::Exponential => {
                let factor = 1u32.checked_shl(try_count).unwrap_or(u32::MAX);
                self.retry_delay
                    .saturating_mul(factor)
                    .min(self.max_retry_delay)
            }
        }
    }
}

/// Heap entry ordered so `BinaryHeap` pops the earliest deadline first,
/// with the submission sequence breaking ties.
struct ScheduledRetry<T> {
    at: Instant,
    seq: u64,
    envelope: Envelope<T>,
}

impl<T> PartialEq for ScheduledRetry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<T> Eq for ScheduledRetry<T> {}

impl<T> PartialOrd for ScheduledRetry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ScheduledRetry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle used by workers and the pump to post envelopes to the
/// timekeeper.
pub(crate) struct RetryHandle<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<Envelope<T>>>>,
    len: Arc<AtomicUsize>,
}

impl<T> RetryHandle<T> {
    /// Queue an envelope for expiry-or-backoff handling. Envelopes posted
    /// after shutdown began are dropped with a warning; the caller's spill
    /// entry was already removed, mirroring a crash during retry wait.
    pub fn schedule(&self, envelope: Envelope<T>) {
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) if tx.send(envelope).is_ok() => {}
            _ => log::warn!("retry scheduler is gone; dropping record"),
        }
    }

    /// Number of records currently waiting out a delay.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Stop accepting new envelopes; the timekeeper exits once its inbox
    /// drains.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// Spawn the timekeeper. The returned join handle yields the envelopes
/// still pending when the scheduler shut down.
pub(crate) fn spawn_scheduler<T>(
    policy: RetryPolicy,
    max_tries: u32,
    expiration: Option<Arc<dyn Expiration<T>>>,
    channel: Arc<TransferChannel<T>>,
    permits: Arc<AdjustableSemaphore>,
) -> (RetryHandle<T>, JoinHandle<Vec<Envelope<T>>>)
where
    T: Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let len = Arc::new(AtomicUsize::new(0));
    let handle = RetryHandle {
        tx: Mutex::new(Some(tx)),
        len: Arc::clone(&len),
    };
    let join = tokio::spawn(timekeeper(
        rx, policy, max_tries, expiration, channel, permits, len,
    ));
    (handle, join)
}

async fn timekeeper<T>(
    mut rx: mpsc::UnboundedReceiver<Envelope<T>>,
    policy: RetryPolicy,
    max_tries: u32,
    expiration: Option<Arc<dyn Expiration<T>>>,
    channel: Arc<TransferChannel<T>>,
    permits: Arc<AdjustableSemaphore>,
    len: Arc<AtomicUsize>,
) -> Vec<Envelope<T>>
where
    T: Send + Sync + 'static,
{
    let mut heap: BinaryHeap<ScheduledRetry<T>> = BinaryHeap::new();
    let mut leftovers: Vec<Envelope<T>> = Vec::new();
    let mut seq: u64 = 0;

    loop {
        // Requeue everything already due before sleeping again.
        while heap
            .peek()
            .is_some_and(|entry| entry.at <= Instant::now())
        {
            let entry = heap.pop().unwrap();
            len.fetch_sub(1, Ordering::AcqRel);
            let delivery = Delivery {
                envelope: entry.envelope,
                spill_key: None,
            };
            if let Err(refused) = channel.put(delivery).await {
                // Channel closed: shutdown is underway, keep the record
                // for persistence.
                leftovers.push(refused.envelope);
            }
        }

        let deadline = heap.peek().map(|entry| entry.at);
        let sleep_target =
            deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            received = rx.recv() => match received {
                Some(mut envelope) => {
                    let tries = envelope.try_count();
                    if max_tries > 0 && tries + 1 >= max_tries {
                        log::debug!(
                            "record expired after {} tries (max {})",
                            tries + 1,
                            max_tries
                        );
                        if let Some(expiration) = expiration.as_ref() {
                            expiration.expired(envelope.into_record()).await;
                        }
                        permits.release();
                    } else {
                        let delay = policy.delay_for(tries);
                        envelope.note_failure(SystemTime::now());
                        seq += 1;
                        heap.push(ScheduledRetry {
                            at: Instant::now() + delay,
                            seq,
                            envelope,
                        });
                        len.fetch_add(1, Ordering::AcqRel);
                    }
                }
                None => break,
            },
            () = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {}
        }
    }

    // Shutdown: everything still waiting goes back to the orchestrator,
    // earliest deadline first.
    while let Some(entry) = heap.pop() {
        len.fetch_sub(1, Ordering::AcqRel);
        leftovers.push(entry.envelope);
    }
    leftovers
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy {
            algorithm: RetryAlgorithm::Fixed,
            retry_delay: Duration::from_millis(250),
            max_retry_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(7), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            algorithm: RetryAlgorithm::Exponential,
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(80),
        };
        let delays: Vec<u64> = (0..5)
            .map(|k| policy.delay_for(k).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 80]);
    }

    #[test]
    fn test_exponential_delay_saturates_at_high_try_counts() {
        let policy = RetryPolicy {
            algorithm: RetryAlgorithm::Exponential,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(300),
        };
        assert_eq!(policy.delay_for(63), Duration::from_secs(300));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_scheduled_retry_orders_by_deadline_then_sequence() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(ScheduledRetry {
            at: now + Duration::from_secs(2),
            seq: 1,
            envelope: Envelope::new(1u32),
        });
        heap.push(ScheduledRetry {
            at: now + Duration::from_secs(1),
            seq: 3,
            envelope: Envelope::new(2u32),
        });
        heap.push(ScheduledRetry {
            at: now + Duration::from_secs(1),
            seq: 2,
            envelope: Envelope::new(3u32),
        });

        assert_eq!(*heap.pop().unwrap().envelope.record(), 3);
        assert_eq!(*heap.pop().unwrap().envelope.record(), 2);
        assert_eq!(*heap.pop().unwrap().envelope.record(), 1);
    }

    struct RecordingExpiration {
        expired: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Expiration<u32> for RecordingExpiration {
        async fn expired(&self, record: u32) {
            self.expired.lock().unwrap().push(record);
        }
    }

    #[tokio::test]
    async fn test_due_record_is_requeued_with_incremented_try_count() {
        let channel = Arc::new(TransferChannel::new(1));
        let permits = Arc::new(AdjustableSemaphore::new(10));
        let policy = RetryPolicy {
            algorithm: RetryAlgorithm::Fixed,
            retry_delay: Duration::ZERO,
            max_retry_delay: Duration::ZERO,
        };
        let (handle, join) =
            spawn_scheduler(policy, 0, None, Arc::clone(&channel), Arc::clone(&permits));

        handle.schedule(Envelope::new(99u32));
        let delivery = tokio::time::timeout(Duration::from_secs(5), channel.take())
            .await
            .expect("retry should be requeued promptly")
            .unwrap();

        assert_eq!(*delivery.envelope.record(), 99);
        assert_eq!(delivery.envelope.try_count(), 1);
        assert!(delivery.envelope.first_attempt_at().is_some());
        assert!(delivery.spill_key.is_none());

        handle.close();
        assert!(join.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_record_expires_and_releases_permit() {
        let channel = Arc::new(TransferChannel::new(1));
        let permits = Arc::new(AdjustableSemaphore::new(10));
        assert!(permits.try_acquire());
        let expiration = Arc::new(RecordingExpiration {
            expired: Mutex::new(Vec::new()),
        });
        let policy = RetryPolicy {
            algorithm: RetryAlgorithm::Fixed,
            retry_delay: Duration::ZERO,
            max_retry_delay: Duration::ZERO,
        };
        let (handle, join) = spawn_scheduler(
            policy,
            1,
            Some(expiration.clone() as Arc<dyn Expiration<u32>>),
            Arc::clone(&channel),
            Arc::clone(&permits),
        );

        // max_tries = 1: the first failure already exhausts the budget.
        handle.schedule(Envelope::new(7u32));

        handle.close();
        assert!(join.await.unwrap().is_empty());
        assert_eq!(*expiration.expired.lock().unwrap(), vec![7]);
        assert_eq!(permits.available(), 10);
    }

    #[tokio::test]
    async fn test_shutdown_returns_pending_envelopes() {
        let channel = Arc::new(TransferChannel::new(1));
        let permits = Arc::new(AdjustableSemaphore::new(10));
        let policy = RetryPolicy {
            algorithm: RetryAlgorithm::Fixed,
            retry_delay: Duration::from_secs(300),
            max_retry_delay: Duration::from_secs(300),
        };
        let (handle, join) =
            spawn_scheduler(policy, 0, None, Arc::clone(&channel), Arc::clone(&permits));

        handle.schedule(Envelope::new(1u32));
        handle.schedule(Envelope::new(2u32));
        handle.close();

        let leftovers = join.await.unwrap();
        let records: Vec<u32> = leftovers.iter().map(|e| *e.record()).collect();
        assert_eq!(records, vec![1, 2]);
        assert!(leftovers.iter().all(|e| e.try_count() == 1));
    }
}
