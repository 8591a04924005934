//! Common test utilities and helpers
//!
//! Counting consumers and configuration shortcuts shared by the
//! integration scenarios. Each test binary uses its own subset.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spoolq::{Consumer, Expiration, QueueConfig, Verdict};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: u64,
}

impl TestRecord {
    pub fn new(id: u64) -> Self {
        Self { id }
    }
}

/// Consumer that always succeeds and counts every observation per id.
#[derive(Default)]
pub struct SuccessConsumer {
    pub processed: AtomicUsize,
    pub observations: Mutex<HashMap<u64, usize>>,
}

impl SuccessConsumer {
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    pub fn max_observations(&self) -> usize {
        self.observations
            .lock()
            .unwrap()
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    pub fn observed_ids(&self) -> Vec<u64> {
        self.observations.lock().unwrap().keys().copied().collect()
    }
}

#[async_trait]
impl Consumer<TestRecord> for SuccessConsumer {
    async fn consume(&self, record: &TestRecord) -> Verdict {
        *self
            .observations
            .lock()
            .unwrap()
            .entry(record.id)
            .or_insert(0) += 1;
        self.processed.fetch_add(1, Ordering::AcqRel);
        Verdict::Success
    }
}

/// Consumer that fails each record until it has been seen
/// `attempts_before_success` times, then succeeds.
pub struct RetryConsumer {
    pub attempts_before_success: usize,
    pub succeeded: AtomicUsize,
    pub attempts: Mutex<HashMap<u64, usize>>,
}

impl RetryConsumer {
    pub fn new(attempts_before_success: usize) -> Self {
        Self {
            attempts_before_success,
            succeeded: AtomicUsize::new(0),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn attempt_counts(&self) -> Vec<usize> {
        self.attempts.lock().unwrap().values().copied().collect()
    }
}

#[async_trait]
impl Consumer<TestRecord> for RetryConsumer {
    async fn consume(&self, record: &TestRecord) -> Verdict {
        let seen = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(record.id).or_insert(0);
            *entry += 1;
            *entry
        };
        if seen < self.attempts_before_success {
            Verdict::FailRequeue
        } else {
            self.succeeded.fetch_add(1, Ordering::AcqRel);
            Verdict::Success
        }
    }
}

/// Consumer that sleeps before succeeding, for backpressure scenarios.
pub struct SlowConsumer {
    pub delay: Duration,
    pub inner: SuccessConsumer,
}

impl SlowConsumer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: SuccessConsumer::default(),
        }
    }
}

#[async_trait]
impl Consumer<TestRecord> for SlowConsumer {
    async fn consume(&self, record: &TestRecord) -> Verdict {
        tokio::time::sleep(self.delay).await;
        self.inner.consume(record).await
    }
}

/// Consumer that never finishes, simulating work lost in a crash.
pub struct StalledConsumer;

#[async_trait]
impl Consumer<TestRecord> for StalledConsumer {
    async fn consume(&self, _record: &TestRecord) -> Verdict {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Consumer that holds every record until the gate opens, then succeeds.
/// Lets tests fill the queue and still stop it cleanly.
pub struct GatedConsumer {
    pub open: std::sync::atomic::AtomicBool,
    pub inner: SuccessConsumer,
}

impl GatedConsumer {
    pub fn closed() -> Self {
        Self {
            open: std::sync::atomic::AtomicBool::new(false),
            inner: SuccessConsumer::default(),
        }
    }

    pub fn open_gate(&self) {
        self.open.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Consumer<TestRecord> for GatedConsumer {
    async fn consume(&self, record: &TestRecord) -> Verdict {
        while !self.open.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.inner.consume(record).await
    }
}

/// Consumer that always requeues and timestamps every attempt.
#[derive(Default)]
pub struct AlwaysFailConsumer {
    pub attempts: Mutex<Vec<Instant>>,
}

impl AlwaysFailConsumer {
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Consumer<TestRecord> for AlwaysFailConsumer {
    async fn consume(&self, _record: &TestRecord) -> Verdict {
        self.attempts.lock().unwrap().push(Instant::now());
        Verdict::FailRequeue
    }
}

/// Expiration callback recording which records ran out of tries.
#[derive(Default)]
pub struct RecordingExpiration {
    pub expired: Mutex<Vec<u64>>,
}

impl RecordingExpiration {
    pub fn expired_ids(&self) -> Vec<u64> {
        self.expired.lock().unwrap().clone()
    }
}

#[async_trait]
impl Expiration<TestRecord> for RecordingExpiration {
    async fn expired(&self, record: TestRecord) {
        self.expired.lock().unwrap().push(record.id);
    }
}

/// Base configuration with a small map and fast rescans, suitable for
/// tests.
pub fn test_config(
    name: &str,
    path: &Path,
    consumer: Arc<dyn Consumer<TestRecord>>,
) -> QueueConfig<TestRecord> {
    QueueConfig::new(name, path, consumer)
        .map_size(64 * 1024 * 1024)
        .persist_retry_delay(Duration::from_millis(100))
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
