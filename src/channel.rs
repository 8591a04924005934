//! Transfer Channel
//!
//! The hand-off point between producers, the spill pump, and the worker
//! pool. Capacity equals the worker count, so a successful non-blocking
//! `offer` means a worker is idle or about to be. Deliveries carry the
//! envelope together with its spill key (when the item came off disk) so
//! verdict handling can acknowledge the right store entry.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::codec::Envelope;

/// One item in flight between the queue and a worker.
#[derive(Debug)]
pub(crate) struct Delivery<T> {
    pub envelope: Envelope<T>,
    /// Key of the backing spill entry; `None` for fast-path items that
    /// never touched disk.
    pub spill_key: Option<u64>,
}

pub(crate) struct TransferChannel<T> {
    tx: Mutex<Option<mpsc::Sender<Delivery<T>>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Delivery<T>>>,
}

impl<T> TransferChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Delivery<T>>> {
        self.tx.lock().unwrap().clone()
    }

    /// Non-blocking hand-off. Returns the delivery on refusal (channel
    /// full or closed) so the caller can spill it instead.
    pub fn offer(&self, delivery: Delivery<T>) -> Result<(), Delivery<T>> {
        let Some(tx) = self.sender() else {
            return Err(delivery);
        };
        match tx.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(d)) => Err(d),
            Err(mpsc::error::TrySendError::Closed(d)) => Err(d),
        }
    }

    /// Blocking hand-off used by the pump and the retry scheduler.
    /// Returns the delivery only when the channel has been closed.
    pub async fn put(&self, delivery: Delivery<T>) -> Result<(), Delivery<T>> {
        let Some(tx) = self.sender() else {
            return Err(delivery);
        };
        tx.send(delivery).await.map_err(|e| e.0)
    }

    /// Receive the next delivery. Workers share the receive side; after
    /// `close()` remaining buffered deliveries are drained and then
    /// `None` signals termination.
    pub async fn take(&self) -> Option<Delivery<T>> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Refuse further deliveries. Already-buffered items stay available
    /// to `take` so nothing handed off is lost.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}
