//! Worker Pool
//!
//! Each worker loops on the transfer channel, runs the consumer callback,
//! and reports the verdict back to the orchestrator. A panic inside the
//! callback is demoted to `FailNoQueue`; it never takes the worker (or
//! the queue) down.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::consumer::{Consumer, Verdict};
use crate::processor::Shared;

pub(crate) async fn run<T>(shared: Arc<Shared<T>>, consumer: Arc<dyn Consumer<T>>, index: usize)
where
    T: Send + Sync + 'static,
{
    log::trace!("worker {} started", index);
    while let Some(delivery) = shared.channel.take().await {
        let verdict = match AssertUnwindSafe(consumer.consume(delivery.envelope.record()))
            .catch_unwind()
            .await
        {
            Ok(verdict) => verdict,
            Err(_) => {
                log::warn!(
                    "worker {}: consumer panicked, treating record as FailNoQueue",
                    index
                );
                Verdict::FailNoQueue
            }
        };
        if let Err(err) = shared.handle_verdict(delivery, verdict) {
            shared.report_fatal("worker", format!("verdict handling failed: {err}"));
            break;
        }
    }
    log::trace!("worker {} stopped", index);
}
