//! Debouncing change accumulator.
//!
//! Bursts of queue events are collapsed into one flush: every `add` pushes
//! the idle deadline out by `idle_delay`, and once no event has arrived for
//! that long the whole batch is handed to the flush callback.

use std::mem;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument};
use yhs_events::ChangeEvent;

use crate::shutdown::signalled;

/// Callback receiving one settled batch.
pub type FlushFn = Box<dyn Fn(Vec<ChangeEvent>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorError {
    #[error("accumulator is already running")]
    AlreadyStarted,
}

/// Coalesces events until activity settles.
///
/// `add` hands events to the loop started by `run`, which owns the buffer.
/// Flushes run inline in that loop and therefore never overlap; events
/// arriving during a flush go into the next batch.
pub struct Accumulator {
    idle_delay: Duration,
    sender: mpsc::UnboundedSender<ChangeEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>,
    on_flush: FlushFn,
}

impl Accumulator {
    pub fn new(idle_delay: Duration, on_flush: FlushFn) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            idle_delay,
            sender,
            receiver: Mutex::new(Some(receiver)),
            on_flush,
        }
    }

    /// Buffer an event. Never blocks.
    pub fn add(&self, event: ChangeEvent) {
        if self.sender.send(event).is_err() {
            debug!("Accumulator stopped, event dropped");
        }
    }

    /// Own the buffer until `shutdown` fires. Events still buffered at that
    /// point are dropped.
    #[instrument(skip_all, name = "accumulator")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AccumulatorError> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(AccumulatorError::AlreadyStarted)?;

        let mut buffer: Vec<ChangeEvent> = Vec::new();
        let idle = sleep(self.idle_delay);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break,
                Some(event) = receiver.recv() => {
                    buffer.push(event);
                    idle.as_mut().reset(Instant::now() + self.idle_delay);
                }
                _ = &mut idle, if !buffer.is_empty() => {
                    let batch = mem::take(&mut buffer);
                    debug!(events = batch.len(), "Flushing accumulated events");
                    tokio::select! {
                        biased;
                        _ = signalled(&mut shutdown) => break,
                        _ = (self.on_flush)(batch) => {}
                    }
                }
            }
        }

        receiver.close();
        let pending = buffer.len() + drain(&mut receiver);
        if pending > 0 {
            info!(dropped = pending, "Accumulator stopped with unflushed events");
        }
        Ok(())
    }
}

fn drain(receiver: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> usize {
    let mut count = 0;
    while receiver.try_recv().is_ok() {
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use yhs_events::{ChangeType, EventType};

    fn queue_event(id: &str) -> ChangeEvent {
        ChangeEvent {
            event_type: EventType::Queue,
            change_type: ChangeType::Set,
            object_id: id.to_string(),
            ..Default::default()
        }
    }

    fn recording() -> (FlushFn, mpsc::UnboundedReceiver<Vec<ChangeEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_flush: FlushFn = Box::new(move |batch| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(batch);
            })
        });
        (on_flush, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_flushes_once() {
        let (on_flush, mut flushed) = recording();
        let accumulator = Arc::new(Accumulator::new(Duration::from_secs(2), on_flush));
        let (_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn({
            let accumulator = accumulator.clone();
            async move { accumulator.run(shutdown).await }
        });

        for i in 0..5 {
            accumulator.add(queue_event(&format!("root.q{i}")));
            sleep(Duration::from_millis(500)).await;
        }

        let batch = flushed.recv().await.unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0].object_id, "root.q0");
        assert_eq!(batch[4].object_id, "root.q4");

        sleep(Duration::from_secs(10)).await;
        assert!(flushed.try_recv().is_err());

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_flush_separately() {
        let (on_flush, mut flushed) = recording();
        let accumulator = Arc::new(Accumulator::new(Duration::from_secs(2), on_flush));
        let (_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn({
            let accumulator = accumulator.clone();
            async move { accumulator.run(shutdown).await }
        });

        accumulator.add(queue_event("a"));
        sleep(Duration::from_secs(3)).await;
        accumulator.add(queue_event("b"));
        accumulator.add(queue_event("c"));

        assert_eq!(flushed.recv().await.unwrap().len(), 1);
        assert_eq!(flushed.recv().await.unwrap().len(), 2);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_events() {
        let (on_flush, mut flushed) = recording();
        let accumulator = Arc::new(Accumulator::new(Duration::from_secs(2), on_flush));
        let (tx, shutdown) = watch::channel(false);
        let task = tokio::spawn({
            let accumulator = accumulator.clone();
            async move { accumulator.run(shutdown).await }
        });

        accumulator.add(queue_event("a"));
        sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        task.await.unwrap().unwrap();
        assert!(flushed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_only_once() {
        let (on_flush, _flushed) = recording();
        let accumulator = Accumulator::new(Duration::from_secs(2), on_flush);
        let (tx, shutdown) = watch::channel(true);

        accumulator.run(shutdown.clone()).await.unwrap();
        assert_eq!(
            accumulator.run(shutdown).await.unwrap_err(),
            AccumulatorError::AlreadyStarted
        );
        drop(tx);
    }
}
