//! Keeping the store in step with the scheduler.
//!
//! Two paths feed the store:
//! - the event feed, consumed by [`EventStreamConsumer`], which tracks live
//!   applications in memory and persists them when they finish, and batches
//!   queue changes through the [`Accumulator`]
//! - the [`Reconciler`], which periodically fetches the full scheduler state,
//!   upserts it and soft-deletes whatever disappeared
//!
//! [`SyncService`] runs both.

mod accumulator;
mod handler;
mod reconciler;
mod service;
mod stream;

pub use accumulator::{Accumulator, AccumulatorError, FlushFn};
pub use handler::{ApplicationEventHandler, DropReason, Outcome};
pub use reconciler::{Reconciler, SyncReport};
pub use service::SyncService;
pub use stream::EventStreamConsumer;

use std::time::Duration;

use thiserror::Error;
use yhs_reconcile::MultiError;

use crate::client::ClientError;
use crate::workqueue::WorkQueueError;

/// Timing of the sync loops.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between full reconciliations.
    pub sync_interval: Duration,
    /// Pause before reopening a closed event feed.
    pub reconnect_delay: Duration,
    /// Quiet period after the last queue event before queues are refreshed.
    pub accumulator_idle: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: yhs_reconcile::DEFAULT_RECONCILE_INTERVAL,
            reconnect_delay: Duration::from_secs(2),
            accumulator_idle: Duration::from_secs(2),
        }
    }
}

/// Sync engine failures.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Partitions could not be listed; nothing else was attempted.
    #[error("failed to fetch partitions: {0}")]
    Partitions(#[source] ClientError),

    /// Some scopes failed; everything fetched successfully was still queued.
    #[error(transparent)]
    Partial(#[from] MultiError),

    #[error("work queue: {0}")]
    WorkQueue(#[from] WorkQueueError),

    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),
}
