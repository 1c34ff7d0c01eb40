//! Asynchronous persistence job queue.
//!
//! Store writes are wrapped in [`Job`]s and handed to a [`WorkQueue`], which
//! runs them in insertion order on a bounded pool of tasks and retries each
//! failing job with capped exponential backoff until it succeeds or the queue
//! is stopped.
//!
//! Lifecycle: a queue starts idle, runs once, and stays stopped afterwards.
//! Jobs can only be added while it runs. On a shutdown signal the queue stops
//! taking jobs, waits up to the grace period for running ones, then cancels
//! what is left. [`WorkQueue::shutdown`] cancels immediately.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use yhs_reconcile::{BackoffPolicy, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_BACKOFF, RETRY_LOG_THRESHOLD};

use crate::shutdown::signalled;

/// Future produced by one attempt of a job.
pub type JobFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A retryable unit of work. The task is called once per attempt.
#[derive(Clone)]
pub struct Job {
    id: Uuid,
    name: Option<String>,
    task: Arc<dyn Fn() -> JobFuture + Send + Sync>,
}

impl Job {
    pub fn new<F, Fut>(task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            name: None,
            task: Arc::new(move || -> JobFuture { Box::pin(task()) }),
        }
    }

    /// Attach a name used in logs.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Configuration for a work queue.
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Name attached to the queue's log span.
    pub name: String,

    /// Delay before the first retry of a failed job.
    pub initial_delay: Duration,

    /// Upper bound on any retry delay.
    pub max_backoff: Duration,

    /// How long a signalled shutdown waits for running jobs.
    pub grace_period: Duration,

    /// Jobs executing at once.
    pub max_concurrency: usize,

    /// Jobs waiting to start before `add` reports the queue full.
    pub max_pending: usize,

    /// Retry count above which retries are logged as errors.
    pub retry_log_threshold: u32,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            name: "persistence".to_string(),
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_backoff: DEFAULT_MAX_BACKOFF,
            grace_period: Duration::from_secs(5),
            max_concurrency: 16,
            max_pending: 1024,
            retry_log_threshold: RETRY_LOG_THRESHOLD,
        }
    }
}

/// Work queue errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WorkQueueError {
    #[error("work queue is not running")]
    NotStarted,

    #[error("work queue is full")]
    Full,

    #[error("work queue is already running")]
    AlreadyRunning,

    #[error("work queue has been stopped")]
    AlreadyStopped,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Bounded, retrying job runner.
pub struct WorkQueue {
    config: WorkQueueConfig,
    state: AtomicU8,
    sender: mpsc::Sender<Job>,
    receiver: Mutex<Option<mpsc::Receiver<Job>>>,
    running: Arc<AtomicUsize>,
    halt: watch::Sender<bool>,
}

impl WorkQueue {
    pub fn new(config: WorkQueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_pending.max(1));
        let (halt, _) = watch::channel(false);
        Self {
            config,
            state: AtomicU8::new(IDLE),
            sender,
            receiver: Mutex::new(Some(receiver)),
            running: Arc::new(AtomicUsize::new(0)),
            halt,
        }
    }

    pub fn config(&self) -> &WorkQueueConfig {
        &self.config
    }

    /// Queue a job, returning its id.
    ///
    /// Nothing is queued on error.
    pub fn add(&self, job: Job) -> Result<Uuid, WorkQueueError> {
        match self.state.load(Ordering::SeqCst) {
            IDLE => return Err(WorkQueueError::NotStarted),
            STOPPED => return Err(WorkQueueError::AlreadyStopped),
            _ => {}
        }

        let id = job.id();
        let name = job.name().to_string();
        match self.sender.try_send(job) {
            Ok(()) => {
                debug!(job_id = %id, job_name = %name, "Job queued");
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job_id = %id, job_name = %name, "Work queue full, job rejected");
                Err(WorkQueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkQueueError::AlreadyStopped),
        }
    }

    /// Run the queue on a new task. The queue accepts jobs as soon as this returns.
    pub fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, WorkQueueError> {
        let receiver = self.begin()?;
        let queue = Arc::clone(self);
        Ok(tokio::spawn(async move {
            queue.process(receiver, shutdown).await;
        }))
    }

    /// Run the queue until `shutdown` fires or [`WorkQueue::shutdown`] is called.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), WorkQueueError> {
        let receiver = self.begin()?;
        self.process(receiver, shutdown).await;
        Ok(())
    }

    /// Stop taking jobs and cancel the running ones now.
    pub fn shutdown(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
        self.halt.send_replace(true);
    }

    /// Jobs currently executing (including ones waiting out a retry delay).
    pub fn running_jobs(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    fn begin(&self) -> Result<mpsc::Receiver<Job>, WorkQueueError> {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|state| match state {
                RUNNING => WorkQueueError::AlreadyRunning,
                _ => WorkQueueError::AlreadyStopped,
            })?;
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(WorkQueueError::AlreadyStopped)
    }

    #[instrument(skip_all, fields(workqueue = %self.config.name))]
    async fn process(&self, mut receiver: mpsc::Receiver<Job>, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_concurrency = self.config.max_concurrency,
            max_pending = self.config.max_pending,
            "Work queue started"
        );

        let mut halt = self.halt.subscribe();
        let slots = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let policy = BackoffPolicy::new(self.config.initial_delay, self.config.max_backoff);
        let mut tasks = JoinSet::new();

        let graceful = loop {
            while tasks.try_join_next().is_some() {}

            let permit = tokio::select! {
                biased;
                _ = signalled(&mut halt) => break false,
                _ = signalled(&mut shutdown) => break true,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break false,
                },
            };

            let job = tokio::select! {
                biased;
                _ = signalled(&mut halt) => break false,
                _ = signalled(&mut shutdown) => break true,
                job = receiver.recv() => match job {
                    Some(job) => job,
                    None => break true,
                },
            };

            let guard = RunningGuard::enter(Arc::clone(&self.running));
            tasks.spawn(execute_with_retry(
                job,
                policy,
                self.config.retry_log_threshold,
                permit,
                guard,
            ));
        };

        self.state.store(STOPPED, Ordering::SeqCst);
        receiver.close();
        let mut discarded = 0usize;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "Discarding jobs that never started");
        }

        let grace = self.config.grace_period;
        if graceful && !grace.is_zero() && !tasks.is_empty() {
            info!(
                running = tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "Waiting for running jobs"
            );
            let drain = async {
                while tasks.join_next().await.is_some() {}
            };
            if tokio::time::timeout(grace, drain).await.is_err() {
                warn!(
                    remaining = self.running_jobs(),
                    "Grace period elapsed, cancelling running jobs"
                );
            }
        }

        tasks.shutdown().await;
        info!("Work queue stopped");
    }
}

/// Counts a job as running for as long as it is alive, including when aborted.
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[instrument(skip_all, fields(job_id = %job.id, job_name = %job.name()))]
async fn execute_with_retry(
    job: Job,
    policy: BackoffPolicy,
    retry_log_threshold: u32,
    _permit: OwnedSemaphorePermit,
    _guard: RunningGuard,
) {
    let mut retry_count: u32 = 0;
    loop {
        debug!(retry_count, "Executing job");
        match (job.task)().await {
            Ok(()) => {
                debug!(retry_count, "Job completed");
                return;
            }
            Err(err) => {
                retry_count = retry_count.saturating_add(1);
                let backoff = policy.delay(retry_count);
                let backoff_ms = backoff.as_millis() as u64;
                if retry_count > retry_log_threshold {
                    error!(error = %format!("{err:#}"), retry_count, backoff_ms, "Job still failing, retrying");
                } else {
                    warn!(error = %format!("{err:#}"), retry_count, backoff_ms, "Job failed, retrying");
                }
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
