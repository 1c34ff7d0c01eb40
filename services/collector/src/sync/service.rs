//! The sync service: event collection and periodic reconciliation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use super::accumulator::{Accumulator, FlushFn};
use super::handler::ApplicationEventHandler;
use super::reconciler::Reconciler;
use super::stream::EventStreamConsumer;
use super::{SyncConfig, SyncError};
use crate::client::SchedulerClient;
use crate::counters::EventCounters;
use crate::shutdown::{is_set, signalled};
use crate::store::PersistenceStore;
use crate::workqueue::WorkQueue;

const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Runs the event collector and the data sync loop side by side.
pub struct SyncService {
    config: SyncConfig,
    workqueue: Arc<WorkQueue>,
    accumulator: Arc<Accumulator>,
    reconciler: Arc<Reconciler>,
    consumer: Mutex<EventStreamConsumer>,
    collector_running: AtomicBool,
    stop_requested: AtomicBool,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        client: Arc<dyn SchedulerClient>,
        store: Arc<dyn PersistenceStore>,
        workqueue: Arc<WorkQueue>,
        counters: Arc<EventCounters>,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&client),
            Arc::clone(&store),
            Arc::clone(&workqueue),
        ));

        let on_flush: FlushFn = {
            let reconciler = Arc::clone(&reconciler);
            Box::new(move |batch| {
                let reconciler = Arc::clone(&reconciler);
                Box::pin(async move {
                    info!(events = batch.len(), "Queue changes settled, refreshing queues");
                    if let Err(e) = reconciler.sync_queues().await {
                        warn!(error = %e, "Queue refresh failed");
                    }
                })
            })
        };
        let accumulator = Arc::new(Accumulator::new(config.accumulator_idle, on_flush));

        let handler = ApplicationEventHandler::new(Arc::clone(&client), store, Arc::clone(&workqueue));
        let consumer = EventStreamConsumer::new(client, handler, Arc::clone(&accumulator), counters);

        Self {
            config,
            workqueue,
            accumulator,
            reconciler,
            consumer: Mutex::new(consumer),
            collector_running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn is_collecting(&self) -> bool {
        self.collector_running.load(Ordering::SeqCst)
    }

    /// Start the work queue and accumulator, then run both loops until
    /// `shutdown` fires.
    ///
    /// The loops are independent: an error in one never stops the other.
    #[instrument(skip_all, fields(component = "sync_service"))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        let queue = self.workqueue.start(shutdown.clone())?;
        self.collector_running.store(true, Ordering::SeqCst);
        if self.stop_requested.load(Ordering::SeqCst) {
            self.collector_running.store(false, Ordering::SeqCst);
        }
        info!(
            sync_interval_secs = self.config.sync_interval.as_secs(),
            reconnect_delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "Sync service started"
        );

        let (accumulator, (), ()) = tokio::join!(
            self.accumulator.run(shutdown.clone()),
            self.run_event_collector(shutdown.clone()),
            self.run_data_sync(shutdown),
        );
        self.collector_running.store(false, Ordering::SeqCst);

        if let Err(e) = queue.await {
            error!(error = %e, "Work queue task failed");
        }
        info!("Sync service stopped");
        accumulator.map_err(SyncError::from)
    }

    /// Stop reopening the event feed once the current connection ends.
    ///
    /// Sticky: a later [`SyncService::run`] never starts the collector.
    pub fn shutdown(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.collector_running.store(false, Ordering::SeqCst);
    }

    /// Consume the event feed, reconnecting after `reconnect_delay` whenever
    /// it closes or fails.
    #[instrument(skip_all, fields(component = "event_collector"))]
    pub async fn run_event_collector(&self, mut shutdown: watch::Receiver<bool>) {
        let mut consumer = self.consumer.lock().await;

        while self.is_collecting() && !is_set(&shutdown) {
            match consumer.run(shutdown.clone()).await {
                Ok(()) => info!("Event stream ended"),
                Err(e) => warn!(error = %e, "Event stream failed"),
            }

            if !self.is_collecting() {
                break;
            }
            tokio::select! {
                _ = signalled(&mut shutdown) => break,
                _ = sleep(self.config.reconnect_delay) => {
                    info!("Reconnecting to event stream");
                }
            }
        }

        info!("Event collector stopped");
    }

    /// Reconcile immediately, then every `sync_interval`.
    #[instrument(skip_all, fields(component = "data_sync"))]
    pub async fn run_data_sync(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sync_interval.max(MIN_SYNC_INTERVAL));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break,
                result = self.reconciler.sync() => match result {
                    Ok(report) => info!(jobs = report.jobs.len(), "Data sync complete"),
                    Err(e) => error!(error = %e, "Data sync failed"),
                },
            }
        }

        info!("Data sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use yhs_events::{ApplicationInfo, PartitionInfo};

    use crate::client::fake::FakeClient;
    use crate::store::{MemoryStore, RecordFilters};
    use crate::workqueue::WorkQueueConfig;

    const FEED: &str = concat!(
        r#"{"type":"APP","eventChangeType":"ADD","eventChangeDetail":"APP_NEW","objectID":"app1","timestampNano":1}"#,
        "\n",
        r#"{"type":"APP","eventChangeType":"SET","eventChangeDetail":"APP_FAILED","objectID":"app1","timestampNano":9}"#,
        "\n",
    );

    fn service(client: FakeClient, store: Arc<MemoryStore>) -> Arc<SyncService> {
        let config = SyncConfig {
            sync_interval: Duration::from_secs(60),
            reconnect_delay: Duration::from_millis(500),
            accumulator_idle: Duration::from_millis(50),
        };
        Arc::new(SyncService::new(
            config,
            Arc::new(client),
            store,
            Arc::new(WorkQueue::new(WorkQueueConfig::default())),
            Arc::new(EventCounters::new()),
        ))
    }

    #[tokio::test]
    async fn test_run_collects_and_reconciles_until_shutdown() {
        let client = FakeClient::default();
        *client.partitions.lock().unwrap() = vec![PartitionInfo {
            name: "default".into(),
            ..Default::default()
        }];
        *client.feed.lock().unwrap() = FEED.as_bytes().to_vec();
        client.applications.lock().unwrap().insert(
            "app1".into(),
            ApplicationInfo {
                id: "app1".into(),
                ..Default::default()
            },
        );
        let store = Arc::new(MemoryStore::new());
        let service = service(client, store.clone());

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.run(rx).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let partitions = store.get_all_partitions(&RecordFilters::live()).await.unwrap();
                let app = store.get_application("app1").await.unwrap();
                if !partitions.is_empty() && app.is_some() {
                    break;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let app = store.get_application("app1").await.unwrap().unwrap();
        assert_eq!(app.application.state, "APP_FAILED");
        assert!(service.is_collecting());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!service.is_collecting());
    }

    #[tokio::test]
    async fn test_service_shutdown_stops_reconnecting() {
        let service = service(FakeClient::default(), Arc::new(MemoryStore::new()));
        service.collector_running.store(true, Ordering::SeqCst);
        service.shutdown();

        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(1), service.run_event_collector(rx))
            .await
            .unwrap();
        assert!(!service.is_collecting());
    }

    #[tokio::test]
    async fn test_shutdown_before_run_keeps_collector_off() {
        let client = FakeClient::default();
        *client.feed.lock().unwrap() = FEED.as_bytes().to_vec();
        client.applications.lock().unwrap().insert(
            "app1".into(),
            ApplicationInfo {
                id: "app1".into(),
                ..Default::default()
            },
        );
        let store = Arc::new(MemoryStore::new());
        let service = service(client, store.clone());
        service.shutdown();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.run(rx).await }
        });

        sleep(Duration::from_millis(300)).await;
        assert!(!service.is_collecting());
        assert!(store.get_application("app1").await.unwrap().is_none());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
