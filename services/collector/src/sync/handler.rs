//! Application lifecycle tracking from feed events.

use std::collections::HashMap;
use std::slice;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};
use yhs_events::{
    AllocationInfo, ApplicationInfo, ChangeDetail, ChangeEvent, ChangeType, RequestInfo,
};

use crate::client::SchedulerClient;
use crate::store::PersistenceStore;
use crate::workqueue::{Job, WorkQueue};

/// What handling one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The application was fetched and cached.
    Cached,
    /// The cached application changed.
    Updated,
    /// The cached application changed and a job persisting it was queued.
    Persisted,
    /// The application left the cache.
    Evicted,
    /// The event was forwarded to the queue accumulator.
    Forwarded,
    /// The event was counted but needs no handling.
    Ignored,
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The event refers to an application that is not cached.
    NotCached,
    /// The scheduler does not know the application.
    NotFound,
    FetchFailed(String),
    EnqueueFailed(String),
    /// The change/detail combination is not one applications produce.
    Unexpected,
}

/// Tracks live applications between the moment they are submitted and the
/// moment they finish.
///
/// The cache is owned by the event loop; nothing else reads or writes it.
pub struct ApplicationEventHandler {
    cache: HashMap<String, ApplicationInfo>,
    client: Arc<dyn SchedulerClient>,
    store: Arc<dyn PersistenceStore>,
    workqueue: Arc<WorkQueue>,
}

impl ApplicationEventHandler {
    pub fn new(
        client: Arc<dyn SchedulerClient>,
        store: Arc<dyn PersistenceStore>,
        workqueue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            cache: HashMap::new(),
            client,
            store,
            workqueue,
        }
    }

    pub fn cached(&self, id: &str) -> Option<&ApplicationInfo> {
        self.cache.get(id)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Apply an application event.
    pub async fn handle(&mut self, event: &ChangeEvent) -> Outcome {
        let detail = event.change_detail;
        match event.change_type {
            ChangeType::Add => match detail {
                ChangeDetail::AppNew | ChangeDetail::DetailsNone => self.fetch(event).await,
                ChangeDetail::AppAlloc => self.with_cached(event, |app| {
                    app.append_allocation(AllocationInfo {
                        allocation_key: event.reference_id.clone(),
                        allocation_time: event.timestamp_nano,
                        resource: event.resource.clone(),
                        application_id: Some(event.object_id.clone()),
                        ..Default::default()
                    });
                    false
                }),
                ChangeDetail::AppRequest => self.with_cached(event, |app| {
                    app.append_request(RequestInfo {
                        allocation_key: event.reference_id.clone(),
                        request_time: event.timestamp_nano,
                        resource: event.resource.clone(),
                        application_id: Some(event.object_id.clone()),
                        ..Default::default()
                    });
                    false
                }),
                _ => unexpected(event),
            },
            ChangeType::Set => match detail {
                ChangeDetail::AppNew => self.fetch(event).await,
                d if d.is_app_transition() => self.with_cached(event, |app| {
                    app.record_state(event.timestamp_nano, d.as_str());
                    d.is_app_terminal()
                }),
                _ => unexpected(event),
            },
            ChangeType::Remove => match detail {
                ChangeDetail::DetailsNone => {
                    if self.cache.remove(&event.object_id).is_some() {
                        debug!(app_id = %event.object_id, "Application evicted");
                    }
                    Outcome::Evicted
                }
                ChangeDetail::AppReject => self.with_cached(event, |app| {
                    app.record_state(event.timestamp_nano, ChangeDetail::AppReject.as_str());
                    if !event.message.is_empty() {
                        app.rejected_message = Some(event.message.clone());
                    }
                    true
                }),
                d if d.is_alloc_or_request_removal() => Outcome::Ignored,
                _ => unexpected(event),
            },
            _ => unexpected(event),
        }
    }

    async fn fetch(&mut self, event: &ChangeEvent) -> Outcome {
        let id = &event.object_id;
        match self.client.application(None, None, id).await {
            Ok(Some(app)) => {
                info!(app_id = %id, state = %app.state, "Application tracked");
                self.cache.insert(id.clone(), app);
                Outcome::Cached
            }
            Ok(None) => {
                warn!(app_id = %id, "Application not found on scheduler, event dropped");
                Outcome::Dropped(DropReason::NotFound)
            }
            Err(e) => {
                warn!(app_id = %id, error = %e, "Failed to fetch application, event dropped");
                Outcome::Dropped(DropReason::FetchFailed(e.to_string()))
            }
        }
    }

    /// Mutate the cached application; `apply` returns whether the result
    /// must be persisted now.
    fn with_cached(
        &mut self,
        event: &ChangeEvent,
        apply: impl FnOnce(&mut ApplicationInfo) -> bool,
    ) -> Outcome {
        let Some(app) = self.cache.get_mut(&event.object_id) else {
            warn!(
                app_id = %event.object_id,
                detail = %event.change_detail,
                "Application not cached, event dropped"
            );
            return Outcome::Dropped(DropReason::NotCached);
        };

        if !apply(app) {
            return Outcome::Updated;
        }

        let snapshot = app.clone();
        match self.persist(snapshot) {
            Ok(()) => Outcome::Persisted,
            Err(reason) => Outcome::Dropped(reason),
        }
    }

    fn persist(&self, app: ApplicationInfo) -> Result<(), DropReason> {
        let id = app.id.clone();
        let store = Arc::clone(&self.store);
        let app = Arc::new(app);
        let job = Job::new(move || {
            let store = Arc::clone(&store);
            let app = Arc::clone(&app);
            async move {
                store
                    .upsert_applications(slice::from_ref(&*app))
                    .await
                    .with_context(|| format!("failed to persist application {}", app.id))
            }
        })
        .named(format!("persist-application-{id}"));

        match self.workqueue.add(job) {
            Ok(job_id) => {
                info!(app_id = %id, job_id = %job_id, "Application persistence queued");
                Ok(())
            }
            Err(e) => {
                warn!(app_id = %id, error = %e, "Failed to queue application persistence");
                Err(DropReason::EnqueueFailed(e.to_string()))
            }
        }
    }
}

fn unexpected(event: &ChangeEvent) -> Outcome {
    warn!(
        app_id = %event.object_id,
        change = %event.change_type,
        detail = %event.change_detail,
        "Unexpected application event"
    );
    Outcome::Dropped(DropReason::Unexpected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rstest::rstest;
    use tokio::sync::watch;
    use yhs_events::EventType;

    use crate::client::fake::FakeClient;
    use crate::store::MemoryStore;
    use crate::workqueue::WorkQueueConfig;

    struct Harness {
        handler: ApplicationEventHandler,
        store: Arc<MemoryStore>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness(known: &[&str]) -> Harness {
        let client = FakeClient::default();
        for id in known {
            client.applications.lock().unwrap().insert(
                id.to_string(),
                ApplicationInfo {
                    id: id.to_string(),
                    partition: "default".into(),
                    queue_name: "root.default".into(),
                    state: "New".into(),
                    ..Default::default()
                },
            );
        }
        let store = Arc::new(MemoryStore::new());
        let workqueue = Arc::new(WorkQueue::new(WorkQueueConfig::default()));
        let (tx, rx) = watch::channel(false);
        workqueue.start(rx).unwrap();

        Harness {
            handler: ApplicationEventHandler::new(Arc::new(client), store.clone(), workqueue),
            store,
            _shutdown: tx,
        }
    }

    fn app_event(change: ChangeType, detail: ChangeDetail, id: &str, at: i64) -> ChangeEvent {
        ChangeEvent {
            event_type: EventType::App,
            change_type: change,
            change_detail: detail,
            object_id: id.to_string(),
            timestamp_nano: at,
            ..Default::default()
        }
    }

    async fn stored_state(store: &MemoryStore, id: &str) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(record) = store.get_application(id).await.unwrap() {
                    return record.application.state;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("application was never persisted")
    }

    #[tokio::test]
    async fn test_completed_application_is_persisted() {
        let mut h = harness(&["app1"]);

        let added = h
            .handler
            .handle(&app_event(ChangeType::Add, ChangeDetail::AppNew, "app1", 10))
            .await;
        assert_eq!(added, Outcome::Cached);

        let completed = h
            .handler
            .handle(&app_event(ChangeType::Set, ChangeDetail::AppCompleted, "app1", 20))
            .await;
        assert_eq!(completed, Outcome::Persisted);

        let app = h.handler.cached("app1").unwrap();
        assert_eq!(app.state, "APP_COMPLETED");
        assert_eq!(app.state_log.len(), 1);
        assert_eq!(app.state_log[0].time, 20);

        assert_eq!(stored_state(&h.store, "app1").await, "APP_COMPLETED");
    }

    #[tokio::test]
    async fn test_running_transition_only_updates_cache() {
        let mut h = harness(&["app1"]);
        h.handler
            .handle(&app_event(ChangeType::Add, ChangeDetail::DetailsNone, "app1", 1))
            .await;

        let outcome = h
            .handler
            .handle(&app_event(ChangeType::Set, ChangeDetail::AppRunning, "app1", 2))
            .await;

        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(h.handler.cached("app1").unwrap().state, "APP_RUNNING");
        assert!(h.store.get_application("app1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_application_is_dropped() {
        let mut h = harness(&[]);
        let outcome = h
            .handler
            .handle(&app_event(ChangeType::Add, ChangeDetail::AppNew, "app-unknown", 1))
            .await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::NotFound));
        assert_eq!(h.handler.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_transition_for_uncached_application_is_dropped() {
        let mut h = harness(&["app1"]);
        let outcome = h
            .handler
            .handle(&app_event(ChangeType::Set, ChangeDetail::AppRunning, "app1", 1))
            .await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::NotCached));
    }

    #[tokio::test]
    async fn test_allocations_and_requests_are_deduplicated() {
        let mut h = harness(&["app1"]);
        h.handler
            .handle(&app_event(ChangeType::Add, ChangeDetail::AppNew, "app1", 1))
            .await;

        let mut alloc = app_event(ChangeType::Add, ChangeDetail::AppAlloc, "app1", 2);
        alloc.reference_id = "alloc-1".into();
        alloc.resource.insert("memory".into(), 1024);
        let mut request = app_event(ChangeType::Add, ChangeDetail::AppRequest, "app1", 3);
        request.reference_id = "ask-1".into();

        for event in [&alloc, &alloc, &request, &request] {
            assert_eq!(h.handler.handle(event).await, Outcome::Updated);
        }

        let app = h.handler.cached("app1").unwrap();
        assert_eq!(app.allocations.len(), 1);
        assert_eq!(app.allocations[0].allocation_key, "alloc-1");
        assert_eq!(app.allocations[0].resource["memory"], 1024);
        assert_eq!(app.requests.len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_persisted() {
        let mut h = harness(&["app1"]);
        h.handler
            .handle(&app_event(ChangeType::Add, ChangeDetail::AppNew, "app1", 1))
            .await;

        let mut reject = app_event(ChangeType::Remove, ChangeDetail::AppReject, "app1", 5);
        reject.message = "queue is full".into();
        assert_eq!(h.handler.handle(&reject).await, Outcome::Persisted);

        assert_eq!(stored_state(&h.store, "app1").await, "APP_REJECT");
        let stored = h.store.get_application("app1").await.unwrap().unwrap();
        assert_eq!(
            stored.application.rejected_message.as_deref(),
            Some("queue is full")
        );
    }

    #[tokio::test]
    async fn test_remove_evicts_idempotently() {
        let mut h = harness(&["app1"]);
        h.handler
            .handle(&app_event(ChangeType::Add, ChangeDetail::AppNew, "app1", 1))
            .await;

        let remove = app_event(ChangeType::Remove, ChangeDetail::DetailsNone, "app1", 2);
        assert_eq!(h.handler.handle(&remove).await, Outcome::Evicted);
        assert_eq!(h.handler.handle(&remove).await, Outcome::Evicted);
        assert_eq!(h.handler.cache_len(), 0);
    }

    #[rstest]
    #[case::add_new(ChangeType::Add, ChangeDetail::AppNew)]
    #[case::add_details_none(ChangeType::Add, ChangeDetail::DetailsNone)]
    #[case::set_new(ChangeType::Set, ChangeDetail::AppNew)]
    #[tokio::test]
    async fn test_new_application_is_fetched_and_cached(
        #[case] change: ChangeType,
        #[case] detail: ChangeDetail,
    ) {
        let mut h = harness(&["app1"]);

        let outcome = h.handler.handle(&app_event(change, detail, "app1", 1)).await;

        assert_eq!(outcome, Outcome::Cached);
        let app = h.handler.cached("app1").unwrap();
        assert_eq!(app.queue_name, "root.default");
        assert_eq!(h.handler.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_starting_transition_is_logged() {
        let mut h = harness(&["app1"]);
        h.handler
            .handle(&app_event(ChangeType::Set, ChangeDetail::AppNew, "app1", 1))
            .await;

        let outcome = h
            .handler
            .handle(&app_event(ChangeType::Set, ChangeDetail::AppStarting, "app1", 2))
            .await;

        assert_eq!(outcome, Outcome::Updated);
        let app = h.handler.cached("app1").unwrap();
        assert_eq!(app.state, "APP_STARTING");
        assert_eq!(app.state_log[0].application_state, "APP_STARTING");
    }

    #[rstest]
    #[case::alloc_cancel(ChangeDetail::AllocCancel)]
    #[case::alloc_preempt(ChangeDetail::AllocPreempt)]
    #[case::alloc_node_removed(ChangeDetail::AllocNodeRemoved)]
    #[case::request_timeout(ChangeDetail::RequestTimeout)]
    #[tokio::test]
    async fn test_removals_are_ignored(#[case] detail: ChangeDetail) {
        let mut h = harness(&["app1"]);
        h.handler
            .handle(&app_event(ChangeType::Add, ChangeDetail::AppNew, "app1", 1))
            .await;

        let outcome = h
            .handler
            .handle(&app_event(ChangeType::Remove, detail, "app1", 2))
            .await;
        assert_eq!(outcome, Outcome::Ignored);
        assert!(h.handler.cached("app1").unwrap().state_log.is_empty());
    }

    #[rstest]
    #[case::add_running(ChangeType::Add, ChangeDetail::AppRunning)]
    #[case::set_alloc(ChangeType::Set, ChangeDetail::AppAlloc)]
    #[case::none(ChangeType::None, ChangeDetail::DetailsNone)]
    #[tokio::test]
    async fn test_unexpected_events_change_nothing(
        #[case] change: ChangeType,
        #[case] detail: ChangeDetail,
    ) {
        let mut h = harness(&["app1"]);
        h.handler
            .handle(&app_event(ChangeType::Add, ChangeDetail::AppNew, "app1", 1))
            .await;
        let before = h.handler.cached("app1").cloned();

        let outcome = h.handler.handle(&app_event(change, detail, "app1", 2)).await;

        assert_eq!(outcome, Outcome::Dropped(DropReason::Unexpected));
        assert_eq!(h.handler.cached("app1").cloned(), before);
    }
}
