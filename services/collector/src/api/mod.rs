//! HTTP surface: health probes and event statistics.

mod health;
mod stats;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::client::SchedulerClient;
use crate::counters::EventCounters;
use crate::store::PersistenceStore;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    client: Arc<dyn SchedulerClient>,
    store: Arc<dyn PersistenceStore>,
    counters: Arc<EventCounters>,
}

impl AppState {
    pub fn new(
        client: Arc<dyn SchedulerClient>,
        store: Arc<dyn PersistenceStore>,
        counters: Arc<EventCounters>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                client,
                store,
                counters,
            }),
        }
    }

    pub fn client(&self) -> &dyn SchedulerClient {
        self.inner.client.as_ref()
    }

    pub fn store(&self) -> &dyn PersistenceStore {
        self.inner.store.as_ref()
    }

    pub fn counters(&self) -> &EventCounters {
        &self.inner.counters
    }
}

/// Build the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(stats::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
