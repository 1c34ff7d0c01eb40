//! Event statistics endpoint.

use std::collections::BTreeMap;

use axum::{extract::State, routing::get, Json, Router};

use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws/v1/event-statistics", get(event_statistics))
}

/// Events received since start, by `TYPE-CHANGE` key.
async fn event_statistics(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    Json(state.counters().snapshot())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use yhs_events::{ChangeType, EventKey, EventType};

    use crate::api::{create_router, test_support::get_json, AppState};
    use crate::client::fake::FakeClient;
    use crate::counters::EventCounters;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_event_statistics_reports_counts() {
        let counters = Arc::new(EventCounters::new());
        counters.record(EventKey::new(EventType::App, ChangeType::Add));
        counters.record(EventKey::new(EventType::App, ChangeType::Add));
        counters.record(EventKey::new(EventType::Queue, ChangeType::Set));

        let router = create_router(AppState::new(
            Arc::new(FakeClient::default()),
            Arc::new(MemoryStore::new()),
            counters,
        ));
        let (status, body) = get_json(router, "/ws/v1/event-statistics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"APP-ADD": 2, "QUEUE-SET": 1}));
    }
}
