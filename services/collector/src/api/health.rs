//! Health check endpoints.
//!
//! `/readyz` reports whether the collector can do useful work: the
//! scheduler answers its health check and the store is reachable.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use super::AppState;

const SERVICE: &str = "yhs-collector";

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    /// RFC 3339.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    pub scheduler: ComponentStatus,
    pub store: ComponentStatus,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok" or "unavailable".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentStatus {
    fn from_check(problem: Option<String>) -> Self {
        Self {
            status: if problem.is_none() { "ok" } else { "unavailable" }.to_string(),
            message: problem,
        }
    }

    fn is_ok(&self) -> bool {
        self.message.is_none()
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, components: Option<ComponentHealth>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components,
    }
}

/// The process is up. No dependency is checked.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// 503 unless both the scheduler and the store are healthy.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let (scheduler, store) = tokio::join!(state.client().healthcheck(), state.store().health_check());

    let scheduler = ComponentStatus::from_check(match scheduler {
        Ok(health) if health.healthy => None,
        Ok(health) => {
            let failed: Vec<&str> = health
                .health_checks
                .iter()
                .filter(|check| !check.succeeded)
                .map(|check| check.name.as_str())
                .collect();
            Some(if failed.is_empty() {
                "scheduler reports unhealthy".to_string()
            } else {
                format!("failed checks: {}", failed.join(", "))
            })
        }
        Err(e) => Some(e.to_string()),
    });
    let store = ComponentStatus::from_check(store.err().map(|e| e.to_string()));

    let ready = scheduler.is_ok() && store.is_ok();
    let body = response(
        if ready { "ok" } else { "degraded" },
        Some(ComponentHealth { scheduler, store }),
    );

    if ready {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::api::{create_router, test_support::get_json};
    use crate::client::fake::FakeClient;
    use crate::counters::EventCounters;
    use crate::store::MemoryStore;

    fn router(healthy: bool) -> Router {
        let client = FakeClient {
            healthy,
            ..Default::default()
        };
        create_router(AppState::new(
            Arc::new(client),
            Arc::new(MemoryStore::new()),
            Arc::new(EventCounters::new()),
        ))
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_livez_returns_ok() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_ok_when_dependencies_healthy() {
        let (status, body) = get_json(router(true), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["components"]["scheduler"]["status"], "ok");
        assert_eq!(body["components"]["store"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_readyz_degraded_when_scheduler_unhealthy() {
        let (status, body) = get_json(router(false), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["components"]["scheduler"]["status"], "unavailable");
        assert_eq!(
            body["components"]["scheduler"]["message"],
            "scheduler reports unhealthy"
        );
    }
}
