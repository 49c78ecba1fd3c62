use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;
use tracing::warn;

use crate::app_state::AppState;

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

#[derive(Serialize)]
struct ReadinessResponse<'a> {
    status: &'a str,
    store: &'a str,
    bus: &'a str,
}

async fn healthz() -> impl IntoResponse {
    metrics::counter!("health_checks_total", "endpoint" => "healthz", "status" => "ok")
        .increment(1);
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Store down means publishes cannot be acknowledged: not ready. A lost bus
/// only costs cross-process visibility: still serving, but degraded.
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = match state.log.ping().await {
        Ok(()) => true,
        Err(err) => {
            warn!(store = state.log.name(), error = %err, "readiness store ping failed");
            false
        }
    };
    let bus_ok = state.fanout.bus_healthy();

    let (code, status) = match (store_ok, bus_ok) {
        (true, true) => (StatusCode::OK, "ready"),
        (true, false) => (StatusCode::OK, "degraded"),
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    metrics::counter!("health_checks_total", "endpoint" => "readyz", "status" => status)
        .increment(1);

    (
        code,
        Json(ReadinessResponse {
            status,
            store: if store_ok { "ok" } else { "error" },
            bus: if bus_ok { "connected" } else { "disconnected" },
        }),
    )
}

pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::{BusEnvelope, BusError, BusSubscription, FanoutBus, LocalBus, SharedBus},
        store::MemoryMessageLog,
    };
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use serde_json::Value;
    use shared::config::server::{Config, Profile};
    use tower::ServiceExt;

    #[derive(Debug)]
    struct DownBus;

    #[async_trait]
    impl FanoutBus for DownBus {
        async fn publish(&self, _envelope: &BusEnvelope) -> Result<(), BusError> {
            Err(BusError::Closed)
        }

        async fn subscribe(&self) -> Result<BusSubscription, BusError> {
            Err(BusError::Closed)
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    async fn state_with(log: Arc<MemoryMessageLog>, bus: SharedBus) -> Arc<AppState> {
        let config = Arc::new(Config::default_for_profile(Profile::Test));
        let state = Arc::new(AppState::assemble(config, log, bus));
        // A subscription that cannot be opened leaves the bus unhealthy.
        let _ = state.fanout.start().await;
        state
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
        let response = create_health_router()
            .with_state(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let state = state_with(Arc::new(MemoryMessageLog::new()), Arc::new(LocalBus::new(8))).await;
        let (status, body) = get_json(state, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn readyz_is_ready_with_store_and_bus() {
        let state = state_with(Arc::new(MemoryMessageLog::new()), Arc::new(LocalBus::new(8))).await;
        let (status, body) = get_json(state, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn readyz_is_degraded_without_the_bus() {
        let state = state_with(Arc::new(MemoryMessageLog::new()), Arc::new(DownBus)).await;
        let (status, body) = get_json(state, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["bus"], "disconnected");
    }

    #[tokio::test]
    async fn readyz_is_unavailable_without_the_store() {
        let log = Arc::new(MemoryMessageLog::new());
        log.fail_queries(true);
        let state = state_with(log, Arc::new(LocalBus::new(8))).await;
        let (status, body) = get_json(state, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["store"], "error");
    }
}
