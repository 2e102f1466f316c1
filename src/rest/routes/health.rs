//! Health check endpoint (§6.1 `GET /health`).

use axum::extract::State;
use axum::Json;

use crate::rest::dto::HealthResponse;
use crate::rest::state::ApiState;
use crate::tmux::TmuxClient;

#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let tmux_available = state.manager.tmux().check_available().is_ok();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tmux_available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::debug::DebugTracker;
    use crate::eventbus::EventBus;
    use crate::manager::Manager;
    use crate::tmux::MockTmuxClient;
    use crate::webhook::WebhookDispatcher;
    use std::sync::Arc;

    fn make_state() -> ApiState {
        let config = Arc::new(Config::default());
        let tmux = Arc::new(MockTmuxClient::new());
        let event_bus = Arc::new(EventBus::new(config.poller.max_event_history));
        let manager = Arc::new(Manager::new(config.clone(), tmux, event_bus.clone()));
        let webhook = WebhookDispatcher::new(manager.clone());
        ApiState { manager, event_bus, webhook, debug: Arc::new(DebugTracker::new()), config }
    }

    #[tokio::test]
    async fn health_reports_ok_with_mock_tmux() {
        let resp = health(State(make_state())).await;
        assert_eq!(resp.status, "ok");
        assert!(resp.tmux_available);
    }
}
