//! HTTP + SSE control plane (§6.1).
//!
//! Grounded on `src/rest/mod.rs`'s `build_router`/`serve` pair (axum Router
//! assembly, CORS + tracing layers, `axum::serve` over a bound
//! `TcpListener`), re-routed onto projects/agents/events/webhook/
//! subscriptions/health instead of issue types and collections.

use std::net::SocketAddr;

use anyhow::Result;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod dto;
pub mod openapi;
pub mod routes;
pub mod sse;
pub mod state;

pub use openapi::ApiDoc;
pub use state::ApiState;

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|o| o.parse::<axum::http::HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Build the API router with every route from §6.1 wired up.
pub fn build_router(state: ApiState) -> Router {
    let cors = cors_layer(&state.config.rest_api.cors_origins);

    Router::new()
        .route("/api/v1/health", get(routes::health::health))
        .route("/api/v1/projects", post(routes::projects::create_project))
        .route("/api/v1/projects", get(routes::projects::list_projects))
        .route("/api/v1/projects/:name", get(routes::projects::get_project))
        .route("/api/v1/projects/:name", patch(routes::projects::update_project))
        .route("/api/v1/projects/:name", delete(routes::projects::delete_project))
        .route("/api/v1/projects/:name/agents", post(routes::agents::create_agent))
        .route("/api/v1/projects/:name/agents", get(routes::agents::list_agents))
        .route("/api/v1/projects/:name/agents/:id", get(routes::agents::get_agent))
        .route("/api/v1/projects/:name/agents/:id", delete(routes::agents::delete_agent))
        .route("/api/v1/projects/:name/agents/:id/input", post(routes::agents::send_input))
        .route("/api/v1/projects/:name/agents/:id/output", get(routes::agents::get_output))
        .route("/api/v1/projects/:name/agents/:id/abort", post(routes::agents::abort_agent))
        .route("/api/v1/projects/:name/agents/:id/messages", get(routes::agents::get_messages))
        .route(
            "/api/v1/projects/:name/agents/:id/messages/last",
            get(routes::agents::get_last_message),
        )
        .route("/api/v1/projects/:name/events", get(routes::events::project_events))
        .route("/api/v1/projects/:name/agents/:id/events", get(routes::events::agent_events))
        .route("/api/v1/subscriptions", get(routes::subscriptions::list_subscriptions))
        .route("/api/v1/webhook/status", get(routes::webhook::webhook_status))
        .route("/api/v1/webhook/test", post(routes::webhook::webhook_test))
        .route("/api/v1/webhook/probe-receiver", post(routes::webhook::probe_receiver))
        .merge(SwaggerUi::new("/api/v1/docs").url("/api/v1/docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the API until the process is killed; the caller owns
/// shutdown (ctrl-c / signal handling lives in `main.rs`, not here).
pub async fn serve(state: ApiState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("REST API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
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

    #[test]
    fn build_router_does_not_panic() {
        let config = Arc::new(Config::default());
        let tmux = Arc::new(MockTmuxClient::new());
        let event_bus = Arc::new(EventBus::new(config.poller.max_event_history));
        let manager = Arc::new(Manager::new(config.clone(), tmux, event_bus.clone()));
        let webhook = WebhookDispatcher::new(manager.clone());
        let state = ApiState { manager, event_bus, webhook, debug: Arc::new(DebugTracker::new()), config };
        let _router = build_router(state);
    }
}
