//! OpenAPI specification builder using utoipa.
//!
//! Grounded on `src/rest/openapi.rs`'s `#[derive(OpenApi)]` struct plus
//! `json()`/`yaml()` helpers that stamp `CARGO_PKG_VERSION` onto the
//! generated spec, re-pointed at this crate's paths/schemas/tags.

use utoipa::OpenApi;

use crate::error::ErrorBody;
use crate::model::{Agent, AgentCallback, AgentStatus, CompactAgent, Project};
use crate::rest::dto::{
    CompactQuery, CreateAgentRequest, CreateProjectRequest, HealthResponse, LastMessageResponse,
    MessageDto, MessagesResponse, MessagesQuery, OkResponse, OutputQuery, OutputResponse,
    ProbeReceiverRequest, ProbeReceiverResponse, SendInputRequest, SinceQuery,
    SubscriptionSummary, UpdateProjectRequest, WebhookStatusResponse,
};
use crate::webhook::{AttemptRecord, TestWebhookInput, WebhookCounters};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "agent-harness API",
        version = "0.1.0",
        description = "HTTP and SSE control plane for supervising interactive coding-agent CLI processes inside tmux.",
        license(name = "MIT")
    ),
    paths(
        crate::rest::routes::health::health,
        crate::rest::routes::projects::create_project,
        crate::rest::routes::projects::list_projects,
        crate::rest::routes::projects::get_project,
        crate::rest::routes::projects::update_project,
        crate::rest::routes::projects::delete_project,
        crate::rest::routes::agents::create_agent,
        crate::rest::routes::agents::list_agents,
        crate::rest::routes::agents::get_agent,
        crate::rest::routes::agents::delete_agent,
        crate::rest::routes::agents::send_input,
        crate::rest::routes::agents::get_output,
        crate::rest::routes::agents::abort_agent,
        crate::rest::routes::agents::get_messages,
        crate::rest::routes::agents::get_last_message,
        crate::rest::routes::events::project_events,
        crate::rest::routes::events::agent_events,
        crate::rest::routes::subscriptions::list_subscriptions,
        crate::rest::routes::webhook::webhook_status,
        crate::rest::routes::webhook::webhook_test,
        crate::rest::routes::webhook::probe_receiver,
    ),
    components(
        schemas(
            // Core entities
            Project,
            Agent,
            CompactAgent,
            AgentStatus,
            AgentCallback,
            // Requests
            CreateProjectRequest,
            UpdateProjectRequest,
            CreateAgentRequest,
            SendInputRequest,
            TestWebhookInput,
            ProbeReceiverRequest,
            // Responses
            OkResponse,
            OutputResponse,
            HealthResponse,
            SubscriptionSummary,
            MessageDto,
            MessagesResponse,
            LastMessageResponse,
            WebhookStatusResponse,
            WebhookCounters,
            AttemptRecord,
            ProbeReceiverResponse,
            ErrorBody,
            // Query params
            CompactQuery,
            OutputQuery,
            MessagesQuery,
            SinceQuery,
        )
    ),
    tags(
        (name = "Health", description = "Liveness and tmux-availability check"),
        (name = "Projects", description = "Workspace CRUD, one tmux session per project"),
        (name = "Agents", description = "Agent lifecycle, input/output, messages"),
        (name = "Events", description = "Server-sent event streams"),
        (name = "Subscriptions", description = "Configured credential profiles"),
        (name = "Webhook", description = "Webhook delivery status and testing"),
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate the OpenAPI specification as a JSON string. The version is
    /// stamped from `CARGO_PKG_VERSION` to stay in sync with Cargo.toml.
    pub fn json() -> Result<String, serde_json::Error> {
        let mut spec = Self::openapi();
        spec.info.version = env!("CARGO_PKG_VERSION").to_string();
        serde_json::to_string_pretty(&spec)
    }

    /// Generate the OpenAPI specification as a YAML string.
    #[allow(dead_code)]
    pub fn yaml() -> Result<String, serde_yaml::Error> {
        let mut spec = Self::openapi();
        spec.info.version = env!("CARGO_PKG_VERSION").to_string();
        serde_yaml::to_string(&spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_spec_generates() {
        let spec = ApiDoc::json().expect("failed to generate OpenAPI spec");
        assert!(spec.contains("agent-harness API"));
        assert!(spec.contains("/api/v1/health"));
        assert!(spec.contains("/api/v1/projects"));
    }

    #[test]
    fn openapi_has_all_tags() {
        let spec = ApiDoc::json().expect("failed to generate OpenAPI spec");
        for tag in ["Health", "Projects", "Agents", "Events", "Subscriptions", "Webhook"] {
            assert!(spec.contains(&format!("\"{tag}\"")), "missing tag {tag}");
        }
    }
}
