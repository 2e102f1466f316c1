//! Request/response DTOs for the REST API.
//!
//! Grounded on `src/rest/dto.rs`'s From-impl-per-response-type convention,
//! trimmed to the shapes §6.1 names. `Project`/`Agent`/`CompactAgent` and
//! `NormalizedEvent` already carry the wire-stable `camelCase` renames
//! (model.rs), so most GET endpoints serialize them directly rather than
//! through an intermediate DTO — only request bodies and the handful of
//! responses with no model-layer counterpart (health, webhook status,
//! messages, subscriptions) get dedicated types here.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::model::AgentCallback;
use crate::providers::JournalMessage;
use crate::webhook::{AttemptRecord, WebhookCounters};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateProjectRequest {
    pub name: String,
    pub cwd: String,
    #[serde(default)]
    pub callback: Option<AgentCallback>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateProjectRequest {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub callback: Option<AgentCallback>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateAgentRequest {
    pub provider: String,
    pub task: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub callback: Option<AgentCallback>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SendInputRequest {
    pub text: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OutputResponse {
    pub text: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(rename = "tmuxAvailable")]
    pub tmux_available: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubscriptionSummary {
    pub id: String,
    pub provider: String,
    pub enabled: bool,
}

/// Wire shape for a single normalized chat message, per §4.6. `providers::
/// JournalMessage` itself carries no serde impl (it's an internal parsing
/// type reused across providers); this DTO is the read-only HTTP view.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<chrono::DateTime<chrono::Utc>>,
    pub role: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl From<&JournalMessage> for MessageDto {
    fn from(m: &JournalMessage) -> Self {
        Self {
            id: m.id.clone(),
            ts: m.ts,
            role: m.role.as_str().to_string(),
            text: m.text.clone(),
            finish_reason: m.finish_reason.clone(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessagesResponse {
    pub messages: Vec<MessageDto>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LastMessageResponse {
    pub message: Option<MessageDto>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookStatusResponse {
    pub counters: WebhookCounters,
    #[serde(rename = "recentAttempts")]
    pub recent_attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ProbeReceiverRequest {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProbeReceiverResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, Default, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CompactQuery {
    #[serde(default)]
    pub compact: bool,
}

#[derive(Debug, Deserialize, Default, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OutputQuery {
    #[serde(default)]
    pub lines: Option<u32>,
}

#[derive(Debug, Deserialize, Default, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct MessagesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize, Default, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: Option<String>,
}
