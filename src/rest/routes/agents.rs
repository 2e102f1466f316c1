//! Agent CRUD and interaction handlers (§6.1
//! `/projects/:name/agents[/:id[/...]]`).

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::HarnessError;
use crate::messages::{self, RoleFilter};
use crate::model::{Agent, CompactAgent};
use crate::providers;
use crate::rest::dto::{
    CompactQuery, CreateAgentRequest, LastMessageResponse, MessageDto, MessagesQuery,
    MessagesResponse, OkResponse, OutputQuery, OutputResponse, SendInputRequest,
};
use crate::rest::state::ApiState;

const COMPACT_MODE_HEADER: &str = "x-agent-harness-mode";

/// Wraps a JSON body, setting `X-Agent-Harness-Mode: compact` when requested
/// (§6.1's `compact=true` contract). Full-fidelity bodies (`compact=false`)
/// pass through with no extra header.
fn respond_compact<T: Serialize>(body: T, compact: bool) -> Response {
    let mut resp = Json(body).into_response();
    if compact {
        resp.headers_mut().insert(COMPACT_MODE_HEADER, HeaderValue::from_static("compact"));
    }
    resp
}

#[utoipa::path(
    post,
    path = "/api/v1/projects/{name}/agents",
    tag = "Agents",
    request_body = CreateAgentRequest,
    responses((status = 200, description = "Agent created", body = Agent))
)]
pub async fn create_agent(
    State(state): State<ApiState>,
    Path(project): Path<String>,
    Json(req): Json<CreateAgentRequest>,
) -> Result<Json<Agent>, HarnessError> {
    let agent = state
        .manager
        .create_agent(
            &project,
            &req.provider,
            &req.task,
            req.model.as_deref(),
            req.subscription.as_deref(),
            req.callback,
            req.name.as_deref(),
        )
        .await?;
    Ok(Json(agent.redacted()))
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{name}/agents",
    tag = "Agents",
    params(CompactQuery),
    responses((status = 200, description = "Agents in the project", body = [Agent]))
)]
pub async fn list_agents(
    State(state): State<ApiState>,
    Path(project): Path<String>,
    Query(query): Query<CompactQuery>,
) -> Result<Response, HarnessError> {
    let agents = state.manager.list_agents(&project).await?;
    if query.compact {
        let compact: Vec<CompactAgent> = agents.iter().map(Agent::compact).collect();
        Ok(respond_compact(compact, true))
    } else {
        let full: Vec<Agent> = agents.iter().map(Agent::redacted).collect();
        Ok(respond_compact(full, false))
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{name}/agents/{id}",
    tag = "Agents",
    params(CompactQuery),
    responses((status = 200, description = "Agent detail", body = Agent))
)]
pub async fn get_agent(
    State(state): State<ApiState>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<CompactQuery>,
) -> Result<Response, HarnessError> {
    let agent = state.manager.get_agent(&project, &id).await?;
    if query.compact {
        Ok(respond_compact(agent.compact(), true))
    } else {
        Ok(respond_compact(agent.redacted(), false))
    }
}

#[utoipa::path(
    delete,
    path = "/api/v1/projects/{name}/agents/{id}",
    tag = "Agents",
    responses((status = 200, description = "Agent removed", body = OkResponse))
)]
pub async fn delete_agent(
    State(state): State<ApiState>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Json<OkResponse>, HarnessError> {
    state.manager.delete_agent(&project, &id).await?;
    Ok(Json(OkResponse { ok: true }))
}

#[utoipa::path(
    post,
    path = "/api/v1/projects/{name}/agents/{id}/input",
    tag = "Agents",
    request_body = SendInputRequest,
    responses((status = 200, description = "Input delivered", body = OkResponse))
)]
pub async fn send_input(
    State(state): State<ApiState>,
    Path((project, id)): Path<(String, String)>,
    Json(req): Json<SendInputRequest>,
) -> Result<Json<OkResponse>, HarnessError> {
    state.manager.send_input(&project, &id, &req.text).await?;
    Ok(Json(OkResponse { ok: true }))
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{name}/agents/{id}/output",
    tag = "Agents",
    params(OutputQuery),
    responses((status = 200, description = "Captured pane tail", body = OutputResponse))
)]
pub async fn get_output(
    State(state): State<ApiState>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<OutputQuery>,
) -> Result<Json<OutputResponse>, HarnessError> {
    let text = state.manager.get_agent_output(&project, &id, query.lines).await?;
    Ok(Json(OutputResponse { text }))
}

#[utoipa::path(
    post,
    path = "/api/v1/projects/{name}/agents/{id}/abort",
    tag = "Agents",
    responses((status = 200, description = "Abort signal sent", body = OkResponse))
)]
pub async fn abort_agent(
    State(state): State<ApiState>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Json<OkResponse>, HarnessError> {
    state.manager.abort_agent(&project, &id).await?;
    Ok(Json(OkResponse { ok: true }))
}

fn journal_path_for(agent: &Agent) -> Result<(Box<dyn providers::Provider>, PathBuf), HarnessError> {
    let provider = providers::by_name(&agent.provider)
        .ok_or_else(|| HarnessError::UnknownProvider(agent.provider.clone()))?;
    let path = agent
        .provider_session_file
        .as_ref()
        .ok_or_else(|| HarnessError::InvalidRequest("agent has no journal yet".to_string()))?;
    Ok((provider, PathBuf::from(path)))
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{name}/agents/{id}/messages",
    tag = "Agents",
    params(MessagesQuery),
    responses((status = 200, description = "Role-filtered message history", body = MessagesResponse))
)]
pub async fn get_messages(
    State(state): State<ApiState>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, HarnessError> {
    let agent = state.manager.get_agent(&project, &id).await?;
    let (provider, path) = journal_path_for(&agent)?;
    let filter = query
        .role
        .as_deref()
        .map(|r| {
            RoleFilter::parse(r)
                .ok_or_else(|| HarnessError::InvalidRequest(format!("unknown role filter '{r}'")))
        })
        .transpose()?
        .unwrap_or(RoleFilter::All);
    let parsed = messages::read_messages(provider.as_ref(), &path, filter, query.limit)
        .map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
    let messages = parsed.iter().map(MessageDto::from).collect();
    Ok(Json(MessagesResponse { messages }))
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{name}/agents/{id}/messages/last",
    tag = "Agents",
    params(CompactQuery),
    responses((status = 200, description = "Most recent assistant message", body = LastMessageResponse))
)]
pub async fn get_last_message(
    State(state): State<ApiState>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<CompactQuery>,
) -> Result<Response, HarnessError> {
    let agent = state.manager.get_agent(&project, &id).await?;
    let (provider, path) = journal_path_for(&agent)?;
    let parsed = messages::read_messages(provider.as_ref(), &path, RoleFilter::All, None)
        .map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
    let message = messages::last_assistant_message(&parsed).map(MessageDto::from);
    Ok(respond_compact(LastMessageResponse { message }, query.compact))
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
    async fn create_then_list_agents_round_trips() {
        let state = make_state();
        state.manager.create_project("p1", "/tmp/p1", None).await.unwrap();
        let req = CreateAgentRequest {
            provider: "codex".to_string(),
            task: "say hi".to_string(),
            model: None,
            subscription: None,
            callback: None,
            name: None,
        };
        let created = create_agent(
            State(state.clone()),
            Path("p1".to_string()),
            Json(req),
        )
        .await
        .unwrap();
        assert_eq!(created.project.as_str(), "p1");

        let listed = list_agents(State(state), Path("p1".to_string()), Query(CompactQuery::default()))
            .await
            .unwrap();
        assert_eq!(listed.status(), axum::http::StatusCode::OK);
    }
}
