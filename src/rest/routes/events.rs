//! SSE event stream handlers (§6.1 `/projects/:name/events`,
//! `/projects/:name/agents/:id/events`).

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};

use crate::eventbus::EventFilter;
use crate::ids::{AgentId, EventId, ProjectName};
use crate::rest::dto::SinceQuery;
use crate::rest::sse::stream_events;
use crate::rest::state::ApiState;

fn parse_since(raw: &Option<String>) -> Option<EventId> {
    raw.as_deref().and_then(EventId::parse)
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{name}/events",
    tag = "Events",
    params(SinceQuery),
    responses((status = 200, description = "Server-sent events for a project"))
)]
pub async fn project_events(
    State(state): State<ApiState>,
    Path(project): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let filter = EventFilter {
        project: ProjectName::parse(&project).ok(),
        agent_id: None,
        types: None,
    };
    stream_events(state.event_bus, filter, parse_since(&query.since))
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{name}/agents/{id}/events",
    tag = "Events",
    params(SinceQuery),
    responses((status = 200, description = "Server-sent events for a single agent"))
)]
pub async fn agent_events(
    State(state): State<ApiState>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<SinceQuery>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let filter = EventFilter {
        project: ProjectName::parse(&project).ok(),
        agent_id: AgentId::parse(&id).ok(),
        types: None,
    };
    stream_events(state.event_bus, filter, parse_since(&query.since))
}
