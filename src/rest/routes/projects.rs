//! Project CRUD handlers (§6.1 `/projects`, `/projects/:name`).

use axum::extract::{Path, State};
use axum::Json;

use crate::error::HarnessError;
use crate::model::Project;
use crate::rest::dto::{CreateProjectRequest, OkResponse, UpdateProjectRequest};
use crate::rest::state::ApiState;

#[utoipa::path(
    post,
    path = "/api/v1/projects",
    tag = "Projects",
    request_body = CreateProjectRequest,
    responses((status = 200, description = "Project created", body = Project))
)]
pub async fn create_project(
    State(state): State<ApiState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<Project>, HarnessError> {
    let project =
        state.manager.create_project(&req.name, &req.cwd, req.callback).await?;
    Ok(Json(project.redacted()))
}

#[utoipa::path(
    get,
    path = "/api/v1/projects",
    tag = "Projects",
    responses((status = 200, description = "All known projects", body = [Project]))
)]
pub async fn list_projects(State(state): State<ApiState>) -> Json<Vec<Project>> {
    let projects = state.manager.list_projects().await;
    Json(projects.into_iter().map(|p| p.redacted()).collect())
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{name}",
    tag = "Projects",
    responses((status = 200, description = "Project detail", body = Project))
)]
pub async fn get_project(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Project>, HarnessError> {
    let project = state.manager.get_project(&name).await?;
    Ok(Json(project.redacted()))
}

#[utoipa::path(
    patch,
    path = "/api/v1/projects/{name}",
    tag = "Projects",
    request_body = UpdateProjectRequest,
    responses((status = 200, description = "Updated project", body = Project))
)]
pub async fn update_project(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<Json<Project>, HarnessError> {
    let callback = req.callback.map(Some);
    let project =
        state.manager.update_project(&name, req.cwd.as_deref(), callback).await?;
    Ok(Json(project.redacted()))
}

#[utoipa::path(
    delete,
    path = "/api/v1/projects/{name}",
    tag = "Projects",
    responses((status = 200, description = "Project removed", body = OkResponse))
)]
pub async fn delete_project(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<OkResponse>, HarnessError> {
    state.manager.delete_project(&name).await?;
    Ok(Json(OkResponse { ok: true }))
}
