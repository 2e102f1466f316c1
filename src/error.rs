//! Wire-stable error kinds (§7) and their HTTP mapping.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("project '{0}' not found")]
    ProjectNotFound(String),
    #[error("project '{0}' already exists")]
    ProjectExists(String),
    #[error("agent '{0}' not found in project '{1}'")]
    AgentNotFound(String, String),
    #[error("agent name '{0}' is invalid")]
    AgentNameInvalid(String),
    #[error("agent name '{0}' already used in project '{1}'")]
    NameConflict(String, String),
    #[error("provider '{0}' is not registered")]
    UnknownProvider(String),
    #[error("provider '{0}' is disabled")]
    ProviderDisabled(String),
    #[error("subscription '{0}' not found")]
    SubscriptionNotFound(String),
    #[error("subscription '{0}' does not match provider '{1}'")]
    SubscriptionProviderMismatch(String, String),
    #[error("subscription '{0}' is invalid: {1}")]
    SubscriptionInvalid(String, String),
    #[error("tmux command failed: {0}")]
    TmuxError(String),
    #[error("tmux is not installed")]
    TmuxUnavailable,
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HarnessError {
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            HarnessError::ProjectExists(_) => "PROJECT_EXISTS",
            HarnessError::AgentNotFound(_, _) => "AGENT_NOT_FOUND",
            HarnessError::AgentNameInvalid(_) => "AGENT_NAME_INVALID",
            HarnessError::NameConflict(_, _) => "NAME_CONFLICT",
            HarnessError::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            HarnessError::ProviderDisabled(_) => "PROVIDER_DISABLED",
            HarnessError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            HarnessError::SubscriptionProviderMismatch(_, _) => "SUBSCRIPTION_PROVIDER_MISMATCH",
            HarnessError::SubscriptionInvalid(_, _) => "SUBSCRIPTION_INVALID",
            HarnessError::TmuxError(_) => "TMUX_ERROR",
            HarnessError::TmuxUnavailable => "TMUX_UNAVAILABLE",
            HarnessError::Unauthorized => "UNAUTHORIZED",
            HarnessError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HarnessError::ProjectNotFound(_) | HarnessError::AgentNotFound(_, _) => {
                StatusCode::NOT_FOUND
            }
            HarnessError::ProjectExists(_) | HarnessError::NameConflict(_, _) => {
                StatusCode::CONFLICT
            }
            HarnessError::AgentNameInvalid(_)
            | HarnessError::UnknownProvider(_)
            | HarnessError::ProviderDisabled(_)
            | HarnessError::SubscriptionNotFound(_)
            | HarnessError::SubscriptionProviderMismatch(_, _)
            | HarnessError::SubscriptionInvalid(_, _)
            | HarnessError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            HarnessError::TmuxError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HarnessError::TmuxUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            HarnessError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Wire shape of an error response body, shared by every handler.
#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for HarnessError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<crate::tmux::TmuxError> for HarnessError {
    fn from(err: crate::tmux::TmuxError) -> Self {
        match err {
            crate::tmux::TmuxError::NotInstalled => HarnessError::TmuxUnavailable,
            other => HarnessError::TmuxError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_table() {
        assert_eq!(
            HarnessError::ProjectNotFound("p".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HarnessError::ProjectExists("p".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(HarnessError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(HarnessError::TmuxUnavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn kind_names_are_wire_stable() {
        assert_eq!(HarnessError::UnknownProvider("x".into()).kind(), "UNKNOWN_PROVIDER");
        assert_eq!(
            HarnessError::SubscriptionProviderMismatch("a".into(), "b".into()).kind(),
            "SUBSCRIPTION_PROVIDER_MISMATCH"
        );
    }
}
