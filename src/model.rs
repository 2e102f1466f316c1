//! Core entities: Project, Agent, AgentStatus, NormalizedEvent, AgentCallback.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::ids::{AgentId, EventId, ProjectName};

/// Routing record for webhook dispatch, attachable to a project (default) or
/// an agent (override).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentCallback {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, String>>,
}

impl AgentCallback {
    /// Returns a copy with `token` stripped, per the API redaction rule (§4.1).
    pub fn redacted(&self) -> Self {
        Self {
            url: self.url.clone(),
            token: None,
            discord_channel: self.discord_channel.clone(),
            session_key: self.session_key.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// A workspace rooted at a filesystem path, backed by one tmux session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: ProjectName,
    pub cwd: String,
    pub session_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<AgentCallback>,
    /// Agents are owned by the Manager's agent table, not embedded here;
    /// this count is derived at read time.
    #[serde(skip)]
    pub agent_count: usize,
}

impl Project {
    /// View safe to return over HTTP: callback token stripped.
    pub fn redacted(&self) -> Self {
        let mut p = self.clone();
        p.callback = p.callback.map(|c| c.redacted());
        p
    }
}

/// Sum type for agent lifecycle status. Terminal values for webhook purposes
/// are `Idle`, `Error`, `Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Idle,
    Processing,
    WaitingInput,
    Error,
    Exited,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Error | AgentStatus::Exited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Idle => "idle",
            AgentStatus::Processing => "processing",
            AgentStatus::WaitingInput => "waiting_input",
            AgentStatus::Error => "error",
            AgentStatus::Exited => "exited",
        }
    }
}

/// A single agent process, realised as one tmux window inside its project's
/// session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub project: ProjectName,
    pub provider: String,
    pub status: AgentStatus,
    /// Last <=4 assistant first-lines, each truncated to <=140 chars.
    #[serde(default)]
    pub brief: Vec<String>,
    pub task: String,
    /// Window name, always equal to `id`.
    pub window_name: String,
    /// `"<session>:<window>"`
    pub tmux_target: String,
    pub attach_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_runtime_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_session_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<AgentCallback>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub last_captured_output: String,
    /// Set once the initial task was submitted via the provider's CLI
    /// argument rather than a delayed send.
    #[serde(default)]
    pub initial_task_via_cli: bool,
}

impl Agent {
    pub fn redacted(&self) -> Self {
        let mut a = self.clone();
        a.callback = a.callback.take().map(|c| c.redacted());
        a.provider_runtime_dir = None;
        a.provider_session_file = None;
        a
    }

    /// Compact view per §6.1 E2: only id/status/tmuxTarget/attachCommand.
    pub fn compact(&self) -> CompactAgent {
        CompactAgent {
            id: self.id.clone(),
            status: self.status,
            tmux_target: self.tmux_target.clone(),
            attach_command: self.attach_command.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompactAgent {
    pub id: AgentId,
    pub status: AgentStatus,
    pub tmux_target: String,
    pub attach_command: String,
}

/// Per-type payload for a NormalizedEvent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    AgentStarted { provider: String },
    StatusChanged {
        from: AgentStatus,
        to: AgentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Output { text: String },
    ToolUse { raw: serde_json::Value },
    ToolResult { raw: serde_json::Value },
    Error { message: String },
    AgentExited {
        #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    InputSent { text: String },
    PermissionRequested { description: String },
    QuestionAsked { question: String, options: Vec<String> },
    Unknown { raw: serde_json::Value },
}

impl EventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::AgentStarted { .. } => "agent_started",
            EventPayload::StatusChanged { .. } => "status_changed",
            EventPayload::Output { .. } => "output",
            EventPayload::ToolUse { .. } => "tool_use",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::Error { .. } => "error",
            EventPayload::AgentExited { .. } => "agent_exited",
            EventPayload::InputSent { .. } => "input_sent",
            EventPayload::PermissionRequested { .. } => "permission_requested",
            EventPayload::QuestionAsked { .. } => "question_asked",
            EventPayload::Unknown { .. } => "unknown",
        }
    }
}

/// Common envelope `{id, ts, project, agentId, type}` plus per-type payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: EventId,
    pub ts: DateTime<Utc>,
    pub project: ProjectName,
    #[serde(rename = "agentId")]
    pub agent_id: AgentId,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl NormalizedEvent {
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_redaction_drops_token_keeps_rest() {
        let cb = AgentCallback {
            url: "https://example.com/hook".into(),
            token: Some("secret".into()),
            discord_channel: Some("#chan".into()),
            session_key: Some("sk".into()),
            extra: None,
        };
        let redacted = cb.redacted();
        assert!(redacted.token.is_none());
        assert_eq!(redacted.url, cb.url);
        assert_eq!(redacted.discord_channel, cb.discord_channel);
    }

    #[test]
    fn agent_status_terminal_set() {
        assert!(AgentStatus::Idle.is_terminal());
        assert!(AgentStatus::Error.is_terminal());
        assert!(AgentStatus::Exited.is_terminal());
        assert!(!AgentStatus::Starting.is_terminal());
        assert!(!AgentStatus::Processing.is_terminal());
        assert!(!AgentStatus::WaitingInput.is_terminal());
    }

    #[test]
    fn event_type_name_matches_payload() {
        let payload = EventPayload::Output { text: "hi".into() };
        assert_eq!(payload.type_name(), "output");
    }
}
