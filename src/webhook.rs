//! Webhook dispatcher and safety net (§4.5).
//!
//! Subscribes to `status_changed` on the EventBus and fires at-most-once-
//! per-status-change POSTs on terminal transitions, backed by a periodic
//! reconciliation loop. Grounded on `src/notifications/webhook_integration.rs`'s
//! retry-once-on-failure POST helper and counter struct, generalized from a
//! single fire-and-forget call site into a subscriber plus a standing
//! safety-net task, the way `src/agents/monitor.rs`'s tick loop structures a
//! periodic reconciliation pass.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::ids::{AgentId, ProjectName};
use crate::manager::Manager;
use crate::messages::{self, RoleFilter};
use crate::model::{Agent, AgentCallback, AgentStatus};
use crate::providers;

const POST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPT_HISTORY: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: &'static str,
    pub project: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub provider: String,
    pub status: String,
    #[serde(rename = "lastMessage", skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "discordChannel", skip_serializing_if = "Option::is_none")]
    pub discord_channel: Option<String>,
    #[serde(rename = "sessionKey", skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AttemptRecord {
    pub at: DateTime<Utc>,
    pub project: ProjectName,
    pub agent_id: AgentId,
    pub event: &'static str,
    pub url: String,
    pub success: bool,
    pub retried: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct WebhookCounters {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub manual_tests: u64,
    pub safety_net_cycles: u64,
    pub safety_net_warnings: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TestWebhookInput {
    pub project: String,
    pub agent_id: String,
    pub provider: String,
    pub status: String,
    #[serde(default)]
    pub last_message: Option<String>,
}

struct LifecycleEntry {
    status: AgentStatus,
    since: DateTime<Utc>,
    delivered_for_terminal: Option<AgentStatus>,
    last_stuck_warn: Option<DateTime<Utc>>,
}

struct Inner {
    counters: WebhookCounters,
    attempts: Vec<AttemptRecord>,
    lifecycle: HashMap<(ProjectName, AgentId), LifecycleEntry>,
}

/// Resolved routing record plus the event name/url/token to send with.
struct Route {
    url: String,
    token: Option<String>,
    discord_channel: Option<String>,
    session_key: Option<String>,
    extra: Option<HashMap<String, String>>,
}

pub struct WebhookDispatcher {
    manager: std::sync::Arc<Manager>,
    http: reqwest::Client,
    inner: Mutex<Inner>,
}

fn event_name_for(status: AgentStatus) -> Option<&'static str> {
    match status {
        AgentStatus::Idle => Some("agent_completed"),
        AgentStatus::Error => Some("agent_error"),
        AgentStatus::Exited => Some("agent_exited"),
        _ => None,
    }
}

/// Whether `status` still needs a webhook delivery given `entry`'s cache:
/// terminal, and not yet delivered for this particular terminal status
/// (shared between the live-transition path and the safety net).
fn needs_redelivery(entry: &LifecycleEntry, status: AgentStatus) -> bool {
    status.is_terminal() && entry.delivered_for_terminal != Some(status)
}

impl WebhookDispatcher {
    pub fn new(manager: std::sync::Arc<Manager>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            manager,
            http: reqwest::Client::new(),
            inner: Mutex::new(Inner { counters: WebhookCounters::default(), attempts: Vec::new(), lifecycle: HashMap::new() }),
        })
    }

    /// Subscribe to the EventBus's `status_changed` stream. The callback
    /// itself must stay synchronous and infallible (§4.4); it spawns a task
    /// to do the actual async delivery.
    pub fn install(self: &std::sync::Arc<Self>, event_bus: &crate::eventbus::EventBus) {
        let this = self.clone();
        event_bus.subscribe(
            crate::eventbus::EventFilter { types: Some(vec!["status_changed".to_string()]), ..Default::default() },
            move |event| {
                let crate::model::EventPayload::StatusChanged { from, to, .. } = &event.payload else { return };
                if from.is_terminal() || !to.is_terminal() {
                    return;
                }
                let this = this.clone();
                let project = event.project.clone();
                let agent_id = event.agent_id.clone();
                let to = *to;
                tokio::spawn(async move {
                    this.deliver_for_transition(&project, &agent_id, to).await;
                });
            },
        );
    }

    async fn deliver_for_transition(&self, project: &ProjectName, agent_id: &AgentId, to: AgentStatus) {
        let Ok(agent) = self.manager.get_agent(project.as_str(), agent_id.as_str()).await else { return };
        let delivered = self.attempt_delivery(&agent, to).await;
        if delivered {
            self.mark_delivered(project, agent_id, to);
        }
    }

    /// Records a successful delivery in the lifecycle cache shared with the
    /// safety net (§4.5 invariant 3: never re-deliver the same terminal
    /// status without the agent first leaving it).
    fn mark_delivered(&self, project: &ProjectName, agent_id: &AgentId, status: AgentStatus) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .lifecycle
            .entry((project.clone(), agent_id.clone()))
            .or_insert_with(|| LifecycleEntry { status, since: now, delivered_for_terminal: None, last_stuck_warn: None });
        entry.status = status;
        entry.delivered_for_terminal = Some(status);
    }

    async fn attempt_delivery(&self, agent: &Agent, status: AgentStatus) -> bool {
        let Some(event) = event_name_for(status) else { return false };
        let config = self.manager.config();
        if !config.webhook.events.is_empty() && !config.webhook.events.iter().any(|e| e == event) {
            return false;
        }
        let Some(route) = self.resolve_route(agent).await else { return false };
        let last_message = self.last_assistant_message(agent);
        let payload = WebhookPayload {
            event,
            project: agent.project.to_string(),
            agent_id: agent.id.to_string(),
            provider: agent.provider.clone(),
            status: status.as_str().to_string(),
            last_message,
            timestamp: Utc::now(),
            discord_channel: route.discord_channel.clone(),
            session_key: route.session_key.clone(),
            extra: route.extra.clone(),
        };
        self.post_with_retry(agent, event, &route, &payload).await
    }

    async fn resolve_route(&self, agent: &Agent) -> Option<Route> {
        if let Some(cb) = &agent.callback {
            return Some(Self::route_from_callback(cb));
        }
        if let Ok(project) = self.manager.get_project(agent.project.as_str()).await {
            if let Some(cb) = &project.callback {
                return Some(Self::route_from_callback(cb));
            }
        }
        let config = self.manager.config();
        let url = config.webhook.url.clone()?;
        let token = config
            .webhook
            .token_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());
        Some(Route { url, token, discord_channel: None, session_key: None, extra: None })
    }

    fn route_from_callback(cb: &AgentCallback) -> Route {
        Route {
            url: cb.url.clone(),
            token: cb.token.clone(),
            discord_channel: cb.discord_channel.clone(),
            session_key: cb.session_key.clone(),
            extra: cb.extra.clone(),
        }
    }

    fn last_assistant_message(&self, agent: &Agent) -> Option<String> {
        let provider = providers::by_name(&agent.provider)?;
        let path = agent.provider_session_file.as_ref()?;
        let msgs = messages::read_messages(provider.as_ref(), std::path::Path::new(path), RoleFilter::Assistant, None).ok()?;
        messages::last_assistant_message(&msgs).map(|m| m.text.clone())
    }

    async fn post_with_retry(&self, agent: &Agent, event: &'static str, route: &Route, payload: &WebhookPayload) -> bool {
        let (first_ok, first_err) = self.post_once(route, payload).await;
        let mut retried = false;
        let success = if first_ok {
            true
        } else {
            retried = true;
            let (retry_ok, _retry_err) = self.post_once(route, payload).await;
            retry_ok
        };
        {
            let mut inner = self.inner.lock().unwrap();
            inner.counters.attempts += 1;
            if retried {
                inner.counters.retries += 1;
            }
            if success {
                inner.counters.successes += 1;
            } else {
                inner.counters.failures += 1;
            }
            inner.attempts.push(AttemptRecord {
                at: Utc::now(),
                project: agent.project.clone(),
                agent_id: agent.id.clone(),
                event,
                url: route.url.clone(),
                success,
                retried,
                error: if success { None } else { first_err.clone() },
            });
            if inner.attempts.len() > MAX_ATTEMPT_HISTORY {
                let drop = inner.attempts.len() - MAX_ATTEMPT_HISTORY;
                inner.attempts.drain(0..drop);
            }
        }
        debug!(agent_id = %agent.id, event, success, retried, "webhook delivery attempt");
        success
    }

    async fn post_once(&self, route: &Route, payload: &WebhookPayload) -> (bool, Option<String>) {
        let mut req = self.http.post(&route.url).json(payload).timeout(POST_TIMEOUT);
        if let Some(token) = &route.token {
            req = req.bearer_auth(token);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => (true, None),
            Ok(resp) => (false, Some(format!("http {}", resp.status()))),
            Err(err) => (false, Some(err.to_string())),
        }
    }

    pub fn counters(&self) -> WebhookCounters {
        self.inner.lock().unwrap().counters.clone()
    }

    pub fn recent_attempts(&self) -> Vec<AttemptRecord> {
        self.inner.lock().unwrap().attempts.clone()
    }

    /// `sendTestWebhook`: synthesise a payload from operator input and reuse
    /// the retrying POST path, without touching lifecycle/delivered state.
    pub async fn send_test(&self, input: TestWebhookInput) -> bool {
        let status = match input.status.as_str() {
            "idle" => AgentStatus::Idle,
            "error" => AgentStatus::Error,
            "exited" => AgentStatus::Exited,
            _ => return false,
        };
        let Some(event) = event_name_for(status) else { return false };
        let project = ProjectName::parse(&input.project).ok();
        let agent_id = AgentId::parse(&input.agent_id).ok();
        let (Some(project), Some(agent_id)) = (project, agent_id) else { return false };

        let route = match self.manager.get_agent(project.as_str(), agent_id.as_str()).await {
            Ok(agent) => self.resolve_route(&agent).await,
            Err(_) => None,
        };
        let Some(route) = route.or_else(|| {
            let config = self.manager.config();
            config.webhook.url.clone().map(|url| Route {
                url,
                token: config.webhook.token_env.as_ref().and_then(|n| std::env::var(n).ok()),
                discord_channel: None,
                session_key: None,
                extra: None,
            })
        }) else {
            return false;
        };

        let payload = WebhookPayload {
            event,
            project: project.to_string(),
            agent_id: agent_id.to_string(),
            provider: input.provider,
            status: status.as_str().to_string(),
            last_message: input.last_message,
            timestamp: Utc::now(),
            discord_channel: route.discord_channel.clone(),
            session_key: route.session_key.clone(),
            extra: route.extra.clone(),
        };
        let (first_ok, _) = self.post_once(&route, &payload).await;
        let success = if first_ok { true } else { self.post_once(&route, &payload).await.0 };
        self.inner.lock().unwrap().counters.manual_tests += 1;
        success
    }

    /// `probeReceiver`: fire a synthetic `event: "probe"` POST at an
    /// operator-supplied URL so a callback target can be validated before
    /// it's wired onto a project or agent.
    pub async fn probe_receiver(&self, url: &str, token: Option<&str>) -> (bool, Option<u16>, Option<String>) {
        let mut req = self
            .http
            .post(url)
            .json(&json!({ "event": "probe", "timestamp": Utc::now() }))
            .timeout(POST_TIMEOUT);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        match req.send().await {
            Ok(resp) => (resp.status().is_success(), Some(resp.status().as_u16()), None),
            Err(err) => (false, None, Some(err.to_string())),
        }
    }

    /// The safety-net reconciliation loop (§4.5). Runs every
    /// `safetyNet.intervalMs` until `cancel` fires.
    pub async fn run_safety_net(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let config = self.manager.config();
        if !config.safety_net.enabled {
            return;
        }
        let interval_ms = config.safety_net.interval_ms;
        let stuck_after_ms = config.safety_net.stuck_after_ms;
        let stuck_warn_interval_ms = config.safety_net.stuck_warn_interval_ms;
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.safety_net_cycle(stuck_after_ms, stuck_warn_interval_ms).await;
                }
            }
        }
    }

    async fn safety_net_cycle(&self, stuck_after_ms: u64, stuck_warn_interval_ms: u64) {
        let live = self.manager.live_agent_keys().await;
        let mut live_set = std::collections::HashSet::new();

        for (project, agent_id) in &live {
            live_set.insert((project.clone(), agent_id.clone()));
            let Ok(agent) = self.manager.get_agent(project.as_str(), agent_id.as_str()).await else { continue };
            let now = Utc::now();

            let (became_stuck_check, needs_delivery) = {
                let mut inner = self.inner.lock().unwrap();
                let entry = inner
                    .lifecycle
                    .entry((project.clone(), agent_id.clone()))
                    .or_insert_with(|| LifecycleEntry { status: agent.status, since: now, delivered_for_terminal: None, last_stuck_warn: None });
                if entry.status != agent.status {
                    entry.status = agent.status;
                    entry.since = now;
                    entry.delivered_for_terminal = None;
                }
                let needs_delivery = needs_redelivery(entry, agent.status);
                let stuck_eligible = matches!(agent.status, AgentStatus::Starting | AgentStatus::Processing);
                (stuck_eligible.then_some(entry.since), needs_delivery)
            };

            if needs_delivery {
                let delivered = self.attempt_delivery(&agent, agent.status).await;
                if delivered {
                    self.mark_delivered(project, agent_id, agent.status);
                }
            }

            if let Some(since) = became_stuck_check {
                let held_ms = (now - since).num_milliseconds().max(0) as u64;
                if held_ms >= stuck_after_ms {
                    let should_warn = {
                        let mut inner = self.inner.lock().unwrap();
                        let entry = inner.lifecycle.get_mut(&(project.clone(), agent_id.clone())).unwrap();
                        let should = entry
                            .last_stuck_warn
                            .map(|last| (now - last).num_milliseconds() as u64 >= stuck_warn_interval_ms)
                            .unwrap_or(true);
                        if should {
                            entry.last_stuck_warn = Some(now);
                        }
                        should
                    };
                    if should_warn {
                        warn!(agent_id = %agent_id, project = %project, status = agent.status.as_str(), held_ms, "agent stuck in non-terminal status");
                        self.inner.lock().unwrap().counters.safety_net_warnings += 1;
                    }
                }
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.lifecycle.retain(|key, _| live_set.contains(key));
            inner.counters.safety_net_cycles += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn event_name_mapping_covers_terminal_statuses() {
        assert_eq!(event_name_for(AgentStatus::Idle), Some("agent_completed"));
        assert_eq!(event_name_for(AgentStatus::Error), Some("agent_error"));
        assert_eq!(event_name_for(AgentStatus::Exited), Some("agent_exited"));
        assert_eq!(event_name_for(AgentStatus::Processing), None);
    }

    fn test_dispatcher() -> std::sync::Arc<WebhookDispatcher> {
        let config = std::sync::Arc::new(crate::config::Config::default());
        let tmux = std::sync::Arc::new(crate::tmux::MockTmuxClient::new());
        let bus = std::sync::Arc::new(crate::eventbus::EventBus::new(1000));
        let manager = std::sync::Arc::new(Manager::new(config, tmux, bus));
        WebhookDispatcher::new(manager)
    }

    #[test]
    fn needs_redelivery_is_false_for_non_terminal_status() {
        let entry = LifecycleEntry { status: AgentStatus::Processing, since: Utc::now(), delivered_for_terminal: None, last_stuck_warn: None };
        assert!(!needs_redelivery(&entry, AgentStatus::Processing));
    }

    #[test]
    fn live_delivery_marks_lifecycle_so_safety_net_does_not_redeliver() {
        let dispatcher = test_dispatcher();
        let project = ProjectName::parse("p1").unwrap();
        let agent_id = AgentId::parse("codex-a").unwrap();

        // Simulate a successful live-path delivery (what `deliver_for_transition`
        // does after `attempt_delivery` succeeds).
        dispatcher.mark_delivered(&project, &agent_id, AgentStatus::Idle);

        let inner = dispatcher.inner.lock().unwrap();
        let entry = inner.lifecycle.get(&(project, agent_id)).unwrap();
        assert!(!needs_redelivery(entry, AgentStatus::Idle));
    }

    #[test]
    fn redelivery_is_required_after_leaving_and_re_entering_a_terminal_status() {
        let entry = LifecycleEntry { status: AgentStatus::Idle, since: Utc::now(), delivered_for_terminal: Some(AgentStatus::Idle), last_stuck_warn: None };
        // Same terminal status: already delivered, no redelivery.
        assert!(!needs_redelivery(&entry, AgentStatus::Idle));
        // A different terminal status (agent left idle and later errored): redeliver.
        assert!(needs_redelivery(&entry, AgentStatus::Error));
    }

    #[test]
    fn payload_serializes_camelcase_fields() {
        let payload = WebhookPayload {
            event: "agent_completed",
            project: "p1".into(),
            agent_id: "codex-a".into(),
            provider: "codex".into(),
            status: "idle".into(),
            last_message: Some("done".into()),
            timestamp: Utc::now(),
            discord_channel: None,
            session_key: None,
            extra: None,
        };
        let v: Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["agentId"], "codex-a");
        assert!(v.get("discordChannel").is_none());
    }
}
