//! Session Manager (§4.1): CRUD on projects and agents, the createAgent
//! startup handshake, abort/delete, and rehydration from a pre-existing
//! tmux state.
//!
//! Grounded on `src/agents/launcher/mod.rs`'s `Launcher::launch`/
//! `session_alive`/`capture_session_content` for the overall shape of
//! "build command, spawn in tmux, track state", re-architected from a
//! disk-persisted one-session-per-ticket model into an in-memory
//! `Arc<RwLock<...>>`-owned project/agent table: there is no database here,
//! by design; restart rehydrates from tmux + provider journals.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::callbacks_store::{agent_key, CallbacksFile, CallbacksStore};
use crate::config::{Config, SubscriptionDef};
use crate::error::HarnessError;
use crate::eventbus::EventBus;
use crate::ids::{generate_agent_id, AgentId, ProjectName};
use crate::model::{Agent, AgentCallback, AgentStatus, EventPayload, NormalizedEvent, Project};
use crate::providers::{self, BuildContext, JournalCursor, Provider};
use crate::tmux::TmuxClient;

/// Per-agent bookkeeping the Poller reads/writes via Manager accessors; never
/// exposed directly over HTTP.
pub(crate) struct AgentRecord {
    pub agent: Agent,
    pub cursor: JournalCursor,
    pub last_pane_snapshot: String,
    pub status_since: chrono::DateTime<Utc>,
    pub last_diff_at: Option<chrono::DateTime<Utc>>,
}

struct ProjectRecord {
    project: Project,
}

#[derive(Default)]
struct Store {
    projects: HashMap<ProjectName, ProjectRecord>,
    agents: HashMap<ProjectName, HashMap<AgentId, AgentRecord>>,
}

pub struct Manager {
    config: Arc<Config>,
    tmux: Arc<dyn TmuxClient>,
    event_bus: Arc<EventBus>,
    store: RwLock<Store>,
    id_seed: AtomicU64,
    callbacks: Option<CallbacksStore>,
}

impl Manager {
    pub fn new(config: Arc<Config>, tmux: Arc<dyn TmuxClient>, event_bus: Arc<EventBus>) -> Self {
        Self {
            config,
            tmux,
            event_bus,
            store: RwLock::new(Store::default()),
            id_seed: AtomicU64::new(0),
            callbacks: None,
        }
    }

    /// Enables `logDir/state/callbacks.json` persistence (§6.3). Without
    /// this, project/agent webhook routing lives only in memory and does
    /// not survive a restart. Loads any existing file immediately so
    /// `rehydrate_projects_from_tmux`/`rehydrate_agents_from_tmux` can
    /// reattach callbacks to sessions reconstructed from tmux state.
    pub fn with_callbacks_persistence(mut self, path: PathBuf) -> Self {
        self.callbacks = Some(CallbacksStore::new(path));
        self
    }

    fn loaded_callbacks(&self) -> CallbacksFile {
        self.callbacks
            .as_ref()
            .and_then(|store| store.load().ok())
            .unwrap_or_default()
    }

    async fn persist_callbacks(&self) {
        let Some(store) = &self.callbacks else { return };
        let file = {
            let guard = self.store.read().await;
            let mut file = CallbacksFile::default();
            file.version = 1;
            for (name, record) in guard.projects.iter() {
                if let Some(cb) = &record.project.callback {
                    file.projects.insert(name.to_string(), cb.clone());
                }
            }
            for (project_name, agents) in guard.agents.iter() {
                for (agent_id, record) in agents.iter() {
                    if let Some(cb) = &record.agent.callback {
                        file.agents.insert(agent_key(project_name.as_str(), agent_id.as_str()), cb.clone());
                    }
                }
            }
            file
        };
        if let Err(err) = store.save(&file) {
            tracing::warn!(error = %err, "failed to persist callbacks.json");
        }
    }

    fn next_seed(&self) -> u64 {
        self.id_seed.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, project: &ProjectName, agent_id: &AgentId, payload: EventPayload) {
        let event = NormalizedEvent {
            id: self.event_bus.next_id(),
            ts: Utc::now(),
            project: project.clone(),
            agent_id: agent_id.clone(),
            payload,
        };
        self.event_bus.emit(event);
    }

    // ---- Projects -------------------------------------------------------

    pub async fn create_project(
        &self,
        name: &str,
        cwd: &str,
        callback: Option<AgentCallback>,
    ) -> Result<Project, HarnessError> {
        let project_name =
            ProjectName::parse(name).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;

        let mut store = self.store.write().await;
        if store.projects.contains_key(&project_name) {
            return Err(HarnessError::ProjectExists(name.to_string()));
        }

        let session_name = format!("{}-{}", self.config.tmux_prefix, project_name);
        self.tmux.new_session(&session_name, cwd)?;

        let project = Project {
            name: project_name.clone(),
            cwd: cwd.to_string(),
            session_name,
            created_at: Utc::now(),
            callback,
            agent_count: 0,
        };
        store.projects.insert(project_name.clone(), ProjectRecord { project: project.clone() });
        store.agents.insert(project_name, HashMap::new());
        drop(store);
        if project.callback.is_some() {
            self.persist_callbacks().await;
        }
        Ok(project)
    }

    pub async fn update_project(
        &self,
        name: &str,
        cwd: Option<&str>,
        callback: Option<Option<AgentCallback>>,
    ) -> Result<Project, HarnessError> {
        let project_name =
            ProjectName::parse(name).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
        let mut store = self.store.write().await;
        let record = store
            .projects
            .get_mut(&project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(name.to_string()))?;
        if let Some(cwd) = cwd {
            record.project.cwd = cwd.to_string();
        }
        let callback_changed = callback.is_some();
        if let Some(callback) = callback {
            record.project.callback = callback;
        }
        let updated = record.project.clone();
        drop(store);
        if callback_changed {
            self.persist_callbacks().await;
        }
        Ok(updated)
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        let store = self.store.read().await;
        store
            .projects
            .values()
            .map(|r| {
                let mut p = r.project.clone();
                p.agent_count = store.agents.get(&r.project.name).map(|a| a.len()).unwrap_or(0);
                p
            })
            .collect()
    }

    pub async fn get_project(&self, name: &str) -> Result<Project, HarnessError> {
        let project_name =
            ProjectName::parse(name).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
        let store = self.store.read().await;
        let record = store
            .projects
            .get(&project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(name.to_string()))?;
        let mut p = record.project.clone();
        p.agent_count = store.agents.get(&project_name).map(|a| a.len()).unwrap_or(0);
        Ok(p)
    }

    pub async fn delete_project(&self, name: &str) -> Result<(), HarnessError> {
        let project_name =
            ProjectName::parse(name).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
        let mut store = self.store.write().await;
        let record = store
            .projects
            .remove(&project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(name.to_string()))?;
        store.agents.remove(&project_name);
        drop(store);
        self.tmux.kill_session(&record.project.session_name)?;
        if record.project.callback.is_some() {
            self.persist_callbacks().await;
        }
        Ok(())
    }

    // ---- Agents -----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_agent(
        self: &Arc<Self>,
        project: &str,
        provider_name: &str,
        task: &str,
        model: Option<&str>,
        subscription_id: Option<&str>,
        callback: Option<AgentCallback>,
        name: Option<&str>,
    ) -> Result<Agent, HarnessError> {
        let project_name =
            ProjectName::parse(project).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;

        let provider = providers::by_name(provider_name)
            .ok_or_else(|| HarnessError::UnknownProvider(provider_name.to_string()))?;

        let subscription = match subscription_id {
            Some(sub_id) => {
                let sub = self
                    .config
                    .subscriptions
                    .iter()
                    .find(|s| s.id == sub_id)
                    .ok_or_else(|| HarnessError::SubscriptionNotFound(sub_id.to_string()))?;
                if sub.provider != provider_name {
                    return Err(HarnessError::SubscriptionProviderMismatch(
                        sub_id.to_string(),
                        provider_name.to_string(),
                    ));
                }
                if !sub.enabled {
                    return Err(HarnessError::SubscriptionInvalid(
                        sub_id.to_string(),
                        "disabled".to_string(),
                    ));
                }
                Some(sub.clone())
            }
            None => None,
        };

        let (session_name, cwd) = {
            let store = self.store.read().await;
            let record = store
                .projects
                .get(&project_name)
                .ok_or_else(|| HarnessError::ProjectNotFound(project.to_string()))?;
            (record.project.session_name.clone(), record.project.cwd.clone())
        };

        let agent_id = {
            let store = self.store.read().await;
            let existing: Vec<AgentId> =
                store.agents.get(&project_name).map(|m| m.keys().cloned().collect()).unwrap_or_default();
            match name {
                Some(requested) => {
                    let id = AgentId::parse(requested)
                        .map_err(|_| HarnessError::AgentNameInvalid(requested.to_string()))?;
                    if existing.contains(&id) {
                        return Err(HarnessError::NameConflict(requested.to_string(), project.to_string()));
                    }
                    id
                }
                None => generate_agent_id(provider.id_prefix(), self.next_seed(), &existing),
            }
        };

        let runtime_dir = self.prepare_runtime_dir(&project_name, &agent_id, provider.as_ref(), subscription.as_ref())?;
        let home_dir = dirs::home_dir();

        let build_ctx = BuildContext {
            agent_id: agent_id.as_str(),
            task,
            model,
            cwd: &cwd,
            runtime_dir: Some(&runtime_dir),
            home_dir: home_dir.as_ref(),
            subscription: subscription.as_ref(),
        };

        let mut cmd = provider.build_command(&build_ctx);
        let initial_task_via_cli = provider.accepts_initial_task_as_arg();
        if !initial_task_via_cli {
            // task is sent as a delayed follow-up; strip any trailing task arg
            // the default build_command may not have appended in that case.
            let _ = &mut cmd;
        }

        let (mut env, mut unset_env) = provider.build_env(&build_ctx);
        if let Some(ref sub) = subscription {
            env.extend(sub.env.clone());
            unset_env.extend(sub.unset_env.clone());
        }
        env.insert("PATH".to_string(), sanitised_path());

        let window_name = agent_id.as_str().to_string();
        let tmux_target = format!("{session_name}:{window_name}");

        self.tmux.new_window(&session_name, &window_name, &cwd, &cmd, &env, &unset_env)?;

        let provider_session_file =
            provider.locate_journal(&build_ctx).map(|p| p.display().to_string());

        let agent = Agent {
            id: agent_id.clone(),
            project: project_name.clone(),
            provider: provider_name.to_string(),
            status: AgentStatus::Starting,
            brief: Vec::new(),
            task: task.to_string(),
            window_name: window_name.clone(),
            tmux_target: tmux_target.clone(),
            attach_command: format!("tmux attach -t {tmux_target}"),
            provider_runtime_dir: Some(runtime_dir.display().to_string()),
            provider_session_file,
            subscription_id: subscription_id.map(str::to_string),
            callback,
            created_at: Utc::now(),
            last_activity: Utc::now(),
            last_captured_output: String::new(),
            initial_task_via_cli,
        };

        {
            let mut store = self.store.write().await;
            let record = AgentRecord {
                agent: agent.clone(),
                cursor: JournalCursor::default(),
                last_pane_snapshot: String::new(),
                status_since: Utc::now(),
                last_diff_at: None,
            };
            store.agents.entry(project_name.clone()).or_default().insert(agent_id.clone(), record);
        }
        if agent.callback.is_some() {
            self.persist_callbacks().await;
        }

        self.emit(&project_name, &agent_id, EventPayload::AgentStarted { provider: provider_name.to_string() });

        if initial_task_via_cli {
            self.schedule_trust_prompt_dismissal(project_name.clone(), agent_id.clone());
            self.transition_status(&project_name, &agent_id, AgentStatus::Processing, "manager_initial_input").await;
            self.emit(&project_name, &agent_id, EventPayload::InputSent { text: task.to_string() });
        } else {
            self.schedule_delayed_initial_send(project_name.clone(), agent_id.clone(), task.to_string(), provider);
        }

        Ok(agent)
    }

    pub async fn list_agents(&self, project: &str) -> Result<Vec<Agent>, HarnessError> {
        let project_name =
            ProjectName::parse(project).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
        let store = self.store.read().await;
        let agents = store
            .agents
            .get(&project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project.to_string()))?;
        Ok(agents.values().map(|r| r.agent.clone()).collect())
    }

    pub async fn get_agent(&self, project: &str, id: &str) -> Result<Agent, HarnessError> {
        let project_name =
            ProjectName::parse(project).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
        let agent_id =
            AgentId::parse(id).map_err(|_| HarnessError::AgentNotFound(id.to_string(), project.to_string()))?;
        let store = self.store.read().await;
        let agents = store
            .agents
            .get(&project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project.to_string()))?;
        agents
            .get(&agent_id)
            .map(|r| r.agent.clone())
            .ok_or_else(|| HarnessError::AgentNotFound(id.to_string(), project.to_string()))
    }

    pub async fn send_input(&self, project: &str, id: &str, text: &str) -> Result<(), HarnessError> {
        let project_name =
            ProjectName::parse(project).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
        let agent_id =
            AgentId::parse(id).map_err(|_| HarnessError::AgentNotFound(id.to_string(), project.to_string()))?;

        let (tmux_target, provider_name) = {
            let store = self.store.read().await;
            let agents = store
                .agents
                .get(&project_name)
                .ok_or_else(|| HarnessError::ProjectNotFound(project.to_string()))?;
            let record = agents
                .get(&agent_id)
                .ok_or_else(|| HarnessError::AgentNotFound(id.to_string(), project.to_string()))?;
            (record.agent.tmux_target.clone(), record.agent.provider.clone())
        };

        if provider_name == "claude-code" {
            self.probe_claude_trust_prompt(&tmux_target);
        }

        let provider = providers::by_name(&provider_name)
            .ok_or_else(|| HarnessError::UnknownProvider(provider_name.clone()))?;
        let formatted = provider.format_input(text);

        if provider_name == "codex" {
            // Codex follow-up paste-enter race: paste, settle, then Enter as a
            // separate keystroke (never collapsed with send_keys_safe).
            let buffer_name = format!("harness-{}", tmux_target.replace([':', '.'], "-"));
            self.tmux.paste_text(&tmux_target, &buffer_name, &formatted)?;
            tokio::time::sleep(std::time::Duration::from_millis(
                self.config.startup.codex_followup_paste_settle_ms,
            ))
            .await;
            self.tmux.send_special_key(&tmux_target, "Enter")?;
        } else {
            self.tmux.send_keys_safe(&tmux_target, &formatted, true)?;
        }

        self.emit(&project_name, &agent_id, EventPayload::InputSent { text: text.to_string() });
        self.touch_activity(&project_name, &agent_id).await;
        Ok(())
    }

    pub async fn get_agent_output(&self, project: &str, id: &str, lines: Option<u32>) -> Result<String, HarnessError> {
        let project_name =
            ProjectName::parse(project).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
        let agent_id =
            AgentId::parse(id).map_err(|_| HarnessError::AgentNotFound(id.to_string(), project.to_string()))?;
        let tmux_target = {
            let store = self.store.read().await;
            let agents = store
                .agents
                .get(&project_name)
                .ok_or_else(|| HarnessError::ProjectNotFound(project.to_string()))?;
            let record = agents
                .get(&agent_id)
                .ok_or_else(|| HarnessError::AgentNotFound(id.to_string(), project.to_string()))?;
            record.agent.tmux_target.clone()
        };
        let lines = lines.unwrap_or(self.config.poller.capture_lines);
        Ok(self.tmux.capture_pane(&tmux_target, lines)?)
    }

    pub async fn abort_agent(&self, project: &str, id: &str) -> Result<(), HarnessError> {
        let project_name =
            ProjectName::parse(project).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
        let agent_id =
            AgentId::parse(id).map_err(|_| HarnessError::AgentNotFound(id.to_string(), project.to_string()))?;
        let tmux_target = {
            let store = self.store.read().await;
            let agents = store
                .agents
                .get(&project_name)
                .ok_or_else(|| HarnessError::ProjectNotFound(project.to_string()))?;
            let record = agents
                .get(&agent_id)
                .ok_or_else(|| HarnessError::AgentNotFound(id.to_string(), project.to_string()))?;
            record.agent.tmux_target.clone()
        };
        self.tmux.send_special_key(&tmux_target, "Escape")?;
        self.tmux.send_special_key(&tmux_target, "C-c")?;
        Ok(())
    }

    pub async fn delete_agent(&self, project: &str, id: &str) -> Result<(), HarnessError> {
        let project_name =
            ProjectName::parse(project).map_err(|e| HarnessError::InvalidRequest(e.to_string()))?;
        let agent_id =
            AgentId::parse(id).map_err(|_| HarnessError::AgentNotFound(id.to_string(), project.to_string()))?;

        let (tmux_target, provider_name) = {
            let store = self.store.read().await;
            let agents = store
                .agents
                .get(&project_name)
                .ok_or_else(|| HarnessError::ProjectNotFound(project.to_string()))?;
            let record = agents
                .get(&agent_id)
                .ok_or_else(|| HarnessError::AgentNotFound(id.to_string(), project.to_string()))?;
            (record.agent.tmux_target.clone(), record.agent.provider.clone())
        };

        if let Some(provider) = providers::by_name(&provider_name) {
            if let Some(exit_cmd) = provider.exit_command() {
                let _ = self.tmux.send_keys_safe(&tmux_target, exit_cmd, true);
                tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
            }
        }
        // Fatal: kill failure would leave the store drifting from tmux reality.
        self.tmux.kill_window(&tmux_target)?;

        self.emit(&project_name, &agent_id, EventPayload::AgentExited { exit_code: None });

        let had_callback = {
            let mut store = self.store.write().await;
            store
                .agents
                .get_mut(&project_name)
                .and_then(|agents| agents.remove(&agent_id))
                .map(|record| record.agent.callback.is_some())
                .unwrap_or(false)
        };
        if had_callback {
            self.persist_callbacks().await;
        }
        Ok(())
    }

    // ---- Rehydration --------------------------------------------------------

    /// List tmux sessions named `<tmuxPrefix>-*`; reconstruct any unknown
    /// Project from the session name and its working directory. Idempotent:
    /// already-known projects are left untouched.
    pub async fn rehydrate_projects_from_tmux(&self) -> Result<(), HarnessError> {
        let prefix = format!("{}-", self.config.tmux_prefix);
        let sessions = self.tmux.list_sessions(Some(&prefix))?;
        let persisted = self.loaded_callbacks();
        let mut store = self.store.write().await;
        for session in sessions {
            let Some(raw_name) = session.name.strip_prefix(&prefix) else { continue };
            let Ok(project_name) = ProjectName::parse(raw_name) else {
                tracing::warn!(session = %session.name, "rehydrate: session name is not a valid project name, skipping");
                continue;
            };
            if store.projects.contains_key(&project_name) {
                continue;
            }
            let callback = persisted.projects.get(project_name.as_str()).cloned();
            let project = Project {
                name: project_name.clone(),
                cwd: session.cwd.clone().unwrap_or_default(),
                session_name: session.name.clone(),
                created_at: Utc::now(),
                callback,
                agent_count: 0,
            };
            store.projects.insert(project_name.clone(), ProjectRecord { project });
            store.agents.entry(project_name).or_default();
        }
        Ok(())
    }

    /// List windows in each known project session; reconstruct any unknown
    /// Agent whose window name is a valid AgentId, inferring the provider
    /// from the pane's current/start command or the window-name prefix.
    /// Never respawns the pane process — it has been running throughout.
    pub async fn rehydrate_agents_from_tmux(&self) -> Result<(), HarnessError> {
        let sessions: Vec<(ProjectName, String, String)> = {
            let store = self.store.read().await;
            store
                .projects
                .values()
                .map(|r| (r.project.name.clone(), r.project.session_name.clone(), r.project.cwd.clone()))
                .collect()
        };

        for (project_name, session_name, cwd) in sessions {
            let windows = self.tmux.list_windows(&session_name)?;
            for window in windows {
                let Ok(agent_id) = AgentId::parse(&window.name) else { continue };
                {
                    let store = self.store.read().await;
                    if store.agents.get(&project_name).map(|m| m.contains_key(&agent_id)).unwrap_or(false) {
                        continue;
                    }
                }

                let target = format!("{session_name}:{}", window.name);
                let pane_info = match self.tmux.pane_info(&target) {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::warn!(target = %target, error = %e, "rehydrate: pane_info failed, skipping window");
                        continue;
                    }
                };

                let Some(provider_name) = infer_provider(&pane_info, &window.name) else {
                    tracing::warn!(target = %target, "rehydrate: could not infer provider, skipping window");
                    continue;
                };
                let Some(provider) = providers::by_name(&provider_name) else { continue };

                let status = if pane_info.dead {
                    AgentStatus::Exited
                } else {
                    let captured = self.tmux.capture_pane(&target, self.config.poller.capture_lines).unwrap_or_default();
                    provider.parse_ui_status(&captured).unwrap_or(AgentStatus::Starting)
                };

                let provider_session_file = recover_claude_session_file(&pane_info, &provider_name, &cwd);
                let provider_runtime_dir = recover_runtime_dir(&pane_info, &provider_name);

                let agent = Agent {
                    id: agent_id.clone(),
                    project: project_name.clone(),
                    provider: provider_name.clone(),
                    status,
                    brief: Vec::new(),
                    task: String::new(),
                    window_name: window.name.clone(),
                    tmux_target: target.clone(),
                    attach_command: format!("tmux attach -t {target}"),
                    provider_runtime_dir,
                    provider_session_file,
                    subscription_id: None,
                    callback: None,
                    created_at: Utc::now(),
                    last_activity: Utc::now(),
                    last_captured_output: String::new(),
                    initial_task_via_cli: false,
                };

                let mut store = self.store.write().await;
                store.agents.entry(project_name.clone()).or_default().insert(
                    agent_id,
                    AgentRecord {
                        agent,
                        cursor: JournalCursor::default(),
                        last_pane_snapshot: String::new(),
                        status_since: Utc::now(),
                        last_diff_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    // ---- Poller-facing accessors --------------------------------------------

    pub(crate) async fn live_agent_keys(&self) -> Vec<(ProjectName, AgentId)> {
        let store = self.store.read().await;
        store
            .agents
            .iter()
            .flat_map(|(p, m)| m.keys().map(move |a| (p.clone(), a.clone())))
            .filter(|(p, a)| {
                // filtered again under lock below; this pass just enumerates keys
                let _ = (p, a);
                true
            })
            .collect()
    }

    pub(crate) async fn snapshot_for_poll(
        &self,
        project: &ProjectName,
        agent_id: &AgentId,
    ) -> Option<(Agent, JournalCursor, String, Option<chrono::DateTime<Utc>>, chrono::DateTime<Utc>)> {
        let store = self.store.read().await;
        let record = store.agents.get(project)?.get(agent_id)?;
        if record.agent.status.is_terminal() {
            return None;
        }
        Some((
            record.agent.clone(),
            record.cursor.clone(),
            record.last_pane_snapshot.clone(),
            record.last_diff_at,
            record.status_since,
        ))
    }

    pub(crate) async fn apply_poll_result(
        &self,
        project: &ProjectName,
        agent_id: &AgentId,
        new_pane_snapshot: String,
        new_cursor: JournalCursor,
        new_status: Option<AgentStatus>,
        status_source: &'static str,
        brief_append: Option<String>,
        had_diff: bool,
    ) {
        let (from, to, source, activity_now) = {
            let mut store = self.store.write().await;
            let Some(record) = store.agents.get_mut(project).and_then(|m| m.get_mut(agent_id)) else {
                return;
            };
            record.last_pane_snapshot = new_pane_snapshot;
            record.cursor = new_cursor;
            if had_diff {
                record.last_diff_at = Some(Utc::now());
                record.agent.last_activity = Utc::now();
            }
            if let Some(line) = brief_append {
                record.agent.brief.push(truncate_brief_line(&line));
                if record.agent.brief.len() > 4 {
                    record.agent.brief.remove(0);
                }
            }
            let from = record.agent.status;
            let to = new_status.unwrap_or(from);
            let changed = to != from;
            if changed {
                record.agent.status = to;
                record.status_since = Utc::now();
            }
            (from, if changed { Some(to) } else { None }, status_source, record.agent.last_activity)
        };
        let _ = activity_now;
        if let Some(to) = to {
            self.emit(project, agent_id, EventPayload::StatusChanged { from, to, source: Some(source.to_string()) });
        }
    }

    pub(crate) async fn emit_output(&self, project: &ProjectName, agent_id: &AgentId, text: String) {
        if text.is_empty() {
            return;
        }
        {
            let mut store = self.store.write().await;
            if let Some(record) = store.agents.get_mut(project).and_then(|m| m.get_mut(agent_id)) {
                record.agent.last_captured_output = text.clone();
            }
        }
        self.emit(project, agent_id, EventPayload::Output { text });
    }

    pub(crate) fn emit_journal_event(&self, project: &ProjectName, agent_id: &AgentId, event: crate::providers::JournalEventOut) {
        let payload = match event {
            crate::providers::JournalEventOut::ToolUse(raw) => EventPayload::ToolUse { raw },
            crate::providers::JournalEventOut::ToolResult(raw) => EventPayload::ToolResult { raw },
            crate::providers::JournalEventOut::Error(message) => EventPayload::Error { message },
            crate::providers::JournalEventOut::Unknown(raw) => EventPayload::Unknown { raw },
        };
        self.emit(project, agent_id, payload);
    }

    pub(crate) fn emit_ui_diff_event(&self, project: &ProjectName, agent_id: &AgentId, event: crate::providers::UiDiffEvent) {
        let payload = match event {
            crate::providers::UiDiffEvent::PermissionRequested { description } => {
                EventPayload::PermissionRequested { description }
            }
            crate::providers::UiDiffEvent::QuestionAsked { question, options } => {
                EventPayload::QuestionAsked { question, options }
            }
        };
        self.emit(project, agent_id, payload);
    }

    pub(crate) fn tmux(&self) -> &Arc<dyn TmuxClient> {
        &self.tmux
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    async fn touch_activity(&self, project: &ProjectName, agent_id: &AgentId) {
        let mut store = self.store.write().await;
        if let Some(record) = store.agents.get_mut(project).and_then(|m| m.get_mut(agent_id)) {
            record.agent.last_activity = Utc::now();
        }
    }

    async fn transition_status(&self, project: &ProjectName, agent_id: &AgentId, to: AgentStatus, source: &str) {
        let from = {
            let mut store = self.store.write().await;
            let Some(record) = store.agents.get_mut(project).and_then(|m| m.get_mut(agent_id)) else {
                return;
            };
            let from = record.agent.status;
            record.agent.status = to;
            record.status_since = Utc::now();
            from
        };
        if from != to {
            self.emit(project, agent_id, EventPayload::StatusChanged { from, to, source: Some(source.to_string()) });
        }
    }

    /// claude-code only: detect the "trust this folder" prompt and confirm
    /// with a single Enter. Both the confirm line (last 2 lines) and the
    /// context phrase (last 8 lines) must match to avoid scrollback echoes.
    fn probe_claude_trust_prompt(&self, tmux_target: &str) {
        let Ok(captured) = self.tmux.capture_pane(tmux_target, 20) else { return };
        if trust_prompt_visible(&captured) {
            let _ = self.tmux.send_special_key(tmux_target, "Enter");
        }
    }

    fn schedule_trust_prompt_dismissal(self: &Arc<Self>, project: ProjectName, agent_id: AgentId) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            let tmux_target = {
                let store = manager.store.read().await;
                store.agents.get(&project).and_then(|m| m.get(&agent_id)).map(|r| r.agent.tmux_target.clone())
            };
            let Some(tmux_target) = tmux_target else { return };
            let mut attempts = 0;
            while attempts < 5 {
                let still_exists = {
                    let store = manager.store.read().await;
                    store.agents.get(&project).map(|m| m.contains_key(&agent_id)).unwrap_or(false)
                };
                if !still_exists {
                    return;
                }
                manager.probe_claude_trust_prompt(&tmux_target);
                attempts += 1;
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        });
    }

    /// For providers whose CLI does not accept the task as argv (pi,
    /// opencode), submit after a provider-specific startup delay, polling the
    /// pane for an idle prompt every 200ms up to the ready-timeout.
    fn schedule_delayed_initial_send(
        self: &Arc<Self>,
        project: ProjectName,
        agent_id: AgentId,
        task: String,
        provider: Box<dyn Provider>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let delay_ms = provider.initial_task_delay_ms(&manager.config.startup);
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;

            let still_exists = {
                let store = manager.store.read().await;
                store.agents.get(&project).map(|m| m.contains_key(&agent_id)).unwrap_or(false)
            };
            if !still_exists {
                return;
            }

            let tmux_target = {
                let store = manager.store.read().await;
                store.agents.get(&project).and_then(|m| m.get(&agent_id)).map(|r| r.agent.tmux_target.clone())
            };
            let Some(tmux_target) = tmux_target else { return };

            let ready_timeout = manager.config.startup.initial_task_ready_timeout_ms;
            let mut waited: u64 = 0;
            loop {
                let still_exists = {
                    let store = manager.store.read().await;
                    store.agents.get(&project).map(|m| m.contains_key(&agent_id)).unwrap_or(false)
                };
                if !still_exists {
                    return;
                }
                if let Ok(captured) = manager.tmux.capture_pane(&tmux_target, 50) {
                    if provider.is_idle_prompt(&captured) || waited >= ready_timeout {
                        break;
                    }
                } else if waited >= ready_timeout {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                waited += 200;
            }

            let formatted = provider.format_input(&task);
            if let Err(e) = manager.tmux.send_keys_safe(&tmux_target, &formatted, true) {
                tracing::warn!(agent_id = %agent_id, error = %e, "initial task send failed, agent remains starting");
                return;
            }

            manager.emit(&project, &agent_id, EventPayload::InputSent { text: task.clone() });
            manager.transition_status(&project, &agent_id, AgentStatus::Processing, "manager_initial_input").await;
        });
    }

    fn prepare_runtime_dir(
        &self,
        project: &ProjectName,
        agent_id: &AgentId,
        provider: &dyn Provider,
        subscription: Option<&SubscriptionDef>,
    ) -> Result<PathBuf, HarnessError> {
        let runtime_dir = self.config.log_dir().join(provider.name()).join(project.as_str()).join(agent_id.as_str());
        std::fs::create_dir_all(&runtime_dir)
            .map_err(|e| HarnessError::InvalidRequest(format!("failed to create runtime sandbox: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&runtime_dir, std::fs::Permissions::from_mode(0o700));
        }

        if provider.name() == "codex" {
            if let Some(home) = dirs::home_dir() {
                let source_home = home.join(".codex");
                if subscription.is_some() {
                    for f in ["auth.json", "config.toml"] {
                        let src = source_home.join(f);
                        if src.exists() {
                            let _ = std::fs::copy(&src, runtime_dir.join(f));
                        }
                    }
                    if let Some(sub) = subscription {
                        if let Some(ref workspace_id) = sub.forced_chatgpt_workspace_id {
                            upsert_toml_key(&runtime_dir.join("config.toml"), "forced_chatgpt_workspace_id", workspace_id);
                        }
                    }
                } else {
                    for f in ["auth.json", "config.toml"] {
                        let src = source_home.join(f);
                        let dest = runtime_dir.join(f);
                        if src.exists() && !dest.exists() {
                            #[cfg(unix)]
                            let _ = std::os::unix::fs::symlink(&src, &dest);
                            #[cfg(not(unix))]
                            let _ = std::fs::copy(&src, &dest);
                        }
                    }
                }
            }
        }
        Ok(runtime_dir)
    }
}

fn truncate_brief_line(line: &str) -> String {
    let first_line = line.lines().next().unwrap_or("");
    if first_line.chars().count() > 140 {
        first_line.chars().take(140).collect()
    } else {
        first_line.to_string()
    }
}

/// Prepend well-known user bin directories so provider binaries resolve
/// under a minimal (e.g. systemd) environment that may lack them.
fn sanitised_path() -> String {
    let existing = std::env::var("PATH").unwrap_or_default();
    let home = dirs::home_dir();
    let mut prefixes = Vec::new();
    if let Some(home) = home {
        prefixes.push(home.join(".local/bin").display().to_string());
        prefixes.push(home.join("bin").display().to_string());
        prefixes.push(home.join(".cargo/bin").display().to_string());
    }
    prefixes.push("/usr/local/bin".to_string());
    prefixes.push("/usr/bin".to_string());
    prefixes.push("/bin".to_string());
    let mut parts: Vec<String> = prefixes;
    parts.push(existing);
    parts.join(":")
}

fn trust_prompt_visible(captured: &str) -> bool {
    let lines: Vec<&str> = captured.lines().collect();
    let last2 = lines.iter().rev().take(2);
    let confirm_line_present = last2.clone().any(|l| l.contains("Enter to confirm"));
    let last8 = lines.iter().rev().take(8);
    let context_present = last8
        .clone()
        .any(|l| l.contains("Quick safety check") || l.contains("trust this folder") || l.contains("Accessing workspace"));
    confirm_line_present && context_present
}

fn infer_provider(pane_info: &crate::tmux::PaneInfo, window_name: &str) -> Option<String> {
    for candidate in providers::all_names() {
        if pane_info.current_command.contains(candidate)
            || pane_info.start_command.contains(candidate)
            || window_name.starts_with(providers::by_name(candidate).map(|p| p.id_prefix().to_string()).unwrap_or_default().as_str())
        {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Recovers the full `providerSessionFile` path (not just the session-id
/// uuid) by re-deriving the sanitised-cwd directory the way
/// `providers::claude::sanitise_cwd` does at creation time (§9: "preserve
/// that [collapse-to-single-`-`] transformation and refuse to normalise
/// differently").
fn recover_claude_session_file(pane_info: &crate::tmux::PaneInfo, provider_name: &str, cwd: &str) -> Option<String> {
    if provider_name != "claude-code" {
        return None;
    }
    let marker = "--session-id";
    let idx = pane_info.start_command.find(marker)?;
    let rest = pane_info.start_command[idx + marker.len()..].trim_start();
    let uuid = rest.split_whitespace().next()?;
    let home = dirs::home_dir()?;
    let sanitised = crate::providers::claude::sanitise_cwd(cwd);
    Some(home.join(".claude").join("projects").join(sanitised).join(format!("{uuid}.jsonl")).display().to_string())
}

fn recover_runtime_dir(pane_info: &crate::tmux::PaneInfo, provider_name: &str) -> Option<String> {
    let var_name = match provider_name {
        "codex" => "CODEX_HOME",
        "pi" => "PI_CODING_AGENT_DIR",
        "opencode" => "XDG_DATA_HOME",
        _ => return None,
    };
    let idx = pane_info.start_command.find(var_name)?;
    let rest = &pane_info.start_command[idx + var_name.len()..];
    let rest = rest.strip_prefix('=')?;
    let value = rest.split_whitespace().next()?;
    Some(value.to_string())
}

fn upsert_toml_key(path: &PathBuf, key: &str, value: &str) {
    let raw = std::fs::read_to_string(path).unwrap_or_default();
    let mut doc: toml::Value = toml::from_str(&raw).unwrap_or_else(|_| toml::Value::Table(toml::Table::new()));
    let Some(table) = doc.as_table_mut() else { return };
    table.insert(key.to_string(), toml::Value::String(value.to_string()));
    if let Ok(serialized) = toml::to_string_pretty(&doc) {
        let _ = std::fs::write(path, serialized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::MockTmuxClient;

    fn test_manager() -> Arc<Manager> {
        let config = Arc::new(Config::default());
        let tmux = Arc::new(MockTmuxClient::new());
        let bus = Arc::new(EventBus::new(1000));
        Arc::new(Manager::new(config, tmux, bus))
    }

    #[tokio::test]
    async fn create_project_then_list_contains_it() {
        let manager = test_manager();
        manager.create_project("p1", "/tmp/p1", None).await.unwrap();
        let projects = manager.list_projects().await;
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name.as_str(), "p1");
    }

    #[tokio::test]
    async fn create_project_twice_conflicts() {
        let manager = test_manager();
        manager.create_project("p1", "/tmp/p1", None).await.unwrap();
        let err = manager.create_project("p1", "/tmp/p1", None).await.unwrap_err();
        assert!(matches!(err, HarnessError::ProjectExists(_)));
    }

    #[tokio::test]
    async fn create_codex_agent_is_processing_with_input_sent() {
        let manager = test_manager();
        manager.create_project("p1", "/tmp/p1", None).await.unwrap();
        let agent = manager.create_agent("p1", "codex", "Reply with exactly: 4", None, None, None, None).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Processing);
        assert!(agent.initial_task_via_cli);
    }

    #[tokio::test]
    async fn create_agent_unknown_provider_errors() {
        let manager = test_manager();
        manager.create_project("p1", "/tmp/p1", None).await.unwrap();
        let err = manager.create_agent("p1", "gemini", "hi", None, None, None, None).await.unwrap_err();
        assert!(matches!(err, HarnessError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn delete_agent_removes_from_list() {
        let manager = test_manager();
        manager.create_project("p1", "/tmp/p1", None).await.unwrap();
        let agent = manager.create_agent("p1", "codex", "hi", None, None, None, None).await.unwrap();
        manager.delete_agent("p1", agent.id.as_str()).await.unwrap();
        let agents = manager.list_agents("p1").await.unwrap();
        assert!(agents.is_empty());
    }

    #[test]
    fn trust_prompt_requires_both_confirm_and_context() {
        let only_confirm = "some output\nEnter to confirm\n";
        assert!(!trust_prompt_visible(only_confirm));
        let both = "Quick safety check\nAccessing workspace\nmore\nmore\nmore\nmore\nEnter to confirm\n";
        assert!(trust_prompt_visible(both));
    }
}
