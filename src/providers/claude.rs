//! Claude-code provider: `--session-id <uuid>` argv, session file path
//! derived from a sanitised cwd, API-key env unset in favour of OAuth (§4.1).

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

use super::{detect_interactive_prompt, BuildContext, JournalCursor, JournalEventOut, JournalMessage, JournalTick, MessageRole, Provider, UiDiffEvent};
use crate::model::AgentStatus;

pub struct ClaudeCode;

/// Collapse each run of non-`[A-Za-z0-9-]` characters in `cwd` to a single
/// `-`, matching how claude-code names its per-project session directory.
pub fn sanitise_cwd(cwd: &str) -> String {
    let mut out = String::with_capacity(cwd.len());
    let mut prev_was_sep = false;
    for c in cwd.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            prev_was_sep = false;
        } else if !prev_was_sep {
            out.push('-');
            prev_was_sep = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Whether `source_dir` names the same location as the default
/// `~/.claude`, in which case `CLAUDE_CONFIG_DIR` is left unset (§4.1).
fn is_default_config_dir(source_dir: &str, home_dir: Option<&PathBuf>) -> bool {
    if source_dir == "~/.claude" {
        return true;
    }
    home_dir.is_some_and(|home| PathBuf::from(source_dir) == home.join(".claude"))
}

impl Provider for ClaudeCode {
    fn name(&self) -> &'static str {
        "claude-code"
    }

    fn id_prefix(&self) -> &'static str {
        "claude"
    }

    fn accepts_initial_task_as_arg(&self) -> bool {
        true
    }

    fn build_command(&self, ctx: &BuildContext) -> Vec<String> {
        let mut cmd = vec!["claude".to_string(), "--session-id".to_string(), ctx.agent_id.to_string()];
        if let Some(model) = ctx.model {
            cmd.push("--model".to_string());
            cmd.push(model.to_string());
        }
        cmd.push(ctx.task.to_string());
        cmd
    }

    fn build_env(&self, ctx: &BuildContext) -> (HashMap<String, String>, Vec<String>) {
        let mut env = HashMap::new();
        let mut unset = vec!["ANTHROPIC_API_KEY".to_string(), "ANTHROPIC_AUTH_TOKEN".to_string()];

        let mut oauth_token_set = false;
        if let Some(sub) = ctx.subscription {
            if let Some(source_dir) = &sub.source_dir {
                if !is_default_config_dir(source_dir, ctx.home_dir) {
                    env.insert("CLAUDE_CONFIG_DIR".to_string(), source_dir.clone());
                }
            }
            if let Some(token_file) = &sub.token_file {
                if let Ok(token) = std::fs::read_to_string(token_file) {
                    env.insert("CLAUDE_CODE_OAUTH_TOKEN".to_string(), token.trim().to_string());
                    oauth_token_set = true;
                }
            }
        }
        if !oauth_token_set {
            unset.push("CLAUDE_CODE_OAUTH_TOKEN".to_string());
        }
        unset.extend(std::env::vars().map(|(k, _)| k).filter(|k| k.starts_with("CLAUDE_PROFILE_")));

        (env, unset)
    }

    fn idle_pattern(&self) -> &'static str {
        "? for shortcuts"
    }

    fn exit_command(&self) -> Option<&'static str> {
        Some("/exit")
    }

    fn initial_task_delay_ms(&self, startup: &crate::config::StartupConfig) -> u64 {
        // claude-code's trust-folder prompt takes longer to clear than the
        // generic startup delay before the CLI-arg task is actually consumed.
        startup.claude_initial_task_delay_ms
    }

    fn locate_journal(&self, ctx: &BuildContext) -> Option<PathBuf> {
        let home = ctx.home_dir?;
        let sanitised = sanitise_cwd(ctx.cwd);
        let candidate = home.join(".claude").join("projects").join(&sanitised).join(format!("{}.jsonl", ctx.agent_id));
        if candidate.exists() {
            return Some(candidate);
        }
        // Fallback: the directory may have been created under a slightly
        // different sanitisation of an older cwd value; pick the newest
        // matching session file if one exists.
        let dir = home.join(".claude").join("projects").join(&sanitised);
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
            .collect();
        files.sort();
        files.into_iter().last()
    }

    fn parse_status(&self, cursor: &mut JournalCursor, new_bytes: &str) -> JournalTick {
        let mut tick = JournalTick::default();
        let combined = format!("{}{}", cursor.partial_line, new_bytes);
        let mut lines: Vec<&str> = combined.split('\n').collect();
        cursor.partial_line = lines.pop().unwrap_or("").to_string();

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(v) => {
                    if let Some(status) = status_for_record(&v) {
                        cursor.last_status = Some(status);
                        tick.status = Some(status);
                    }
                    match v.get("type").and_then(Value::as_str) {
                        Some("tool_use") => tick.events.push(JournalEventOut::ToolUse(v.clone())),
                        Some("tool_result") => tick.events.push(JournalEventOut::ToolResult(v.clone())),
                        _ => {}
                    }
                }
                Err(_) => tick.parse_errors += 1,
            }
        }
        tick
    }

    fn parse_ui_status(&self, tail: &str) -> Option<AgentStatus> {
        detect_interactive_prompt(tail).map(|_| AgentStatus::WaitingInput)
    }

    fn parse_output_diff(&self, diff: &str) -> Option<UiDiffEvent> {
        detect_interactive_prompt(diff)
    }

    fn read_messages(&self, journal_path: &PathBuf) -> anyhow::Result<Vec<JournalMessage>> {
        let content = std::fs::read_to_string(journal_path)?;
        let mut messages = Vec::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(v) = serde_json::from_str::<Value>(line) else { continue };
            let Some(msg) = v.get("message") else { continue };
            let role_str = msg.get("role").and_then(Value::as_str).unwrap_or("");
            let role = match role_str {
                "user" => MessageRole::User,
                "assistant" => MessageRole::Assistant,
                _ => continue,
            };
            let Some(text) = extract_text(msg) else { continue };
            if should_skip(&text) {
                continue;
            }
            messages.push(JournalMessage {
                id: v.get("uuid").and_then(Value::as_str).map(str::to_string),
                ts: v
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&chrono::Utc)),
                role,
                text,
                finish_reason: msg.get("stop_reason").and_then(Value::as_str).map(str::to_string),
            });
        }
        Ok(messages)
    }
}

fn extract_text(msg: &Value) -> Option<String> {
    match msg.get("content") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => {
            let joined: Vec<String> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join("\n"))
            }
        }
        _ => None,
    }
}

/// Skip synthetic/bookkeeping lines: local-command wrappers and empty text.
fn should_skip(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty()
        || trimmed.starts_with("<local-command-caveat>")
        || trimmed.starts_with("<local-command-stdout>")
        || trimmed.starts_with("<command-name>")
}

/// §4.3 claude-code status map: `queue-operation.enqueue`/`user` ->
/// processing; `assistant` with no `stop_reason` or `stop_reason` in
/// `{tool_use, pause_turn}` -> processing; `{end_turn, max_tokens,
/// stop_sequence}` -> idle; `error` -> error; `system.level=error` -> error.
fn status_for_record(v: &Value) -> Option<AgentStatus> {
    match v.get("type").and_then(Value::as_str) {
        Some("queue-operation") => {
            (v.get("operation").and_then(Value::as_str) == Some("enqueue")).then_some(AgentStatus::Processing)
        }
        Some("user") => Some(AgentStatus::Processing),
        Some("assistant") => {
            let msg = v.get("message");
            let stop_reason = msg.and_then(|m| m.get("stop_reason")).and_then(Value::as_str);
            match stop_reason {
                None => Some(AgentStatus::Processing),
                Some("tool_use") | Some("pause_turn") => Some(AgentStatus::Processing),
                Some("end_turn") | Some("max_tokens") | Some("stop_sequence") => Some(AgentStatus::Idle),
                Some("error") => Some(AgentStatus::Error),
                Some(_) => None,
            }
        }
        Some("system") => {
            (v.get("level").and_then(Value::as_str) == Some("error")).then_some(AgentStatus::Error)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitise_cwd_collapses_runs() {
        assert_eq!(sanitise_cwd("/home/user/my project!!"), "home-user-my-project");
    }

    #[test]
    fn build_command_includes_session_id() {
        let claude = ClaudeCode;
        let ctx = BuildContext {
            agent_id: "claude-swift-otter",
            task: "hello",
            model: None,
            cwd: "/tmp",
            runtime_dir: None,
            home_dir: None,
            subscription: None,
        };
        let cmd = claude.build_command(&ctx);
        assert!(cmd.contains(&"--session-id".to_string()));
        assert!(cmd.contains(&"claude-swift-otter".to_string()));
    }

    fn build_ctx<'a>(subscription: Option<&'a crate::config::SubscriptionDef>, home_dir: Option<&'a PathBuf>) -> BuildContext<'a> {
        BuildContext { agent_id: "claude-a", task: "hi", model: None, cwd: "/tmp", runtime_dir: None, home_dir, subscription }
    }

    #[test]
    fn build_env_leaves_config_dir_unset_without_subscription() {
        let (env, unset) = ClaudeCode.build_env(&build_ctx(None, None));
        assert!(!env.contains_key("CLAUDE_CONFIG_DIR"));
        assert!(unset.contains(&"CLAUDE_CODE_OAUTH_TOKEN".to_string()));
    }

    #[test]
    fn build_env_leaves_config_dir_unset_when_source_dir_is_default() {
        let home = PathBuf::from("/home/op");
        let sub = crate::config::SubscriptionDef {
            id: "s1".to_string(),
            provider: "claude-code".to_string(),
            enabled: true,
            source_dir: Some("/home/op/.claude".to_string()),
            token_file: None,
            forced_chatgpt_workspace_id: None,
            env: HashMap::new(),
            unset_env: Vec::new(),
        };
        let (env, _unset) = ClaudeCode.build_env(&build_ctx(Some(&sub), Some(&home)));
        assert!(!env.contains_key("CLAUDE_CONFIG_DIR"));
    }

    #[test]
    fn build_env_sets_config_dir_when_source_dir_differs() {
        let home = PathBuf::from("/home/op");
        let sub = crate::config::SubscriptionDef {
            id: "s1".to_string(),
            provider: "claude-code".to_string(),
            enabled: true,
            source_dir: Some("/opt/claude-profiles/work".to_string()),
            token_file: None,
            forced_chatgpt_workspace_id: None,
            env: HashMap::new(),
            unset_env: Vec::new(),
        };
        let (env, _unset) = ClaudeCode.build_env(&build_ctx(Some(&sub), Some(&home)));
        assert_eq!(env.get("CLAUDE_CONFIG_DIR"), Some(&"/opt/claude-profiles/work".to_string()));
    }

    #[test]
    fn build_env_reads_token_file_and_keeps_oauth_token_out_of_unset() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token");
        std::fs::write(&token_path, "sk-test-token\n").unwrap();
        let sub = crate::config::SubscriptionDef {
            id: "s1".to_string(),
            provider: "claude-code".to_string(),
            enabled: true,
            source_dir: None,
            token_file: Some(token_path.display().to_string()),
            forced_chatgpt_workspace_id: None,
            env: HashMap::new(),
            unset_env: Vec::new(),
        };
        let (env, unset) = ClaudeCode.build_env(&build_ctx(Some(&sub), None));
        assert_eq!(env.get("CLAUDE_CODE_OAUTH_TOKEN"), Some(&"sk-test-token".to_string()));
        assert!(!unset.contains(&"CLAUDE_CODE_OAUTH_TOKEN".to_string()));
    }

    #[test]
    fn parse_output_diff_recognises_permission_prompt() {
        let diff = "Do you want to proceed?\n❯ 1. Yes\n  2. No\n";
        assert_eq!(
            ClaudeCode.parse_output_diff(diff),
            Some(UiDiffEvent::PermissionRequested { description: "Do you want to proceed?".to_string() })
        );
        assert_eq!(ClaudeCode.parse_ui_status(diff), Some(AgentStatus::WaitingInput));
    }

    #[test]
    fn should_skip_filters_local_command_wrappers() {
        assert!(should_skip("<local-command-caveat>note</local-command-caveat>"));
        assert!(should_skip("   "));
        assert!(!should_skip("actual reply"));
    }

    #[test]
    fn status_mapping_end_turn_is_idle() {
        let v: Value = serde_json::json!({"type": "assistant", "message": {"stop_reason": "end_turn"}});
        assert_eq!(status_for_record(&v), Some(AgentStatus::Idle));
    }

    #[test]
    fn status_mapping_assistant_no_stop_reason_is_processing() {
        let v: Value = serde_json::json!({"type": "assistant", "message": {}});
        assert_eq!(status_for_record(&v), Some(AgentStatus::Processing));
    }

    #[test]
    fn status_mapping_system_error_level_is_error() {
        let v: Value = serde_json::json!({"type": "system", "level": "error"});
        assert_eq!(status_for_record(&v), Some(AgentStatus::Error));
    }
}
