//! Codex provider: argv-delivered initial task, rollout JSONL journal
//! pinned to the oldest file in the oldest dated directory (§4.1, §4.3).

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

use super::{detect_interactive_prompt, BuildContext, JournalCursor, JournalEventOut, JournalMessage, JournalTick, MessageRole, Provider, UiDiffEvent};
use crate::model::AgentStatus;

pub struct Codex;

impl Provider for Codex {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn id_prefix(&self) -> &'static str {
        "codex"
    }

    fn accepts_initial_task_as_arg(&self) -> bool {
        true
    }

    fn build_command(&self, ctx: &BuildContext) -> Vec<String> {
        let mut cmd = vec!["codex".to_string()];
        if let Some(model) = ctx.model {
            cmd.push("--model".to_string());
            cmd.push(model.to_string());
        }
        // Appended last: the only reliable submission path for large
        // prompts, since codex's TUI collapses pastes >=256 chars into
        // markers and may swallow Enter while the marker is arming.
        cmd.push(ctx.task.to_string());
        cmd
    }

    fn build_env(&self, ctx: &BuildContext) -> (HashMap<String, String>, Vec<String>) {
        let mut env = HashMap::new();
        if let Some(runtime_dir) = ctx.runtime_dir {
            env.insert("CODEX_HOME".to_string(), runtime_dir.display().to_string());
        }
        let unset = vec!["OPENAI_API_KEY".to_string(), "CODEX_API_KEY".to_string()];
        (env, unset)
    }

    fn idle_pattern(&self) -> &'static str {
        ""
    }

    fn ui_heuristic_enabled(&self) -> bool {
        // Internals are mandatory for codex; no UI-text fallback (§4.3 priority 3).
        false
    }

    fn exit_command(&self) -> Option<&'static str> {
        Some("/exit")
    }

    fn locate_journal(&self, ctx: &BuildContext) -> Option<PathBuf> {
        let runtime_dir = ctx.runtime_dir?;
        find_oldest_rollout(&runtime_dir.join("sessions"))
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
                    if let Some(t) = v.get("type").and_then(Value::as_str) {
                        if t == "error" {
                            let msg = v
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("codex error")
                                .to_string();
                            tick.events.push(JournalEventOut::Error(msg));
                        }
                    }
                }
                Err(_) => tick.parse_errors += 1,
            }
        }
        tick
    }

    fn parse_output_diff(&self, diff: &str) -> Option<UiDiffEvent> {
        detect_interactive_prompt(diff)
    }

    fn read_messages(&self, journal_path: &PathBuf) -> anyhow::Result<Vec<JournalMessage>> {
        let content = std::fs::read_to_string(journal_path)?;
        let mut messages = Vec::new();
        let mut last_event_msg: Option<JournalMessage> = None;

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(v) = serde_json::from_str::<Value>(line) else { continue };
            if let Some(item) = v.get("response_item") {
                if item.get("role").and_then(Value::as_str) == Some("assistant") {
                    if let Some(text) = extract_text_parts(item) {
                        messages.push(JournalMessage {
                            id: None,
                            ts: None,
                            role: MessageRole::Assistant,
                            text,
                            finish_reason: item
                                .get("phase")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        });
                    }
                }
            } else if let Some(event) = v.get("event_msg") {
                if event.get("type").and_then(Value::as_str) == Some("agent_message") {
                    if let Some(text) = event.get("message").and_then(Value::as_str) {
                        last_event_msg = Some(JournalMessage {
                            id: None,
                            ts: None,
                            role: MessageRole::Assistant,
                            text: text.to_string(),
                            finish_reason: None,
                        });
                    }
                }
            }
        }
        // Prefer response_item assistant records; fall back to the last
        // streamed event_msg chunk only when no response_item was found.
        if messages.is_empty() {
            if let Some(m) = last_event_msg {
                messages.push(m);
            }
        }
        Ok(messages)
    }
}

fn extract_text_parts(item: &Value) -> Option<String> {
    let content = item.get("content")?.as_array()?;
    let joined: Vec<String> = content
        .iter()
        .filter_map(|c| c.get("text").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join("\n"))
    }
}

fn status_for_record(v: &Value) -> Option<AgentStatus> {
    if let Some(event) = v.get("event_msg") {
        let t = event.get("type").and_then(Value::as_str)?;
        return match t {
            "task_started" | "agent_reasoning" | "agent_message" => Some(AgentStatus::Processing),
            "task_complete" | "turn_aborted" => Some(AgentStatus::Idle),
            _ => None,
        };
    }
    if let Some(item) = v.get("response_item") {
        let role = item.get("role").and_then(Value::as_str);
        let kind = item.get("type").and_then(Value::as_str);
        if role == Some("assistant") && item.get("phase").and_then(Value::as_str) == Some("final_answer") {
            return Some(AgentStatus::Idle);
        }
        if matches!(kind, Some("reasoning") | Some("function_call") | Some("custom_tool_call")) {
            return Some(AgentStatus::Processing);
        }
    }
    if v.get("type").and_then(Value::as_str) == Some("error") {
        return Some(AgentStatus::Error);
    }
    None
}

/// Select the oldest `rollout-*.jsonl` file in the oldest `YYYY/MM/DD` dir
/// under `<runtime>/sessions`. Pinned for the agent's lifetime by the caller
/// (the Manager only calls this once, at create or rehydrate time).
fn find_oldest_rollout(sessions_dir: &PathBuf) -> Option<PathBuf> {
    let mut date_dirs = Vec::new();
    collect_date_dirs(sessions_dir, 0, &mut date_dirs);
    date_dirs.sort();
    for dir in date_dirs {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("rollout-") && n.ends_with(".jsonl"))
                    .unwrap_or(false)
            })
            .collect();
        if files.is_empty() {
            continue;
        }
        files.sort();
        return files.into_iter().next();
    }
    None
}

fn collect_date_dirs(dir: &PathBuf, depth: u8, out: &mut Vec<PathBuf>) {
    if depth == 3 {
        out.push(dir.clone());
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        if entry.path().is_dir() {
            collect_date_dirs(&entry.path(), depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_task_started_is_processing() {
        let v: Value = serde_json::json!({"event_msg": {"type": "task_started"}});
        assert_eq!(status_for_record(&v), Some(AgentStatus::Processing));
    }

    #[test]
    fn status_mapping_task_complete_is_idle() {
        let v: Value = serde_json::json!({"event_msg": {"type": "task_complete"}});
        assert_eq!(status_for_record(&v), Some(AgentStatus::Idle));
    }

    #[test]
    fn status_mapping_error_type_is_error() {
        let v: Value = serde_json::json!({"type": "error", "message": "boom"});
        assert_eq!(status_for_record(&v), Some(AgentStatus::Error));
    }

    #[test]
    fn parse_status_increments_parse_errors_on_malformed_line() {
        let codex = Codex;
        let mut cursor = JournalCursor::default();
        let tick = codex.parse_status(&mut cursor, "not json\n{\"event_msg\":{\"type\":\"task_started\"}}\n");
        assert_eq!(tick.parse_errors, 1);
        assert_eq!(tick.status, Some(AgentStatus::Processing));
    }

    #[test]
    fn initial_task_appended_as_last_argv() {
        let codex = Codex;
        let ctx = BuildContext {
            agent_id: "codex-a",
            task: "reply with 4",
            model: None,
            cwd: "/tmp",
            runtime_dir: None,
            home_dir: None,
            subscription: None,
        };
        let cmd = codex.build_command(&ctx);
        assert_eq!(cmd.last().unwrap(), "reply with 4");
    }
}
