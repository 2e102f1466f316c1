//! Opencode provider: `ses_*.json` session file plus sibling `message/` and
//! `part/` directories; messages are assembled by joining parts ordered by
//! `time.created` (§4.1, §4.3, §4.6).

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

use super::{detect_interactive_prompt, BuildContext, JournalCursor, JournalEventOut, JournalMessage, JournalTick, MessageRole, Provider, UiDiffEvent};
use crate::model::AgentStatus;

pub struct OpenCode;

impl Provider for OpenCode {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn id_prefix(&self) -> &'static str {
        "opencode"
    }

    fn accepts_initial_task_as_arg(&self) -> bool {
        false
    }

    fn build_command(&self, ctx: &BuildContext) -> Vec<String> {
        let mut cmd = vec!["opencode".to_string()];
        if let Some(model) = ctx.model {
            cmd.push("--model".to_string());
            cmd.push(model.to_string());
        }
        cmd
    }

    fn build_env(&self, ctx: &BuildContext) -> (HashMap<String, String>, Vec<String>) {
        let mut env = HashMap::new();
        if let Some(runtime_dir) = ctx.runtime_dir {
            env.insert("XDG_DATA_HOME".to_string(), runtime_dir.display().to_string());
        }
        (env, Vec::new())
    }

    fn idle_pattern(&self) -> &'static str {
        ">"
    }

    fn exit_command(&self) -> Option<&'static str> {
        Some("/exit")
    }

    fn locate_journal(&self, ctx: &BuildContext) -> Option<PathBuf> {
        let runtime_dir = ctx.runtime_dir?;
        let storage = runtime_dir.join("storage").join("session");
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = std::fs::read_dir(&storage)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("ses_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .filter_map(|p| p.metadata().ok().and_then(|m| m.modified().ok()).map(|mtime| (mtime, p)))
            .collect();
        files.sort_by_key(|(mtime, _)| *mtime);
        files.into_iter().last().map(|(_, p)| p)
    }

    fn parse_status(&self, cursor: &mut JournalCursor, new_bytes: &str) -> JournalTick {
        // Opencode publishes message/part trees rather than an append-only
        // log; the Poller feeds this provider whole-file snapshots of the
        // session's latest part file instead of true incremental bytes, so a
        // single JSON object (not line-delimited) is expected here.
        let mut tick = JournalTick::default();
        if new_bytes.trim().is_empty() {
            cursor.partial_line.clear();
            return tick;
        }
        match serde_json::from_str::<Value>(new_bytes.trim()) {
            Ok(v) => {
                if let Some(status) = status_for_record(&v) {
                    cursor.last_status = Some(status);
                    tick.status = Some(status);
                }
                if v.get("type").and_then(Value::as_str) == Some("tool") {
                    tick.events.push(JournalEventOut::ToolUse(v));
                }
            }
            Err(_) => tick.parse_errors += 1,
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
        let session: Value = serde_json::from_str(&std::fs::read_to_string(journal_path)?)?;
        let session_id = session
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("opencode session file missing id"))?;

        let root = journal_path
            .parent()
            .and_then(|p| p.parent())
            .ok_or_else(|| anyhow::anyhow!("opencode session file has no storage root"))?;
        let message_dir = root.join("message").join(session_id);
        let part_dir = root.join("part").join(session_id);

        let mut messages = Vec::new();
        let Ok(entries) = std::fs::read_dir(&message_dir) else {
            return Ok(messages);
        };
        let mut message_files: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        message_files.sort();

        for msg_path in message_files {
            let Ok(raw) = std::fs::read_to_string(&msg_path) else { continue };
            let Ok(meta): Result<Value, _> = serde_json::from_str(&raw) else { continue };
            let role_str = meta.get("role").and_then(Value::as_str).unwrap_or("");
            let role = match role_str {
                "user" => MessageRole::User,
                "assistant" => MessageRole::Assistant,
                _ => continue,
            };
            let msg_id = meta.get("id").and_then(Value::as_str).unwrap_or_default();
            let text = join_parts(&part_dir, msg_id);
            if text.trim().is_empty() {
                continue;
            }
            messages.push(JournalMessage {
                id: Some(msg_id.to_string()),
                ts: meta
                    .get("time")
                    .and_then(|t| t.get("created"))
                    .and_then(Value::as_i64)
                    .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
                    .map(|dt| dt.with_timezone(&chrono::Utc)),
                finish_reason: meta.get("finish").and_then(Value::as_str).map(str::to_string),
                role,
                text,
            });
        }
        Ok(messages)
    }
}

fn join_parts(part_dir: &PathBuf, message_id: &str) -> String {
    let dir = part_dir.join(message_id);
    let Ok(entries) = std::fs::read_dir(&dir) else { return String::new() };
    let mut parts: Vec<(i64, String)> = Vec::new();
    for entry in entries.flatten() {
        let Ok(raw) = std::fs::read_to_string(entry.path()) else { continue };
        let Ok(v): Result<Value, _> = serde_json::from_str(&raw) else { continue };
        if v.get("type").and_then(Value::as_str) != Some("text") {
            continue;
        }
        let created = v.get("time").and_then(|t| t.get("created")).and_then(Value::as_i64).unwrap_or(0);
        if let Some(text) = v.get("text").and_then(Value::as_str) {
            parts.push((created, text.to_string()));
        }
    }
    parts.sort_by_key(|(created, _)| *created);
    parts.into_iter().map(|(_, text)| text).collect::<Vec<_>>().join("")
}

/// §4.3 opencode status map: assistant complete with `finish=stop` -> idle;
/// assistant with no `time.completed` or a non-stop finish -> processing;
/// user -> processing; a tool-part with `state.status=error` -> error.
fn status_for_record(v: &Value) -> Option<AgentStatus> {
    match v.get("role").and_then(Value::as_str) {
        Some("user") => return Some(AgentStatus::Processing),
        Some("assistant") => {
            let completed = v.get("time").and_then(|t| t.get("completed")).is_some();
            let finish = v.get("finish").and_then(Value::as_str);
            return if completed && finish == Some("stop") {
                Some(AgentStatus::Idle)
            } else {
                Some(AgentStatus::Processing)
            };
        }
        _ => {}
    }
    match v.get("type").and_then(Value::as_str) {
        Some("tool") => {
            if v.get("state").and_then(|s| s.get("status")).and_then(Value::as_str) == Some("error") {
                Some(AgentStatus::Error)
            } else {
                Some(AgentStatus::Processing)
            }
        }
        Some("error") => Some(AgentStatus::Error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opencode_does_not_accept_cli_arg_task() {
        assert!(!OpenCode.accepts_initial_task_as_arg());
    }

    #[test]
    fn join_parts_orders_by_time_created() {
        let dir = tempfile::tempdir().unwrap();
        let part_dir = dir.path().join("msg1");
        std::fs::create_dir_all(&part_dir).unwrap();
        std::fs::write(part_dir.join("b.json"), r#"{"type":"text","text":" world","time":{"created":2}}"#).unwrap();
        std::fs::write(part_dir.join("a.json"), r#"{"type":"text","text":"hello","time":{"created":1}}"#).unwrap();
        let joined = join_parts(&dir.path().to_path_buf(), "msg1");
        assert_eq!(joined, "hello world");
    }

    #[test]
    fn status_mapping_tool_is_processing() {
        let v: Value = serde_json::json!({"type": "tool"});
        assert_eq!(status_for_record(&v), Some(AgentStatus::Processing));
    }
}
