//! Pi provider: no CLI-arg task support, straight role mapping, newest
//! `*.jsonl` in the runtime dir is the journal (§4.1, §4.3, §4.6).

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

use super::{detect_interactive_prompt, BuildContext, JournalCursor, JournalEventOut, JournalMessage, JournalTick, MessageRole, Provider, UiDiffEvent};
use crate::model::AgentStatus;

pub struct Pi;

impl Provider for Pi {
    fn name(&self) -> &'static str {
        "pi"
    }

    fn id_prefix(&self) -> &'static str {
        "pi"
    }

    fn accepts_initial_task_as_arg(&self) -> bool {
        false
    }

    fn build_command(&self, ctx: &BuildContext) -> Vec<String> {
        let mut cmd = vec!["pi".to_string()];
        if let Some(model) = ctx.model {
            cmd.push("--model".to_string());
            cmd.push(model.to_string());
        }
        cmd
    }

    fn build_env(&self, ctx: &BuildContext) -> (HashMap<String, String>, Vec<String>) {
        let mut env = HashMap::new();
        if let Some(runtime_dir) = ctx.runtime_dir {
            env.insert("PI_HOME".to_string(), runtime_dir.display().to_string());
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
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = std::fs::read_dir(runtime_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
            .filter_map(|p| p.metadata().ok().and_then(|m| m.modified().ok()).map(|mtime| (mtime, p)))
            .collect();
        files.sort_by_key(|(mtime, _)| *mtime);
        files.into_iter().last().map(|(_, p)| p)
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
            let role_str = v.get("role").and_then(Value::as_str).unwrap_or("");
            let role = match role_str {
                "user" => MessageRole::User,
                "assistant" => MessageRole::Assistant,
                "system" => MessageRole::System,
                _ => continue,
            };
            let Some(text) = v.get("content").and_then(Value::as_str) else { continue };
            if text.trim().is_empty() {
                continue;
            }
            messages.push(JournalMessage {
                id: v.get("id").and_then(Value::as_str).map(str::to_string),
                ts: None,
                role,
                text: text.to_string(),
                finish_reason: None,
            });
        }
        Ok(messages)
    }
}

/// §4.3 pi status map: `message.role=user` -> processing; `role=assistant`
/// -> idle unless `stopReason=error`.
fn status_for_record(v: &Value) -> Option<AgentStatus> {
    let message = v.get("message").unwrap_or(v);
    match message.get("role").and_then(Value::as_str) {
        Some("user") => Some(AgentStatus::Processing),
        Some("assistant") => {
            if message.get("stopReason").and_then(Value::as_str) == Some("error") {
                Some(AgentStatus::Error)
            } else {
                Some(AgentStatus::Idle)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pi_does_not_accept_cli_arg_task() {
        assert!(!Pi.accepts_initial_task_as_arg());
    }

    #[test]
    fn status_mapping_user_is_processing() {
        let v: Value = serde_json::json!({"role": "user"});
        assert_eq!(status_for_record(&v), Some(AgentStatus::Processing));
    }

    #[test]
    fn status_mapping_assistant_error_stop_reason_is_error() {
        let v: Value = serde_json::json!({"role": "assistant", "stopReason": "error"});
        assert_eq!(status_for_record(&v), Some(AgentStatus::Error));
    }

    #[test]
    fn status_mapping_assistant_default_is_idle() {
        let v: Value = serde_json::json!({"role": "assistant"});
        assert_eq!(status_for_record(&v), Some(AgentStatus::Idle));
    }

    #[test]
    fn read_messages_skips_empty_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "{\"role\":\"user\",\"content\":\"hi\"}\n{\"role\":\"assistant\",\"content\":\"\"}\n").unwrap();
        let msgs = Pi.read_messages(&path).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text, "hi");
    }
}
