//! Cross-provider message reader facade (§4.6).
//!
//! No direct teacher precedent — delegates per-provider parsing to
//! `providers::Provider::read_messages`, following the same
//! incremental-journal-reading discipline the provider modules already use.
//! This module's own job is the provider-independent parts: codex's
//! subagent-aware journal selection via `history.jsonl`, role filtering, and
//! `last_assistant_message`'s fallback rule.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::providers::{JournalMessage, MessageRole, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFilter {
    All,
    User,
    Assistant,
    System,
    Developer,
}

impl RoleFilter {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "all" => Some(Self::All),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "developer" => Some(Self::Developer),
            _ => None,
        }
    }

    fn matches(self, role: MessageRole) -> bool {
        match self {
            Self::All => true,
            Self::User => role == MessageRole::User,
            Self::Assistant => role == MessageRole::Assistant,
            Self::System => role == MessageRole::System,
            Self::Developer => role == MessageRole::Developer,
        }
    }
}

/// Resolve the journal path to actually read messages from, given the
/// provider-located candidate. For codex, if a `history.jsonl` sits beside
/// the session directory and names a canonical parent session id, prefer the
/// `rollout-*-<sessionId>.jsonl` matching that id over the candidate (which
/// may be a subagent's own rollout). Falls back to the candidate when
/// history gives no hint.
pub fn resolve_journal_path(provider: &dyn Provider, candidate: &Path) -> PathBuf {
    if provider.name() != "codex" {
        return candidate.to_path_buf();
    }
    let Some(sessions_dir) = find_sessions_root(candidate) else {
        return candidate.to_path_buf();
    };
    let history_path = sessions_dir.join("history.jsonl");
    let Some(parent_session_id) = read_canonical_parent_session_id(&history_path) else {
        return candidate.to_path_buf();
    };
    find_rollout_for_session(&sessions_dir, &parent_session_id).unwrap_or_else(|| candidate.to_path_buf())
}

fn find_sessions_root(candidate: &Path) -> Option<PathBuf> {
    let mut cur = candidate.parent()?;
    loop {
        if cur.file_name().and_then(|n| n.to_str()) == Some("sessions") {
            return Some(cur.to_path_buf());
        }
        cur = cur.parent()?;
    }
}

/// `history.jsonl` records append-only lines; the canonical parent session
/// id is read from the last record naming one.
fn read_canonical_parent_session_id(history_path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(history_path).ok()?;
    content
        .lines()
        .rev()
        .find_map(|line| {
            let v: Value = serde_json::from_str(line).ok()?;
            v.get("session_id").and_then(Value::as_str).map(str::to_string)
        })
}

fn find_rollout_for_session(sessions_dir: &Path, session_id: &str) -> Option<PathBuf> {
    let suffix = format!("-{session_id}.jsonl");
    let mut found = Vec::new();
    collect_rollouts(sessions_dir, 0, &mut found);
    found.into_iter().find(|p| p.file_name().and_then(|n| n.to_str()).map(|n| n.ends_with(&suffix)).unwrap_or(false))
}

fn collect_rollouts(dir: &Path, depth: u8, out: &mut Vec<PathBuf>) {
    if depth == 3 {
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()).map(|n| n.starts_with("rollout-")).unwrap_or(false) {
                out.push(path);
            }
        }
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        if entry.path().is_dir() {
            collect_rollouts(&entry.path(), depth + 1, out);
        }
    }
}

/// Read and role-filter an agent's full message history from its provider's
/// journal, applying §4.6's per-provider normalisation.
pub fn read_messages(
    provider: &dyn Provider,
    journal_path: &Path,
    filter: RoleFilter,
    limit: Option<usize>,
) -> anyhow::Result<Vec<JournalMessage>> {
    let resolved = resolve_journal_path(provider, journal_path);
    let mut messages = provider.read_messages(&resolved)?;
    messages.retain(|m| filter.matches(m.role));
    if let Some(limit) = limit {
        if messages.len() > limit {
            let start = messages.len() - limit;
            messages = messages.split_off(start);
        }
    }
    Ok(messages)
}

/// The most recent assistant message with non-whitespace text, falling back
/// to the most recent assistant message overall.
pub fn last_assistant_message(messages: &[JournalMessage]) -> Option<&JournalMessage> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant && !m.text.trim().is_empty())
        .or_else(|| messages.iter().rev().find(|m| m.role == MessageRole::Assistant))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::codex::Codex;
    use chrono::Utc;

    fn msg(role: MessageRole, text: &str) -> JournalMessage {
        JournalMessage { id: None, ts: Some(Utc::now()), role, text: text.to_string(), finish_reason: None }
    }

    #[test]
    fn role_filter_parses_known_values() {
        assert_eq!(RoleFilter::parse("assistant"), Some(RoleFilter::Assistant));
        assert_eq!(RoleFilter::parse("bogus"), None);
    }

    #[test]
    fn last_assistant_message_skips_whitespace_only() {
        let msgs = vec![
            msg(MessageRole::Assistant, "real answer"),
            msg(MessageRole::Assistant, "   "),
            msg(MessageRole::User, "question"),
        ];
        let last = last_assistant_message(&msgs).unwrap();
        assert_eq!(last.text, "real answer");
    }

    #[test]
    fn last_assistant_message_falls_back_when_all_blank() {
        let msgs = vec![msg(MessageRole::Assistant, "   "), msg(MessageRole::User, "q")];
        let last = last_assistant_message(&msgs).unwrap();
        assert_eq!(last.role, MessageRole::Assistant);
    }

    #[test]
    fn resolve_journal_path_falls_back_without_history() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("sessions/2026/01/01");
        std::fs::create_dir_all(&sessions).unwrap();
        let candidate = sessions.join("rollout-abc.jsonl");
        std::fs::write(&candidate, "").unwrap();
        let resolved = resolve_journal_path(&Codex, &candidate);
        assert_eq!(resolved, candidate);
    }

    #[test]
    fn resolve_journal_path_follows_history_to_parent_session() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("sessions");
        let day_dir = sessions.join("2026/01/01");
        std::fs::create_dir_all(&day_dir).unwrap();
        let parent_rollout = day_dir.join("rollout-2026-01-01-parent-session.jsonl");
        std::fs::write(&parent_rollout, "").unwrap();
        let sub_rollout = day_dir.join("rollout-2026-01-01-sub-session.jsonl");
        std::fs::write(&sub_rollout, "").unwrap();
        std::fs::write(
            sessions.join("history.jsonl"),
            "{\"session_id\":\"parent-session\"}\n",
        )
        .unwrap();
        let resolved = resolve_journal_path(&Codex, &sub_rollout);
        assert_eq!(resolved, parent_rollout);
    }
}
