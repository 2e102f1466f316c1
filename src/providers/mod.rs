//! Dynamic dispatch over providers (§9): one value per provider, selected by
//! name, implementing `{buildCommand, buildEnv, parseStatus, idlePattern,
//! formatInput, exitCommand, parseOutputDiff}`.
//!
//! Grounded on `src/permissions/{claude,translator}.rs`'s
//! trait-object-per-provider dispatch pattern, adapted to the different
//! 7-method provider interface. Journal/status reading has no direct
//! teacher precedent; it follows the incremental-cursor bookkeeping style
//! implied by `src/agents/monitor.rs`.

pub mod claude;
pub mod codex;
pub mod opencode;
pub mod pi;

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::SubscriptionDef;
use crate::model::AgentStatus;

/// Inputs needed to build a provider's argv/env for `createAgent`.
pub struct BuildContext<'a> {
    pub agent_id: &'a str,
    pub task: &'a str,
    pub model: Option<&'a str>,
    pub cwd: &'a str,
    pub runtime_dir: Option<&'a PathBuf>,
    pub home_dir: Option<&'a PathBuf>,
    /// The subscription (credential profile) the agent was created with, if
    /// any (§4.1's per-provider sandbox rules consult this for `sourceDir`/
    /// `tokenFile`).
    pub subscription: Option<&'a SubscriptionDef>,
}

/// A normalised chat message, per §4.6.
#[derive(Debug, Clone)]
pub struct JournalMessage {
    pub id: Option<String>,
    pub ts: Option<chrono::DateTime<chrono::Utc>>,
    pub role: MessageRole,
    pub text: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Developer,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Developer => "developer",
        }
    }
}

/// Output of feeding new journal lines into a provider's incremental reader:
/// a status contribution (if any line yielded one) and any lifecycle events
/// the Poller should emit (tool_use / tool_result / error / unknown).
#[derive(Debug, Default)]
pub struct JournalTick {
    pub status: Option<AgentStatus>,
    pub events: Vec<JournalEventOut>,
    pub parse_errors: u32,
}

#[derive(Debug)]
pub enum JournalEventOut {
    ToolUse(serde_json::Value),
    ToolResult(serde_json::Value),
    Error(String),
    Unknown(serde_json::Value),
}

/// Per-agent incremental cursor over a provider's journal file.
#[derive(Debug, Clone, Default)]
pub struct JournalCursor {
    pub session_file: Option<PathBuf>,
    pub offset: u64,
    pub partial_line: String,
    pub last_status: Option<AgentStatus>,
}

/// A provider-specific event surfaced by scanning freshly-appended pane text
/// for an interactive prompt (§4.2 step 6's `parseOutputDiff`), as opposed
/// to the journal-derived `JournalEventOut`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiDiffEvent {
    PermissionRequested { description: String },
    QuestionAsked { question: String, options: Vec<String> },
}

/// Shared heuristic for the line-oriented TUIs: a `?`-terminated line
/// immediately followed by a short block of numbered/arrow-marked option
/// lines is an interactive prompt. Two options where one reads "yes" is
/// treated as a permission confirmation; anything else is a free-form
/// question.
pub fn detect_interactive_prompt(text: &str) -> Option<UiDiffEvent> {
    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let question = line.trim();
        if question.is_empty() || !question.ends_with('?') {
            continue;
        }

        let mut options = Vec::new();
        for candidate in lines.iter().skip(i + 1) {
            let trimmed = candidate.trim_start_matches(['❯', '>', ' ']).trim();
            if trimmed.is_empty() {
                break;
            }
            let stripped =
                trimmed.trim_start_matches(|c: char| c.is_ascii_digit()).trim_start_matches(['.', ')']).trim();
            if stripped.is_empty() || stripped.len() == trimmed.len() {
                break;
            }
            options.push(stripped.to_string());
        }
        if options.is_empty() {
            continue;
        }

        let question = question.to_string();
        let is_confirmation = options.len() <= 2 && options.iter().any(|o| o.eq_ignore_ascii_case("yes"));
        return Some(if is_confirmation {
            UiDiffEvent::PermissionRequested { description: question }
        } else {
            UiDiffEvent::QuestionAsked { question, options }
        });
    }
    None
}

/// The per-provider interface named in §9.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Prefix used for auto-generated agent ids and rehydration window-name
    /// prefix matching.
    fn id_prefix(&self) -> &'static str;
    /// Whether the CLI accepts the initial prompt as an argv entry (codex,
    /// claude-code) vs needing a delayed send (pi, opencode).
    fn accepts_initial_task_as_arg(&self) -> bool;

    fn build_command(&self, ctx: &BuildContext) -> Vec<String>;
    /// Returns `(env to set, env vars to unset)`.
    fn build_env(&self, ctx: &BuildContext) -> (HashMap<String, String>, Vec<String>);

    /// Regex-ish substring/pattern describing an idle/ready prompt in the
    /// captured pane tail, used during the initial-task readiness poll.
    fn idle_pattern(&self) -> &'static str;
    fn is_idle_prompt(&self, captured_tail: &str) -> bool {
        captured_tail.contains(self.idle_pattern())
    }

    /// Wraps raw user text for submission (most providers: identity).
    fn format_input(&self, text: &str) -> String {
        text.to_string()
    }

    fn exit_command(&self) -> Option<&'static str>;

    /// Initial task delay before a delayed (non-CLI-arg) send, in ms.
    fn initial_task_delay_ms(&self, startup: &crate::config::StartupConfig) -> u64 {
        startup.initial_task_delay_ms
    }

    /// Locate/select the journal file(s) for a freshly-created agent, or
    /// `None` if the provider publishes nothing yet (e.g. not started).
    fn locate_journal(&self, ctx: &BuildContext) -> Option<PathBuf>;

    /// Feed newly-appended journal bytes (already read from `cursor.offset`)
    /// into the incremental parser, updating `cursor` in place.
    fn parse_status(&self, cursor: &mut JournalCursor, new_bytes: &str) -> JournalTick;

    /// Whether this provider's UI-text heuristic fallback is enabled when no
    /// journal status is available (§4.3 priority 3 — disabled for codex).
    fn ui_heuristic_enabled(&self) -> bool {
        true
    }

    /// UI-text fallback status parse over the captured pane tail.
    fn parse_ui_status(&self, _tail: &str) -> Option<AgentStatus> {
        None
    }

    /// Scan a freshly-appended pane diff for an interactive prompt (§4.2
    /// step 6's `parseOutputDiff`) so the Poller can emit
    /// `permission_requested`/`question_asked` events. Default: none.
    fn parse_output_diff(&self, _diff: &str) -> Option<UiDiffEvent> {
        None
    }

    /// Parse the full journal (from scratch) into normalised messages, per
    /// §4.6.
    fn read_messages(&self, journal_path: &PathBuf) -> anyhow::Result<Vec<JournalMessage>>;
}

pub fn by_name(name: &str) -> Option<Box<dyn Provider>> {
    match name {
        "codex" => Some(Box::new(codex::Codex)),
        "claude-code" => Some(Box::new(claude::ClaudeCode)),
        "pi" => Some(Box::new(pi::Pi)),
        "opencode" => Some(Box::new(opencode::OpenCode)),
        _ => None,
    }
}

pub fn all_names() -> &'static [&'static str] {
    &["codex", "claude-code", "pi", "opencode"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_name_covers_all_four_providers() {
        for name in all_names() {
            assert!(by_name(name).is_some(), "missing provider impl for {name}");
        }
        assert!(by_name("gemini").is_none());
    }

    #[test]
    fn detect_interactive_prompt_finds_permission_confirmation() {
        let tail = "Do you want to proceed?\n❯ 1. Yes\n  2. No, and tell Claude what to do differently\n";
        assert_eq!(
            detect_interactive_prompt(tail),
            Some(UiDiffEvent::PermissionRequested { description: "Do you want to proceed?".to_string() })
        );
    }

    #[test]
    fn detect_interactive_prompt_finds_free_form_question() {
        let tail = "Which approach should I take?\n❯ 1. Rewrite the parser\n  2. Patch the existing one\n  3. Ask for more context\n";
        assert_eq!(
            detect_interactive_prompt(tail),
            Some(UiDiffEvent::QuestionAsked {
                question: "Which approach should I take?".to_string(),
                options: vec![
                    "Rewrite the parser".to_string(),
                    "Patch the existing one".to_string(),
                    "Ask for more context".to_string(),
                ],
            })
        );
    }

    #[test]
    fn detect_interactive_prompt_ignores_plain_text() {
        assert_eq!(detect_interactive_prompt("just some output\nwith a question?\nand more output\n"), None);
    }
}
