//! The Poller loop (§4.2): a single process-wide tick over every live agent,
//! plus the pure capture differ (§4.2.1) and status deriver (§4.3).
//!
//! Grounded on `src/agents/monitor.rs`'s periodic tick-over-all-sessions
//! loop shape (interval timer, per-item best-effort work, no single failure
//! aborting the cycle), adapted to a richer per-agent signal set: pane diff,
//! pane liveness, and an incremental provider-journal cursor feeding the
//! status deriver's priority chain.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::debug::DebugTracker;
use crate::ids::{AgentId, ProjectName};
use crate::manager::Manager;
use crate::model::{Agent, AgentStatus};
use crate::providers::{self, BuildContext, JournalCursor};

const STARTING_TO_PROCESSING_WINDOW_MS: i64 = 2_000;
const PROCESSING_TO_IDLE_QUIET_MS: i64 = 4_000;
const SHELL_COMMANDS: &[&str] = &["bash", "zsh", "sh", "fish"];

pub struct Poller {
    manager: Arc<Manager>,
    debug: Arc<DebugTracker>,
}

impl Poller {
    pub fn new(manager: Arc<Manager>, debug: Arc<DebugTracker>) -> Arc<Self> {
        Arc::new(Self { manager, debug })
    }

    /// Runs the process-wide tick loop until `cancel` fires (§5, §9:
    /// graceful shutdown of independent long-lived tasks).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval_ms = self.manager.config().poller.poll_interval_ms;
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let keys = self.manager.live_agent_keys().await;
        for (project, agent_id) in keys {
            self.poll_one(&project, &agent_id).await;
        }
    }

    async fn poll_one(&self, project: &ProjectName, agent_id: &AgentId) {
        let Some((agent, mut cursor, last_snapshot, last_diff_at, _status_since)) =
            self.manager.snapshot_for_poll(project, agent_id).await
        else {
            return;
        };
        self.debug.record_poll_tick(project, agent_id);

        let current = match self.manager.tmux().capture_pane(&agent.tmux_target, self.manager.config().poller.capture_lines) {
            Ok(text) => text,
            Err(err) => {
                self.debug.record_capture_failure(project, agent_id, &err.to_string());
                warn!(agent_id = %agent_id, error = %err, "poller: capture_pane failed, skipping this tick");
                return;
            }
        };
        let diff = capture_diff(&last_snapshot, &current);
        let had_diff = !diff.is_empty();

        let pane_info = self.manager.tmux().pane_info(&agent.tmux_target).ok();
        let pane_dead = pane_info.as_ref().map(|p| p.dead).unwrap_or(false);
        let pane_is_shell = pane_info
            .as_ref()
            .map(|p| SHELL_COMMANDS.contains(&p.current_command.as_str()))
            .unwrap_or(true);

        let Some(provider) = providers::by_name(&agent.provider) else {
            warn!(agent_id = %agent_id, provider = %agent.provider, "poller: unknown provider, skipping");
            return;
        };

        let journal_status = if pane_dead {
            None
        } else {
            self.feed_journal(&agent, provider.as_ref(), &mut cursor, project, agent_id)
        };

        let now = chrono::Utc::now();
        let ms_since_last_diff = last_diff_at.map(|t| (now - t).num_milliseconds());

        let (status, source) = derive_status(DeriveInput {
            pane_dead,
            journal_status,
            journal_source: journal_source_for(agent.provider.as_str()),
            ui_heuristic_enabled: provider.ui_heuristic_enabled(),
            ui_status: if pane_dead { None } else { provider.parse_ui_status(&current) },
            current_status: agent.status,
            had_diff,
            pane_is_shell,
            ms_since_last_diff,
        });

        let brief_append = if had_diff && status == AgentStatus::Idle && !diff.trim().is_empty() {
            diff.lines().find(|l| !l.trim().is_empty()).map(str::to_string)
        } else {
            None
        };
        let ui_diff_event = if had_diff { provider.parse_output_diff(&diff) } else { None };

        self.manager
            .apply_poll_result(project, agent_id, current, cursor, Some(status), source, brief_append, had_diff)
            .await;

        if had_diff {
            if let Some(event) = ui_diff_event {
                self.manager.emit_ui_diff_event(project, agent_id, event);
            }
            self.manager.emit_output(project, agent_id, diff).await;
        }
    }

    /// Resolve (and, for codex, permanently pin) the journal path, then feed
    /// newly-appended bytes through the provider's incremental parser.
    fn feed_journal(
        &self,
        agent: &Agent,
        provider: &dyn providers::Provider,
        cursor: &mut JournalCursor,
        project: &ProjectName,
        agent_id: &AgentId,
    ) -> Option<AgentStatus> {
        if cursor.session_file.is_none() {
            cursor.session_file = self.resolve_journal_path(agent, provider);
        }
        let path = cursor.session_file.clone()?;

        let new_bytes = read_new_bytes(&path, &mut cursor.offset)?;
        if new_bytes.is_empty() {
            return cursor.last_status;
        }
        let tick = provider.parse_status(cursor, &new_bytes);
        self.debug.record_parse_errors(project, agent_id, tick.parse_errors);
        for event in tick.events {
            self.manager.emit_journal_event(project, agent_id, event);
        }
        tick.status
    }

    fn resolve_journal_path(&self, agent: &Agent, provider: &dyn providers::Provider) -> Option<PathBuf> {
        if let Some(existing) = &agent.provider_session_file {
            return Some(PathBuf::from(existing));
        }
        let runtime_dir = agent.provider_runtime_dir.as_ref().map(PathBuf::from);
        let home_dir = dirs::home_dir();
        let ctx = BuildContext {
            agent_id: agent.id.as_str(),
            task: "",
            model: None,
            cwd: "",
            runtime_dir: runtime_dir.as_ref(),
            home_dir: home_dir.as_ref(),
            subscription: None,
        };
        provider.locate_journal(&ctx)
    }
}

fn journal_source_for(provider: &str) -> &'static str {
    match provider {
        "codex" => "internals_codex_jsonl",
        "claude-code" => "internals_claude_jsonl",
        "pi" => "internals_pi_jsonl",
        "opencode" => "internals_opencode_storage",
        _ => "internals_unknown",
    }
}

/// Read bytes appended to `path` since `*offset`, advancing `*offset` to the
/// file's new length. Returns `None` if the file can't be read (not yet
/// created, permissions); resets `*offset` to 0 if the file shrank
/// (rotated/truncated).
fn read_new_bytes(path: &Path, offset: &mut u64) -> Option<String> {
    let metadata = std::fs::metadata(path).ok()?;
    let len = metadata.len();
    if len < *offset {
        *offset = 0;
    }
    if len == *offset {
        return Some(String::new());
    }
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path).ok()?;
    file.seek(SeekFrom::Start(*offset)).ok()?;
    let mut buf = Vec::with_capacity((len - *offset) as usize);
    file.read_to_end(&mut buf).ok()?;
    *offset = len;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Step 2 of §4.2.1's differ: last <=10 lines of `previous` as a tail match
/// anchor.
const TAIL_ANCHOR_LINES: usize = 10;

/// The capture differ (§4.2.1): given the previous and current pane
/// snapshots, return the text that appeared since `previous`.
pub fn capture_diff(previous: &str, current: &str) -> String {
    if previous.is_empty() {
        return current.to_string();
    }
    if previous == current {
        return String::new();
    }

    let prev_lines: Vec<&str> = previous.split('\n').collect();
    let cur_lines: Vec<&str> = current.split('\n').collect();

    let tail_start = prev_lines.len().saturating_sub(TAIL_ANCHOR_LINES);
    let tail = &prev_lines[tail_start..];
    if !tail.is_empty() {
        if let Some(match_end) = find_subsequence(&cur_lines, tail) {
            if match_end < cur_lines.len() {
                return cur_lines[match_end..].join("\n");
            }
            return String::new();
        }
    }

    if let Some(last_nonblank) = prev_lines.iter().rev().find(|l| !l.trim().is_empty()) {
        if let Some(pos) = cur_lines.iter().position(|l| l == last_nonblank) {
            let after = pos + 1;
            if after < cur_lines.len() {
                return cur_lines[after..].join("\n");
            }
            return String::new();
        }
    }

    if cur_lines.len() > prev_lines.len() {
        let excess = cur_lines.len() - prev_lines.len();
        return cur_lines[cur_lines.len() - excess..].join("\n");
    }

    String::new()
}

/// Find the end index (exclusive) of the first occurrence of `needle` as a
/// contiguous subsequence of `haystack`.
fn find_subsequence(haystack: &[&str], needle: &[&str]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    for start in 0..=(haystack.len() - needle.len()) {
        if &haystack[start..start + needle.len()] == needle {
            return Some(start + needle.len());
        }
    }
    None
}

struct DeriveInput {
    pane_dead: bool,
    journal_status: Option<AgentStatus>,
    journal_source: &'static str,
    ui_heuristic_enabled: bool,
    ui_status: Option<AgentStatus>,
    current_status: AgentStatus,
    had_diff: bool,
    pane_is_shell: bool,
    /// Milliseconds since the agent's last non-empty diff, or `None` if
    /// none has been observed yet.
    ms_since_last_diff: Option<i64>,
}

/// §4.3's priority chain plus overrides. Returns `(status, source)`.
fn derive_status(input: DeriveInput) -> (AgentStatus, &'static str) {
    if input.pane_dead {
        return (AgentStatus::Exited, "pane_dead");
    }
    let (mut status, mut source) = if let Some(s) = input.journal_status {
        (s, input.journal_source)
    } else if input.ui_heuristic_enabled {
        if let Some(s) = input.ui_status {
            (s, "ui_parser")
        } else {
            (input.current_status, "unchanged")
        }
    } else {
        (input.current_status, "unchanged")
    };

    let diff_is_fresh = input.had_diff || input.ms_since_last_diff.map(|ms| ms <= STARTING_TO_PROCESSING_WINDOW_MS).unwrap_or(false);
    let diff_is_quiet = !input.had_diff && input.ms_since_last_diff.map(|ms| ms >= PROCESSING_TO_IDLE_QUIET_MS).unwrap_or(true);

    if input.current_status == AgentStatus::Starting && status == AgentStatus::Starting && diff_is_fresh {
        status = AgentStatus::Processing;
        source = "override_starting_to_processing";
    }
    if input.current_status == AgentStatus::Processing && status == AgentStatus::Processing && !input.pane_is_shell && diff_is_quiet {
        status = AgentStatus::Idle;
        source = "override_processing_to_idle";
    }
    if matches!(input.current_status, AgentStatus::Idle | AgentStatus::WaitingInput | AgentStatus::Error)
        && status == AgentStatus::Starting
    {
        status = input.current_status;
        source = "no_regress_to_starting";
    }

    (status, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        assert_eq!(capture_diff("a\nb\nc", "a\nb\nc"), "");
    }

    #[test]
    fn diff_from_empty_previous_returns_all_current() {
        assert_eq!(capture_diff("", "hello\nworld"), "hello\nworld");
    }

    #[test]
    fn diff_returns_appended_suffix() {
        let prev = "line1\nline2\nline3";
        let cur = "line1\nline2\nline3\nline4\nline5";
        assert_eq!(capture_diff(prev, cur), "line4\nline5");
    }

    #[test]
    fn diff_withstands_scrollback_shift() {
        let prev = "a\nb\nc\nd";
        let cur = "b\nc\nd\ne\nf";
        assert_eq!(capture_diff(prev, cur), "e\nf");
    }

    #[test]
    fn diff_falls_back_to_last_nonblank_line_match() {
        let prev = "x\ny\n\n";
        let cur = "w\nx\ny\nz";
        assert_eq!(capture_diff(prev, cur), "z");
    }

    #[test]
    fn diff_returns_empty_when_current_is_shorter() {
        let prev = "a\nb\nc\nd\ne\nf\ng\nh\ni\nj\nk";
        let cur = "z";
        assert_eq!(capture_diff(prev, cur), "");
    }

    #[test]
    fn derive_status_pane_dead_always_wins() {
        let (status, source) = derive_status(
            DeriveInput {
                pane_dead: true,
                journal_status: Some(AgentStatus::Processing),
                journal_source: "internals_codex_jsonl",
                ui_heuristic_enabled: true,
                ui_status: None,
                current_status: AgentStatus::Processing,
                had_diff: true,
                pane_is_shell: false,
                ms_since_last_diff: None,
            },
        );
        assert_eq!(status, AgentStatus::Exited);
        assert_eq!(source, "pane_dead");
    }

    #[test]
    fn derive_status_starting_to_processing_on_fresh_diff() {
        let (status, source) = derive_status(
            DeriveInput {
                pane_dead: false,
                journal_status: None,
                journal_source: "internals_pi_jsonl",
                ui_heuristic_enabled: false,
                ui_status: None,
                current_status: AgentStatus::Starting,
                had_diff: true,
                pane_is_shell: false,
                ms_since_last_diff: None,
            },
        );
        assert_eq!(status, AgentStatus::Processing);
        assert_eq!(source, "override_starting_to_processing");
    }

    #[test]
    fn derive_status_never_regresses_idle_to_starting() {
        let (status, source) = derive_status(
            DeriveInput {
                pane_dead: false,
                journal_status: None,
                journal_source: "internals_pi_jsonl",
                ui_heuristic_enabled: true,
                ui_status: Some(AgentStatus::Starting),
                current_status: AgentStatus::Idle,
                had_diff: false,
                pane_is_shell: true,
                ms_since_last_diff: None,
            },
        );
        assert_eq!(status, AgentStatus::Idle);
        assert_eq!(source, "no_regress_to_starting");
    }

    #[test]
    fn derive_status_processing_to_idle_when_quiet_and_not_shell() {
        let (status, source) = derive_status(
            DeriveInput {
                pane_dead: false,
                journal_status: None,
                journal_source: "internals_pi_jsonl",
                ui_heuristic_enabled: false,
                ui_status: None,
                current_status: AgentStatus::Processing,
                had_diff: false,
                pane_is_shell: false,
                ms_since_last_diff: None,
            },
        );
        assert_eq!(status, AgentStatus::Idle);
        assert_eq!(source, "override_processing_to_idle");
    }
}
