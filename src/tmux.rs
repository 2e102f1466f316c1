#![allow(dead_code)]

//! Multiplexer subprocess contract (§6.2).
//!
//! Trait-based abstraction over tmux so the Session Manager and Poller can be
//! unit tested without a real tmux binary. Generalized from a
//! session-per-ticket model to session-per-project + window-per-agent:
//! targets are `"<session>:<window>"` throughout.

use std::collections::HashMap;
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TmuxError {
    #[error("tmux is not installed or not in PATH")]
    NotInstalled,
    #[error("tmux version {0} is below minimum required version {1}")]
    VersionTooOld(String, String),
    #[error("session '{0}' already exists")]
    SessionExists(String),
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("window '{0}' not found")]
    WindowNotFound(String),
    #[error("failed to create session '{0}': {1}")]
    SessionCreationFailed(String, String),
    #[error("failed to create window '{0}': {1}")]
    WindowCreationFailed(String, String),
    #[error("failed to send keys to '{0}': {1}")]
    SendKeysFailed(String, String),
    #[error("failed to set buffer '{0}': {1}")]
    SetBufferFailed(String, String),
    #[error("failed to paste buffer '{0}' to '{1}': {2}")]
    PasteBufferFailed(String, String, String),
    #[error("failed to delete buffer '{0}': {1}")]
    DeleteBufferFailed(String, String),
    #[error("tmux command failed: {0}")]
    CommandFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TmuxVersion {
    pub major: u32,
    pub minor: u32,
    pub raw: String,
}

impl TmuxVersion {
    pub fn parse(version_str: &str) -> Option<Self> {
        let parts: Vec<&str> = version_str.split_whitespace().collect();
        if parts.len() < 2 {
            return None;
        }
        let version_part = parts[1];
        let numeric_part: String = version_part
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut version_nums = numeric_part.split('.');
        let major: u32 = version_nums.next()?.parse().ok()?;
        let minor: u32 = version_nums.next().unwrap_or("0").parse().unwrap_or(0);
        Some(Self { major, minor, raw: version_str.to_string() })
    }

    pub fn meets_minimum(&self, min_major: u32, min_minor: u32) -> bool {
        self.major > min_major || (self.major == min_major && self.minor >= min_minor)
    }
}

#[derive(Debug, Clone)]
pub struct TmuxSession {
    pub name: String,
    pub created: Option<String>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TmuxWindow {
    pub name: String,
    pub index: String,
}

/// `display-message -p "#{pane_dead}|#{pane_current_command}|#{pane_start_command}|#{pane_id}|#{pane_pid}"`
#[derive(Debug, Clone, Default)]
pub struct PaneInfo {
    pub dead: bool,
    pub current_command: String,
    pub start_command: String,
    pub pane_id: String,
    pub pane_pid: String,
}

impl PaneInfo {
    fn parse(raw: &str) -> Self {
        let mut parts = raw.trim_end().splitn(5, '|');
        let dead = parts.next().unwrap_or("0") == "1";
        let current_command = parts.next().unwrap_or("").to_string();
        let start_command = parts.next().unwrap_or("").to_string();
        let pane_id = parts.next().unwrap_or("").to_string();
        let pane_pid = parts.next().unwrap_or("").to_string();
        Self { dead, current_command, start_command, pane_id, pane_pid }
    }
}

/// Threshold in bytes for switching from send_keys to buffer method.
const SEND_KEYS_THRESHOLD: usize = 2000;

pub trait TmuxClient: Send + Sync {
    fn check_available(&self) -> Result<TmuxVersion, TmuxError>;
    fn session_exists(&self, name: &str) -> Result<bool, TmuxError>;
    fn list_sessions(&self, prefix: Option<&str>) -> Result<Vec<TmuxSession>, TmuxError>;
    fn list_windows(&self, session: &str) -> Result<Vec<TmuxWindow>, TmuxError>;

    /// `new-session -s <name> -c <cwd>`, followed by disabling auto/allow-rename.
    fn new_session(&self, name: &str, cwd: &str) -> Result<(), TmuxError>;
    fn kill_session(&self, name: &str) -> Result<(), TmuxError>;

    /// `new-window -t <sess> -n <win> -c <cwd> -- <cmd>...` with env applied
    /// via `set-environment` before spawn.
    fn new_window(
        &self,
        session: &str,
        window: &str,
        cwd: &str,
        cmd: &[String],
        env: &HashMap<String, String>,
        unset_env: &[String],
    ) -> Result<(), TmuxError>;
    fn kill_window(&self, target: &str) -> Result<(), TmuxError>;

    fn send_keys(&self, target: &str, keys: &str, press_enter: bool) -> Result<(), TmuxError>;
    /// Sends one of the named special keys (`Enter`, `Escape`, `C-c`) alone.
    fn send_special_key(&self, target: &str, key: &str) -> Result<(), TmuxError>;

    fn capture_pane(&self, target: &str, lines: u32) -> Result<String, TmuxError>;
    fn pane_info(&self, target: &str) -> Result<PaneInfo, TmuxError>;

    fn set_buffer(&self, buffer_name: &str, content: &str) -> Result<(), TmuxError>;
    fn paste_buffer(&self, buffer_name: &str, target: &str) -> Result<(), TmuxError>;
    fn delete_buffer(&self, buffer_name: &str) -> Result<(), TmuxError>;

    /// `set-buffer` -> `paste-buffer` -> `delete-buffer`, without pressing Enter.
    /// Callers control the Enter keystroke separately to honor the
    /// paste-enter race timing contract in §4.1.
    fn paste_text(&self, target: &str, buffer_name: &str, text: &str) -> Result<(), TmuxError> {
        self.set_buffer(buffer_name, text)?;
        let result = self.paste_buffer(buffer_name, target);
        let _ = self.delete_buffer(buffer_name);
        result
    }

    /// Sends `keys` pressing Enter if requested; uses the buffer method
    /// automatically for payloads over [`SEND_KEYS_THRESHOLD`] bytes.
    fn send_keys_safe(&self, target: &str, keys: &str, press_enter: bool) -> Result<(), TmuxError> {
        if keys.len() > SEND_KEYS_THRESHOLD {
            let buffer_name = format!("harness-{}", target.replace([':', '.'], "-"));
            self.paste_text(target, &buffer_name, keys)?;
            if press_enter {
                self.send_special_key(target, "Enter")?;
            }
            Ok(())
        } else {
            self.send_keys(target, keys, press_enter)
        }
    }
}

pub struct SystemTmuxClient {
    socket_name: Option<String>,
}

pub const HARNESS_SOCKET: &str = "agent-harness";

impl SystemTmuxClient {
    pub fn new() -> Self {
        Self { socket_name: None }
    }

    pub fn with_dedicated_socket() -> Self {
        Self { socket_name: Some(HARNESS_SOCKET.to_string()) }
    }

    fn run(&self, args: &[&str]) -> Result<Output, TmuxError> {
        let mut cmd = Command::new("tmux");
        if let Some(ref socket) = self.socket_name {
            cmd.arg("-L").arg(socket);
        }
        cmd.args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TmuxError::NotInstalled
            } else {
                TmuxError::CommandFailed(e.to_string())
            }
        })
    }
}

impl Default for SystemTmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxClient for SystemTmuxClient {
    fn check_available(&self) -> Result<TmuxVersion, TmuxError> {
        let output = self.run(&["-V"])?;
        if !output.status.success() {
            return Err(TmuxError::NotInstalled);
        }
        let version_str = String::from_utf8_lossy(&output.stdout);
        TmuxVersion::parse(version_str.trim())
            .ok_or_else(|| TmuxError::CommandFailed(format!("could not parse version: {version_str}")))
    }

    fn session_exists(&self, name: &str) -> Result<bool, TmuxError> {
        match self.run(&["has-session", "-t", &format!("={name}")]) {
            Ok(out) => Ok(out.status.success()),
            Err(TmuxError::NotInstalled) => Err(TmuxError::NotInstalled),
            Err(_) => Ok(false),
        }
    }

    fn list_sessions(&self, prefix: Option<&str>) -> Result<Vec<TmuxSession>, TmuxError> {
        let output = self.run(&["list-sessions", "-F", "#{session_name}\t#{session_created}\t#{pane_current_path}"]);
        match output {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                Ok(stdout
                    .lines()
                    .filter_map(|line| {
                        let parts: Vec<&str> = line.split('\t').collect();
                        let name = parts.first()?.to_string();
                        if let Some(p) = prefix {
                            if !name.starts_with(p) {
                                return None;
                            }
                        }
                        Some(TmuxSession {
                            name,
                            created: parts.get(1).map(|s| s.to_string()),
                            cwd: parts.get(2).map(|s| s.to_string()),
                        })
                    })
                    .collect())
            }
            Ok(_) => Ok(Vec::new()),
            Err(TmuxError::NotInstalled) => Err(TmuxError::NotInstalled),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn list_windows(&self, session: &str) -> Result<Vec<TmuxWindow>, TmuxError> {
        let output = self.run(&["list-windows", "-t", session, "-F", "#{window_name}\t#{window_index}"])?;
        if !output.status.success() {
            return Err(TmuxError::SessionNotFound(session.to_string()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(2, '\t');
                let name = parts.next()?.to_string();
                let index = parts.next().unwrap_or("0").to_string();
                Some(TmuxWindow { name, index })
            })
            .collect())
    }

    fn new_session(&self, name: &str, cwd: &str) -> Result<(), TmuxError> {
        if self.session_exists(name)? {
            return Err(TmuxError::SessionExists(name.to_string()));
        }
        let output = self.run(&["new-session", "-d", "-s", name, "-c", cwd])?;
        if !output.status.success() {
            return Err(TmuxError::SessionCreationFailed(
                name.to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        // Critical: auto-rename changes session:window targets mid-flight.
        let _ = self.run(&["set-option", "-t", name, "allow-rename", "off"]);
        let _ = self.run(&["set-option", "-t", name, "automatic-rename", "off"]);
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        let output = self.run(&["kill-session", "-t", name])?;
        if !output.status.success() {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    fn new_window(
        &self,
        session: &str,
        window: &str,
        cwd: &str,
        cmd: &[String],
        env: &HashMap<String, String>,
        unset_env: &[String],
    ) -> Result<(), TmuxError> {
        for (k, v) in env {
            let _ = self.run(&["set-environment", "-t", session, k, v]);
        }
        for k in unset_env {
            let _ = self.run(&["set-environment", "-t", session, "-u", k]);
        }
        let mut args: Vec<&str> = vec!["new-window", "-t", session, "-n", window, "-c", cwd, "--"];
        let cmd_strs: Vec<&str> = cmd.iter().map(String::as_str).collect();
        args.extend(cmd_strs);
        let output = self.run(&args)?;
        if !output.status.success() {
            return Err(TmuxError::WindowCreationFailed(
                window.to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    fn kill_window(&self, target: &str) -> Result<(), TmuxError> {
        let output = self.run(&["kill-window", "-t", target])?;
        if !output.status.success() {
            return Err(TmuxError::WindowNotFound(target.to_string()));
        }
        Ok(())
    }

    fn send_keys(&self, target: &str, keys: &str, press_enter: bool) -> Result<(), TmuxError> {
        let mut args = vec!["send-keys", "-t", target, keys];
        if press_enter {
            args.push("Enter");
        }
        let output = self.run(&args)?;
        if !output.status.success() {
            return Err(TmuxError::SendKeysFailed(
                target.to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    fn send_special_key(&self, target: &str, key: &str) -> Result<(), TmuxError> {
        let output = self.run(&["send-keys", "-t", target, key])?;
        if !output.status.success() {
            return Err(TmuxError::SendKeysFailed(
                target.to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    fn capture_pane(&self, target: &str, lines: u32) -> Result<String, TmuxError> {
        let start = format!("-{lines}");
        let output = self.run(&["capture-pane", "-p", "-t", target, "-S", &start])?;
        if !output.status.success() {
            return Err(TmuxError::WindowNotFound(target.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn pane_info(&self, target: &str) -> Result<PaneInfo, TmuxError> {
        let output = self.run(&[
            "display-message",
            "-t",
            target,
            "-p",
            "#{pane_dead}|#{pane_current_command}|#{pane_start_command}|#{pane_id}|#{pane_pid}",
        ])?;
        if !output.status.success() {
            return Err(TmuxError::WindowNotFound(target.to_string()));
        }
        Ok(PaneInfo::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    fn set_buffer(&self, buffer_name: &str, content: &str) -> Result<(), TmuxError> {
        let path = std::env::temp_dir().join(format!("{buffer_name}.txt"));
        std::fs::write(&path, content)
            .map_err(|e| TmuxError::SetBufferFailed(buffer_name.to_string(), e.to_string()))?;
        let output = self.run(&["load-buffer", "-b", buffer_name, path.to_str().unwrap_or_default()])?;
        let _ = std::fs::remove_file(&path);
        if !output.status.success() {
            return Err(TmuxError::SetBufferFailed(
                buffer_name.to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    fn paste_buffer(&self, buffer_name: &str, target: &str) -> Result<(), TmuxError> {
        let output = self.run(&["paste-buffer", "-b", buffer_name, "-t", target])?;
        if !output.status.success() {
            return Err(TmuxError::PasteBufferFailed(
                buffer_name.to_string(),
                target.to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    fn delete_buffer(&self, buffer_name: &str) -> Result<(), TmuxError> {
        let output = self.run(&["delete-buffer", "-b", buffer_name])?;
        if !output.status.success() {
            return Err(TmuxError::DeleteBufferFailed(
                buffer_name.to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }
}

/// In-memory fake for tests: records a command log, simulates sessions,
/// windows, and pane content.
#[derive(Clone)]
pub struct MockTmuxClient {
    pub inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
pub struct MockState {
    pub sessions: HashMap<String, String>, // name -> cwd
    pub windows: HashMap<String, Vec<String>>, // session -> window names
    pub panes: HashMap<String, String>, // "session:window" -> captured text
    pub pane_infos: HashMap<String, PaneInfo>,
    pub command_log: Vec<String>,
    pub fail_on: Vec<String>,
}

impl MockTmuxClient {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MockState::default())) }
    }

    pub fn set_pane_content(&self, target: &str, content: &str) {
        self.inner.lock().unwrap().panes.insert(target.to_string(), content.to_string());
    }

    pub fn set_pane_info(&self, target: &str, info: PaneInfo) {
        self.inner.lock().unwrap().pane_infos.insert(target.to_string(), info);
    }

    pub fn command_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().command_log.clone()
    }
}

impl Default for MockTmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxClient for MockTmuxClient {
    fn check_available(&self) -> Result<TmuxVersion, TmuxError> {
        Ok(TmuxVersion { major: 3, minor: 4, raw: "tmux 3.4".into() })
    }

    fn session_exists(&self, name: &str) -> Result<bool, TmuxError> {
        Ok(self.inner.lock().unwrap().sessions.contains_key(name))
    }

    fn list_sessions(&self, prefix: Option<&str>) -> Result<Vec<TmuxSession>, TmuxError> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .filter(|(name, _)| prefix.map(|p| name.starts_with(p)).unwrap_or(true))
            .map(|(name, cwd)| TmuxSession { name: name.clone(), created: None, cwd: Some(cwd.clone()) })
            .collect())
    }

    fn list_windows(&self, session: &str) -> Result<Vec<TmuxWindow>, TmuxError> {
        let state = self.inner.lock().unwrap();
        let windows = state
            .windows
            .get(session)
            .ok_or_else(|| TmuxError::SessionNotFound(session.to_string()))?;
        Ok(windows
            .iter()
            .enumerate()
            .map(|(i, name)| TmuxWindow { name: name.clone(), index: i.to_string() })
            .collect())
    }

    fn new_session(&self, name: &str, cwd: &str) -> Result<(), TmuxError> {
        let mut state = self.inner.lock().unwrap();
        state.command_log.push(format!("new-session {name} {cwd}"));
        if state.sessions.contains_key(name) {
            return Err(TmuxError::SessionExists(name.to_string()));
        }
        state.sessions.insert(name.to_string(), cwd.to_string());
        state.windows.insert(name.to_string(), Vec::new());
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        let mut state = self.inner.lock().unwrap();
        state.command_log.push(format!("kill-session {name}"));
        if state.sessions.remove(name).is_none() {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        state.windows.remove(name);
        Ok(())
    }

    fn new_window(
        &self,
        session: &str,
        window: &str,
        _cwd: &str,
        _cmd: &[String],
        _env: &HashMap<String, String>,
        _unset_env: &[String],
    ) -> Result<(), TmuxError> {
        let mut state = self.inner.lock().unwrap();
        state.command_log.push(format!("new-window {session} {window}"));
        let windows = state
            .windows
            .get_mut(session)
            .ok_or_else(|| TmuxError::SessionNotFound(session.to_string()))?;
        windows.push(window.to_string());
        Ok(())
    }

    fn kill_window(&self, target: &str) -> Result<(), TmuxError> {
        let mut state = self.inner.lock().unwrap();
        state.command_log.push(format!("kill-window {target}"));
        let Some((session, window)) = target.split_once(':') else {
            return Err(TmuxError::WindowNotFound(target.to_string()));
        };
        if let Some(windows) = state.windows.get_mut(session) {
            windows.retain(|w| w != window);
        }
        state.panes.remove(target);
        Ok(())
    }

    fn send_keys(&self, target: &str, keys: &str, press_enter: bool) -> Result<(), TmuxError> {
        self.inner
            .lock()
            .unwrap()
            .command_log
            .push(format!("send-keys {target} {keys:?} enter={press_enter}"));
        Ok(())
    }

    fn send_special_key(&self, target: &str, key: &str) -> Result<(), TmuxError> {
        self.inner.lock().unwrap().command_log.push(format!("send-keys {target} {key}"));
        Ok(())
    }

    fn capture_pane(&self, target: &str, _lines: u32) -> Result<String, TmuxError> {
        Ok(self.inner.lock().unwrap().panes.get(target).cloned().unwrap_or_default())
    }

    fn pane_info(&self, target: &str) -> Result<PaneInfo, TmuxError> {
        Ok(self.inner.lock().unwrap().pane_infos.get(target).cloned().unwrap_or_default())
    }

    fn set_buffer(&self, buffer_name: &str, content: &str) -> Result<(), TmuxError> {
        self.inner
            .lock()
            .unwrap()
            .command_log
            .push(format!("set-buffer {buffer_name} ({} bytes)", content.len()));
        Ok(())
    }

    fn paste_buffer(&self, buffer_name: &str, target: &str) -> Result<(), TmuxError> {
        self.inner.lock().unwrap().command_log.push(format!("paste-buffer {buffer_name} {target}"));
        Ok(())
    }

    fn delete_buffer(&self, buffer_name: &str) -> Result<(), TmuxError> {
        self.inner.lock().unwrap().command_log.push(format!("delete-buffer {buffer_name}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parse_and_minimum() {
        let v = TmuxVersion::parse("tmux 3.3a").unwrap();
        assert_eq!(v.major, 3);
        assert_eq!(v.minor, 3);
        assert!(v.meets_minimum(1, 8));
        assert!(!v.meets_minimum(3, 4));
    }

    #[test]
    fn pane_info_parses_pipe_format() {
        let info = PaneInfo::parse("1|bash|codex|%3|4242\n");
        assert!(info.dead);
        assert_eq!(info.current_command, "bash");
        assert_eq!(info.start_command, "codex");
        assert_eq!(info.pane_pid, "4242");
    }

    #[test]
    fn mock_new_window_requires_session() {
        let mock = MockTmuxClient::new();
        let err = mock
            .new_window("nope", "w1", "/tmp", &[], &HashMap::new(), &[])
            .unwrap_err();
        assert!(matches!(err, TmuxError::SessionNotFound(_)));
    }

    #[test]
    fn mock_window_lifecycle() {
        let mock = MockTmuxClient::new();
        mock.new_session("harness-p1", "/tmp/p1").unwrap();
        mock.new_window("harness-p1", "codex-a", "/tmp/p1", &[], &HashMap::new(), &[]).unwrap();
        let windows = mock.list_windows("harness-p1").unwrap();
        assert_eq!(windows.len(), 1);
        mock.kill_window("harness-p1:codex-a").unwrap();
        assert!(mock.list_windows("harness-p1").unwrap().is_empty());
    }

    #[test]
    fn send_keys_safe_uses_buffer_over_threshold() {
        let mock = MockTmuxClient::new();
        mock.new_session("harness-p1", "/tmp/p1").unwrap();
        mock.new_window("harness-p1", "codex-a", "/tmp/p1", &[], &HashMap::new(), &[]).unwrap();
        let long = "x".repeat(SEND_KEYS_THRESHOLD + 1);
        mock.send_keys_safe("harness-p1:codex-a", &long, true).unwrap();
        let log = mock.command_log();
        assert!(log.iter().any(|l| l.starts_with("set-buffer")));
        assert!(log.iter().any(|l| l.starts_with("paste-buffer")));
    }
}
