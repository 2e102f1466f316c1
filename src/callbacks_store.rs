//! `<logDir>/state/callbacks.json` persistence (§6.3): project- and
//! agent-level webhook routing records survive a restart independently of
//! the in-memory agent table.
//!
//! Grounded on `src/rest/server.rs`'s `write_session_file` (create the
//! parent directory before writing, restrictive permissions) generalized
//! into a write-temp-then-rename so a crash mid-write never leaves a
//! truncated file behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::AgentCallback;

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallbacksFile {
    pub version: u32,
    #[serde(default)]
    pub projects: HashMap<String, AgentCallback>,
    #[serde(default)]
    pub agents: HashMap<String, AgentCallback>,
}

impl CallbacksFile {
    fn new() -> Self {
        Self { version: CURRENT_VERSION, projects: HashMap::new(), agents: HashMap::new() }
    }
}

/// `"<project>:<agentId>"` key used in the `agents` map.
pub fn agent_key(project: &str, agent_id: &str) -> String {
    format!("{project}:{agent_id}")
}

pub struct CallbacksStore {
    path: PathBuf,
}

impl CallbacksStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<CallbacksFile> {
        if !self.path.exists() {
            return Ok(CallbacksFile::new());
        }
        let raw = std::fs::read_to_string(&self.path).with_context(|| format!("reading {}", self.path.display()))?;
        let file: CallbacksFile = serde_json::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(file)
    }

    pub fn save(&self, file: &CallbacksFile) -> Result<()> {
        write_atomic(&self.path, file)
    }

    pub fn set_project_callback(&self, project: &str, callback: Option<AgentCallback>) -> Result<()> {
        let mut file = self.load()?;
        match callback {
            Some(cb) => {
                file.projects.insert(project.to_string(), cb);
            }
            None => {
                file.projects.remove(project);
            }
        }
        self.save(&file)
    }

    pub fn set_agent_callback(&self, project: &str, agent_id: &str, callback: Option<AgentCallback>) -> Result<()> {
        let mut file = self.load()?;
        let key = agent_key(project, agent_id);
        match callback {
            Some(cb) => {
                file.agents.insert(key, cb);
            }
            None => {
                file.agents.remove(&key);
            }
        }
        self.save(&file)
    }

    pub fn remove_project(&self, project: &str) -> Result<()> {
        let mut file = self.load()?;
        file.projects.remove(project);
        let prefix = format!("{project}:");
        file.agents.retain(|k, _| !k.starts_with(&prefix));
        self.save(&file)
    }

    pub fn remove_agent(&self, project: &str, agent_id: &str) -> Result<()> {
        let mut file = self.load()?;
        file.agents.remove(&agent_key(project, agent_id));
        self.save(&file)
    }
}

#[cfg(unix)]
fn set_restrictive_perms(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_restrictive_perms(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn write_atomic(path: &Path, file: &CallbacksFile) -> Result<()> {
    let parent = path.parent().context("callbacks path has no parent directory")?;
    std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    set_restrictive_perms(parent, 0o700)?;

    let tmp_path = parent.join(format!(".callbacks.json.{}.tmp", std::process::id()));
    let body = serde_json::to_string_pretty(file)?;
    std::fs::write(&tmp_path, body).with_context(|| format!("writing {}", tmp_path.display()))?;
    set_restrictive_perms(&tmp_path, 0o600)?;
    std::fs::rename(&tmp_path, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_project_and_agent_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let store = CallbacksStore::new(dir.path().join("state/callbacks.json"));

        let cb = AgentCallback { url: "https://x/hook".into(), token: Some("t".into()), discord_channel: None, session_key: None, extra: None };
        store.set_project_callback("p1", Some(cb.clone())).unwrap();
        store.set_agent_callback("p1", "codex-a", Some(cb.clone())).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.projects.get("p1").unwrap().url, cb.url);
        assert_eq!(loaded.agents.get("p1:codex-a").unwrap().url, cb.url);
    }

    #[test]
    fn remove_project_drops_its_agent_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = CallbacksStore::new(dir.path().join("state/callbacks.json"));
        let cb = AgentCallback { url: "https://x/hook".into(), token: None, discord_channel: None, session_key: None, extra: None };
        store.set_project_callback("p1", Some(cb.clone())).unwrap();
        store.set_agent_callback("p1", "codex-a", Some(cb)).unwrap();

        store.remove_project("p1").unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.projects.is_empty());
        assert!(loaded.agents.is_empty());
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = CallbacksStore::new(dir.path().join("nope/callbacks.json"));
        let loaded = store.load().unwrap();
        assert_eq!(loaded.version, 1);
        assert!(loaded.projects.is_empty());
    }
}
