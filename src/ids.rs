//! Identifier newtypes for projects, agents, and events.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Error, Debug)]
pub enum IdError {
    #[error("project name must be 1-64 chars of [A-Za-z0-9_-], got {0:?}")]
    InvalidProjectName(String),
    #[error("agent id must be 3-40 chars of [a-z0-9-], got {0:?}")]
    InvalidAgentId(String),
}

fn is_project_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_agent_char(c: char) -> bool {
    (c.is_ascii_lowercase() && c.is_ascii_alphanumeric()) || c.is_ascii_digit() || c == '-'
}

/// A validated project name: 1-64 chars of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ProjectName(String);

impl ProjectName {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        if raw.is_empty() || raw.chars().count() > 64 || !raw.chars().all(is_project_char) {
            return Err(IdError::InvalidProjectName(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated agent id: 3-40 chars of `[a-z0-9-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let len = raw.chars().count();
        if !(3..=40).contains(&len) || !raw.chars().all(is_agent_char) {
            return Err(IdError::InvalidAgentId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// English adjective/noun pools for auto-generated agent ids.
const ADJECTIVES: &[&str] = &[
    "swift", "calm", "bold", "quiet", "eager", "brisk", "keen", "lucid", "sturdy", "wry",
];
const NOUNS: &[&str] = &[
    "otter", "falcon", "maple", "comet", "badger", "delta", "heron", "ember", "quartz", "willow",
];

/// Generate `<provider-prefix>-<adjective>-<noun>` from a seed, retrying with a
/// numeric suffix on collision. `seed` should vary per call (e.g. a counter or
/// random source owned by the caller) since this module avoids `rand`/time.
pub fn generate_agent_id(provider_prefix: &str, seed: u64, existing: &[AgentId]) -> AgentId {
    let adj = ADJECTIVES[(seed as usize) % ADJECTIVES.len()];
    let noun = NOUNS[(seed as usize / ADJECTIVES.len()) % NOUNS.len()];
    let base = format!("{provider_prefix}-{adj}-{noun}");
    if !existing.iter().any(|e| e.as_str() == base) {
        return AgentId(base);
    }
    let mut n: u64 = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !existing.iter().any(|e| e.as_str() == candidate) {
            return AgentId(candidate);
        }
        n += 1;
    }
}

/// Monotonically increasing event id, formatted `evt-<N>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt-{}", self.0)
    }
}

impl EventId {
    /// Parse `evt-<N>` back into a numeric id, used for `since=` query parsing.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.strip_prefix("evt-")?.parse::<u64>().ok().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_accepts_valid() {
        assert!(ProjectName::parse("my_project-1").is_ok());
    }

    #[test]
    fn project_name_rejects_empty_and_long() {
        assert!(ProjectName::parse("").is_err());
        assert!(ProjectName::parse(&"a".repeat(65)).is_err());
    }

    #[test]
    fn project_name_rejects_bad_chars() {
        assert!(ProjectName::parse("has space").is_err());
        assert!(ProjectName::parse("has/slash").is_err());
    }

    #[test]
    fn agent_id_length_bounds() {
        assert!(AgentId::parse("ab").is_err());
        assert!(AgentId::parse(&"a".repeat(41)).is_err());
        assert!(AgentId::parse("abc").is_ok());
    }

    #[test]
    fn agent_id_rejects_uppercase() {
        assert!(AgentId::parse("Codex-Agent").is_err());
    }

    #[test]
    fn generated_id_avoids_collision() {
        let existing = vec![AgentId::parse("codex-swift-otter").unwrap()];
        let id = generate_agent_id("codex", 0, &existing);
        assert_ne!(id.as_str(), "codex-swift-otter");
    }

    #[test]
    fn event_id_roundtrip() {
        let id = EventId(42);
        assert_eq!(id.to_string(), "evt-42");
        assert_eq!(EventId::parse("evt-42"), Some(EventId(42)));
        assert_eq!(EventId::parse("bogus"), None);
    }
}
