//! Remote runner registrations.

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Secret an agent presents on every runner call after registering.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RunnerToken(pub String);

impl RunnerToken {
    pub fn generate() -> Self {
        Self(format!("vrt-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunnerToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Debug for RunnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RunnerToken(..)")
    }
}

/// A registered remote runner.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Agent {
    pub id: AgentId,

    /// Display name, unique among registered agents
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub runner_token: RunnerToken,

    /// Registration token the agent authenticated with
    pub registration_token: String,

    pub last_seen_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        registration_token: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: name.into(),
            description,
            runner_token: RunnerToken::generate(),
            registration_token: registration_token.into(),
            last_seen_at: now,
            created_at: now,
        }
    }

    /// An agent that has not been seen within `expiry` is considered gone.
    pub fn is_expired(&self, expiry: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_seen_at > expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_expiry() {
        let mut agent = Agent::new("runner-1", None, "reg");
        let now = Utc::now();
        assert!(!agent.is_expired(Duration::minutes(5), now));

        agent.last_seen_at = now - Duration::minutes(6);
        assert!(agent.is_expired(Duration::minutes(5), now));
    }

    #[test]
    fn test_runner_tokens_are_unique() {
        let a = Agent::new("a", None, "reg");
        let b = Agent::new("b", None, "reg");
        assert_ne!(a.runner_token, b.runner_token);
        assert_ne!(a.id, b.id);
    }
}
