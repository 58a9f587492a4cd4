//! Agent configuration, lifecycle, and activity state.

use crate::ids::{AgentId, ContainerId};
use serde::{Deserialize, Serialize};

/// Static configuration an agent is created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub system_prompt: String,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

/// Coarse lifecycle of an agent.
///
/// `Running` and `Stopped` alternate freely; `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Running,
    Stopped,
    Destroyed,
}

/// What an agent is doing right now, derived from the most recent
/// backend stream event. Reset to `Idle` on `message_stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentActivity {
    Idle,
    Thinking,
    Responding,
    AwaitingToolResult,
}

/// Wire-serializable projection of an agent, used in mirror responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: AgentId,
    pub container_id: ContainerId,
    pub name: String,
    pub lifecycle: Lifecycle,
    pub activity: AgentActivity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_snake_case_tags() {
        assert_eq!(
            serde_json::to_string(&Lifecycle::Destroyed).unwrap(),
            "\"destroyed\""
        );
        assert_eq!(
            serde_json::to_string(&AgentActivity::AwaitingToolResult).unwrap(),
            "\"awaiting_tool_result\""
        );
    }

    #[test]
    fn descriptor_serde_roundtrip() {
        let descriptor = AgentDescriptor {
            agent_id: AgentId::from_string("a1"),
            container_id: ContainerId::from_string("c1"),
            name: "helper".into(),
            lifecycle: Lifecycle::Running,
            activity: AgentActivity::Idle,
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: AgentDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }
}
