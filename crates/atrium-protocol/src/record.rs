//! Persisted records: container manifests, session snapshots, and agent images.

use crate::ids::{AgentId, ContainerId, ImageId, SessionId};
use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lightweight persisted record of a container.
///
/// Disposal destroys the container's agents but retains this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container_id: ContainerId,
    pub created_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn new(container_id: ContainerId) -> Self {
        Self {
            container_id,
            created_at: Utc::now(),
        }
    }
}

/// Persisted snapshot of a session's message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub container_id: ContainerId,
    pub messages: Vec<Message>,
}

/// Immutable snapshot of an agent's configuration and message history.
///
/// Created by an explicit snapshot of a live agent; `resume` spawns a
/// brand-new agent in the originating container pre-loaded with
/// `messages`. The snapshot is copied at the instant of capture, so later
/// agent activity never leaks into an existing image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentImage {
    pub image_id: ImageId,
    pub container_id: ContainerId,
    pub agent_id: AgentId,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_image_id: Option<ImageId>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn image_serde_roundtrip() {
        let image = AgentImage {
            image_id: ImageId::from_string("img-1"),
            container_id: ContainerId::from_string("c1"),
            agent_id: AgentId::from_string("a1"),
            name: "helper".into(),
            description: "baseline".into(),
            system_prompt: "be useful".into(),
            messages: vec![Message::user("hi"), Message::assistant("hello")],
            parent_image_id: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&image).unwrap();
        assert!(!json.contains("parent_image_id"));
        let back: AgentImage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.messages.len(), 2);
        assert_eq!(back.messages[1].role, Role::Assistant);
    }
}
