//! Append-only message history owned by one agent.

use atrium_protocol::{AgentId, ContainerId, Message, SessionId, SessionRecord};
use parking_lot::Mutex;

/// The ordered message history of one agent.
///
/// Mutated only by the owning agent's message loop; callers read copies.
pub struct RuntimeSession {
    session_id: SessionId,
    agent_id: AgentId,
    container_id: ContainerId,
    messages: Mutex<Vec<Message>>,
}

impl RuntimeSession {
    pub fn new(agent_id: AgentId, container_id: ContainerId) -> Self {
        Self::from_messages(agent_id, container_id, Vec::new())
    }

    /// A session pre-populated from an image snapshot.
    pub fn from_messages(
        agent_id: AgentId,
        container_id: ContainerId,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            session_id: SessionId::new_uuid(),
            agent_id,
            container_id,
            messages: Mutex::new(messages),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn append(&self, message: Message) {
        self.messages.lock().push(message);
    }

    /// Copy of the history at the instant of call.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    /// Persistable snapshot of the session.
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            agent_id: self.agent_id.clone(),
            container_id: self.container_id.clone(),
            messages: self.messages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_protocol::Role;

    #[test]
    fn history_is_append_only_and_copied_out() {
        let session = RuntimeSession::new(
            AgentId::from_string("a1"),
            ContainerId::from_string("c1"),
        );
        session.append(Message::user("hi"));
        let copy = session.messages();
        session.append(Message::assistant("hello"));

        // The earlier copy is unaffected by later appends.
        assert_eq!(copy.len(), 1);
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.messages()[1].role, Role::Assistant);
    }

    #[test]
    fn record_carries_ownership_ids() {
        let session = RuntimeSession::from_messages(
            AgentId::from_string("a1"),
            ContainerId::from_string("c1"),
            vec![Message::user("seed")],
        );
        let record = session.record();
        assert_eq!(record.agent_id, AgentId::from_string("a1"));
        assert_eq!(record.container_id, ContainerId::from_string("c1"));
        assert_eq!(record.messages.len(), 1);
    }
}
