//! A container: the unit of isolation that owns a set of live agents.

use std::path::PathBuf;
use std::sync::Arc;

use atrium_bus::{BusDriver, BusProducer};
use atrium_protocol::{
    AgentConfig, AgentId, ContainerId, ContainerRecord, EventContext, EventKind, ImageId, Message,
    Repository, RuntimeResult, SystemEvent,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::agent::RuntimeAgent;
use crate::sandbox::RuntimeSandbox;
use crate::session::RuntimeSession;

pub struct RuntimeContainer {
    container_id: ContainerId,
    created_at: DateTime<Utc>,
    root: PathBuf,
    producer: BusProducer,
    driver: BusDriver,
    repository: Arc<dyn Repository>,
    agents: Mutex<IndexMap<AgentId, Arc<RuntimeAgent>>>,
}

impl RuntimeContainer {
    pub(crate) fn new(
        container_id: ContainerId,
        root: PathBuf,
        producer: BusProducer,
        driver: BusDriver,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self {
            container_id,
            created_at: Utc::now(),
            root,
            producer,
            driver,
            repository,
            agents: Mutex::new(IndexMap::new()),
        }
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn record(&self) -> ContainerRecord {
        ContainerRecord {
            container_id: self.container_id.clone(),
            created_at: self.created_at,
        }
    }

    pub fn agent_count(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<Arc<RuntimeAgent>> {
        self.agents.lock().get(agent_id).cloned()
    }

    pub fn agents(&self) -> Vec<Arc<RuntimeAgent>> {
        self.agents.lock().values().cloned().collect()
    }

    /// Create, initialize, and register a fresh agent.
    pub async fn run_agent(&self, config: AgentConfig) -> RuntimeResult<Arc<RuntimeAgent>> {
        self.run_agent_from_messages(config, Vec::new(), None).await
    }

    /// Like [`Self::run_agent`], with a pre-populated session. Used by
    /// image resume.
    #[instrument(skip(self, config, messages), fields(container_id = %self.container_id, name = %config.name))]
    pub async fn run_agent_from_messages(
        &self,
        config: AgentConfig,
        messages: Vec<Message>,
        source_image_id: Option<ImageId>,
    ) -> RuntimeResult<Arc<RuntimeAgent>> {
        let agent_id = AgentId::new_uuid();
        let session = Arc::new(RuntimeSession::from_messages(
            agent_id.clone(),
            self.container_id.clone(),
            messages,
        ));
        let sandbox = RuntimeSandbox::new(self.root.join("agents").join(agent_id.as_str()));
        sandbox.initialize().await?;

        let agent = Arc::new(RuntimeAgent::new(
            agent_id.clone(),
            self.container_id.clone(),
            config,
            source_image_id,
            Arc::clone(&session),
            sandbox,
            self.driver.clone(),
            Arc::clone(&self.repository),
        ));
        self.repository.save_session(&session.record()).await?;
        self.agents.lock().insert(agent_id.clone(), Arc::clone(&agent));

        self.producer.emit(&SystemEvent::lifecycle(
            EventContext::agent(self.container_id.clone(), agent_id.clone()),
            EventKind::AgentRegistered {
                container_id: self.container_id.clone(),
                agent_id: agent_id.clone(),
            },
        ));
        info!(container_id = %self.container_id, agent_id = %agent_id, "agent registered");
        Ok(agent)
    }

    /// Destroy and unregister one agent. Returns `false` for an unknown
    /// id instead of raising.
    #[instrument(skip(self), fields(container_id = %self.container_id))]
    pub async fn destroy_agent(&self, agent_id: &AgentId) -> bool {
        let Some(agent) = self.agents.lock().shift_remove(agent_id) else {
            return false;
        };
        if let Err(error) = agent.destroy().await {
            warn!(agent_id = %agent_id, %error, "agent teardown failed");
        }
        self.producer.emit(&SystemEvent::lifecycle(
            EventContext::agent(self.container_id.clone(), agent_id.clone()),
            EventKind::AgentUnregistered {
                container_id: self.container_id.clone(),
                agent_id: agent_id.clone(),
            },
        ));
        info!(container_id = %self.container_id, agent_id = %agent_id, "agent unregistered");
        true
    }

    /// Destroy every agent in registration order, then announce the
    /// container's own teardown. Individual failures are logged so the
    /// remaining agents are still cleaned up.
    #[instrument(skip(self), fields(container_id = %self.container_id))]
    pub async fn dispose_all(&self) {
        let agents: Vec<AgentId> = self.agents.lock().keys().cloned().collect();
        for agent_id in agents {
            if !self.destroy_agent(&agent_id).await {
                warn!(agent_id = %agent_id, "agent vanished during disposal");
            }
        }
        self.producer.emit(&SystemEvent::lifecycle(
            EventContext::container(self.container_id.clone()),
            EventKind::ContainerDestroyed {
                container_id: self.container_id.clone(),
            },
        ));
        info!(container_id = %self.container_id, "container disposed");
    }
}
