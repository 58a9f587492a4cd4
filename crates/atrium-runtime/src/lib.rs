//! Container, agent, session, and image lifecycle over the event bus.
//!
//! The [`Runtime`] façade is the sole entry point for callers: it owns the
//! container registry, the image store, and the bus the environment is
//! attached to. It is an explicit instance built by [`RuntimeBuilder`];
//! there is no process-global runtime.

pub mod agent;
pub mod container;
pub mod repository;
pub mod sandbox;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use atrium_bus::{Backend, BusDriver, BusProducer, DriverConfig, Effector, SystemBus};
use atrium_protocol::{
    AgentConfig, AgentId, AgentImage, ContainerId, ContainerRecord, EventContext, EventKind,
    ImageId, Repository, RuntimeError, RuntimeResult, SystemEvent,
};
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{info, instrument};

pub use agent::{AgentExchange, RuntimeAgent};
pub use container::RuntimeContainer;
pub use repository::MemoryRepository;
pub use sandbox::RuntimeSandbox;
pub use session::RuntimeSession;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory for container and agent sandboxes.
    pub root: PathBuf,
    pub driver: DriverConfig,
}

impl RuntimeConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            driver: DriverConfig::default(),
        }
    }
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    repository: Option<Arc<dyn Repository>>,
    backend: Option<Arc<dyn Backend>>,
}

impl RuntimeBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            config: RuntimeConfig::new(root),
            repository: None,
            backend: None,
        }
    }

    pub fn with_driver_config(mut self, driver: DriverConfig) -> Self {
        self.config.driver = driver;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Attach a backend; the runtime spawns an environment effector for it.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Runtime {
        let bus = SystemBus::new();
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(MemoryRepository::new()));
        let effector = self
            .backend
            .map(|backend| Effector::spawn(&bus.consumer(), bus.producer(), backend));
        let driver = BusDriver::new(bus.producer(), bus.consumer(), self.config.driver.clone());
        Runtime {
            config: self.config,
            producer: bus.producer(),
            bus,
            driver,
            repository,
            containers: Mutex::new(IndexMap::new()),
            _effector: effector,
        }
    }
}

/// Routing façade over the container, agent, and image registries.
pub struct Runtime {
    config: RuntimeConfig,
    bus: SystemBus,
    producer: BusProducer,
    driver: BusDriver,
    repository: Arc<dyn Repository>,
    containers: Mutex<IndexMap<ContainerId, Arc<RuntimeContainer>>>,
    _effector: Option<Effector>,
}

impl Runtime {
    pub fn builder(root: impl Into<PathBuf>) -> RuntimeBuilder {
        RuntimeBuilder::new(root)
    }

    /// The bus every component of this runtime shares.
    pub fn bus(&self) -> &SystemBus {
        &self.bus
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Create and register a container with a caller-assigned id.
    #[instrument(skip(self))]
    pub async fn create_container(
        &self,
        container_id: ContainerId,
    ) -> RuntimeResult<Arc<RuntimeContainer>> {
        if self.containers.lock().contains_key(&container_id) {
            return Err(RuntimeError::ContainerExists(container_id));
        }
        let container = Arc::new(RuntimeContainer::new(
            container_id.clone(),
            self.config.root.join("containers").join(container_id.as_str()),
            self.producer.clone(),
            self.driver.clone(),
            Arc::clone(&self.repository),
        ));
        self.repository.save_container(&container.record()).await?;
        self.containers
            .lock()
            .insert(container_id.clone(), Arc::clone(&container));

        self.producer.emit(&SystemEvent::lifecycle(
            EventContext::container(container_id.clone()),
            EventKind::ContainerCreated {
                container_id: container_id.clone(),
            },
        ));
        info!(container_id = %container_id, "container created");
        Ok(container)
    }

    pub fn container(&self, container_id: &ContainerId) -> Option<Arc<RuntimeContainer>> {
        self.containers.lock().get(container_id).cloned()
    }

    pub fn container_record(&self, container_id: &ContainerId) -> Option<ContainerRecord> {
        self.container(container_id).map(|c| c.record())
    }

    /// Destroy a container's agents and drop it from the live registry.
    /// The persisted record is retained: dispose is not delete.
    #[instrument(skip(self))]
    pub async fn dispose_container(&self, container_id: &ContainerId) -> bool {
        let Some(container) = self.containers.lock().shift_remove(container_id) else {
            return false;
        };
        container.dispose_all().await;
        true
    }

    pub async fn run_agent(
        &self,
        container_id: &ContainerId,
        config: AgentConfig,
    ) -> RuntimeResult<Arc<RuntimeAgent>> {
        let container = self
            .container(container_id)
            .ok_or(RuntimeError::ContainerNotFound)?;
        container.run_agent(config).await
    }

    pub fn agent(
        &self,
        container_id: &ContainerId,
        agent_id: &AgentId,
    ) -> Option<Arc<RuntimeAgent>> {
        self.container(container_id)?.agent(agent_id)
    }

    pub async fn destroy_agent(&self, container_id: &ContainerId, agent_id: &AgentId) -> bool {
        match self.container(container_id) {
            Some(container) => container.destroy_agent(agent_id).await,
            None => false,
        }
    }

    /// Capture an immutable image of a live agent's configuration and
    /// history at the instant of call.
    #[instrument(skip(self, name, description))]
    pub async fn snapshot_agent(
        &self,
        container_id: &ContainerId,
        agent_id: &AgentId,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> RuntimeResult<AgentImage> {
        let container = self
            .container(container_id)
            .ok_or(RuntimeError::ContainerNotFound)?;
        let agent = container
            .agent(agent_id)
            .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.clone()))?;

        let image = AgentImage {
            image_id: ImageId::new_uuid(),
            container_id: container_id.clone(),
            agent_id: agent_id.clone(),
            name: name.into(),
            description: description.into(),
            system_prompt: agent.config().system_prompt.clone(),
            messages: agent.session().messages(),
            parent_image_id: agent.source_image_id().cloned(),
            created_at: Utc::now(),
        };
        self.repository.save_image(&image).await?;
        info!(image_id = %image.image_id, agent_id = %agent_id, "agent snapshotted");
        Ok(image)
    }

    /// Spawn a brand-new agent from an image, in the image's original
    /// container. The container must still be live; the persisted record
    /// alone is not sufficient.
    #[instrument(skip(self))]
    pub async fn resume_image(&self, image_id: &ImageId) -> RuntimeResult<Arc<RuntimeAgent>> {
        let image = self
            .repository
            .find_image_by_id(image_id)
            .await?
            .ok_or_else(|| RuntimeError::ImageNotFound(image_id.clone()))?;
        let container = self
            .container(&image.container_id)
            .ok_or(RuntimeError::ContainerNotFound)?;

        let config = AgentConfig::new(image.name.clone(), image.system_prompt.clone());
        let agent = container
            .run_agent_from_messages(config, image.messages.clone(), Some(image.image_id.clone()))
            .await?;
        info!(image_id = %image_id, agent_id = %agent.agent_id(), "image resumed");
        Ok(agent)
    }

    pub async fn list_images(&self) -> RuntimeResult<Vec<AgentImage>> {
        self.repository.find_all_images().await
    }

    pub async fn get_image(&self, image_id: &ImageId) -> RuntimeResult<Option<AgentImage>> {
        self.repository.find_image_by_id(image_id).await
    }

    pub async fn delete_image(&self, image_id: &ImageId) -> RuntimeResult<bool> {
        self.repository.delete_image(image_id).await
    }
}
