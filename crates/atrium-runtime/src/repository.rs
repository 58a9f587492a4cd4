//! In-memory repository, the default persistence collaborator.

use std::collections::HashMap;

use async_trait::async_trait;
use atrium_protocol::{
    AgentImage, ContainerId, ContainerRecord, ImageId, Repository, RuntimeResult, SessionId,
    SessionRecord,
};
use parking_lot::Mutex;

/// Process-local [`Repository`] used by default and by tests. Filesystem,
/// SQLite, and Redis backends plug in through the same port.
#[derive(Default)]
pub struct MemoryRepository {
    containers: Mutex<HashMap<ContainerId, ContainerRecord>>,
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    images: Mutex<HashMap<ImageId, AgentImage>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_container(&self, record: &ContainerRecord) -> RuntimeResult<()> {
        self.containers
            .lock()
            .insert(record.container_id.clone(), record.clone());
        Ok(())
    }

    async fn find_container_by_id(
        &self,
        container_id: &ContainerId,
    ) -> RuntimeResult<Option<ContainerRecord>> {
        Ok(self.containers.lock().get(container_id).cloned())
    }

    async fn save_session(&self, record: &SessionRecord) -> RuntimeResult<()> {
        self.sessions
            .lock()
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn find_session_by_id(
        &self,
        session_id: &SessionId,
    ) -> RuntimeResult<Option<SessionRecord>> {
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    async fn save_image(&self, image: &AgentImage) -> RuntimeResult<()> {
        self.images
            .lock()
            .insert(image.image_id.clone(), image.clone());
        Ok(())
    }

    async fn find_image_by_id(&self, image_id: &ImageId) -> RuntimeResult<Option<AgentImage>> {
        Ok(self.images.lock().get(image_id).cloned())
    }

    async fn find_all_images(&self) -> RuntimeResult<Vec<AgentImage>> {
        let mut images: Vec<_> = self.images.lock().values().cloned().collect();
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(images)
    }

    async fn delete_image(&self, image_id: &ImageId) -> RuntimeResult<bool> {
        Ok(self.images.lock().remove(image_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn image(id: &str) -> AgentImage {
        AgentImage {
            image_id: ImageId::from_string(id),
            container_id: ContainerId::from_string("c1"),
            agent_id: atrium_protocol::AgentId::from_string("a1"),
            name: id.to_owned(),
            description: String::new(),
            system_prompt: String::new(),
            messages: Vec::new(),
            parent_image_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn container_record_survives_round_trip() -> anyhow::Result<()> {
        let repository = MemoryRepository::new();
        let record = ContainerRecord::new(ContainerId::from_string("c1"));
        repository.save_container(&record).await?;

        let found = repository
            .find_container_by_id(&ContainerId::from_string("c1"))
            .await?;
        assert_eq!(found, Some(record));
        assert!(
            repository
                .find_container_by_id(&ContainerId::from_string("missing"))
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn image_delete_reports_presence() -> anyhow::Result<()> {
        let repository = MemoryRepository::new();
        repository.save_image(&image("img-1")).await?;

        assert!(repository.delete_image(&ImageId::from_string("img-1")).await?);
        assert!(!repository.delete_image(&ImageId::from_string("img-1")).await?);
        assert!(repository.find_all_images().await?.is_empty());
        Ok(())
    }
}
