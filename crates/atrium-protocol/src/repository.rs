//! Persistence port consumed by containers and the image registry.
//!
//! Backend-agnostic: memory, filesystem, SQLite, and Redis implementations
//! all live outside this crate. The runtime only requires these operations.

use crate::error::RuntimeResult;
use crate::ids::{ContainerId, ImageId, SessionId};
use crate::record::{AgentImage, ContainerRecord, SessionRecord};
use async_trait::async_trait;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn save_container(&self, record: &ContainerRecord) -> RuntimeResult<()>;
    async fn find_container_by_id(
        &self,
        container_id: &ContainerId,
    ) -> RuntimeResult<Option<ContainerRecord>>;

    async fn save_session(&self, record: &SessionRecord) -> RuntimeResult<()>;
    async fn find_session_by_id(
        &self,
        session_id: &SessionId,
    ) -> RuntimeResult<Option<SessionRecord>>;

    async fn save_image(&self, image: &AgentImage) -> RuntimeResult<()>;
    async fn find_image_by_id(&self, image_id: &ImageId) -> RuntimeResult<Option<AgentImage>>;
    async fn find_all_images(&self) -> RuntimeResult<Vec<AgentImage>>;
    async fn delete_image(&self, image_id: &ImageId) -> RuntimeResult<bool>;
}
