//! Error taxonomy for the atrium runtime.
//!
//! Lifecycle violations carry fixed messages callers can match on; they are
//! rejected before any bus interaction. Timeout errors cover both domains
//! (exchange inactivity, mirror pending requests) and are independent.

use crate::ids::{AgentId, ContainerId, ImageId};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("cannot resume destroyed agent")]
    ResumeDestroyedAgent,
    #[error("cannot send message to stopped agent")]
    SendToStoppedAgent,
    #[error("agent is destroyed")]
    AgentDestroyed,
    #[error("container not found")]
    ContainerNotFound,
    #[error("container already exists: {0}")]
    ContainerExists(ContainerId),
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),
    #[error("image not found: {0}")]
    ImageNotFound(ImageId),
    #[error("exchange timed out after {0:?}")]
    ExchangeTimeout(Duration),
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),
    #[error("channel closed")]
    ChannelClosed,
    #[error("invalid channel state: {0}")]
    InvalidChannelState(String),
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("repository error: {0}")]
    Repository(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
