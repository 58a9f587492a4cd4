//! # atrium-protocol — shared contract for the atrium runtime
//!
//! This crate defines the typed IDs, the closed event vocabulary, the
//! persisted record shapes, and the port traits that every atrium crate
//! depends on. It is intentionally dependency-light (no tokio, no axum) so
//! it can serve as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (ContainerId, AgentId, SessionId, ImageId, RequestId)
//! - [`event`] — SystemEvent envelope + closed EventKind tag set + DriveableEvent
//! - [`message`] — Message and Role
//! - [`agent`] — AgentConfig, Lifecycle, AgentActivity, AgentDescriptor
//! - [`record`] — ContainerRecord, SessionRecord, AgentImage
//! - [`repository`] — Repository persistence port
//! - [`error`] — RuntimeError, RuntimeResult

pub mod agent;
pub mod error;
pub mod event;
pub mod ids;
pub mod message;
pub mod record;
pub mod repository;

// Re-export the most commonly used types at the crate root.
pub use agent::{AgentActivity, AgentConfig, AgentDescriptor, Lifecycle};
pub use error::{RuntimeError, RuntimeResult};
pub use event::{
    DriveableEvent, EventCategory, EventContext, EventIntent, EventKind, EventSource, SystemEvent,
};
pub use ids::{AgentId, ContainerId, ImageId, RequestId, SessionId};
pub use message::{Message, Role};
pub use record::{AgentImage, ContainerRecord, SessionRecord};
pub use repository::Repository;
