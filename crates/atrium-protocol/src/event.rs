//! The universal event envelope and its closed, wire-stable vocabulary.
//!
//! Every component communicates exclusively through [`SystemEvent`]s on the
//! bus or over a channel. The tag set is closed: one [`EventKind`] variant
//! per wire type, dispatched with exhaustive matches instead of dynamic
//! type strings.

use crate::agent::{AgentConfig, AgentDescriptor};
use crate::ids::{AgentId, ContainerId, ImageId, RequestId};
use crate::record::{AgentImage, ContainerRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which component emitted an event.
///
/// The source is load-bearing: only `environment`-sourced stream events may
/// drive an agent's exchange, so an agent's own outbound traffic can never
/// be misread as backend input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Environment,
    Container,
    Agent,
    Mirror,
}

/// Coarse routing class of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Lifecycle,
    Stream,
    Request,
    Response,
    Notification,
}

/// Whether an event asks for work, answers it, or merely informs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventIntent {
    Request,
    Result,
    Notification,
}

/// Scoping context carried by every event. The bus performs no
/// partitioning; consumers filter to their own scope with these ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<ContainerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

impl EventContext {
    pub fn container(container_id: ContainerId) -> Self {
        Self {
            container_id: Some(container_id),
            agent_id: None,
        }
    }

    pub fn agent(container_id: ContainerId, agent_id: AgentId) -> Self {
        Self {
            container_id: Some(container_id),
            agent_id: Some(agent_id),
        }
    }
}

/// The universal state-change envelope.
///
/// Invariant: every request-category event carries a `request_id`, and
/// exactly one response event answering it carries the same `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub category: EventCategory,
    pub intent: EventIntent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub context: EventContext,
    pub kind: EventKind,
}

impl SystemEvent {
    /// A backend stream delta, stamped with its exchange correlation id.
    pub fn stream_from_environment(
        request_id: RequestId,
        context: EventContext,
        kind: EventKind,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            source: EventSource::Environment,
            category: EventCategory::Stream,
            intent: EventIntent::Notification,
            request_id: Some(request_id),
            context,
            kind,
        }
    }

    /// A request-category event. Always carries a `request_id`.
    pub fn request(
        source: EventSource,
        request_id: RequestId,
        context: EventContext,
        kind: EventKind,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            category: EventCategory::Request,
            intent: EventIntent::Request,
            request_id: Some(request_id),
            context,
            kind,
        }
    }

    /// The response answering the request with the given id.
    pub fn response(request_id: RequestId, context: EventContext, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            source: EventSource::Container,
            category: EventCategory::Response,
            intent: EventIntent::Result,
            request_id: Some(request_id),
            context,
            kind,
        }
    }

    /// A server-initiated event with no pending request attached.
    pub fn notification(source: EventSource, context: EventContext, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            category: EventCategory::Notification,
            intent: EventIntent::Notification,
            request_id: None,
            context,
            kind,
        }
    }

    /// A lifecycle notification emitted by containers.
    pub fn lifecycle(context: EventContext, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            source: EventSource::Container,
            category: EventCategory::Lifecycle,
            intent: EventIntent::Notification,
            request_id: None,
            context,
            kind,
        }
    }

    /// An outbound user message opening one exchange.
    pub fn user_message(
        source: EventSource,
        request_id: RequestId,
        context: EventContext,
        content: impl Into<String>,
    ) -> Self {
        Self::request(
            source,
            request_id,
            context,
            EventKind::UserMessage {
                content: content.into(),
            },
        )
    }

    /// Wire tag of the payload.
    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }
}

/// Discriminated union of every event this runtime carries.
///
/// Closed by design: adding a wire type means adding a variant here and
/// letting the compiler point at every dispatch site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ── Lifecycle ──
    ContainerCreated {
        container_id: ContainerId,
    },
    ContainerDestroyed {
        container_id: ContainerId,
    },
    AgentRegistered {
        container_id: ContainerId,
        agent_id: AgentId,
    },
    AgentUnregistered {
        container_id: ContainerId,
        agent_id: AgentId,
    },

    // ── Backend stream ──
    MessageStart,
    TextDelta {
        delta: String,
    },
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        output: serde_json::Value,
    },
    MessageStop,
    Interrupted,
    StreamError {
        message: String,
    },

    // ── Outbound ──
    UserMessage {
        content: String,
    },
    InterruptRequest,

    // ── Mirror request/response pairs ──
    ContainerCreateRequest {
        container_id: ContainerId,
    },
    ContainerCreateResponse {
        record: ContainerRecord,
    },
    AgentRunRequest {
        container_id: ContainerId,
        config: AgentConfig,
    },
    AgentRunResponse {
        descriptor: AgentDescriptor,
    },
    AgentDestroyRequest {
        container_id: ContainerId,
        agent_id: AgentId,
    },
    AgentDestroyed {
        container_id: ContainerId,
        agent_id: AgentId,
        removed: bool,
    },
    AgentStopRequest {
        container_id: ContainerId,
        agent_id: AgentId,
    },
    AgentStopped {
        container_id: ContainerId,
        agent_id: AgentId,
    },
    AgentResumeRequest {
        container_id: ContainerId,
        agent_id: AgentId,
    },
    AgentResumed {
        container_id: ContainerId,
        agent_id: AgentId,
    },
    ImageSnapshotRequest {
        container_id: ContainerId,
        agent_id: AgentId,
        name: String,
        description: String,
    },
    ImageSnapshotResponse {
        image: AgentImage,
    },
    ImagesListRequest,
    ImagesListResponse {
        images: Vec<AgentImage>,
    },
    ImageGetRequest {
        image_id: ImageId,
    },
    ImageGetResponse {
        image: Option<AgentImage>,
    },
    ImageDeleteRequest {
        image_id: ImageId,
    },
    ImageResumeRequest {
        image_id: ImageId,
    },
    ImageResumeResponse {
        descriptor: AgentDescriptor,
    },

    // ── Error response ──
    RequestFailed {
        message: String,
    },
}

impl EventKind {
    /// Stable wire tag, identical to the serde tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ContainerCreated { .. } => "container_created",
            Self::ContainerDestroyed { .. } => "container_destroyed",
            Self::AgentRegistered { .. } => "agent_registered",
            Self::AgentUnregistered { .. } => "agent_unregistered",
            Self::MessageStart => "message_start",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::MessageStop => "message_stop",
            Self::Interrupted => "interrupted",
            Self::StreamError { .. } => "stream_error",
            Self::UserMessage { .. } => "user_message",
            Self::InterruptRequest => "interrupt_request",
            Self::ContainerCreateRequest { .. } => "container_create_request",
            Self::ContainerCreateResponse { .. } => "container_create_response",
            Self::AgentRunRequest { .. } => "agent_run_request",
            Self::AgentRunResponse { .. } => "agent_run_response",
            Self::AgentDestroyRequest { .. } => "agent_destroy_request",
            Self::AgentDestroyed { .. } => "agent_destroyed",
            Self::AgentStopRequest { .. } => "agent_stop_request",
            Self::AgentStopped { .. } => "agent_stopped",
            Self::AgentResumeRequest { .. } => "agent_resume_request",
            Self::AgentResumed { .. } => "agent_resumed",
            Self::ImageSnapshotRequest { .. } => "image_snapshot_request",
            Self::ImageSnapshotResponse { .. } => "image_snapshot_response",
            Self::ImagesListRequest => "images_list_request",
            Self::ImagesListResponse { .. } => "images_list_response",
            Self::ImageGetRequest { .. } => "image_get_request",
            Self::ImageGetResponse { .. } => "image_get_response",
            Self::ImageDeleteRequest { .. } => "image_delete_request",
            Self::ImageResumeRequest { .. } => "image_resume_request",
            Self::ImageResumeResponse { .. } => "image_resume_response",
            Self::RequestFailed { .. } => "request_failed",
        }
    }
}

/// Backend-originated events eligible to drive an agent's exchange.
///
/// A strict allow-list, not an exclusion list: anything outside these six
/// variants, or any event whose source is not the environment, is ignored
/// by the exchange driver. This is what prevents feedback loops when an
/// agent's own events share a type name with backend deltas.
#[derive(Debug, Clone, PartialEq)]
pub enum DriveableEvent {
    MessageStart,
    TextDelta {
        delta: String,
    },
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        output: serde_json::Value,
    },
    MessageStop,
    Interrupted,
}

impl DriveableEvent {
    /// Admit an event only if it is an environment-sourced stream delta.
    pub fn from_event(event: &SystemEvent) -> Option<Self> {
        if event.source != EventSource::Environment {
            return None;
        }
        match &event.kind {
            EventKind::MessageStart => Some(Self::MessageStart),
            EventKind::TextDelta { delta } => Some(Self::TextDelta {
                delta: delta.clone(),
            }),
            EventKind::ToolCall { name, arguments } => Some(Self::ToolCall {
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            EventKind::ToolResult { name, output } => Some(Self::ToolResult {
                name: name.clone(),
                output: output.clone(),
            }),
            EventKind::MessageStop => Some(Self::MessageStop),
            EventKind::Interrupted => Some(Self::Interrupted),
            _ => None,
        }
    }

    /// Whether this event ends an exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MessageStop | Self::Interrupted)
    }

    /// The corresponding wire kind.
    pub fn into_kind(self) -> EventKind {
        match self {
            Self::MessageStart => EventKind::MessageStart,
            Self::TextDelta { delta } => EventKind::TextDelta { delta },
            Self::ToolCall { name, arguments } => EventKind::ToolCall { name, arguments },
            Self::ToolResult { name, output } => EventKind::ToolResult { name, output },
            Self::MessageStop => EventKind::MessageStop,
            Self::Interrupted => EventKind::Interrupted,
        }
    }
}
