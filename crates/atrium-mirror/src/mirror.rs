//! Client side of the mirror protocol: a parallel object graph
//! ([`MirrorRuntime`] / [`MirrorContainer`] / [`MirrorAgent`] /
//! [`MirrorImage`]) that proxies every operation over a channel.
//!
//! Local state is an eventually-consistent cache with one reconciliation
//! rule: only response and notification events write to it. It is
//! authoritative at most between a send and its matching response, never
//! between operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use atrium_protocol::{
    AgentActivity, AgentConfig, AgentDescriptor, AgentId, AgentImage, ContainerId,
    ContainerRecord, EventCategory, EventContext, EventKind, EventSource, ImageId, Lifecycle,
    Message, RequestId, Role, RuntimeError, RuntimeResult, SystemEvent,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelState};

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Per-request timeout; timed-out entries remove themselves.
    pub request_timeout: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(30_000),
        }
    }
}

struct PendingRequest {
    sender: oneshot::Sender<EventKind>,
    /// Responses must match this scope or they are ignored outright.
    container_scope: Option<ContainerId>,
}

struct AgentEntry {
    descriptor: AgentDescriptor,
    messages: Vec<Message>,
    partial: String,
}

struct ContainerEntry {
    record: ContainerRecord,
    agents: HashMap<AgentId, AgentEntry>,
}

#[derive(Default)]
struct MirrorState {
    containers: HashMap<ContainerId, ContainerEntry>,
    images: HashMap<ImageId, AgentImage>,
}

struct MirrorInner {
    channel: Arc<dyn Channel>,
    config: MirrorConfig,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    state: Mutex<MirrorState>,
}

/// The client-side projection of a remote [`Runtime`].
///
/// [`Runtime`]: atrium_runtime::Runtime
pub struct MirrorRuntime {
    inner: Arc<MirrorInner>,
    reader: JoinHandle<()>,
}

impl Drop for MirrorRuntime {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl MirrorRuntime {
    /// Connect the channel if necessary and start mirroring it.
    pub async fn connect(
        channel: Arc<dyn Channel>,
        config: MirrorConfig,
    ) -> RuntimeResult<Self> {
        if channel.state() == ChannelState::Stopped {
            channel.connect().await?;
        }
        let inner = Arc::new(MirrorInner {
            channel: Arc::clone(&channel),
            config,
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(MirrorState::default()),
        });

        let reader_inner = Arc::clone(&inner);
        let mut subscription = channel.subscribe();
        let reader = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(event) => reader_inner.observe(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "mirror fell behind on channel events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Self { inner, reader })
    }

    /// Create a container on the server and mirror it locally.
    pub async fn create_container(
        &self,
        container_id: ContainerId,
    ) -> RuntimeResult<MirrorContainer> {
        let kind = self
            .inner
            .request(
                EventKind::ContainerCreateRequest {
                    container_id: container_id.clone(),
                },
                EventContext::container(container_id.clone()),
                Some(container_id.clone()),
            )
            .await?;
        let EventKind::ContainerCreateResponse { record } = kind else {
            return Err(unexpected_response(&kind));
        };
        self.inner.state.lock().containers.insert(
            container_id.clone(),
            ContainerEntry {
                record,
                agents: HashMap::new(),
            },
        );
        Ok(MirrorContainer {
            inner: Arc::clone(&self.inner),
            container_id,
        })
    }

    /// A proxy for an already-mirrored container.
    pub fn container(&self, container_id: &ContainerId) -> Option<MirrorContainer> {
        self.inner
            .state
            .lock()
            .containers
            .contains_key(container_id)
            .then(|| MirrorContainer {
                inner: Arc::clone(&self.inner),
                container_id: container_id.clone(),
            })
    }

    /// Fetch the image registry; the response overwrites the local cache.
    pub async fn list_images(&self) -> RuntimeResult<Vec<MirrorImage>> {
        let kind = self
            .inner
            .request(EventKind::ImagesListRequest, EventContext::default(), None)
            .await?;
        let EventKind::ImagesListResponse { images } = kind else {
            return Err(unexpected_response(&kind));
        };
        let mut state = self.inner.state.lock();
        state.images = images
            .iter()
            .map(|image| (image.image_id.clone(), image.clone()))
            .collect();
        Ok(images
            .into_iter()
            .map(|image| MirrorImage {
                inner: Arc::clone(&self.inner),
                image_id: image.image_id,
            })
            .collect())
    }

    pub async fn get_image(&self, image_id: &ImageId) -> RuntimeResult<Option<MirrorImage>> {
        let kind = self
            .inner
            .request(
                EventKind::ImageGetRequest {
                    image_id: image_id.clone(),
                },
                EventContext::default(),
                None,
            )
            .await?;
        let EventKind::ImageGetResponse { image } = kind else {
            return Err(unexpected_response(&kind));
        };
        Ok(image.map(|image| {
            let mut state = self.inner.state.lock();
            state.images.insert(image.image_id.clone(), image.clone());
            MirrorImage {
                inner: Arc::clone(&self.inner),
                image_id: image.image_id,
            }
        }))
    }
}

/// Client-side proxy of one server container.
pub struct MirrorContainer {
    inner: Arc<MirrorInner>,
    container_id: ContainerId,
}

impl MirrorContainer {
    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn record(&self) -> Option<ContainerRecord> {
        self.inner
            .state
            .lock()
            .containers
            .get(&self.container_id)
            .map(|entry| entry.record.clone())
    }

    pub fn agent_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .containers
            .get(&self.container_id)
            .map_or(0, |entry| entry.agents.len())
    }

    pub async fn run_agent(&self, config: AgentConfig) -> RuntimeResult<MirrorAgent> {
        let kind = self
            .inner
            .request(
                EventKind::AgentRunRequest {
                    container_id: self.container_id.clone(),
                    config,
                },
                EventContext::container(self.container_id.clone()),
                Some(self.container_id.clone()),
            )
            .await?;
        let EventKind::AgentRunResponse { descriptor } = kind else {
            return Err(unexpected_response(&kind));
        };
        let agent_id = descriptor.agent_id.clone();
        self.inner.upsert_agent(&self.container_id, descriptor);
        Ok(MirrorAgent {
            inner: Arc::clone(&self.inner),
            container_id: self.container_id.clone(),
            agent_id,
        })
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<MirrorAgent> {
        let state = self.inner.state.lock();
        state
            .containers
            .get(&self.container_id)
            .is_some_and(|entry| entry.agents.contains_key(agent_id))
            .then(|| MirrorAgent {
                inner: Arc::clone(&self.inner),
                container_id: self.container_id.clone(),
                agent_id: agent_id.clone(),
            })
    }

    pub async fn destroy_agent(&self, agent_id: &AgentId) -> RuntimeResult<bool> {
        let kind = self
            .inner
            .request(
                EventKind::AgentDestroyRequest {
                    container_id: self.container_id.clone(),
                    agent_id: agent_id.clone(),
                },
                EventContext::agent(self.container_id.clone(), agent_id.clone()),
                Some(self.container_id.clone()),
            )
            .await?;
        let EventKind::AgentDestroyed { removed, .. } = kind else {
            return Err(unexpected_response(&kind));
        };
        if removed {
            self.inner.remove_agent(&self.container_id, agent_id);
        }
        Ok(removed)
    }
}

/// Client-side proxy of one server agent.
pub struct MirrorAgent {
    inner: Arc<MirrorInner>,
    container_id: ContainerId,
    agent_id: AgentId,
}

impl MirrorAgent {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn descriptor(&self) -> Option<AgentDescriptor> {
        self.inner
            .with_agent(&self.container_id, &self.agent_id, |entry| {
                entry.descriptor.clone()
            })
    }

    pub fn lifecycle(&self) -> Option<Lifecycle> {
        self.descriptor().map(|d| d.lifecycle)
    }

    pub fn activity(&self) -> Option<AgentActivity> {
        self.descriptor().map(|d| d.activity)
    }

    /// Mirrored message history, rebuilt from forwarded stream events.
    pub fn messages(&self) -> Vec<Message> {
        self.inner
            .with_agent(&self.container_id, &self.agent_id, |entry| {
                entry.messages.clone()
            })
            .unwrap_or_default()
    }

    fn context(&self) -> EventContext {
        EventContext::agent(self.container_id.clone(), self.agent_id.clone())
    }

    /// Fire-and-forget: the reply arrives as forwarded stream events, not
    /// as a response to this request.
    pub async fn send_message(&self, content: impl Into<String>) -> RuntimeResult<()> {
        self.inner
            .channel
            .send(&SystemEvent::user_message(
                EventSource::Mirror,
                RequestId::new_uuid(),
                self.context(),
                content,
            ))
            .await
    }

    /// Ask the server to abort the agent's in-flight exchange.
    pub async fn interrupt(&self) -> RuntimeResult<()> {
        self.inner
            .channel
            .send(&SystemEvent::request(
                EventSource::Mirror,
                RequestId::new_uuid(),
                self.context(),
                EventKind::InterruptRequest,
            ))
            .await
    }

    pub async fn stop(&self) -> RuntimeResult<()> {
        let kind = self
            .inner
            .request(
                EventKind::AgentStopRequest {
                    container_id: self.container_id.clone(),
                    agent_id: self.agent_id.clone(),
                },
                self.context(),
                Some(self.container_id.clone()),
            )
            .await?;
        let EventKind::AgentStopped { .. } = kind else {
            return Err(unexpected_response(&kind));
        };
        self.inner
            .set_lifecycle(&self.container_id, &self.agent_id, Lifecycle::Stopped);
        Ok(())
    }

    pub async fn resume(&self) -> RuntimeResult<()> {
        let kind = self
            .inner
            .request(
                EventKind::AgentResumeRequest {
                    container_id: self.container_id.clone(),
                    agent_id: self.agent_id.clone(),
                },
                self.context(),
                Some(self.container_id.clone()),
            )
            .await?;
        let EventKind::AgentResumed { .. } = kind else {
            return Err(unexpected_response(&kind));
        };
        self.inner
            .set_lifecycle(&self.container_id, &self.agent_id, Lifecycle::Running);
        Ok(())
    }

    pub async fn snapshot(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> RuntimeResult<MirrorImage> {
        let kind = self
            .inner
            .request(
                EventKind::ImageSnapshotRequest {
                    container_id: self.container_id.clone(),
                    agent_id: self.agent_id.clone(),
                    name: name.into(),
                    description: description.into(),
                },
                self.context(),
                Some(self.container_id.clone()),
            )
            .await?;
        let EventKind::ImageSnapshotResponse { image } = kind else {
            return Err(unexpected_response(&kind));
        };
        let image_id = image.image_id.clone();
        self.inner.state.lock().images.insert(image_id.clone(), image);
        Ok(MirrorImage {
            inner: Arc::clone(&self.inner),
            image_id,
        })
    }
}

/// Client-side proxy of one stored agent image.
pub struct MirrorImage {
    inner: Arc<MirrorInner>,
    image_id: ImageId,
}

impl MirrorImage {
    pub fn image_id(&self) -> &ImageId {
        &self.image_id
    }

    pub fn record(&self) -> Option<AgentImage> {
        self.inner.state.lock().images.get(&self.image_id).cloned()
    }

    /// Spawn a new agent from this image on the server.
    pub async fn resume(&self) -> RuntimeResult<MirrorAgent> {
        let kind = self
            .inner
            .request(
                EventKind::ImageResumeRequest {
                    image_id: self.image_id.clone(),
                },
                EventContext::default(),
                None,
            )
            .await?;
        let EventKind::ImageResumeResponse { descriptor } = kind else {
            return Err(unexpected_response(&kind));
        };
        let container_id = descriptor.container_id.clone();
        let agent_id = descriptor.agent_id.clone();
        self.inner.upsert_agent(&container_id, descriptor);
        Ok(MirrorAgent {
            inner: Arc::clone(&self.inner),
            container_id,
            agent_id,
        })
    }

    /// Fire-and-forget delete; the cache entry is pruned optimistically
    /// and the next `images_list` response reconciles.
    pub async fn delete(&self) -> RuntimeResult<()> {
        self.inner
            .channel
            .send(&SystemEvent::request(
                EventSource::Mirror,
                RequestId::new_uuid(),
                EventContext::default(),
                EventKind::ImageDeleteRequest {
                    image_id: self.image_id.clone(),
                },
            ))
            .await?;
        self.inner.state.lock().images.remove(&self.image_id);
        Ok(())
    }
}

impl MirrorInner {
    async fn request(
        &self,
        kind: EventKind,
        context: EventContext,
        container_scope: Option<ContainerId>,
    ) -> RuntimeResult<EventKind> {
        let request_id = RequestId::new_uuid();
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                sender,
                container_scope,
            },
        );

        let send_result = self
            .channel
            .send(&SystemEvent::request(
                EventSource::Mirror,
                request_id.clone(),
                context,
                kind,
            ))
            .await;
        if let Err(error) = send_result {
            self.pending.lock().remove(&request_id);
            return Err(error);
        }

        match tokio::time::timeout(self.config.request_timeout, receiver).await {
            Ok(Ok(EventKind::RequestFailed { message })) => {
                Err(RuntimeError::RequestFailed(message))
            }
            Ok(Ok(kind)) => Ok(kind),
            Ok(Err(_)) => Err(RuntimeError::ChannelClosed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(RuntimeError::RequestTimeout(self.config.request_timeout))
            }
        }
    }

    /// Route one channel event: resolve a pending request if it matches,
    /// otherwise treat it as a notification.
    fn observe(&self, event: SystemEvent) {
        if event.category == EventCategory::Response {
            let Some(request_id) = event.request_id.clone() else {
                debug!(tag = event.tag(), "response without request id dropped");
                return;
            };
            let entry = {
                let mut pending = self.pending.lock();
                let scope_ok = match pending.get(&request_id) {
                    // Timed out or never existed: both silent no-ops.
                    None => {
                        debug!(tag = event.tag(), "late or unknown response dropped");
                        return;
                    }
                    Some(p) => {
                        p.container_scope.is_none()
                            || p.container_scope == event.context.container_id
                    }
                };
                if !scope_ok {
                    // Scope mismatch: drop the response, keep waiting.
                    debug!(tag = event.tag(), "response scope mismatch dropped");
                    return;
                }
                pending.remove(&request_id)
            };
            if let Some(entry) = entry {
                let _ = entry.sender.send(event.kind);
            }
            return;
        }
        self.apply_notification(&event);
    }

    /// Notifications update the cache unconditionally.
    fn apply_notification(&self, event: &SystemEvent) {
        let mut state = self.state.lock();
        match &event.kind {
            EventKind::ContainerCreated { container_id } => {
                state
                    .containers
                    .entry(container_id.clone())
                    .or_insert_with(|| ContainerEntry {
                        record: ContainerRecord {
                            container_id: container_id.clone(),
                            created_at: event.timestamp,
                        },
                        agents: HashMap::new(),
                    });
            }
            EventKind::ContainerDestroyed { container_id } => {
                // Dispose is not delete: the record stays, the agents go.
                if let Some(entry) = state.containers.get_mut(container_id) {
                    entry.agents.clear();
                }
            }
            EventKind::AgentRegistered {
                container_id,
                agent_id,
            } => {
                if let Some(entry) = state.containers.get_mut(container_id) {
                    entry
                        .agents
                        .entry(agent_id.clone())
                        .or_insert_with(|| AgentEntry {
                            descriptor: AgentDescriptor {
                                agent_id: agent_id.clone(),
                                container_id: container_id.clone(),
                                name: String::new(),
                                lifecycle: Lifecycle::Running,
                                activity: AgentActivity::Idle,
                            },
                            messages: Vec::new(),
                            partial: String::new(),
                        });
                }
            }
            EventKind::AgentUnregistered {
                container_id,
                agent_id,
            }
            | EventKind::AgentDestroyed {
                container_id,
                agent_id,
                ..
            } => {
                if let Some(entry) = state.containers.get_mut(container_id) {
                    entry.agents.remove(agent_id);
                }
            }
            EventKind::AgentStopped {
                container_id,
                agent_id,
            } => {
                Self::agent_entry(&mut state, container_id, agent_id, |agent| {
                    agent.descriptor.lifecycle = Lifecycle::Stopped;
                });
            }
            EventKind::AgentResumed {
                container_id,
                agent_id,
            } => {
                Self::agent_entry(&mut state, container_id, agent_id, |agent| {
                    agent.descriptor.lifecycle = Lifecycle::Running;
                });
            }
            EventKind::UserMessage { content } => {
                // The server's own outbound user_message, forwarded to us.
                if event.source == EventSource::Agent {
                    self.with_event_agent(&mut state, event, |agent| {
                        agent.messages.push(Message::user(content.clone()));
                    });
                }
            }
            EventKind::MessageStart => {
                self.with_event_agent(&mut state, event, |agent| {
                    agent.descriptor.activity = AgentActivity::Thinking;
                });
            }
            EventKind::TextDelta { delta } => {
                self.with_event_agent(&mut state, event, |agent| {
                    agent.partial.push_str(delta);
                    agent.descriptor.activity = AgentActivity::Responding;
                });
            }
            EventKind::ToolCall { .. } => {
                self.with_event_agent(&mut state, event, |agent| {
                    agent.descriptor.activity = AgentActivity::AwaitingToolResult;
                });
            }
            EventKind::ToolResult { output, .. } => {
                self.with_event_agent(&mut state, event, |agent| {
                    agent.messages.push(Message::tool(output.to_string()));
                    agent.descriptor.activity = AgentActivity::Thinking;
                });
            }
            EventKind::MessageStop => {
                self.with_event_agent(&mut state, event, |agent| {
                    let reply = std::mem::take(&mut agent.partial);
                    agent.messages.push(Message::assistant(reply));
                    agent.descriptor.activity = AgentActivity::Idle;
                });
            }
            EventKind::Interrupted => {
                self.with_event_agent(&mut state, event, |agent| {
                    agent.partial.clear();
                    agent.descriptor.activity = AgentActivity::Idle;
                });
            }
            EventKind::StreamError { message } => {
                self.with_event_agent(&mut state, event, |agent| {
                    agent.messages.push(Message::new(Role::Error, message.clone()));
                });
            }
            _ => {}
        }
    }

    fn agent_entry(
        state: &mut MirrorState,
        container_id: &ContainerId,
        agent_id: &AgentId,
        apply: impl FnOnce(&mut AgentEntry),
    ) {
        if let Some(agent) = state
            .containers
            .get_mut(container_id)
            .and_then(|entry| entry.agents.get_mut(agent_id))
        {
            apply(agent);
        }
    }

    fn with_event_agent(
        &self,
        state: &mut MirrorState,
        event: &SystemEvent,
        apply: impl FnOnce(&mut AgentEntry),
    ) {
        if let (Some(container_id), Some(agent_id)) =
            (&event.context.container_id, &event.context.agent_id)
        {
            Self::agent_entry(state, container_id, agent_id, apply);
        }
    }

    fn upsert_agent(&self, container_id: &ContainerId, descriptor: AgentDescriptor) {
        let mut state = self.state.lock();
        let Some(entry) = state.containers.get_mut(container_id) else {
            return;
        };
        let agent_id = descriptor.agent_id.clone();
        match entry.agents.get_mut(&agent_id) {
            Some(agent) => agent.descriptor = descriptor,
            None => {
                entry.agents.insert(
                    agent_id,
                    AgentEntry {
                        descriptor,
                        messages: Vec::new(),
                        partial: String::new(),
                    },
                );
            }
        }
    }

    fn remove_agent(&self, container_id: &ContainerId, agent_id: &AgentId) {
        if let Some(entry) = self.state.lock().containers.get_mut(container_id) {
            entry.agents.remove(agent_id);
        }
    }

    fn set_lifecycle(&self, container_id: &ContainerId, agent_id: &AgentId, lifecycle: Lifecycle) {
        let mut state = self.state.lock();
        Self::agent_entry(&mut state, container_id, agent_id, |agent| {
            agent.descriptor.lifecycle = lifecycle;
        });
    }

    fn with_agent<T>(
        &self,
        container_id: &ContainerId,
        agent_id: &AgentId,
        read: impl FnOnce(&AgentEntry) -> T,
    ) -> Option<T> {
        let state = self.state.lock();
        state
            .containers
            .get(container_id)
            .and_then(|entry| entry.agents.get(agent_id))
            .map(read)
    }
}

fn unexpected_response(kind: &EventKind) -> RuntimeError {
    RuntimeError::RequestFailed(format!("unexpected response: {}", kind.tag()))
}
