//! One conversational agent: identity, lifecycle, activity, and the
//! message loop over its exchange driver.

use std::sync::Arc;

use async_stream::stream;
use atrium_bus::{BusDriver, ExchangeHandle};
use atrium_protocol::{
    AgentActivity, AgentConfig, AgentDescriptor, AgentId, ContainerId, DriveableEvent,
    EventContext, ImageId, Lifecycle, Message, Repository, RequestId, Role, RuntimeError,
    RuntimeResult,
};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::sandbox::RuntimeSandbox;
use crate::session::RuntimeSession;

/// One exchange opened by [`RuntimeAgent::send_message`].
pub struct AgentExchange {
    pub request_id: RequestId,
    pub handle: ExchangeHandle,
    pub events: BoxStream<'static, RuntimeResult<DriveableEvent>>,
}

pub struct RuntimeAgent {
    agent_id: AgentId,
    container_id: ContainerId,
    config: AgentConfig,
    source_image_id: Option<ImageId>,
    lifecycle: Mutex<Lifecycle>,
    activity: Mutex<AgentActivity>,
    session: Arc<RuntimeSession>,
    sandbox: RuntimeSandbox,
    driver: BusDriver,
    repository: Arc<dyn Repository>,
}

impl RuntimeAgent {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        agent_id: AgentId,
        container_id: ContainerId,
        config: AgentConfig,
        source_image_id: Option<ImageId>,
        session: Arc<RuntimeSession>,
        sandbox: RuntimeSandbox,
        driver: BusDriver,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self {
            agent_id,
            container_id,
            config,
            source_image_id,
            lifecycle: Mutex::new(Lifecycle::Running),
            activity: Mutex::new(AgentActivity::Idle),
            session,
            sandbox,
            driver,
            repository,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The image this agent was resumed from, if any.
    pub fn source_image_id(&self) -> Option<&ImageId> {
        self.source_image_id.as_ref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub fn activity(&self) -> AgentActivity {
        *self.activity.lock()
    }

    pub fn session(&self) -> &Arc<RuntimeSession> {
        &self.session
    }

    pub fn sandbox(&self) -> &RuntimeSandbox {
        &self.sandbox
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: self.agent_id.clone(),
            container_id: self.container_id.clone(),
            name: self.config.name.clone(),
            lifecycle: self.lifecycle(),
            activity: self.activity(),
        }
    }

    /// Pause the agent. New messages are rejected until [`Self::resume`].
    pub fn stop(&self) -> RuntimeResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Destroyed {
            return Err(RuntimeError::AgentDestroyed);
        }
        *lifecycle = Lifecycle::Stopped;
        *self.activity.lock() = AgentActivity::Idle;
        debug!(agent_id = %self.agent_id, "agent stopped");
        Ok(())
    }

    /// Bring a stopped agent back to `running`.
    pub fn resume(&self) -> RuntimeResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Destroyed {
            return Err(RuntimeError::ResumeDestroyedAgent);
        }
        *lifecycle = Lifecycle::Running;
        debug!(agent_id = %self.agent_id, "agent resumed");
        Ok(())
    }

    /// Terminal teardown: persists the session one last time and removes
    /// the sandbox. Destroyed agents are irrecoverable.
    pub(crate) async fn destroy(&self) -> RuntimeResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            *lifecycle = Lifecycle::Destroyed;
            *self.activity.lock() = AgentActivity::Idle;
        }
        self.persist_session().await;
        self.sandbox.dispose().await?;
        debug!(agent_id = %self.agent_id, "agent destroyed");
        Ok(())
    }

    /// Open one exchange for `content`.
    ///
    /// Lifecycle is checked before any bus interaction: a stopped or
    /// destroyed agent rejects without mutating the session. The returned
    /// stream applies activity transitions as deltas arrive and appends
    /// exactly one assistant message per completed exchange.
    #[instrument(skip(self, content), fields(agent_id = %self.agent_id))]
    pub fn send_message(
        self: &Arc<Self>,
        content: impl Into<String>,
    ) -> RuntimeResult<AgentExchange> {
        match self.lifecycle() {
            Lifecycle::Stopped => return Err(RuntimeError::SendToStoppedAgent),
            Lifecycle::Destroyed => return Err(RuntimeError::AgentDestroyed),
            Lifecycle::Running => {}
        }

        let content = content.into();
        self.session.append(Message::user(content.clone()));

        let context = EventContext::agent(self.container_id.clone(), self.agent_id.clone());
        let exchange = self.driver.drive(context, content);

        let agent = Arc::clone(self);
        let mut inner = exchange.events;
        let events = stream! {
            let mut reply = String::new();
            while let Some(item) = inner.next().await {
                match item {
                    Ok(event) => {
                        agent.apply_delta(&event, &mut reply).await;
                        yield Ok(event);
                    }
                    Err(error) => {
                        agent.set_activity(AgentActivity::Idle);
                        agent
                            .session
                            .append(Message::new(Role::Error, error.to_string()));
                        agent.persist_session().await;
                        yield Err(error);
                    }
                }
            }
            // Covers streams that end without a terminal delta.
            agent.set_activity(AgentActivity::Idle);
        }
        .boxed();

        Ok(AgentExchange {
            request_id: exchange.request_id,
            handle: exchange.handle,
            events,
        })
    }

    async fn apply_delta(&self, event: &DriveableEvent, reply: &mut String) {
        match event {
            DriveableEvent::MessageStart => self.set_activity(AgentActivity::Thinking),
            DriveableEvent::TextDelta { delta } => {
                reply.push_str(delta);
                self.set_activity(AgentActivity::Responding);
            }
            DriveableEvent::ToolCall { .. } => {
                self.set_activity(AgentActivity::AwaitingToolResult);
            }
            DriveableEvent::ToolResult { output, .. } => {
                self.session
                    .append(Message::tool(output.to_string()));
                self.set_activity(AgentActivity::Thinking);
            }
            DriveableEvent::MessageStop => {
                self.session
                    .append(Message::assistant(std::mem::take(reply)));
                self.set_activity(AgentActivity::Idle);
                self.persist_session().await;
            }
            DriveableEvent::Interrupted => {
                // Partial reply is discarded, not recorded.
                reply.clear();
                self.set_activity(AgentActivity::Idle);
                self.persist_session().await;
            }
        }
    }

    fn set_activity(&self, activity: AgentActivity) {
        *self.activity.lock() = activity;
    }

    async fn persist_session(&self) {
        if let Err(error) = self.repository.save_session(&self.session.record()).await {
            warn!(
                agent_id = %self.agent_id,
                session_id = %self.session.session_id(),
                %error,
                "failed persisting session"
            );
        }
    }
}
