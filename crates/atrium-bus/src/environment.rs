//! The environment pair bridging the bus to a backend model stream.
//!
//! The [`Effector`] watches outbound `user_message` events and invokes the
//! backend; the [`Receptor`] stamps each backend delta with its exchange
//! correlation and emits it as an environment-sourced stream event. The
//! runtime depends only on this pair obeying the driveable vocabulary;
//! prompt construction and transport are the backend's business.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use atrium_protocol::{EventContext, EventKind, RequestId, SystemEvent};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bus::{BusConsumer, BusProducer, Subscription};

/// Correlation for one backend exchange.
#[derive(Debug, Clone)]
pub struct ExchangeScope {
    pub request_id: RequestId,
    pub context: EventContext,
}

/// Raw deltas a backend stream produces.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendDelta {
    MessageStart,
    TextDelta(String),
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

impl BackendDelta {
    fn into_kind(self) -> EventKind {
        match self {
            Self::MessageStart => EventKind::MessageStart,
            Self::TextDelta(delta) => EventKind::TextDelta { delta },
            Self::ToolCall { name, arguments } => EventKind::ToolCall { name, arguments },
            Self::ToolResult { name, output } => EventKind::ToolResult { name, output },
            Self::MessageStop => EventKind::MessageStop,
            Self::Interrupted => EventKind::Interrupted,
        }
    }
}

/// Opaque backend model adapter.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run one exchange and stream its deltas.
    async fn exchange(
        &self,
        scope: &ExchangeScope,
        prompt: String,
    ) -> anyhow::Result<BoxStream<'static, BackendDelta>>;

    /// Best-effort cancellation of an in-flight exchange.
    async fn cancel(&self, request_id: &RequestId);
}

/// Turns backend deltas into environment-sourced bus events.
#[derive(Clone)]
pub struct Receptor {
    producer: BusProducer,
}

impl Receptor {
    pub fn new(producer: BusProducer) -> Self {
        Self { producer }
    }

    pub fn emit_delta(&self, scope: &ExchangeScope, delta: BackendDelta) {
        self.producer.emit(&SystemEvent::stream_from_environment(
            scope.request_id.clone(),
            scope.context.clone(),
            delta.into_kind(),
        ));
    }

    /// Forward a backend failure as stream events rather than an
    /// exception: the error is observable, the exchange still terminates,
    /// and the agent stays usable for its next message.
    pub fn emit_error(&self, scope: &ExchangeScope, message: impl Into<String>) {
        self.producer.emit(&SystemEvent::stream_from_environment(
            scope.request_id.clone(),
            scope.context.clone(),
            EventKind::StreamError {
                message: message.into(),
            },
        ));
        self.emit_delta(scope, BackendDelta::MessageStop);
    }
}

/// Subscribes to outbound traffic and drives the backend.
///
/// Holding the `Effector` keeps its subscriptions alive; dropping it
/// detaches the environment from the bus.
pub struct Effector {
    _user_messages: Subscription,
    _interrupts: Subscription,
}

impl Effector {
    pub fn spawn(consumer: &BusConsumer, producer: BusProducer, backend: Arc<dyn Backend>) -> Self {
        let receptor = Receptor::new(producer);

        let exchange_backend = Arc::clone(&backend);
        let user_messages = consumer.on_tag("user_message", move |event| {
            let Some(request_id) = event.request_id.clone() else {
                return;
            };
            let EventKind::UserMessage { content } = &event.kind else {
                return;
            };
            let scope = ExchangeScope {
                request_id,
                context: event.context.clone(),
            };
            let backend = Arc::clone(&exchange_backend);
            let receptor = receptor.clone();
            let prompt = content.clone();
            tokio::spawn(async move {
                debug!(request_id = %scope.request_id, "starting backend exchange");
                match backend.exchange(&scope, prompt).await {
                    Ok(mut deltas) => {
                        while let Some(delta) = deltas.next().await {
                            receptor.emit_delta(&scope, delta);
                        }
                    }
                    Err(error) => {
                        warn!(request_id = %scope.request_id, %error, "backend exchange failed");
                        receptor.emit_error(&scope, error.to_string());
                    }
                }
            });
        });

        let cancel_backend = Arc::clone(&backend);
        let interrupts = consumer.on_tag("interrupt_request", move |event| {
            let Some(request_id) = event.request_id.clone() else {
                return;
            };
            let backend = Arc::clone(&cancel_backend);
            tokio::spawn(async move {
                backend.cancel(&request_id).await;
            });
        });

        Self {
            _user_messages: user_messages,
            _interrupts: interrupts,
        }
    }
}

/// Backend stub that replays configured delta sequences.
///
/// Each exchange consumes the next queued script, falling back to the
/// default reply. Useful for demos and deterministic tests.
pub struct ScriptedBackend {
    scripts: Mutex<Vec<Vec<BackendDelta>>>,
    default_reply: Vec<BackendDelta>,
    cancelled: Mutex<HashSet<RequestId>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::with_reply("ok")
    }

    /// A backend whose default exchange answers with one text delta.
    pub fn with_reply(text: impl Into<String>) -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            default_reply: vec![
                BackendDelta::MessageStart,
                BackendDelta::TextDelta(text.into()),
                BackendDelta::MessageStop,
            ],
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    /// Queue a one-shot script consumed by the next exchange.
    pub fn push_script(&self, deltas: Vec<BackendDelta>) {
        self.scripts.lock().push(deltas);
    }

    pub fn was_cancelled(&self, request_id: &RequestId) -> bool {
        self.cancelled.lock().contains(request_id)
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn exchange(
        &self,
        _scope: &ExchangeScope,
        _prompt: String,
    ) -> anyhow::Result<BoxStream<'static, BackendDelta>> {
        let deltas = {
            let mut scripts = self.scripts.lock();
            if scripts.is_empty() {
                self.default_reply.clone()
            } else {
                scripts.remove(0)
            }
        };
        Ok(futures_util::stream::iter(deltas).boxed())
    }

    async fn cancel(&self, request_id: &RequestId) {
        self.cancelled.lock().insert(request_id.clone());
    }
}
