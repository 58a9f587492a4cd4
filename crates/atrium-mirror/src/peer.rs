//! Server side of the mirror protocol: serves one channel against a
//! [`Runtime`].
//!
//! Inbound request events become runtime calls, answered by exactly one
//! response event (or `request_failed`) per request. Outbound, every bus
//! event except mirror-sourced ones is forwarded to the channel, so the
//! mirror sees lifecycle notifications and stream deltas as they happen.
//! Filtering on source is what keeps a mirror's own traffic from echoing
//! back to it as input.

use std::collections::HashMap;
use std::sync::Arc;

use atrium_bus::ExchangeHandle;
use atrium_protocol::{
    AgentId, EventContext, EventKind, EventSource, RequestId, RuntimeError, RuntimeResult,
    SystemEvent,
};
use atrium_runtime::Runtime;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::channel::{Channel, ChannelState};

type InterruptRegistry = Arc<Mutex<HashMap<AgentId, ExchangeHandle>>>;

/// One served connection. Dropping the peer stops both pumps and detaches
/// the bus subscription.
pub struct Peer {
    _outbound_subscription: atrium_bus::Subscription,
    inbound: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl Peer {
    /// Connect the channel if necessary and start serving it.
    pub async fn serve(runtime: Arc<Runtime>, channel: Arc<dyn Channel>) -> RuntimeResult<Self> {
        if channel.state() == ChannelState::Stopped {
            channel.connect().await?;
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SystemEvent>();
        let outbound_subscription = runtime.bus().consumer().on_any(move |event| {
            if event.source != EventSource::Mirror {
                let _ = outbound_tx.send(event.clone());
            }
        });
        let forward_channel = Arc::clone(&channel);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                if forward_channel.send(&event).await.is_err() {
                    debug!("channel closed; outbound pump stopping");
                    break;
                }
            }
        });

        let interrupts: InterruptRegistry = Arc::new(Mutex::new(HashMap::new()));
        let mut subscription = channel.subscribe();
        let inbound_channel = Arc::clone(&channel);
        let inbound = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(event) => {
                        handle_inbound(&runtime, &inbound_channel, &interrupts, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "peer fell behind on inbound events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Self {
            _outbound_subscription: outbound_subscription,
            inbound,
            forwarder,
        })
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.inbound.abort();
        self.forwarder.abort();
    }
}

#[instrument(skip_all, fields(tag = event.tag()))]
async fn handle_inbound(
    runtime: &Arc<Runtime>,
    channel: &Arc<dyn Channel>,
    interrupts: &InterruptRegistry,
    event: SystemEvent,
) {
    let context = event.context.clone();
    let Some(request_id) = event.request_id.clone() else {
        // Every mirror request carries a correlation id; anything else is
        // not addressed to us.
        return;
    };

    match event.kind {
        EventKind::ContainerCreateRequest { container_id } => {
            let result = runtime
                .create_container(container_id)
                .await
                .map(|container| EventKind::ContainerCreateResponse {
                    record: container.record(),
                });
            respond(channel, request_id, context, result).await;
        }
        EventKind::AgentRunRequest {
            container_id,
            config,
        } => {
            let result = runtime
                .run_agent(&container_id, config)
                .await
                .map(|agent| EventKind::AgentRunResponse {
                    descriptor: agent.descriptor(),
                });
            respond(channel, request_id, context, result).await;
        }
        EventKind::AgentDestroyRequest {
            container_id,
            agent_id,
        } => {
            let removed = runtime.destroy_agent(&container_id, &agent_id).await;
            respond(
                channel,
                request_id,
                context,
                Ok(EventKind::AgentDestroyed {
                    container_id,
                    agent_id,
                    removed,
                }),
            )
            .await;
        }
        EventKind::AgentStopRequest {
            container_id,
            agent_id,
        } => {
            let result = runtime
                .agent(&container_id, &agent_id)
                .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.clone()))
                .and_then(|agent| agent.stop())
                .map(|()| EventKind::AgentStopped {
                    container_id,
                    agent_id,
                });
            respond(channel, request_id, context, result).await;
        }
        EventKind::AgentResumeRequest {
            container_id,
            agent_id,
        } => {
            let result = runtime
                .agent(&container_id, &agent_id)
                .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.clone()))
                .and_then(|agent| agent.resume())
                .map(|()| EventKind::AgentResumed {
                    container_id,
                    agent_id,
                });
            respond(channel, request_id, context, result).await;
        }
        EventKind::ImageSnapshotRequest {
            container_id,
            agent_id,
            name,
            description,
        } => {
            let result = runtime
                .snapshot_agent(&container_id, &agent_id, name, description)
                .await
                .map(|image| EventKind::ImageSnapshotResponse { image });
            respond(channel, request_id, context, result).await;
        }
        EventKind::ImagesListRequest => {
            let result = runtime
                .list_images()
                .await
                .map(|images| EventKind::ImagesListResponse { images });
            respond(channel, request_id, context, result).await;
        }
        EventKind::ImageGetRequest { image_id } => {
            let result = runtime
                .get_image(&image_id)
                .await
                .map(|image| EventKind::ImageGetResponse { image });
            respond(channel, request_id, context, result).await;
        }
        EventKind::ImageDeleteRequest { image_id } => {
            // Fire-and-forget: only failures are answered.
            if let Err(error) = runtime.delete_image(&image_id).await {
                respond(channel, request_id, context, Err(error)).await;
            }
        }
        EventKind::ImageResumeRequest { image_id } => {
            let result = runtime
                .resume_image(&image_id)
                .await
                .map(|agent| EventKind::ImageResumeResponse {
                    descriptor: agent.descriptor(),
                });
            respond(channel, request_id, context, result).await;
        }
        EventKind::UserMessage { content } => {
            if let Err(error) = open_exchange(runtime, interrupts, &context, content) {
                respond(channel, request_id, context, Err(error)).await;
            }
        }
        EventKind::InterruptRequest => {
            let handle = context
                .agent_id
                .as_ref()
                .and_then(|agent_id| interrupts.lock().get(agent_id).cloned());
            if let Some(handle) = handle {
                handle.interrupt();
            }
        }
        _ => {}
    }
}

/// Open one exchange on behalf of the mirror and drive it in the
/// background. The stream deltas reach the mirror through the outbound
/// pump; the peer only has to keep the exchange moving and remember its
/// interrupt handle.
fn open_exchange(
    runtime: &Arc<Runtime>,
    interrupts: &InterruptRegistry,
    context: &EventContext,
    content: String,
) -> RuntimeResult<()> {
    let (Some(container_id), Some(agent_id)) = (&context.container_id, &context.agent_id) else {
        return Err(RuntimeError::RequestFailed(
            "user_message requires container and agent context".to_owned(),
        ));
    };
    let agent = runtime
        .agent(container_id, agent_id)
        .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.clone()))?;

    let mut exchange = agent.send_message(content)?;
    interrupts
        .lock()
        .insert(agent_id.clone(), exchange.handle.clone());

    let registry = Arc::clone(interrupts);
    let agent_id = agent_id.clone();
    let exchange_id = exchange.request_id.clone();
    tokio::spawn(async move {
        while let Some(item) = exchange.events.next().await {
            if let Err(error) = item {
                debug!(agent_id = %agent_id, %error, "exchange ended with error");
            }
        }
        let mut registry = registry.lock();
        // A newer exchange may already have replaced this entry.
        if registry
            .get(&agent_id)
            .is_some_and(|handle| handle.request_id() == &exchange_id)
        {
            registry.remove(&agent_id);
        }
    });
    Ok(())
}

async fn respond(
    channel: &Arc<dyn Channel>,
    request_id: RequestId,
    context: EventContext,
    result: RuntimeResult<EventKind>,
) {
    let kind = match result {
        Ok(kind) => kind,
        Err(error) => EventKind::RequestFailed {
            message: error.to_string(),
        },
    };
    let response = SystemEvent::response(request_id, context, kind);
    if let Err(error) = channel.send(&response).await {
        warn!(%error, "failed sending response");
    }
}
