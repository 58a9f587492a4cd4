//! Adapts the bus's asynchronous event flow into the single linear
//! exchange an agent's message loop expects.
//!
//! One call to [`BusDriver::drive`] is one exchange: the driver subscribes
//! *before* emitting the outbound `user_message` (so deltas arriving early
//! wait in the queue), then yields environment-sourced stream events until
//! a terminal `message_stop`/`interrupted` arrives, the caller interrupts,
//! or the inactivity timeout fires. The bus subscription is released on
//! every exit path because the guard lives inside the stream closure.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use atrium_protocol::{
    DriveableEvent, EventContext, EventKind, EventSource, RequestId, RuntimeError, RuntimeResult,
    SystemEvent,
};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::{debug, instrument};

use crate::bus::{BusConsumer, BusProducer};
use crate::queue::{AbortSignal, event_queue};

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Inactivity window; the timer resets on every received event.
    pub idle_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(30_000),
        }
    }
}

/// One in-flight exchange: its correlation id, an interrupt handle, and
/// the finite, non-restartable event sequence.
pub struct Exchange {
    pub request_id: RequestId,
    pub handle: ExchangeHandle,
    pub events: BoxStream<'static, RuntimeResult<DriveableEvent>>,
}

/// Best-effort cancellation for an exchange.
#[derive(Clone)]
pub struct ExchangeHandle {
    request_id: RequestId,
    context: EventContext,
    signal: Arc<AbortSignal>,
    producer: BusProducer,
}

impl ExchangeHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Abort the exchange (the queue closes immediately, waking a parked
    /// consumer and discarding further events) and ask the environment to
    /// cancel the in-flight backend call.
    pub fn interrupt(&self) {
        if self.signal.abort() {
            return;
        }
        debug!(request_id = %self.request_id, "exchange interrupted");
        self.producer.emit(&SystemEvent::request(
            EventSource::Agent,
            self.request_id.clone(),
            self.context.clone(),
            EventKind::InterruptRequest,
        ));
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }
}

/// Per-agent adapter between the bus and a linear message loop.
#[derive(Clone)]
pub struct BusDriver {
    producer: BusProducer,
    consumer: BusConsumer,
    config: DriverConfig,
}

impl BusDriver {
    pub fn new(producer: BusProducer, consumer: BusConsumer, config: DriverConfig) -> Self {
        Self {
            producer,
            consumer,
            config,
        }
    }

    /// Open one exchange for `content` scoped to `context`.
    #[instrument(skip(self, content), fields(agent_id = ?context.agent_id))]
    pub fn drive(&self, context: EventContext, content: impl Into<String>) -> Exchange {
        let request_id = RequestId::new_uuid();
        let signal = Arc::new(AbortSignal::new());
        let (queue_tx, mut queue_rx) = event_queue(Arc::clone(&signal));

        // Subscribe before emitting so a backend that answers faster than
        // the consumer starts pulling cannot lose its first deltas.
        let correlation = request_id.clone();
        let subscription = self.consumer.on_any(move |event| {
            if event.request_id.as_ref() != Some(&correlation) {
                return;
            }
            // from_event enforces the environment-source allow-list; the
            // user_message we emitted ourselves falls through here.
            if let Some(delta) = DriveableEvent::from_event(event) {
                queue_tx.push(delta);
            }
        });

        self.producer.emit(&SystemEvent::user_message(
            EventSource::Agent,
            request_id.clone(),
            context.clone(),
            content.into(),
        ));

        let handle = ExchangeHandle {
            request_id: request_id.clone(),
            context,
            signal,
            producer: self.producer.clone(),
        };

        let idle_timeout = self.config.idle_timeout;
        let exchange_id = request_id.clone();
        let events = stream! {
            let _subscription = subscription;
            loop {
                if queue_rx.is_aborted() {
                    debug!(request_id = %exchange_id, "exchange closed after abort");
                    break;
                }
                match tokio::time::timeout(idle_timeout, queue_rx.pop()).await {
                    Err(_) => {
                        debug!(request_id = %exchange_id, ?idle_timeout, "exchange idle timeout");
                        yield Err(RuntimeError::ExchangeTimeout(idle_timeout));
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(event)) => {
                        let terminal = event.is_terminal();
                        yield Ok(event);
                        if terminal {
                            break;
                        }
                    }
                }
            }
        }
        .boxed();

        Exchange {
            request_id,
            handle,
            events,
        }
    }
}
