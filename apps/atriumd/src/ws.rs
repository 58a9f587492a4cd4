//! WebSocket-backed [`Channel`]: JSON-serialized `SystemEvent` text frames.

use async_trait::async_trait;
use atrium_mirror::{Channel, ChannelState};
use atrium_protocol::{RuntimeError, RuntimeResult, SystemEvent};
use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// One accepted WebSocket connection, adapted to the channel contract.
///
/// The socket's read half is pumped by the accept handler, which feeds
/// frames into `inbound`; this type owns only the write half.
pub struct WsChannel {
    outbound: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    inbound: broadcast::Sender<SystemEvent>,
    state: Mutex<ChannelState>,
}

impl WsChannel {
    pub fn new(
        outbound: SplitSink<WebSocket, Message>,
        inbound: broadcast::Sender<SystemEvent>,
    ) -> Self {
        Self {
            outbound: tokio::sync::Mutex::new(outbound),
            inbound,
            state: Mutex::new(ChannelState::Stopped),
        }
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn connect(&self) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        if *state != ChannelState::Stopped {
            return Err(RuntimeError::InvalidChannelState(format!(
                "connect from {:?}",
                *state
            )));
        }
        // The socket is already upgraded by the time the channel exists.
        *state = ChannelState::Listening;
        Ok(())
    }

    async fn send(&self, event: &SystemEvent) -> RuntimeResult<()> {
        if *self.state.lock() != ChannelState::Listening {
            return Err(RuntimeError::ChannelClosed);
        }
        let payload =
            serde_json::to_string(event).map_err(|error| RuntimeError::RequestFailed(error.to_string()))?;
        self.outbound
            .lock()
            .await
            .send(Message::Text(payload.into()))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }

    fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.inbound.subscribe()
    }

    async fn close(&self) -> RuntimeResult<()> {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Listening {
                return Err(RuntimeError::InvalidChannelState(format!(
                    "close from {:?}",
                    *state
                )));
            }
            *state = ChannelState::Stopping;
        }
        let _ = self.outbound.lock().await.send(Message::Close(None)).await;
        *self.state.lock() = ChannelState::Stopped;
        Ok(())
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }
}
