//! Bidirectional event channels between a runtime and its mirrors.

use async_trait::async_trait;
use atrium_protocol::{RuntimeError, RuntimeResult, SystemEvent};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Connection state machine: `stopped → starting → listening → stopping`,
/// then back to `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

/// One bidirectional message channel carrying serialized [`SystemEvent`]s.
///
/// `send` requires the channel to be listening; `subscribe` may be called
/// any number of times, each receiver observing events from subscription
/// onward.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn connect(&self) -> RuntimeResult<()>;
    async fn send(&self, event: &SystemEvent) -> RuntimeResult<()>;
    fn subscribe(&self) -> broadcast::Receiver<SystemEvent>;
    async fn close(&self) -> RuntimeResult<()>;
    fn state(&self) -> ChannelState;
}

const CHANNEL_CAPACITY: usize = 256;

/// In-process channel pair: what one side sends, the other receives.
///
/// Used by tests and by same-process mirrors; network transports implement
/// [`Channel`] over their own socket.
pub struct LocalChannel {
    outbound: broadcast::Sender<SystemEvent>,
    inbound: broadcast::Sender<SystemEvent>,
    state: Mutex<ChannelState>,
}

impl LocalChannel {
    /// Two crossed halves of one in-process connection.
    pub fn pair() -> (LocalChannel, LocalChannel) {
        let (a_to_b, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (b_to_a, _) = broadcast::channel(CHANNEL_CAPACITY);
        (
            LocalChannel {
                outbound: a_to_b.clone(),
                inbound: b_to_a.clone(),
                state: Mutex::new(ChannelState::Stopped),
            },
            LocalChannel {
                outbound: b_to_a,
                inbound: a_to_b,
                state: Mutex::new(ChannelState::Stopped),
            },
        )
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn connect(&self) -> RuntimeResult<()> {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Stopped {
                return Err(RuntimeError::InvalidChannelState(format!(
                    "connect from {:?}",
                    *state
                )));
            }
            *state = ChannelState::Starting;
        }
        // No handshake for the in-process pair.
        *self.state.lock() = ChannelState::Listening;
        debug!("local channel listening");
        Ok(())
    }

    async fn send(&self, event: &SystemEvent) -> RuntimeResult<()> {
        if *self.state.lock() != ChannelState::Listening {
            return Err(RuntimeError::ChannelClosed);
        }
        // A send with no live receiver is not an error: events are lossy
        // by contract and the mirror reconciles from later responses.
        let _ = self.outbound.send(event.clone());
        Ok(())
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
        *self.state.lock() = ChannelState::Stopped;
        debug!("local channel closed");
        Ok(())
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }
}
