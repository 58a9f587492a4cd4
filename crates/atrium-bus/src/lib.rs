//! Event bus plumbing for the atrium runtime.
//!
//! [`SystemBus`] is the shared synchronous hub; it splits into an
//! emit-only [`BusProducer`] and a subscribe-only [`BusConsumer`]. On top
//! of it, [`BusDriver`] turns the event flow into one linear exchange per
//! user message, and the [`Effector`]/[`Receptor`] pair connects the bus
//! to a [`Backend`] model adapter.

pub mod bus;
pub mod driver;
pub mod environment;
pub mod queue;

pub use bus::{BusConsumer, BusProducer, Subscription, SystemBus};
pub use driver::{BusDriver, DriverConfig, Exchange, ExchangeHandle};
pub use environment::{
    Backend, BackendDelta, Effector, ExchangeScope, Receptor, ScriptedBackend,
};
pub use queue::{AbortSignal, QueueReceiver, QueueSender, event_queue};
