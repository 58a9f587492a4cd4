//! Network mirroring for the atrium runtime.
//!
//! A [`Peer`] serves one [`Channel`] against a server-side runtime; a
//! [`MirrorRuntime`] on the other end reconstructs the runtime's object
//! graph from responses and forwarded notifications. [`LocalChannel`]
//! provides an in-process transport for tests and same-process mirrors.

pub mod channel;
pub mod mirror;
pub mod peer;

pub use channel::{Channel, ChannelState, LocalChannel};
pub use mirror::{MirrorAgent, MirrorConfig, MirrorContainer, MirrorImage, MirrorRuntime};
pub use peer::Peer;
