//! Peer link negotiation and the connection state machine.

pub mod client;
pub mod loopback;
pub mod peer;
pub mod state;
pub mod websocket;

pub use client::TransportClient;
pub use loopback::{LoopbackPeer, LoopbackRemote, LoopbackTransport};
pub use peer::{EventChannel, LinkMessage, PeerLink, PeerTransport};
pub use state::{ConnectionState, StateMachine};
pub use websocket::WebSocketTransport;
