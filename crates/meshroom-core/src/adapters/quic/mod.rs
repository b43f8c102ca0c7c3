//! QUIC (Quinn) transport: peer endpoint, signaling server and their shared
//! wire format.

pub mod codec;
pub mod peer;
pub mod signaling;
pub mod tls;

pub use peer::{QuicConnector, QuicPeerTransport};
pub use signaling::SignalingServer;
