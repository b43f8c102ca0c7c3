pub mod codec;
pub mod loopback;
pub mod membership;
pub mod quic;
pub mod recording;
