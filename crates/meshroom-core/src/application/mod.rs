pub mod ports;

pub mod resilience;
pub mod room_protocol;
pub mod transport_session;
