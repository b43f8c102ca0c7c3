//! Pure data: identities, room members, wire frames and session states.

pub mod frame;
pub mod identity;
pub mod member;
pub mod session;
