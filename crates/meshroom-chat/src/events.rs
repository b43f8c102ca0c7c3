//! TerminalEvents: implements the [`RoomEvents`] port by printing to stdout.

use meshroom_core::application::ports::RoomEvents;
use meshroom_core::domain::identity::PeerIdentity;
use meshroom_core::domain::member::ChatMessage;
use meshroom_core::domain::session::SessionState;
use meshroom_core::error::SessionError;

/// Bridges room events to the terminal.
#[derive(Debug, Default, Clone)]
pub struct TerminalEvents;

impl RoomEvents for TerminalEvents {
    fn on_join(&self, peer: &PeerIdentity, display_name: &str) {
        println!("* {display_name} joined ({peer})");
    }

    fn on_leave(&self, peer: &PeerIdentity) {
        println!("* {peer} left");
    }

    fn on_message(&self, message: &ChatMessage, _from: &PeerIdentity) {
        println!("<{}> {}", message.sender, message.content);
    }

    fn on_error(&self, error: &SessionError) {
        println!("! {error}");
    }

    fn on_state_change(&self, state: SessionState) {
        match state {
            SessionState::Failed => println!("* session failed; /retry or /restart"),
            other => println!("* {other}"),
        }
    }
}
