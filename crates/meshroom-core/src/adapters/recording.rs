//! [`RoomEvents`] sink that remembers every callback, for tests and for
//! headless embedding.

use std::sync::Mutex;

use crate::application::ports::RoomEvents;
use crate::domain::identity::PeerIdentity;
use crate::domain::member::ChatMessage;
use crate::domain::session::SessionState;
use crate::error::{ErrorKind, SessionError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Join { peer: PeerIdentity, display_name: String },
    Leave { peer: PeerIdentity },
    Message { message: ChatMessage, from: PeerIdentity },
    Error(SessionError),
    State(SessionState),
}

#[derive(Default)]
pub struct RecordingEvents {
    log: Mutex<Vec<Recorded>>,
}

impl RecordingEvents {
    pub fn all(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn joins(&self) -> Vec<(PeerIdentity, String)> {
        self.filter(|r| match r {
            Recorded::Join { peer, display_name } => Some((peer.clone(), display_name.clone())),
            _ => None,
        })
    }

    pub fn leaves(&self) -> Vec<PeerIdentity> {
        self.filter(|r| match r {
            Recorded::Leave { peer } => Some(peer.clone()),
            _ => None,
        })
    }

    pub fn messages(&self) -> Vec<(ChatMessage, PeerIdentity)> {
        self.filter(|r| match r {
            Recorded::Message { message, from } => Some((message.clone(), from.clone())),
            _ => None,
        })
    }

    pub fn errors(&self) -> Vec<ErrorKind> {
        self.filter(|r| match r {
            Recorded::Error(e) => Some(e.kind()),
            _ => None,
        })
    }

    pub fn states(&self) -> Vec<SessionState> {
        self.filter(|r| match r {
            Recorded::State(s) => Some(*s),
            _ => None,
        })
    }

    fn filter<T>(&self, f: impl Fn(&Recorded) -> Option<T>) -> Vec<T> {
        self.log.lock().unwrap().iter().filter_map(f).collect()
    }

    fn push(&self, entry: Recorded) {
        self.log.lock().unwrap().push(entry);
    }
}

impl RoomEvents for RecordingEvents {
    fn on_join(&self, peer: &PeerIdentity, display_name: &str) {
        self.push(Recorded::Join {
            peer: peer.clone(),
            display_name: display_name.to_owned(),
        });
    }

    fn on_leave(&self, peer: &PeerIdentity) {
        self.push(Recorded::Leave { peer: peer.clone() });
    }

    fn on_message(&self, message: &ChatMessage, from: &PeerIdentity) {
        self.push(Recorded::Message {
            message: message.clone(),
            from: from.clone(),
        });
    }

    fn on_error(&self, error: &SessionError) {
        self.push(Recorded::Error(error.clone()));
    }

    fn on_state_change(&self, state: SessionState) {
        self.push(Recorded::State(state));
    }
}
