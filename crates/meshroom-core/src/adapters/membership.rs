//! In-memory [`Membership`] adapter.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::application::ports::Membership;
use crate::domain::identity::PeerIdentity;
use crate::domain::member::RoomMember;

/// Simple in-memory member map, ordered by identity.
pub struct InMemoryMembership {
    members: Mutex<BTreeMap<PeerIdentity, RoomMember>>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl Membership for InMemoryMembership {
    fn members(&self) -> Vec<RoomMember> {
        self.members.lock().unwrap().values().cloned().collect()
    }

    fn get(&self, id: &PeerIdentity) -> Option<RoomMember> {
        self.members.lock().unwrap().get(id).cloned()
    }

    fn upsert(&self, member: RoomMember) -> Option<RoomMember> {
        self.members
            .lock()
            .unwrap()
            .insert(member.id.clone(), member)
    }

    fn insert_if_absent(&self, member: RoomMember) -> bool {
        let mut members = self.members.lock().unwrap();
        if members.contains_key(&member.id) {
            return false;
        }
        members.insert(member.id.clone(), member);
        true
    }

    fn remove(&self, id: &PeerIdentity) -> Option<RoomMember> {
        self.members.lock().unwrap().remove(id)
    }

    fn clear(&self) {
        self.members.lock().unwrap().clear();
    }
}
