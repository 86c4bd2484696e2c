// Contact record and its merge rule
//
// Contacts are replicated between devices and peers with no coordinator, so
// every field merges as a join: applying the same remote record twice, or
// applying records in any order, ends in the same state.

use crate::identity::PeerId;
use serde::{Deserialize, Serialize};

/// Trust record for one peer identity.
///
/// `added` / `removed` are Unix seconds of the latest add and remove events.
/// `banned` only means something while the contact is inactive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub added: u64,
    #[serde(default)]
    pub removed: u64,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub banned: bool,
    /// One-to-one conversation bound to this contact, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl Contact {
    pub fn is_active(&self) -> bool {
        self.added > self.removed
    }

    pub fn is_banned(&self) -> bool {
        !self.is_active() && self.banned
    }

    /// Merge a remote view of the same contact into this one.
    ///
    /// Returns `true` when the merge changed whether the contact is active,
    /// banned, or confirmed; that is the signal for propagating the change
    /// or altering routing eligibility.
    pub fn update(&mut self, remote: &Contact) -> bool {
        let was_active = self.is_active();
        let was_banned = self.is_banned();
        let was_confirmed = self.confirmed;

        if remote.added > self.added {
            self.added = remote.added;
            self.conversation_id = remote.conversation_id.clone();
        } else if remote.added == self.added && remote.conversation_id > self.conversation_id {
            self.conversation_id = remote.conversation_id.clone();
        }

        // `removed` and `banned` always travel together. On equal removal
        // times the ban wins, which keeps the merge order-independent.
        if (remote.removed, remote.banned) > (self.removed, self.banned) {
            self.removed = remote.removed;
            self.banned = remote.banned;
        }

        self.confirmed |= remote.confirmed;

        was_active != self.is_active()
            || was_banned != self.is_banned()
            || was_confirmed != self.confirmed
    }

    /// Public view of this record, `None` for contacts that are neither
    /// active nor banned.
    pub fn details(&self, id: PeerId) -> Option<ContactDetails> {
        let status = if self.is_active() {
            ContactStatus::Active {
                confirmed: self.confirmed,
            }
        } else if self.is_banned() {
            ContactStatus::Banned
        } else {
            return None;
        };
        Some(ContactDetails {
            id,
            added: self.added,
            status,
            conversation_id: self.conversation_id.clone(),
        })
    }
}

/// Status reported for a listed contact. An active contact reports whether
/// it is confirmed, a banned contact reports only the ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactStatus {
    Active { confirmed: bool },
    Banned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetails {
    pub id: PeerId,
    pub added: u64,
    pub status: ContactStatus,
    pub conversation_id: Option<String>,
}

/// Pending invitation from a peer that is not (yet) an active contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRequest {
    pub received: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub payload: Vec<u8>,
}
