// Contacts manager — per-account trust ledger
//
// Local actions (accept / block) and remote gossip both land here from
// different threads, so all state sits behind one mutex. Observers are
// notified after the lock is released.

use super::contact::{Contact, ContactDetails, TrustRequest};
use super::ContactsError;
use crate::identity::PeerId;
use crate::store::StorageBackend;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage key of the contact map
pub const CONTACTS_KEY: &str = "contacts";
/// Storage key of pending incoming trust requests
pub const TRUST_REQUESTS_KEY: &str = "incoming_trust_requests";
/// Upper bound of trust requests shipped in one sync payload
pub const MAX_SYNC_TRUST_REQUESTS: usize = 20;

/// Observer for contact state changes
#[cfg_attr(test, mockall::automock)]
pub trait ContactEvents: Send + Sync {
    fn contact_added(&self, peer: &PeerId, confirmed: bool);
    fn contact_removed(&self, peer: &PeerId, banned: bool);
    fn trust_request(
        &self,
        peer: &PeerId,
        conversation_id: Option<String>,
        payload: Vec<u8>,
        received: u64,
    );
    fn confirmation(&self, peer: &PeerId, conversation_id: Option<String>);
}

/// Contact state exchanged between devices of the same account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactsSync {
    pub date: u64,
    pub peers: BTreeMap<PeerId, Contact>,
    #[serde(default)]
    pub trust_requests: BTreeMap<PeerId, TrustRequest>,
}

enum Notification {
    Added(PeerId, bool),
    Removed(PeerId, bool),
    TrustRequest(PeerId, Option<String>, Vec<u8>, u64),
    Confirmation(PeerId, Option<String>),
}

#[derive(Default)]
struct Ledger {
    contacts: BTreeMap<PeerId, Contact>,
    trust_requests: BTreeMap<PeerId, TrustRequest>,
}

impl Ledger {
    /// Apply the merge rule and queue the resulting notification
    fn merge(
        &mut self,
        peer: PeerId,
        remote: &Contact,
        notes: &mut Vec<Notification>,
    ) -> (bool, Contact) {
        let entry = self.contacts.entry(peer).or_default();
        let changed = entry.update(remote);
        let merged = entry.clone();
        if changed {
            self.trust_requests.remove(&peer);
            if merged.is_active() {
                notes.push(Notification::Added(peer, merged.confirmed));
            } else {
                notes.push(Notification::Removed(peer, merged.banned));
            }
        }
        (changed, merged)
    }
}

pub struct ContactsManager {
    storage: Arc<dyn StorageBackend>,
    ledger: Mutex<Ledger>,
    events: RwLock<Option<Arc<dyn ContactEvents>>>,
}

impl ContactsManager {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            ledger: Mutex::new(Ledger::default()),
            events: RwLock::new(None),
        }
    }

    /// Register the observer for contact changes (replaces any previous one)
    pub fn set_event_handler(&self, events: Arc<dyn ContactEvents>) {
        *self.events.write() = Some(events);
    }

    // ------------------------------------------------------------------------
    // LOCAL MUTATIONS
    // ------------------------------------------------------------------------

    /// Add (or re-add) a contact. Idempotent for an already active contact
    /// with the same confirmation state.
    pub fn add_contact(&self, peer: &PeerId, confirmed: bool) -> Contact {
        self.add_contact_inner(peer, confirmed, None)
    }

    /// Add a contact and bind its one-to-one conversation
    pub fn add_contact_in_conversation(
        &self,
        peer: &PeerId,
        confirmed: bool,
        conversation_id: &str,
    ) -> Contact {
        self.add_contact_inner(peer, confirmed, Some(conversation_id))
    }

    fn add_contact_inner(
        &self,
        peer: &PeerId,
        confirmed: bool,
        conversation_id: Option<&str>,
    ) -> Contact {
        let contact = {
            let mut ledger = self.ledger.lock();
            let contact = ledger.contacts.entry(*peer).or_default();
            let same_conversation = conversation_id
                .map_or(true, |id| contact.conversation_id.as_deref() == Some(id));
            if contact.is_active() && contact.confirmed == confirmed && same_conversation {
                return contact.clone();
            }
            contact.added = current_timestamp();
            // A re-add within the same second as the removal must still be active
            contact.removed = 0;
            contact.banned = false;
            contact.confirmed |= confirmed;
            if let Some(id) = conversation_id {
                contact.conversation_id = Some(id.to_string());
            }
            contact.clone()
        };

        info!(peer = %peer, confirmed = contact.confirmed, "Contact added");
        self.notify(vec![Notification::Added(*peer, contact.confirmed)]);
        contact
    }

    /// Remove a contact, optionally banning it. No-op if already inactive
    /// with the same ban state.
    pub fn remove_contact(&self, peer: &PeerId, ban: bool) -> Contact {
        let contact = {
            let mut ledger = self.ledger.lock();
            let contact = ledger.contacts.entry(*peer).or_default();
            if !contact.is_active() && contact.removed != 0 && contact.banned == ban {
                return contact.clone();
            }
            // Never move `removed` backwards, even past a skewed remote clock
            contact.removed = current_timestamp()
                .max(contact.added)
                .max(contact.removed.saturating_add(1));
            contact.banned = ban;
            let contact = contact.clone();
            if ledger.trust_requests.remove(peer).is_some() {
                debug!(peer = %peer, "Dropped pending trust request of removed contact");
            }
            contact
        };

        info!(peer = %peer, banned = ban, "Contact removed");
        self.notify(vec![Notification::Removed(*peer, ban)]);
        contact
    }

    /// Merge a remote view of a contact. Returns whether the merge changed
    /// the contact's active / banned / confirmed state, and the merged record.
    pub fn update_contact(&self, peer: &PeerId, remote: &Contact) -> (bool, Contact) {
        let mut notes = Vec::new();
        let result = self.ledger.lock().merge(*peer, remote, &mut notes);
        if result.0 {
            debug!(peer = %peer, active = result.1.is_active(), banned = result.1.is_banned(), "Contact state changed by merge");
        }
        self.notify(notes);
        result
    }

    // ------------------------------------------------------------------------
    // QUERIES
    // ------------------------------------------------------------------------

    /// Active and banned contacts
    pub fn get_contacts(&self) -> Vec<ContactDetails> {
        self.ledger
            .lock()
            .contacts
            .iter()
            .filter_map(|(id, contact)| contact.details(*id))
            .collect()
    }

    /// Raw record for a peer, whatever its state
    pub fn contact(&self, peer: &PeerId) -> Option<Contact> {
        self.ledger.lock().contacts.get(peer).cloned()
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.ledger
            .lock()
            .contacts
            .get(peer)
            .map_or(false, Contact::is_banned)
    }

    /// Drop banned identities from a candidate list
    pub fn filter_routable(&self, peers: impl IntoIterator<Item = PeerId>) -> Vec<PeerId> {
        let ledger = self.ledger.lock();
        peers
            .into_iter()
            .filter(|peer| !ledger.contacts.get(peer).map_or(false, Contact::is_banned))
            .collect()
    }

    // ------------------------------------------------------------------------
    // TRUST REQUESTS
    // ------------------------------------------------------------------------

    /// Handle an incoming trust request. Returns `true` when a confirmation
    /// should be sent back to the peer.
    pub fn on_trust_request(
        &self,
        peer: &PeerId,
        received: u64,
        confirm: bool,
        conversation_id: Option<String>,
        payload: Vec<u8>,
    ) -> bool {
        let mut notes = Vec::new();
        let mut accept = false;
        let mut active = false;
        {
            let mut ledger = self.ledger.lock();
            if let Some(contact) = ledger.contacts.get_mut(peer) {
                if contact.is_banned() {
                    debug!(peer = %peer, "Discarding trust request from banned peer");
                    return false;
                }
                if contact.is_active() {
                    active = true;
                    accept = !confirm;
                    if !contact.confirmed {
                        contact.confirmed = true;
                        notes.push(Notification::Added(*peer, true));
                    }
                }
            }
            if !active {
                match ledger.trust_requests.entry(*peer) {
                    Entry::Vacant(slot) => {
                        slot.insert(TrustRequest {
                            received,
                            conversation_id: conversation_id.clone(),
                            payload: payload.clone(),
                        });
                    }
                    Entry::Occupied(mut slot) => {
                        if received < slot.get().received {
                            let existing = slot.get_mut();
                            existing.received = received;
                            existing.payload = payload.clone();
                        } else {
                            debug!(peer = %peer, "Ignoring outdated trust request");
                        }
                    }
                }
            }
        }

        if !confirm {
            notes.push(Notification::TrustRequest(
                *peer,
                conversation_id,
                payload,
                received,
            ));
        } else if active {
            notes.push(Notification::Confirmation(*peer, conversation_id));
        }
        self.notify(notes);
        accept
    }

    pub fn trust_requests(&self) -> Vec<(PeerId, TrustRequest)> {
        self.ledger
            .lock()
            .trust_requests
            .iter()
            .map(|(peer, request)| (*peer, request.clone()))
            .collect()
    }

    pub fn trust_request(&self, peer: &PeerId) -> Option<TrustRequest> {
        self.ledger.lock().trust_requests.get(peer).cloned()
    }

    /// Accept a pending request: the peer becomes a confirmed contact
    pub fn accept_trust_request(&self, peer: &PeerId) -> bool {
        let request = self.ledger.lock().trust_requests.remove(peer);
        match request {
            Some(request) => {
                match request.conversation_id {
                    Some(id) => self.add_contact_in_conversation(peer, true, &id),
                    None => self.add_contact(peer, true),
                };
                true
            }
            None => false,
        }
    }

    pub fn discard_trust_request(&self, peer: &PeerId) -> bool {
        self.ledger.lock().trust_requests.remove(peer).is_some()
    }

    // ------------------------------------------------------------------------
    // SYNC
    // ------------------------------------------------------------------------

    /// Snapshot to gossip to the account's other devices
    pub fn sync_data(&self) -> ContactsSync {
        let ledger = self.ledger.lock();
        let strip = |request: &TrustRequest| TrustRequest {
            received: request.received,
            conversation_id: request.conversation_id.clone(),
            payload: Vec::new(),
        };

        let trust_requests = if ledger.trust_requests.len() <= MAX_SYNC_TRUST_REQUESTS {
            ledger
                .trust_requests
                .iter()
                .map(|(peer, request)| (*peer, strip(request)))
                .collect()
        } else {
            // Rotate the starting point so every request is eventually shipped
            let start = PeerId::random();
            ledger
                .trust_requests
                .range(start..)
                .chain(ledger.trust_requests.range(..start))
                .take(MAX_SYNC_TRUST_REQUESTS)
                .map(|(peer, request)| (*peer, strip(request)))
                .collect()
        };

        ContactsSync {
            date: current_timestamp(),
            peers: ledger.contacts.clone(),
            trust_requests,
        }
    }

    /// Merge a snapshot received from another device. Returns the number of
    /// contacts whose state changed.
    pub fn apply_sync(&self, sync: &ContactsSync) -> usize {
        let mut changed = 0;
        for (peer, contact) in &sync.peers {
            if self.update_contact(peer, contact).0 {
                changed += 1;
            }
        }
        for (peer, request) in &sync.trust_requests {
            let known = self.ledger.lock().contacts.contains_key(peer);
            if !known {
                self.on_trust_request(
                    peer,
                    request.received,
                    false,
                    request.conversation_id.clone(),
                    request.payload.clone(),
                );
            }
        }
        changed
    }

    // ------------------------------------------------------------------------
    // PERSISTENCE
    // ------------------------------------------------------------------------

    /// Load contacts and trust requests from storage
    pub fn load(&self) -> usize {
        let loaded = self.load_contacts();
        self.load_trust_requests();
        loaded
    }

    /// Persist contacts and trust requests
    pub fn save(&self) -> Result<(), ContactsError> {
        self.save_contacts()?;
        self.save_trust_requests()
    }

    /// Merge every persisted contact into the ledger. A missing or corrupt
    /// file counts as an empty set. Returns the number of records read.
    pub fn load_contacts(&self) -> usize {
        let contacts: BTreeMap<PeerId, Contact> = match self.read_json(CONTACTS_KEY) {
            Ok(Some(contacts)) => contacts,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "Error loading contacts");
                return 0;
            }
        };

        let count = contacts.len();
        for (peer, contact) in &contacts {
            self.update_contact(peer, contact);
        }
        info!(count, "Loaded contacts");
        count
    }

    pub fn save_contacts(&self) -> Result<(), ContactsError> {
        let data = {
            let ledger = self.ledger.lock();
            serde_json::to_vec(&ledger.contacts)
                .map_err(|e| ContactsError::Serialization(e.to_string()))?
        };
        self.storage
            .put(CONTACTS_KEY, &data)
            .map_err(ContactsError::Storage)?;
        self.storage.flush().map_err(ContactsError::Storage)
    }

    pub fn load_trust_requests(&self) -> usize {
        let requests: BTreeMap<PeerId, TrustRequest> = match self.read_json(TRUST_REQUESTS_KEY)
        {
            Ok(Some(requests)) => requests,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "Error loading trust requests");
                return 0;
            }
        };

        let count = requests.len();
        for (peer, request) in requests {
            self.on_trust_request(
                &peer,
                request.received,
                false,
                request.conversation_id,
                request.payload,
            );
        }
        count
    }

    pub fn save_trust_requests(&self) -> Result<(), ContactsError> {
        let data = {
            let ledger = self.ledger.lock();
            serde_json::to_vec(&ledger.trust_requests)
                .map_err(|e| ContactsError::Serialization(e.to_string()))?
        };
        self.storage
            .put(TRUST_REQUESTS_KEY, &data)
            .map_err(ContactsError::Storage)?;
        self.storage.flush().map_err(ContactsError::Storage)
    }

    fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, ContactsError> {
        let Some(data) = self.storage.get(key).map_err(ContactsError::Storage)? else {
            return Ok(None);
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| ContactsError::Serialization(e.to_string()))
    }

    fn notify(&self, notes: Vec<Notification>) {
        if notes.is_empty() {
            return;
        }
        let Some(events) = self.events.read().clone() else {
            return;
        };
        for note in notes {
            match note {
                Notification::Added(peer, confirmed) => events.contact_added(&peer, confirmed),
                Notification::Removed(peer, banned) => events.contact_removed(&peer, banned),
                Notification::TrustRequest(peer, conversation_id, payload, received) => {
                    events.trust_request(&peer, conversation_id, payload, received)
                }
                Notification::Confirmation(peer, conversation_id) => {
                    events.confirmation(&peer, conversation_id)
                }
            }
        }
    }
}

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
