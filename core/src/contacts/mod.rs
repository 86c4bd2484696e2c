//! Contacts — replicated trust ledger
//!
//! Tracks which peer identities are trusted, pending, or banned. Updates
//! arrive both from local user actions and from peers/devices gossiping their
//! own view; the merge rule in [`Contact::update`] makes the result
//! independent of arrival order.

mod contact;
mod manager;

pub use contact::{Contact, ContactDetails, ContactStatus, TrustRequest};
pub use manager::{
    ContactEvents, ContactsManager, ContactsSync, CONTACTS_KEY, MAX_SYNC_TRUST_REQUESTS,
    TRUST_REQUESTS_KEY,
};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ContactsError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}
