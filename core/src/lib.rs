// SwarmLink Core — peer connectivity for swarm conversations
//
// Decides which peers we trust, which of them we keep live links to, and
// how to reach the ones that are only reachable through a relay.

pub mod config;
pub mod contacts;
pub mod identity;
pub mod logging;
pub mod relay;
pub mod routing;
pub mod store;

pub use config::{CoreConfig, RelayConfig, RoutingConfig};
pub use contacts::{Contact, ContactEvents, ContactStatus, ContactsError, ContactsManager};
pub use identity::{IdentityError, IdentityKeys, PeerId};
pub use relay::{PeerConnectionMode, RelayError, RelayHandlers, RelayState, RelayTransport, RelayTransportParams};
pub use routing::{RoutingManager, DEFAULT_BUCKET_MAX_SIZE};
pub use store::{FileStorage, MemoryStorage, StorageBackend};
