//! Routing — bounded set of live peer links
//!
//! Each peer is placed in a bucket by the position of the highest bit in
//! which its identity differs from ours. Buckets hold a bounded number of
//! live links, so the table stays small while still covering the whole
//! identifier space.
//!
//! - [`RoutingTable`]: plain bucket bookkeeping and eviction decisions
//! - [`RoutingManager`]: locking, membership tracking and the `on_peer_change`
//!   notification

mod manager;
mod table;

pub use manager::{PeerChangeCallback, RoutingManager, DEFAULT_BUCKET_MAX_SIZE};
pub use table::{PeerChange, RoutedPeer, RoutingTable};
