// RoutingManager — thread-safe routing table with peer-change notifications
//
// All table mutations happen under one lock. Notifications are collected while
// the lock is held and delivered after it is released, in the order the table
// produced them, so a callback may safely call back into the manager.

use super::table::{PeerChange, RoutedPeer, RoutingTable};
use crate::config::RoutingConfig;
use crate::identity::PeerId;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of live links per bucket
pub const DEFAULT_BUCKET_MAX_SIZE: usize = 4;

/// Invoked with `(peer, true)` when a peer becomes routed and
/// `(peer, false)` when it stops being routed
pub type PeerChangeCallback = Arc<dyn Fn(&PeerId, bool) + Send + Sync>;

pub struct RoutingManager<T> {
    table: Mutex<RoutingTable<T>>,
    on_peer_change: RwLock<Option<PeerChangeCallback>>,
}

impl<T: Clone + Send> RoutingManager<T> {
    pub fn new(base: PeerId, bucket_max_size: usize) -> Self {
        Self {
            table: Mutex::new(RoutingTable::new(base, bucket_max_size)),
            on_peer_change: RwLock::new(None),
        }
    }

    pub fn from_config(base: PeerId, config: &RoutingConfig) -> Self {
        Self::new(base, config.bucket_max_size)
    }

    pub fn base(&self) -> PeerId {
        *self.table.lock().base()
    }

    pub fn bucket_max_size(&self) -> usize {
        self.table.lock().bucket_max_size()
    }

    /// Register the routing-change observer, replacing any previous one
    pub fn on_peer_change<F>(&self, callback: F)
    where
        F: Fn(&PeerId, bool) + Send + Sync + 'static,
    {
        *self.on_peer_change.write() = Some(Arc::new(callback));
    }

    fn notify(&self, changes: Vec<PeerChange>) {
        if changes.is_empty() {
            return;
        }
        let callback = self.on_peer_change.read().clone();
        if let Some(callback) = callback {
            for change in changes {
                callback(&change.peer, change.added);
            }
        }
    }

    // ------------------------------------------------------------------------
    // LIVE LINKS
    // ------------------------------------------------------------------------

    /// Add a live transport to the table. A new peer fires `(peer, true)`,
    /// preceded by `(victim, false)` if its bucket was full. Re-injecting a
    /// routed peer only refreshes it.
    pub fn inject_peer(&self, peer: PeerId, transport: T) {
        let changes = self.table.lock().inject(peer, transport);
        if !changes.is_empty() {
            debug!(peer = %peer, "Peer injected into routing table");
        }
        self.notify(changes);
    }

    pub fn inject_peers<I>(&self, peers: I)
    where
        I: IntoIterator<Item = (PeerId, T)>,
    {
        let changes = {
            let mut table = self.table.lock();
            peers
                .into_iter()
                .flat_map(|(peer, transport)| table.inject(peer, transport))
                .collect()
        };
        self.notify(changes);
    }

    /// Drop the live transport to `peer`. Fires `(peer, false)` only if it
    /// was routed.
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let removed = self.table.lock().remove(peer).is_some();
        if removed {
            debug!(peer = %peer, "Peer removed from routing table");
            self.notify(vec![PeerChange {
                peer: *peer,
                added: false,
            }]);
        }
        removed
    }

    pub fn remove_peers<'a, I>(&self, peers: I) -> usize
    where
        I: IntoIterator<Item = &'a PeerId>,
    {
        let changes: Vec<PeerChange> = {
            let mut table = self.table.lock();
            peers
                .into_iter()
                .filter(|peer| table.remove(peer).is_some())
                .map(|peer| PeerChange {
                    peer: *peer,
                    added: false,
                })
                .collect()
        };
        let count = changes.len();
        self.notify(changes);
        count
    }

    /// Mark a routed peer as recently used, protecting it from eviction
    pub fn record_activity(&self, peer: &PeerId) -> bool {
        self.table.lock().touch(peer)
    }

    // ------------------------------------------------------------------------
    // MEMBERSHIP / CONNECTION PLANNING
    // ------------------------------------------------------------------------

    /// Replace the set of known members. Routed peers that are no longer
    /// members are removed.
    pub fn set_known_peers<I>(&self, peers: I)
    where
        I: IntoIterator<Item = PeerId>,
    {
        let wanted: std::collections::BTreeSet<PeerId> = peers.into_iter().collect();
        let changes = {
            let mut table = self.table.lock();
            let stale: Vec<PeerId> = table
                .known()
                .filter(|p| !wanted.contains(p))
                .copied()
                .collect();
            let mut changes = Vec::new();
            for peer in stale {
                let routed = table.remove(&peer).is_some();
                table.remove_known(&peer);
                if routed {
                    changes.push(PeerChange { peer, added: false });
                }
            }
            for peer in wanted {
                table.add_known(peer);
            }
            changes
        };
        self.notify(changes);
    }

    pub fn add_known_peer(&self, peer: PeerId) -> bool {
        self.table.lock().add_known(peer)
    }

    /// Forget a member entirely, dropping its live link if it had one
    pub fn remove_known_peer(&self, peer: &PeerId) -> bool {
        let (known, routed) = {
            let mut table = self.table.lock();
            let routed = table.remove(peer).is_some();
            (table.remove_known(peer), routed)
        };
        if routed {
            self.notify(vec![PeerChange {
                peer: *peer,
                added: false,
            }]);
        }
        known || routed
    }

    /// Record that a connection attempt to `peer` is in flight
    pub fn mark_connecting(&self, peer: PeerId) -> bool {
        self.table.lock().mark_connecting(peer)
    }

    /// Record that a connection attempt failed; the peer becomes a
    /// candidate again
    pub fn connection_failed(&self, peer: &PeerId) -> bool {
        let cleared = self.table.lock().clear_connecting(peer);
        if cleared {
            debug!(peer = %peer, "Connection attempt failed");
        }
        cleared
    }

    pub fn is_connecting(&self, peer: &PeerId) -> bool {
        self.table.lock().is_connecting(peer)
    }

    /// Mark members as mobile: they are routed when they connect to us but
    /// never proposed by [`Self::get_peers_to_connect`]. Returns how many
    /// were newly marked.
    pub fn set_mobile_peers<'a>(&self, peers: impl IntoIterator<Item = &'a PeerId>) -> usize {
        let mut table = self.table.lock();
        peers
            .into_iter()
            .filter(|peer| table.add_mobile(**peer))
            .count()
    }

    /// Apply the mobility a routed peer announced about itself
    pub fn change_mobility(&self, peer: &PeerId, mobile: bool) -> bool {
        let changed = self.table.lock().change_mobility(peer, mobile);
        if changed {
            debug!(peer = %peer, mobile, "Peer mobility changed");
        }
        changed
    }

    pub fn is_mobile(&self, peer: &PeerId) -> bool {
        self.table.lock().is_mobile(peer)
    }

    /// Unrouted members marked as mobile
    pub fn mobile_peers(&self) -> Vec<PeerId> {
        self.table.lock().mobile().copied().collect()
    }

    /// Known members worth dialing: unrouted, not already being dialed, in
    /// buckets with spare capacity. Closest to the local identity first.
    pub fn get_peers_to_connect(&self) -> Vec<PeerId> {
        self.table.lock().peers_to_connect()
    }

    // ------------------------------------------------------------------------
    // QUERIES
    // ------------------------------------------------------------------------

    pub fn routed_peers(&self) -> Vec<PeerId> {
        self.table.lock().routed().map(|n| n.peer).collect()
    }

    pub fn routed_entries(&self) -> Vec<RoutedPeer<T>> {
        self.table.lock().routed().cloned().collect()
    }

    pub fn is_routed(&self, peer: &PeerId) -> bool {
        self.table.lock().contains(peer)
    }

    pub fn transport(&self, peer: &PeerId) -> Option<T> {
        self.table.lock().get(peer).map(|n| n.transport.clone())
    }

    /// Up to `count` routed peers closest to `target`
    pub fn closest_peers(&self, target: &PeerId, count: usize) -> Vec<PeerId> {
        self.table.lock().closest(target, count)
    }

    pub fn bucket_len(&self, index: usize) -> usize {
        self.table.lock().bucket_len(index)
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Drop every live link, firing `(peer, false)` for each. The routing
    /// observer is released afterwards.
    pub fn shutdown(&self) {
        let drained = self.table.lock().drain();
        info!(peers = drained.len(), "Routing manager shutting down");
        let changes = drained
            .into_iter()
            .map(|n| PeerChange {
                peer: n.peer,
                added: false,
            })
            .collect();
        self.notify(changes);
        self.on_peer_change.write().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Events = Arc<Mutex<Vec<(PeerId, bool)>>>;

    fn recording(manager: &RoutingManager<u32>) -> Events {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        manager.on_peer_change(move |peer, added| sink.lock().push((*peer, added)));
        events
    }

    fn peer_in_bucket(base: &PeerId, bucket: usize, salt: u8) -> PeerId {
        let mut bytes = *base.as_bytes();
        // vary bits well below the bucket bit so the bucket is unchanged
        bytes[31] ^= salt;
        PeerId::from_bytes(bytes).with_bit_flipped(bucket)
    }

    #[test]
    fn test_inject_fires_added_once() {
        let base = PeerId::random();
        let manager = RoutingManager::new(base, DEFAULT_BUCKET_MAX_SIZE);
        let events = recording(&manager);
        let peer = peer_in_bucket(&base, 200, 1);

        manager.inject_peer(peer, 1);
        manager.inject_peer(peer, 2);

        assert_eq!(*events.lock(), vec![(peer, true)]);
        assert_eq!(manager.transport(&peer), Some(2));
    }

    #[test]
    fn test_remove_unknown_peer_is_silent() {
        let base = PeerId::random();
        let manager = RoutingManager::<u32>::new(base, DEFAULT_BUCKET_MAX_SIZE);
        let events = recording(&manager);

        assert!(!manager.remove_peer(&PeerId::random()));
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_eviction_precedes_insertion() {
        let base = PeerId::zero();
        let manager = RoutingManager::new(base, 1);
        let events = recording(&manager);
        let first = peer_in_bucket(&base, 64, 1);
        let second = peer_in_bucket(&base, 64, 2);

        manager.inject_peer(first, 1);
        manager.inject_peer(second, 2);

        assert_eq!(
            *events.lock(),
            vec![(first, true), (first, false), (second, true)]
        );
        assert_eq!(manager.routed_peers(), vec![second]);
    }

    #[test]
    fn test_callback_can_reenter_manager() {
        let base = PeerId::random();
        let manager = Arc::new(RoutingManager::new(base, DEFAULT_BUCKET_MAX_SIZE));
        let seen = Arc::new(AtomicUsize::new(0));
        let (m, s) = (Arc::downgrade(&manager), seen.clone());
        manager.on_peer_change(move |_, _| {
            if let Some(m) = m.upgrade() {
                s.store(m.len(), Ordering::SeqCst);
            }
        });

        manager.inject_peer(peer_in_bucket(&base, 10, 0), 7u32);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connecting_lifecycle() {
        let base = PeerId::zero();
        let manager = RoutingManager::<u32>::new(base, 2);
        let peer = peer_in_bucket(&base, 30, 1);

        manager.add_known_peer(peer);
        assert_eq!(manager.get_peers_to_connect(), vec![peer]);

        assert!(manager.mark_connecting(peer));
        assert!(manager.get_peers_to_connect().is_empty());

        assert!(manager.connection_failed(&peer));
        assert_eq!(manager.get_peers_to_connect(), vec![peer]);

        manager.mark_connecting(peer);
        manager.inject_peer(peer, 1);
        assert!(!manager.is_connecting(&peer));
        assert!(manager.get_peers_to_connect().is_empty());
    }

    #[test]
    fn test_set_known_peers_drops_departed_members() {
        let base = PeerId::zero();
        let manager = RoutingManager::new(base, 4);
        let events = recording(&manager);
        let stays = peer_in_bucket(&base, 40, 1);
        let leaves = peer_in_bucket(&base, 41, 1);

        manager.set_known_peers([stays, leaves]);
        manager.inject_peer(leaves, 1);
        events.lock().clear();

        manager.set_known_peers([stays]);
        assert_eq!(*events.lock(), vec![(leaves, false)]);
        assert_eq!(manager.get_peers_to_connect(), vec![stays]);
    }

    #[test]
    fn test_shutdown_reports_every_routed_peer() {
        let base = PeerId::zero();
        let manager = RoutingManager::new(base, 4);
        let events = recording(&manager);
        let peers: Vec<PeerId> = (0..3).map(|i| peer_in_bucket(&base, 100 + i, 0)).collect();
        manager.inject_peers(peers.iter().map(|p| (*p, 0u32)));
        events.lock().clear();

        manager.shutdown();

        let mut removed: Vec<PeerId> = events.lock().iter().map(|(p, added)| {
            assert!(!added);
            *p
        }).collect();
        removed.sort();
        let mut expected = peers.clone();
        expected.sort();
        assert_eq!(removed, expected);
        assert!(manager.is_empty());

        // observer released: later changes are not reported
        manager.inject_peer(peers[0], 1);
        assert_eq!(events.lock().len(), 3);
    }

    #[test]
    fn test_record_activity_protects_from_eviction() {
        let base = PeerId::zero();
        let manager = RoutingManager::new(base, 2);
        let a = peer_in_bucket(&base, 90, 1);
        let b = peer_in_bucket(&base, 90, 2);
        let c = peer_in_bucket(&base, 90, 3);

        manager.inject_peer(a, 0u32);
        manager.inject_peer(b, 0);
        assert!(manager.record_activity(&a));
        manager.inject_peer(c, 0);

        assert!(manager.is_routed(&a));
        assert!(!manager.is_routed(&b));
        assert!(manager.is_routed(&c));
    }

    #[test]
    fn test_mobile_peers_skipped_when_planning_connections() {
        let base = PeerId::zero();
        let manager: RoutingManager<u32> = RoutingManager::new(base, 4);
        let events = recording(&manager);
        let phone = peer_in_bucket(&base, 60, 1);
        let laptop = peer_in_bucket(&base, 60, 2);

        manager.set_known_peers([phone, laptop]);
        assert_eq!(manager.set_mobile_peers(&[phone, base]), 1);
        assert_eq!(manager.get_peers_to_connect(), vec![laptop]);
        assert_eq!(manager.mobile_peers(), vec![phone]);

        // The phone reaches us on its own and announces it is mobile
        manager.inject_peer(phone, 7);
        assert!(manager.change_mobility(&phone, true));
        assert_eq!(events.lock().as_slice(), &[(phone, true)]);

        manager.remove_peer(&phone);
        assert!(manager.is_mobile(&phone));
        assert!(!manager.get_peers_to_connect().contains(&phone));
    }
}
