//! Bucketed routing table
//!
//! Peers are partitioned by the position of the highest bit in which their
//! identity differs from the local (base) identity. Each partition holds at
//! most `bucket_max_size` live links; when a bucket is full the
//! least-recently-active link is evicted to make room.
//!
//! Members flagged as mobile are usually offline, so they are routed when
//! they connect to us but never proposed for an outgoing connection.
//!
//! The table is plain data: it returns the add/remove decisions it made and
//! leaves notification to [`super::RoutingManager`].

use crate::identity::PeerId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// One add/remove decision produced by the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerChange {
    pub peer: PeerId,
    pub added: bool,
}

impl PeerChange {
    fn added(peer: PeerId) -> Self {
        Self { peer, added: true }
    }

    fn removed(peer: PeerId) -> Self {
        Self { peer, added: false }
    }
}

/// A peer with a live transport
#[derive(Debug, Clone)]
pub struct RoutedPeer<T> {
    pub peer: PeerId,
    pub transport: T,
    pub bucket: usize,
    /// Logical timestamp of the last inbound or outbound use
    pub last_activity: u64,
    pub mobile: bool,
}

#[derive(Debug)]
struct Bucket<T> {
    nodes: Vec<RoutedPeer<T>>,
}

impl<T> Default for Bucket<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<T> Bucket<T> {
    fn position(&self, peer: &PeerId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.peer == peer)
    }

    fn get_mut(&mut self, peer: &PeerId) -> Option<&mut RoutedPeer<T>> {
        self.nodes.iter_mut().find(|n| &n.peer == peer)
    }

    fn remove(&mut self, peer: &PeerId) -> Option<RoutedPeer<T>> {
        self.position(peer).map(|i| self.nodes.swap_remove(i))
    }

    /// Least-recently-active entry; ties broken by identity
    fn least_recently_seen(&self) -> Option<PeerId> {
        self.nodes
            .iter()
            .min_by(|a, b| {
                a.last_activity
                    .cmp(&b.last_activity)
                    .then_with(|| a.peer.cmp(&b.peer))
            })
            .map(|n| n.peer)
    }
}

pub struct RoutingTable<T> {
    base: PeerId,
    bucket_max_size: usize,
    clock: u64,
    buckets: BTreeMap<usize, Bucket<T>>,
    /// Conversation members, routed or not
    known: BTreeSet<PeerId>,
    /// Members with a connection attempt in flight
    connecting: BTreeSet<PeerId>,
    /// Unrouted members that are not dialed proactively
    mobile: BTreeSet<PeerId>,
}

impl<T> RoutingTable<T> {
    pub fn new(base: PeerId, bucket_max_size: usize) -> Self {
        if bucket_max_size == 0 {
            warn!("Bucket size of 0 requested, using 1");
        }
        Self {
            base,
            bucket_max_size: bucket_max_size.max(1),
            clock: 0,
            buckets: BTreeMap::new(),
            known: BTreeSet::new(),
            connecting: BTreeSet::new(),
            mobile: BTreeSet::new(),
        }
    }

    pub fn base(&self) -> &PeerId {
        &self.base
    }

    pub fn bucket_max_size(&self) -> usize {
        self.bucket_max_size
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Register a live transport to `peer`
    pub fn inject(&mut self, peer: PeerId, transport: T) -> Vec<PeerChange> {
        let Some(index) = self.base.bucket_index(&peer) else {
            warn!("Refusing to route to our own identity");
            return Vec::new();
        };
        let now = self.tick();
        self.connecting.remove(&peer);
        self.known.insert(peer);
        let mobile = self.mobile.remove(&peer);

        let max = self.bucket_max_size;
        let bucket = self.buckets.entry(index).or_default();

        if let Some(existing) = bucket.get_mut(&peer) {
            existing.transport = transport;
            existing.last_activity = now;
            return Vec::new();
        }

        let mut changes = Vec::with_capacity(2);
        if bucket.nodes.len() >= max {
            if let Some(victim) = bucket.least_recently_seen() {
                if bucket.remove(&victim).map_or(false, |v| v.mobile) {
                    self.mobile.insert(victim);
                }
                debug!(bucket = index, evicted = %victim, "Bucket full, evicting least recently seen peer");
                changes.push(PeerChange::removed(victim));
            }
        }
        bucket.nodes.push(RoutedPeer {
            peer,
            transport,
            bucket: index,
            last_activity: now,
            mobile,
        });
        changes.push(PeerChange::added(peer));
        changes
    }

    /// Drop the live transport to `peer`, if any
    pub fn remove(&mut self, peer: &PeerId) -> Option<RoutedPeer<T>> {
        let index = self.base.bucket_index(peer)?;
        let bucket = self.buckets.get_mut(&index)?;
        let removed = bucket.remove(peer);
        if bucket.nodes.is_empty() {
            self.buckets.remove(&index);
        }
        if removed.as_ref().map_or(false, |r| r.mobile) {
            self.mobile.insert(*peer);
        }
        removed
    }

    /// Bump the activity timestamp of a routed peer
    pub fn touch(&mut self, peer: &PeerId) -> bool {
        let Some(index) = self.base.bucket_index(peer) else {
            return false;
        };
        let now = self.tick();
        match self.buckets.get_mut(&index).and_then(|b| b.get_mut(peer)) {
            Some(node) => {
                node.last_activity = now;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<&RoutedPeer<T>> {
        let index = self.base.bucket_index(peer)?;
        self.buckets
            .get(&index)
            .and_then(|b| b.nodes.iter().find(|n| &n.peer == peer))
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.get(peer).is_some()
    }

    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets.get(&index).map_or(0, |b| b.nodes.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn routed(&self) -> impl Iterator<Item = &RoutedPeer<T>> {
        self.buckets.values().flat_map(|b| b.nodes.iter())
    }

    /// Routed peers sorted by XOR distance to `target`
    pub fn closest(&self, target: &PeerId, count: usize) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .routed()
            .map(|n| n.peer)
            .filter(|p| p != target)
            .collect();
        peers.sort_by(|a, b| target.xor_cmp(a, b));
        peers.truncate(count);
        peers
    }

    /// Remove every routed peer
    pub fn drain(&mut self) -> Vec<RoutedPeer<T>> {
        let drained: Vec<RoutedPeer<T>> = std::mem::take(&mut self.buckets)
            .into_values()
            .flat_map(|b| b.nodes)
            .collect();
        self.mobile
            .extend(drained.iter().filter(|n| n.mobile).map(|n| n.peer));
        drained
    }

    // ------------------------------------------------------------------------
    // MEMBERSHIP
    // ------------------------------------------------------------------------

    /// Record a member. Returns `true` if it was not known before.
    pub fn add_known(&mut self, peer: PeerId) -> bool {
        if peer == self.base {
            return false;
        }
        self.known.insert(peer)
    }

    pub fn remove_known(&mut self, peer: &PeerId) -> bool {
        self.connecting.remove(peer);
        self.mobile.remove(peer);
        self.known.remove(peer)
    }

    pub fn known(&self) -> impl Iterator<Item = &PeerId> {
        self.known.iter()
    }

    pub fn mark_connecting(&mut self, peer: PeerId) -> bool {
        if peer == self.base || self.contains(&peer) {
            return false;
        }
        self.known.insert(peer);
        // Dialing a mobile member means it is reachable right now
        self.mobile.remove(&peer);
        self.connecting.insert(peer)
    }

    pub fn clear_connecting(&mut self, peer: &PeerId) -> bool {
        self.connecting.remove(peer)
    }

    pub fn is_connecting(&self, peer: &PeerId) -> bool {
        self.connecting.contains(peer)
    }

    /// Record an unrouted member as mobile. Returns `false` for our own
    /// identity, routed peers, and members already marked.
    pub fn add_mobile(&mut self, peer: PeerId) -> bool {
        if peer == self.base || self.contains(&peer) {
            return false;
        }
        self.known.insert(peer);
        self.mobile.insert(peer)
    }

    /// Update the mobility a routed peer announced. Returns `false` if the
    /// peer is not routed.
    pub fn change_mobility(&mut self, peer: &PeerId, mobile: bool) -> bool {
        let Some(index) = self.base.bucket_index(peer) else {
            return false;
        };
        match self.buckets.get_mut(&index).and_then(|b| b.get_mut(peer)) {
            Some(node) => {
                node.mobile = mobile;
                true
            }
            None => false,
        }
    }

    pub fn is_mobile(&self, peer: &PeerId) -> bool {
        self.mobile.contains(peer) || self.get(peer).map_or(false, |n| n.mobile)
    }

    /// Unrouted mobile members
    pub fn mobile(&self) -> impl Iterator<Item = &PeerId> {
        self.mobile.iter()
    }

    /// Known, unrouted, not-yet-connecting members whose bucket still has
    /// room, closest to the base identity first. In-flight attempts count
    /// against a bucket's capacity.
    pub fn peers_to_connect(&self) -> Vec<PeerId> {
        let mut in_use: BTreeMap<usize, usize> = self
            .buckets
            .iter()
            .map(|(index, bucket)| (*index, bucket.nodes.len()))
            .collect();
        for peer in &self.connecting {
            if let Some(index) = self.base.bucket_index(peer) {
                *in_use.entry(index).or_default() += 1;
            }
        }

        let mut candidates: Vec<PeerId> = self
            .known
            .iter()
            .filter(|p| !self.connecting.contains(p) && !self.mobile.contains(p) && !self.contains(p))
            .copied()
            .collect();
        candidates.sort_by(|a, b| self.base.xor_cmp(a, b));

        let mut selected = Vec::new();
        for peer in candidates {
            let Some(index) = self.base.bucket_index(&peer) else {
                continue;
            };
            let used = in_use.entry(index).or_default();
            if *used < self.bucket_max_size {
                *used += 1;
                selected.push(peer);
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Peer in bucket `bucket` relative to the zero identity, distinguished
    /// by its low bits
    fn peer_in_bucket(bucket: usize, salt: u8) -> PeerId {
        let mut bytes = [0u8; 32];
        bytes[31] = salt;
        PeerId::from_bytes(bytes).with_bit_flipped(bucket)
    }

    #[test]
    fn test_inject_assigns_bucket() {
        let mut table = RoutingTable::new(PeerId::zero(), 4);
        let peer = peer_in_bucket(100, 1);
        let changes = table.inject(peer, ());
        assert_eq!(changes, vec![PeerChange::added(peer)]);
        assert_eq!(table.get(&peer).unwrap().bucket, 100);
        assert_eq!(table.bucket_len(100), 1);
    }

    #[test]
    fn test_reinject_refreshes_without_change() {
        let mut table = RoutingTable::new(PeerId::zero(), 4);
        let peer = peer_in_bucket(100, 1);
        table.inject(peer, 1u8);
        let before = table.get(&peer).unwrap().last_activity;

        assert!(table.inject(peer, 2u8).is_empty());
        let entry = table.get(&peer).unwrap();
        assert!(entry.last_activity > before);
        assert_eq!(entry.transport, 2);
    }

    #[test]
    fn test_full_bucket_evicts_least_recently_seen() {
        let mut table = RoutingTable::new(PeerId::zero(), 2);
        let a = peer_in_bucket(50, 1);
        let b = peer_in_bucket(50, 2);
        let c = peer_in_bucket(50, 3);

        table.inject(a, ());
        table.inject(b, ());
        // a becomes the most recently used
        assert!(table.touch(&a));

        let changes = table.inject(c, ());
        assert_eq!(changes, vec![PeerChange::removed(b), PeerChange::added(c)]);
        assert!(table.contains(&a));
        assert!(!table.contains(&b));
        assert_eq!(table.bucket_len(50), 2);
    }

    #[test]
    fn test_own_identity_is_never_routed() {
        let base = PeerId::random();
        let mut table = RoutingTable::new(base, 4);
        assert!(table.inject(base, ()).is_empty());
        assert!(!table.add_known(base));
        assert!(table.is_empty());
    }

    #[test]
    fn test_peers_to_connect_respects_capacity() {
        let mut table = RoutingTable::new(PeerId::zero(), 2);
        let routed = peer_in_bucket(10, 1);
        let pending = peer_in_bucket(10, 2);
        let spare = peer_in_bucket(10, 3);
        let other = peer_in_bucket(20, 1);

        table.inject(routed, ());
        for peer in [pending, spare, other] {
            table.add_known(peer);
        }

        let mut candidates = table.peers_to_connect();
        candidates.sort();
        let mut expected = vec![pending, other];
        expected.sort();
        assert_eq!(candidates, expected);

        // An in-flight attempt uses the last slot of bucket 10
        table.mark_connecting(pending);
        assert_eq!(table.peers_to_connect(), vec![other]);

        // A failed attempt frees the slot again
        table.clear_connecting(&pending);
        assert!(table.peers_to_connect().contains(&pending));
    }

    #[test]
    fn test_mobile_members_are_not_dialed() {
        let mut table: RoutingTable<()> = RoutingTable::new(PeerId::zero(), 4);
        let phone = peer_in_bucket(30, 1);
        let desktop = peer_in_bucket(30, 2);
        table.add_known(desktop);
        assert!(table.add_mobile(phone));
        assert!(!table.add_mobile(phone));

        assert_eq!(table.peers_to_connect(), vec![desktop]);
        assert!(table.is_mobile(&phone));
        assert!(table.known().any(|p| p == &phone));
    }

    #[test]
    fn test_mobile_peer_routed_when_it_connects() {
        let mut table = RoutingTable::new(PeerId::zero(), 4);
        let phone = peer_in_bucket(30, 1);
        table.add_mobile(phone);

        table.inject(phone, ());
        assert!(table.get(&phone).unwrap().mobile);
        assert_eq!(table.mobile().count(), 0);
        assert!(!table.add_mobile(phone), "routed peers are not re-marked");

        // Dropping the link puts it back among the undialed mobile members
        table.remove(&phone);
        assert!(table.is_mobile(&phone));
        assert!(table.peers_to_connect().is_empty());
    }

    #[test]
    fn test_change_mobility_of_routed_peer() {
        let mut table = RoutingTable::new(PeerId::zero(), 4);
        let peer = peer_in_bucket(12, 1);
        assert!(!table.change_mobility(&peer, true));

        table.inject(peer, ());
        assert!(table.change_mobility(&peer, true));
        table.remove(&peer);
        assert!(table.is_mobile(&peer));

        // An explicit connection attempt clears the flag
        assert!(table.mark_connecting(peer));
        assert!(!table.is_mobile(&peer));
        table.clear_connecting(&peer);
        assert_eq!(table.peers_to_connect(), vec![peer]);
    }

    #[test]
    fn test_evicted_mobile_peer_stays_mobile() {
        let mut table = RoutingTable::new(PeerId::zero(), 1);
        let phone = peer_in_bucket(40, 1);
        let other = peer_in_bucket(40, 2);
        table.add_mobile(phone);
        table.inject(phone, ());

        let changes = table.inject(other, ());
        assert_eq!(changes, vec![PeerChange::removed(phone), PeerChange::added(other)]);
        assert!(table.is_mobile(&phone));
    }

    #[test]
    fn test_closest_orders_by_xor_distance() {
        let mut table = RoutingTable::new(PeerId::zero(), 4);
        let near = peer_in_bucket(3, 0);
        let mid = peer_in_bucket(40, 0);
        let far = peer_in_bucket(200, 0);
        for peer in [far, near, mid] {
            table.inject(peer, ());
        }
        assert_eq!(table.closest(&PeerId::zero(), 2), vec![near, mid]);
    }

    #[test]
    fn test_remove_unrouted_is_none() {
        let mut table: RoutingTable<()> = RoutingTable::new(PeerId::zero(), 4);
        assert!(table.remove(&peer_in_bucket(5, 1)).is_none());
    }

    proptest! {
        #[test]
        fn prop_buckets_never_overflow(
            ops in proptest::collection::vec((any::<bool>(), 0usize..6, any::<u8>()), 1..200),
            max in 1usize..5,
        ) {
            let mut table = RoutingTable::new(PeerId::zero(), max);
            for (insert, bucket, salt) in ops {
                let peer = peer_in_bucket(bucket, salt);
                if insert {
                    table.inject(peer, ());
                } else {
                    table.remove(&peer);
                }
                for index in 0..8 {
                    prop_assert!(table.bucket_len(index) <= max);
                }
            }
        }
    }
}
