use parking_lot::Mutex;
use std::sync::Arc;
use swarmlink_core::identity::PeerId;
use swarmlink_core::routing::{RoutingManager, DEFAULT_BUCKET_MAX_SIZE};

type Events = Arc<Mutex<Vec<(PeerId, bool)>>>;

fn record<T: Clone + Send>(manager: &RoutingManager<T>) -> Events {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager.on_peer_change(move |peer, added| sink.lock().push((*peer, added)));
    events
}

/// Distinct identity whose highest differing bit from `base` is `bucket`
fn peer_in_bucket(base: &PeerId, bucket: usize, salt: u8) -> PeerId {
    let mut bytes = *base.as_bytes();
    bytes[31] ^= salt;
    PeerId::from_bytes(bytes).with_bit_flipped(bucket)
}

#[test]
fn test_full_bucket_evicts_least_recently_seen() {
    tracing_subscriber::fmt().with_env_filter("debug").try_init().ok();

    let base = PeerId::random();
    let manager = RoutingManager::new(base, 4);
    let events = record(&manager);

    let peers: Vec<PeerId> = (1..=5).map(|i| peer_in_bucket(&base, 180, i)).collect();
    for (i, peer) in peers.iter().enumerate() {
        manager.inject_peer(*peer, i);
    }

    assert_eq!(manager.len(), 4);
    assert_eq!(manager.bucket_len(180), 4);
    assert!(!manager.is_routed(&peers[0]));

    let removals: Vec<PeerId> = events
        .lock()
        .iter()
        .filter(|(_, added)| !added)
        .map(|(peer, _)| *peer)
        .collect();
    assert_eq!(removals, vec![peers[0]]);
    println!("✓ Fifth peer evicted the least recently seen one");
}

#[test]
fn test_activity_changes_eviction_victim() {
    let base = PeerId::random();
    let manager = RoutingManager::new(base, DEFAULT_BUCKET_MAX_SIZE);
    let events = record(&manager);

    let peers: Vec<PeerId> = (1..=5).map(|i| peer_in_bucket(&base, 77, i)).collect();
    for peer in &peers[..4] {
        manager.inject_peer(*peer, ());
    }
    // Traffic on the oldest link, and a re-injection of the second
    manager.record_activity(&peers[0]);
    manager.inject_peer(peers[1], ());
    manager.inject_peer(peers[4], ());

    assert!(manager.is_routed(&peers[0]));
    assert!(manager.is_routed(&peers[1]));
    assert!(!manager.is_routed(&peers[2]));
    assert_eq!(
        events.lock().iter().filter(|(_, added)| !added).count(),
        1
    );
}

#[test]
fn test_buckets_are_independent() {
    let base = PeerId::random();
    let manager = RoutingManager::new(base, 2);
    let events = record(&manager);

    for bucket in [10, 20, 30] {
        for salt in 1..=2 {
            manager.inject_peer(peer_in_bucket(&base, bucket, salt), ());
        }
    }

    assert_eq!(manager.len(), 6);
    assert!(events.lock().iter().all(|(_, added)| *added));
}

#[test]
fn test_connection_planning_loop() {
    let base = PeerId::random();
    let manager = RoutingManager::new(base, 2);
    let members: Vec<PeerId> = (1..=3).map(|i| peer_in_bucket(&base, 50, i)).collect();
    manager.set_known_peers(members.iter().copied().chain(std::iter::once(base)));

    // The local identity is never a candidate; capacity limits the plan
    let plan = manager.get_peers_to_connect();
    assert_eq!(plan.len(), 2);
    assert!(!plan.contains(&base));

    for peer in &plan {
        manager.mark_connecting(*peer);
    }
    assert!(manager.get_peers_to_connect().is_empty());

    // One dial succeeds, one fails
    manager.inject_peer(plan[0], "link-0".to_string());
    manager.connection_failed(&plan[1]);
    let retry = manager.get_peers_to_connect();
    assert_eq!(retry.len(), 1);
    assert_eq!(manager.transport(&plan[0]).as_deref(), Some("link-0"));

    // The link drops: the peer becomes a candidate again
    assert!(manager.remove_peer(&plan[0]));
    assert_eq!(manager.get_peers_to_connect().len(), 2);
}

#[test]
fn test_removals_notify_once_per_routed_peer() {
    let base = PeerId::random();
    let manager = RoutingManager::new(base, 4);
    let events = record(&manager);
    let a = peer_in_bucket(&base, 5, 0);
    let b = peer_in_bucket(&base, 6, 0);
    let stranger = peer_in_bucket(&base, 7, 0);

    manager.inject_peers([(a, 1u8), (b, 2u8)]);
    events.lock().clear();

    assert_eq!(manager.remove_peers([&a, &stranger, &b, &a]), 2);
    assert_eq!(*events.lock(), vec![(a, false), (b, false)]);
}

#[test]
fn test_closest_peers_to_target() {
    let base = PeerId::zero();
    let manager = RoutingManager::new(base, 4);
    let near = peer_in_bucket(&base, 2, 0);
    let far = peer_in_bucket(&base, 250, 0);
    manager.inject_peers([(near, ()), (far, ())]);

    assert_eq!(manager.closest_peers(&far, 1), vec![near]);
    assert_eq!(manager.closest_peers(&base, 2), vec![near, far]);
}
