use helmsman::core::membership::{
    JoinPhase, MembershipState, PeerCache, PeerChange, ProcMask,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_get_or_create_by_id_then_learn_uname() {
    let cache = PeerCache::new(false);
    let peer = cache.get_or_create(Some(1), None).unwrap();
    assert_eq!(peer.id, 1);
    assert!(peer.uname.is_none());

    let peer = cache.get_or_create(Some(1), Some("alpha")).unwrap();
    assert_eq!(peer.uname.as_deref(), Some("alpha"));
    assert_eq!(cache.get_by_uname("alpha").unwrap().id, 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_conflicting_uname_for_cluster_peer_is_rejected() {
    let cache = PeerCache::new(false);
    cache.get_or_create(Some(1), Some("alpha")).unwrap();
    assert!(cache.get_or_create(Some(1), Some("beta")).is_err());
}

#[test]
fn test_lookup_requires_some_identity() {
    let cache = PeerCache::new(false);
    assert!(cache.get_or_create(None, None).is_err());
}

#[test]
fn test_remote_peer_gets_synthetic_id() {
    let cache = PeerCache::new(false);
    let remote = cache.mark_remote("remote-a").unwrap();
    assert!(remote.id >= 1 << 24);
    assert!(remote.flags.contains(helmsman::core::membership::PeerFlags::REMOTE));
}

#[test]
fn test_lost_resets_join_phase() {
    let cache = PeerCache::new(false);
    let peer = cache.get_or_create(Some(2), Some("beta")).unwrap();
    cache.update_state(peer.id, MembershipState::Member, 0).unwrap();
    cache.update_join(peer.id, JoinPhase::Confirmed).unwrap();
    assert_eq!(cache.get(2).unwrap().join, JoinPhase::Confirmed);

    cache.update_state(peer.id, MembershipState::Lost, 0).unwrap();
    assert_eq!(cache.get(2).unwrap().join, JoinPhase::None);
}

#[test]
fn test_autoreap_drops_lost_peers() {
    let cache = PeerCache::new(true);
    let peer = cache.get_or_create(Some(3), Some("gamma")).unwrap();
    cache.update_state(peer.id, MembershipState::Member, 0).unwrap();
    assert_eq!(cache.len(), 1);

    cache.update_state(peer.id, MembershipState::Lost, 0).unwrap();
    assert!(cache.get(3).is_none());
    assert!(cache.get_by_uname("gamma").is_none());
}

#[test]
fn test_status_callback_sees_state_changes() {
    let cache = PeerCache::new(false);
    let states = Arc::new(AtomicUsize::new(0));
    let procs = Arc::new(AtomicUsize::new(0));
    let states_cb = Arc::clone(&states);
    let procs_cb = Arc::clone(&procs);
    cache.set_status_callback(Box::new(move |change, _peer| match change {
        PeerChange::State => {
            states_cb.fetch_add(1, Ordering::SeqCst);
        }
        PeerChange::Processes => {
            procs_cb.fetch_add(1, Ordering::SeqCst);
        }
        PeerChange::Uname => {}
    }));

    let peer = cache.get_or_create(Some(4), Some("delta")).unwrap();
    cache.update_state(peer.id, MembershipState::Member, 0).unwrap();
    // Same state again must not re-notify.
    cache.update_state(peer.id, MembershipState::Member, 0).unwrap();
    cache.update_proc(peer.id, ProcMask::CONTROLLER).unwrap();

    assert_eq!(states.load(Ordering::SeqCst), 1);
    assert_eq!(procs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_uuid_is_monotonic_once_set() {
    let cache = PeerCache::new(false);
    let peer = cache.get_or_create(Some(5), Some("epsilon")).unwrap();
    cache.update_uuid(peer.id, "uuid-1").unwrap();
    // A different uuid for a live peer is ignored, not applied.
    cache.update_uuid(peer.id, "uuid-2").unwrap();
    assert_eq!(cache.get(5).unwrap().uuid.as_deref(), Some("uuid-1"));
}

#[test]
fn test_reap_by_uname() {
    let cache = PeerCache::new(false);
    cache.get_or_create(Some(6), Some("zeta")).unwrap();
    assert!(cache.reap(None, Some("zeta")));
    assert!(cache.is_empty());
    assert!(!cache.reap(None, Some("zeta")));
}

#[test]
fn test_active_member_count() {
    let cache = PeerCache::new(false);
    for id in 1..=3u32 {
        let peer = cache.get_or_create(Some(id), None).unwrap();
        if id != 2 {
            cache.update_state(peer.id, MembershipState::Member, 0).unwrap();
        }
    }
    assert_eq!(cache.active_members(), 2);
}
