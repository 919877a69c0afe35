use helmsman::config::ClusterConfig;
use helmsman::core::membership::{MembershipState, PeerCache};
use helmsman::core::messaging::{
    ClusterTransport, ControlMessage, Destination, EndpointId, HostSpec, InboundEvent,
    LoopbackTransport, MessagingLayer, Outbox, TransportEvent, WireFrame, run_flusher,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

struct Harness {
    layer: Arc<MessagingLayer>,
    transport: Arc<LoopbackTransport>,
    peers: Arc<PeerCache>,
    outbox: Arc<Outbox>,
    inbound: mpsc::Receiver<InboundEvent>,
}

fn harness() -> Harness {
    let transport = LoopbackTransport::new(1);
    let peers = PeerCache::new(false);
    peers.get_or_create(Some(1), Some("alpha")).unwrap();
    let outbox = Outbox::new(200);
    let (inbound_tx, inbound) = mpsc::channel(256);
    let layer = MessagingLayer::new(
        transport.clone(),
        outbox.clone(),
        peers.clone(),
        ClusterConfig::default(),
        "alpha".to_string(),
        inbound_tx,
    );
    Harness {
        layer,
        transport,
        peers,
        outbox,
        inbound,
    }
}

fn frame_from(node_id: u32, uname: &str, host: HostSpec, message: &ControlMessage) -> bytes::Bytes {
    WireFrame::build(
        EndpointId {
            node_id,
            pid: 1000 + node_id,
            uname: uname.to_string(),
        },
        host,
        1,
        message,
        64 * 1024,
    )
    .unwrap()
    .encode()
    .unwrap()
}

fn ping(from: &str) -> ControlMessage {
    ControlMessage::Ping {
        from: from.to_string(),
    }
}

async fn expect_message(rx: &mut mpsc::Receiver<InboundEvent>) -> ControlMessage {
    match timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(InboundEvent::Message(m))) => m.message,
        other => panic!("expected a message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_queues_and_flusher_delivers() {
    let mut h = harness();
    h.layer
        .send(ping("alpha"), Destination::Broadcast, false)
        .await
        .unwrap();
    assert_eq!(h.outbox.len(), 1);

    let (shutdown_tx, _) = broadcast::channel(1);
    let flusher = tokio::spawn(run_flusher(
        h.outbox.clone(),
        h.transport.clone() as Arc<dyn ClusterTransport>,
        ClusterConfig::default(),
        shutdown_tx.subscribe(),
    ));

    // The flush pass drains the queue (monotonic non-increasing absent new
    // sends) and the transport delivers our own frame back, where the
    // self-filter drops it.
    timeout(Duration::from_secs(5), async {
        while h.outbox.len() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.outbox.sent_total(), 1);

    let mut events = h.transport.take_events().unwrap();
    let event = events.recv().await.unwrap();
    h.layer.handle_event(event).await;
    assert!(h.inbound.try_recv().is_err());

    shutdown_tx.send(()).unwrap();
    flusher.await.unwrap();
}

#[tokio::test]
async fn test_local_echo_delivers_without_the_transport() {
    let mut h = harness();
    h.layer
        .send(ping("alpha"), Destination::Broadcast, true)
        .await
        .unwrap();
    assert!(matches!(
        expect_message(&mut h.inbound).await,
        ControlMessage::Ping { .. }
    ));
    // The frame still went out for the peers.
    assert_eq!(h.outbox.len(), 1);
}

#[tokio::test]
async fn test_self_addressed_unicast_never_touches_the_transport() {
    let mut h = harness();
    h.layer
        .send(ping("alpha"), Destination::Node("alpha".to_string()), false)
        .await
        .unwrap();
    assert!(matches!(
        expect_message(&mut h.inbound).await,
        ControlMessage::Ping { .. }
    ));
    assert_eq!(h.outbox.len(), 0);
}

#[tokio::test]
async fn test_spoofed_sender_is_dropped() {
    let mut h = harness();
    // Claimed sender id 7, transport says node 2.
    let frame = frame_from(7, "mallory", HostSpec::broadcast(), &ping("mallory"));
    h.layer
        .handle_event(TransportEvent::Delivered {
            node_id: 2,
            pid: 9,
            data: frame,
        })
        .await;
    assert!(h.inbound.try_recv().is_err());
}

#[tokio::test]
async fn test_frames_for_other_hosts_are_dropped() {
    let mut h = harness();
    let by_id = frame_from(2, "beta", HostSpec {
        node_id: Some(42),
        uname: None,
        local: false,
    }, &ping("beta"));
    let by_uname = frame_from(2, "beta", HostSpec::to_uname("gamma"), &ping("beta"));
    for data in [by_id, by_uname] {
        h.layer
            .handle_event(TransportEvent::Delivered {
                node_id: 2,
                pid: 9,
                data,
            })
            .await;
    }
    assert!(h.inbound.try_recv().is_err());

    // A frame addressed to us by uname does arrive.
    let for_us = frame_from(2, "beta", HostSpec::to_uname("alpha"), &ping("beta"));
    h.layer
        .handle_event(TransportEvent::Delivered {
            node_id: 2,
            pid: 9,
            data: for_us,
        })
        .await;
    assert!(matches!(
        expect_message(&mut h.inbound).await,
        ControlMessage::Ping { .. }
    ));
}

#[tokio::test]
async fn test_sender_uname_is_backfilled_from_the_peer_cache() {
    let mut h = harness();
    h.peers.get_or_create(Some(2), Some("beta")).unwrap();

    let frame = frame_from(2, "", HostSpec::broadcast(), &ping("beta"));
    h.layer
        .handle_event(TransportEvent::Delivered {
            node_id: 2,
            pid: 9,
            data: frame,
        })
        .await;

    match timeout(Duration::from_secs(5), h.inbound.recv()).await {
        Ok(Some(InboundEvent::Message(m))) => {
            assert_eq!(m.sender_uname.as_deref(), Some("beta"));
        }
        other => panic!("expected a message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_membership_deltas_update_the_peer_cache() {
    let h = harness();
    h.layer
        .handle_event(TransportEvent::Membership {
            members: vec![1, 2],
            joined: vec![2],
            left: vec![],
        })
        .await;
    assert_eq!(h.peers.get(2).unwrap().state, MembershipState::Member);

    h.layer
        .handle_event(TransportEvent::Membership {
            members: vec![1],
            joined: vec![],
            left: vec![2],
        })
        .await;
    assert_eq!(h.peers.get(2).unwrap().state, MembershipState::Lost);
}

#[tokio::test]
async fn test_local_eviction_disconnects() {
    let mut h = harness();
    h.layer
        .handle_event(TransportEvent::Membership {
            members: vec![2, 3],
            joined: vec![],
            left: vec![],
        })
        .await;
    assert!(h.layer.is_evicted());
    assert!(matches!(
        timeout(Duration::from_secs(5), h.inbound.recv()).await,
        Ok(Some(InboundEvent::Disconnected))
    ));

    // Further sends are refused.
    assert!(
        h.layer
            .send(ping("alpha"), Destination::Broadcast, false)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_membership_contradiction_promotes_after_grace() {
    let mut config = ClusterConfig::default();
    config.membership_contradiction_timeout = Duration::from_millis(50);

    let transport = LoopbackTransport::new(1);
    let peers = PeerCache::new(false);
    peers.get_or_create(Some(1), Some("alpha")).unwrap();
    let outbox = Outbox::new(200);
    let (inbound_tx, _inbound) = mpsc::channel(256);
    let layer = MessagingLayer::new(
        transport,
        outbox,
        peers.clone(),
        config,
        "alpha".to_string(),
        inbound_tx,
    );

    // The cluster layer believes node 2 is gone, the transport disagrees.
    let peer = peers.get_or_create(Some(2), Some("beta")).unwrap();
    peers.update_state(peer.id, MembershipState::Lost, 0).unwrap();

    let membership = TransportEvent::Membership {
        members: vec![1, 2],
        joined: vec![],
        left: vec![],
    };
    layer.handle_event(membership.clone()).await;
    assert_eq!(peers.get(2).unwrap().state, MembershipState::Lost);

    tokio::time::sleep(Duration::from_millis(80)).await;
    layer.handle_event(membership).await;
    assert_eq!(peers.get(2).unwrap().state, MembershipState::Member);
}
