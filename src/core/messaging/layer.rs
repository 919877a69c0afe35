// src/core/messaging/layer.rs

//! The messaging layer proper: framing and addressing on the way out,
//! filtering and peer-cache bookkeeping on the way in, and translation of
//! group-membership changes into peer-cache state.

use crate::config::ClusterConfig;
use crate::core::HelmsmanError;
use crate::core::membership::{MembershipState, PeerCache};
use crate::core::messaging::frame::{EndpointId, HostSpec, WireFrame};
use crate::core::messaging::outbox::Outbox;
use crate::core::messaging::protocol::ControlMessage;
use crate::core::messaging::transport::{ClusterTransport, TransportEvent};
use crate::core::types::now_ms;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

/// Where an outbound message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Every node, ourselves included only when `local_echo` is requested.
    Broadcast,
    /// A single node by uname. Transport-level delivery is still multicast;
    /// non-addressees drop the frame on arrival.
    Node(String),
}

/// A filtered, decoded inbound control message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender_id: u32,
    pub sender_uname: Option<String>,
    pub message: ControlMessage,
}

/// What the receiver task hands to the controller.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(InboundMessage),
    /// The local node was evicted from the transport group.
    Disconnected,
}

/// The messaging layer. Cheap to share; all state lives behind the outbox,
/// the peer cache, and a couple of atomics.
pub struct MessagingLayer {
    transport: Arc<dyn ClusterTransport>,
    outbox: Arc<Outbox>,
    peers: Arc<PeerCache>,
    config: ClusterConfig,
    local_uname: String,
    pid: u32,
    evicted: AtomicBool,
    inbound_tx: mpsc::Sender<InboundEvent>,
}

impl MessagingLayer {
    pub fn new(
        transport: Arc<dyn ClusterTransport>,
        outbox: Arc<Outbox>,
        peers: Arc<PeerCache>,
        config: ClusterConfig,
        local_uname: String,
        inbound_tx: mpsc::Sender<InboundEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            outbox,
            peers,
            config,
            local_uname,
            pid: std::process::id(),
            evicted: AtomicBool::new(false),
            inbound_tx,
        })
    }

    pub fn local_node_id(&self) -> u32 {
        self.transport.local_node_id()
    }

    pub fn local_uname(&self) -> &str {
        &self.local_uname
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Serializes, frames, and queues a message. With `local_echo`, a copy
    /// is delivered to the local inbound stream without touching the
    /// transport.
    pub async fn send(
        &self,
        message: ControlMessage,
        destination: Destination,
        local_echo: bool,
    ) -> Result<(), HelmsmanError> {
        if self.is_evicted() {
            return Err(HelmsmanError::NotConnected(
                "Local node was evicted from the cluster".to_string(),
            ));
        }

        let host = match &destination {
            Destination::Broadcast => HostSpec::broadcast(),
            Destination::Node(uname) if uname == &self.local_uname => HostSpec {
                node_id: Some(self.local_node_id()),
                uname: Some(uname.clone()),
                local: true,
            },
            Destination::Node(uname) => HostSpec::to_uname(uname),
        };

        let sender = EndpointId {
            node_id: self.local_node_id(),
            pid: self.pid,
            uname: self.local_uname.clone(),
        };

        let frame = WireFrame::build(
            sender,
            host,
            self.outbox.next_seq(),
            &message,
            self.config.compression_threshold,
        )?;

        let local_only = matches!(&destination, Destination::Node(uname) if uname == &self.local_uname);

        if local_echo || local_only {
            let echo = InboundEvent::Message(InboundMessage {
                sender_id: self.local_node_id(),
                sender_uname: Some(self.local_uname.clone()),
                message: message.clone(),
            });
            if self.inbound_tx.send(echo).await.is_err() {
                return Err(HelmsmanError::NotConnected(
                    "Inbound channel closed".to_string(),
                ));
            }
            if local_only {
                trace!("Delivered {} locally only", message.op_name());
                return Ok(());
            }
        }

        trace!(
            "Queued {} for {:?} (seq {})",
            message.op_name(),
            destination,
            frame.header.seq
        );
        self.outbox.enqueue(frame.encode()?);
        Ok(())
    }

    /// Handles one transport event: decode + filter a delivery, or apply a
    /// membership change.
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Delivered { node_id, pid, data } => {
                if let Err(e) = self.handle_delivery(node_id, pid, &data).await {
                    warn!("Dropping inbound frame from node {}: {}", node_id, e);
                }
            }
            TransportEvent::Membership {
                members,
                joined,
                left,
            } => {
                self.apply_membership(&members, &joined, &left).await;
            }
        }
    }

    async fn handle_delivery(
        &self,
        transport_node_id: u32,
        _pid: u32,
        data: &[u8],
    ) -> Result<(), HelmsmanError> {
        let frame = WireFrame::decode(data)?;

        // A frame claiming to come from a node other than the one the
        // transport attributes it to is spoofed or corrupt.
        if frame.header.sender.node_id != transport_node_id {
            return Err(HelmsmanError::Protocol(format!(
                "Sender id {} does not match transport-reported id {}",
                frame.header.sender.node_id, transport_node_id
            )));
        }

        let local_id = self.local_node_id();
        if let Some(host_id) = frame.header.host.node_id
            && host_id != local_id
        {
            trace!("Frame addressed to node id {}, not us", host_id);
            return Ok(());
        }
        if let Some(host_uname) = &frame.header.host.uname
            && host_uname != &self.local_uname
        {
            trace!("Frame addressed to '{}', not us", host_uname);
            return Ok(());
        }

        // Frames we multicast to ourselves already arrived via local echo.
        if transport_node_id == local_id && !frame.header.host.local {
            trace!("Filtered our own multicast (seq {})", frame.header.seq);
            return Ok(());
        }

        let mut sender_uname = if frame.header.sender.uname.is_empty() {
            None
        } else {
            Some(frame.header.sender.uname.clone())
        };

        let peer = self
            .peers
            .get_or_create(Some(transport_node_id), sender_uname.as_deref())?;
        if sender_uname.is_none() {
            // Backfill from the cache when the sender did not know its own
            // name yet (early startup).
            sender_uname = peer.uname.clone();
        }

        let message = frame.message()?;
        debug!(
            "Received {} from node {} ('{}')",
            message.op_name(),
            transport_node_id,
            sender_uname.as_deref().unwrap_or("unknown")
        );

        let inbound = InboundEvent::Message(InboundMessage {
            sender_id: transport_node_id,
            sender_uname,
            message,
        });
        self.inbound_tx
            .send(inbound)
            .await
            .map_err(|_| HelmsmanError::NotConnected("Inbound channel closed".to_string()))
    }

    /// Applies a group-membership delta to the peer cache, detects local
    /// eviction, and resolves lingering membership contradictions.
    async fn apply_membership(&self, members: &[u32], joined: &[u32], left: &[u32]) {
        let seen = now_ms();
        info!(
            "Membership change: {} members, {} joined, {} left",
            members.len(),
            joined.len(),
            left.len()
        );

        for id in left {
            match self.peers.get(*id) {
                Some(_) => {
                    if let Err(e) = self.peers.update_state(*id, MembershipState::Lost, seen) {
                        warn!("Could not mark node {} lost: {}", id, e);
                    }
                }
                None => trace!("Departed node {} was never cached", id),
            }
        }

        for id in joined {
            if let Err(e) = self
                .peers
                .get_or_create(Some(*id), None)
                .and_then(|_| self.peers.update_state(*id, MembershipState::Member, seen))
            {
                warn!("Could not admit node {}: {}", id, e);
            }
        }

        let local_id = self.local_node_id();
        let mut local_present = false;
        for id in members {
            if *id == local_id {
                local_present = true;
            }
            let cached = match self.peers.get_or_create(Some(*id), None) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!("Could not cache member {}: {}", id, e);
                    continue;
                }
            };

            if cached.state == MembershipState::Member {
                continue;
            }

            // The transport says this node is in the group while the peer
            // cache says otherwise. Give the cluster layer a window to
            // catch up, then believe the transport.
            match self.peers.note_contradiction(*id) {
                Ok(first_seen) => {
                    if first_seen.elapsed() >= self.config.membership_contradiction_timeout {
                        warn!(
                            "Node {} stuck in {:?} for {:?}, forcing member state",
                            id,
                            cached.state,
                            first_seen.elapsed()
                        );
                        let _ = self.peers.update_state(*id, MembershipState::Member, seen);
                    }
                }
                Err(e) => warn!("Could not track contradiction for node {}: {}", id, e),
            }
        }

        if !local_present && !members.is_empty() {
            error!("Local node {} evicted from the transport group", local_id);
            self.evicted.store(true, Ordering::Release);
            let _ = self.inbound_tx.send(InboundEvent::Disconnected).await;
        }
    }
}

impl std::fmt::Debug for MessagingLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingLayer")
            .field("local_uname", &self.local_uname)
            .field("evicted", &self.is_evicted())
            .field("queued", &self.outbox.len())
            .finish()
    }
}

/// Pumps transport events into the layer until the transport closes or
/// shutdown is signalled.
pub async fn run_receiver(
    layer: Arc<MessagingLayer>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Messaging receiver started");
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => layer.handle_event(event).await,
                    None => {
                        warn!("Transport event stream ended");
                        let _ = layer.inbound_tx.send(InboundEvent::Disconnected).await;
                        return;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Messaging receiver stopping");
                return;
            }
        }
    }
}
