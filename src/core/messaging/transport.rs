// src/core/messaging/transport.rs

//! The cluster-transport seam: helmsman consumes group messaging through
//! this trait and never links a concrete membership stack directly.

use crate::core::HelmsmanError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events pushed up from the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An ordered multicast delivery.
    Delivered { node_id: u32, pid: u32, data: Bytes },
    /// A group-membership change (configuration change callback).
    Membership {
        members: Vec<u32>,
        joined: Vec<u32>,
        left: Vec<u32>,
    },
}

/// Whether the transport accepted a frame for agreed-order delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastOutcome {
    Accepted,
    /// Transient backpressure (the transport queue is full); retry later.
    Backpressure,
}

/// Minimal capabilities helmsman needs from a group-messaging stack.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// The transport-assigned id of the local node.
    fn local_node_id(&self) -> u32;

    /// Multicasts one encoded frame with agreed ordering.
    async fn multicast(&self, frame: Bytes) -> Result<MulticastOutcome, HelmsmanError>;

    /// Hands over the event stream. May only be called once.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// An in-process transport: every multicast loops straight back to the local
/// event stream. Useful for single-node operation and for tests.
pub struct LoopbackTransport {
    node_id: u32,
    pid: u32,
    tx: mpsc::Sender<TransportEvent>,
    rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl LoopbackTransport {
    pub fn new(node_id: u32) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1024);
        Arc::new(Self {
            node_id,
            pid: std::process::id(),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Injects a membership change, as a real transport's configuration
    /// callback would.
    pub async fn inject_membership(&self, members: Vec<u32>, joined: Vec<u32>, left: Vec<u32>) {
        let _ = self
            .tx
            .send(TransportEvent::Membership {
                members,
                joined,
                left,
            })
            .await;
    }

    /// Injects a raw delivery attributed to an arbitrary sender, for
    /// exercising the receive-side filters.
    pub async fn inject_delivery(&self, node_id: u32, pid: u32, data: Bytes) {
        let _ = self
            .tx
            .send(TransportEvent::Delivered { node_id, pid, data })
            .await;
    }
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    fn local_node_id(&self) -> u32 {
        self.node_id
    }

    async fn multicast(&self, frame: Bytes) -> Result<MulticastOutcome, HelmsmanError> {
        match self.tx.try_send(TransportEvent::Delivered {
            node_id: self.node_id,
            pid: self.pid,
            data: frame,
        }) {
            Ok(()) => Ok(MulticastOutcome::Accepted),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(MulticastOutcome::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HelmsmanError::NotConnected(
                "Loopback transport event stream closed".to_string(),
            )),
        }
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.rx.lock().take()
    }
}
