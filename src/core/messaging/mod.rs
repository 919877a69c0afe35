// src/core/messaging/mod.rs

//! Cluster messaging: frames, the control-message vocabulary, the send
//! queue, and the receive-side filtering that feeds the controller.

pub mod frame;
pub mod layer;
pub mod outbox;
pub mod protocol;
pub mod transport;

pub use frame::{EndpointId, FrameHeader, HostSpec, WireFrame};
pub use layer::{Destination, InboundEvent, InboundMessage, MessagingLayer, run_receiver};
pub use outbox::{Outbox, run_flusher};
pub use protocol::{ControlMessage, FenceNotification, MsgClass, NodeSummary, RemoteResourceOp};
pub use transport::{ClusterTransport, LoopbackTransport, MulticastOutcome, TransportEvent};
