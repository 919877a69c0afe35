// src/core/messaging/protocol.rs

//! The cluster control vocabulary: every message class and payload that
//! controllers exchange over the membership transport.

use crate::core::membership::{ElectionNoVote, ElectionVote};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level routing class carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(bincode::Encode, bincode::Decode)]
pub enum MsgClass {
    /// Controller-to-controller traffic (join protocol, elections, TE/LRM
    /// relays, shutdown coordination).
    Controller,
    /// Fencing coordinator traffic (requests, replies, notifications).
    Fencing,
}

/// A resource operation relayed to the executor of another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RemoteResourceOp {
    pub rsc_id: String,
    pub standard: String,
    pub provider: Option<String>,
    pub agent_type: String,
    pub task: String,
    pub interval_ms: u32,
    pub timeout_ms: u64,
    pub start_delay_ms: u64,
    pub params: BTreeMap<String, String>,
    /// Encoded transition key binding the eventual result back to the
    /// graph action that fired this.
    pub user_data: String,
}

/// Summary of a node handed around in join/hello traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct NodeSummary {
    pub node_id: u32,
    pub uname: String,
    pub uuid: Option<String>,
    pub processes: u32,
}

/// A fence outcome propagated cluster-wide (or unicast to the requester).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct FenceNotification {
    /// The node that was (to be) fenced.
    pub target: String,
    pub action: String,
    /// 0 on success; anything else is the failing agent rc.
    pub result: i32,
    /// The node whose device carried out the operation.
    pub executioner: String,
    /// The node that asked for the operation.
    pub origin: String,
    pub client_id: String,
    pub call_id: i32,
    pub device: Option<String>,
    pub output: Option<String>,
    /// Round-tripped transition key when a graph action requested the fence.
    pub user_data: Option<String>,
}

impl FenceNotification {
    pub fn succeeded(&self) -> bool {
        self.result == 0
    }
}

/// Every control message a controller can receive from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ControlMessage {
    /// First contact after a controller starts.
    Hello {
        uname: String,
        version: String,
        processes: u32,
    },
    /// DC invites a node into the cluster (join round `join_id`).
    JoinOffer { dc: String, join_id: u64 },
    /// Node asks the DC to be admitted.
    JoinRequest {
        uname: String,
        join_id: u64,
        version: String,
    },
    /// DC admits (`ack = true`) or rejects a joiner.
    JoinAckNak {
        uname: String,
        join_id: u64,
        ack: bool,
    },
    /// Joiner confirms it wrote its state and is fully in.
    JoinConfirm { uname: String, join_id: u64 },
    /// Peer metadata refresh.
    NodeInfo(NodeSummary),
    /// DC instructs a node to shut down now.
    Shutdown { uname: String },
    /// Node asks the DC to schedule its clean shutdown.
    ShutdownReq { uname: String },
    Ping { from: String },
    /// Load advertisement used to derive remote batch limits.
    Throttle { from: String, level: u32 },
    /// Erase executor + CIB history for a resource on the receiving node.
    LrmDelete { rsc_id: String },
    /// Inject a synthetic failure for a resource on the receiving node.
    LrmFail { rsc_id: String, reason: String },
    /// Ask the receiving node to resync its resource history into the CIB.
    LrmRefresh,
    /// Ask the receiving node for its active resource list.
    LrmQuery { reply_to: String },
    /// Wipe history and force re-detection of every resource.
    Reprobe,
    /// Execute a resource operation on the receiving node's executor.
    InvokeLrm(RemoteResourceOp),
    /// Abort any transition the receiving DC is running.
    TeAbort { reason: String, priority: i32 },
    /// Halt transition processing entirely.
    TeHalt { reason: String },
    Vote(ElectionVote),
    NoVote(ElectionNoVote),
    /// A fence request relayed to the coordinator that owns the device.
    FenceRequest {
        target: String,
        action: String,
        origin: String,
        client_id: String,
        call_id: i32,
        timeout_ms: u64,
        user_data: Option<String>,
    },
    /// Cluster-wide fence outcome.
    FenceNotify(FenceNotification),
}

impl ControlMessage {
    /// The routing class this message travels under.
    pub fn class(&self) -> MsgClass {
        match self {
            ControlMessage::FenceRequest { .. } | ControlMessage::FenceNotify(_) => {
                MsgClass::Fencing
            }
            _ => MsgClass::Controller,
        }
    }

    /// Stable short name for logging.
    pub fn op_name(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::JoinOffer { .. } => "join_offer",
            ControlMessage::JoinRequest { .. } => "join_request",
            ControlMessage::JoinAckNak { .. } => "join_acknak",
            ControlMessage::JoinConfirm { .. } => "join_confirm",
            ControlMessage::NodeInfo(_) => "node_info",
            ControlMessage::Shutdown { .. } => "shutdown",
            ControlMessage::ShutdownReq { .. } => "shutdown_req",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Throttle { .. } => "throttle",
            ControlMessage::LrmDelete { .. } => "lrm_delete",
            ControlMessage::LrmFail { .. } => "lrm_fail",
            ControlMessage::LrmRefresh => "lrm_refresh",
            ControlMessage::LrmQuery { .. } => "lrm_query",
            ControlMessage::Reprobe => "reprobe",
            ControlMessage::InvokeLrm(_) => "invoke_lrm",
            ControlMessage::TeAbort { .. } => "te_abort",
            ControlMessage::TeHalt { .. } => "te_halt",
            ControlMessage::Vote(_) => "vote",
            ControlMessage::NoVote(_) => "novote",
            ControlMessage::FenceRequest { .. } => "fence_request",
            ControlMessage::FenceNotify(_) => "fence_notify",
        }
    }
}
