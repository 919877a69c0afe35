// src/core/cib/records.rs

//! Typed views of the CIB sections the controller reads and writes.
//!
//! The cluster-wide store itself is a collaborator; these records define the
//! persisted shape of the status section the controller owns: per-node
//! resource history with transition keys and digests.

use crate::core::keys::{TransitionKey, TransitionMagic};
use crate::core::types::{OpStatus, ResourceSpec, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The CIB revision triple. Ordering is lexicographic, matching how the
/// store advances it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, Hash,
)]
pub struct CibRevision {
    pub admin_epoch: u64,
    pub epoch: u64,
    pub num_updates: u64,
}

impl CibRevision {
    pub fn bump_update(&mut self) {
        self.num_updates += 1;
    }

    pub fn bump_epoch(&mut self) {
        self.epoch += 1;
        self.num_updates = 0;
    }
}

impl std::fmt::Display for CibRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.admin_epoch, self.epoch, self.num_updates)
    }
}

/// One recorded operation result (`lrm_rsc_op`). The id is the op key, or
/// the distinguished `<rsc>_last_failure_0` for the retained failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOpRecord {
    pub id: String,
    pub op_type: String,
    pub call_id: i32,
    pub rc: i32,
    pub op_status: OpStatus,
    pub interval_ms: u32,
    /// Epoch ms when the operation ran (unset for pending records).
    pub last_run: Option<u64>,
    /// Epoch ms when the rc last changed.
    pub last_rc_change: Option<u64>,
    pub exec_time_ms: u64,
    pub queue_time_ms: u64,
    pub op_digest: Option<String>,
    pub op_restart_digest: Option<String>,
    pub op_secure_digest: Option<String>,
    pub transition_key: Option<String>,
    pub transition_magic: Option<String>,
}

impl ResourceOpRecord {
    /// Decodes the transition magic, if the record carries one.
    pub fn magic(&self) -> Option<TransitionMagic> {
        self.transition_magic
            .as_deref()
            .and_then(|m| TransitionMagic::parse(m).ok())
    }

    /// Decodes the transition key, if the record carries one.
    pub fn key(&self) -> Option<TransitionKey> {
        self.transition_key
            .as_deref()
            .and_then(|k| TransitionKey::parse(k).ok())
    }

    /// The id used for the retained most-recent-failure entry.
    pub fn last_failure_id(rsc_id: &str) -> String {
        format!("{rsc_id}_last_failure_0")
    }
}

/// Per-resource state under one node (`lrm_resource`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStateRecord {
    pub rsc: ResourceSpec,
    /// Epoch ms of the shutdown lock, if the resource is locked to this node.
    pub shutdown_lock: Option<u64>,
    /// Keyed by record id (op key or the last-failure id).
    pub ops: BTreeMap<String, ResourceOpRecord>,
}

impl ResourceStateRecord {
    pub fn new(rsc: ResourceSpec) -> Self {
        Self {
            rsc,
            shutdown_lock: None,
            ops: BTreeMap::new(),
        }
    }
}

/// Per-node status (`node_state`): membership attributes plus the resource
/// history section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeStateRecord {
    pub uname: String,
    pub node_id: u32,
    /// Member of the cluster layer.
    pub in_ccm: bool,
    /// The controller daemon is reachable on the node.
    pub controller_online: bool,
    pub join: String,
    pub expected: String,
    pub resources: BTreeMap<String, ResourceStateRecord>,
}

impl NodeStateRecord {
    pub fn new(uname: &str, node_id: u32) -> Self {
        Self {
            uname: uname.to_string(),
            node_id,
            ..Default::default()
        }
    }
}

/// The whole document, as the controller sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CibDocument {
    pub revision: CibRevision,
    pub dc: Option<String>,
    /// Cluster configuration the controller consults (opaque here; the
    /// scheduler interprets it).
    pub config: serde_json::Map<String, serde_json::Value>,
    pub nodes: BTreeMap<String, NodeStateRecord>,
}

/// One effect observed in a diff notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CibChange {
    /// An operation record was created or replaced.
    OpRecord {
        node: String,
        rsc_id: String,
        record: ResourceOpRecord,
    },
    /// An operation record was removed.
    OpRecordRemoved {
        node: String,
        rsc_id: String,
        op_id: String,
    },
    /// A resource's whole history left the status section.
    ResourceRemoved { node: String, rsc_id: String },
    /// A node_state entry changed membership/join attributes.
    NodeState { node: String },
    /// The recorded DC changed.
    DcChanged { dc: Option<String> },
    /// Something under the configuration section changed.
    ConfigChanged { path: String },
    /// The whole document was replaced; diffs before this are void.
    Replaced,
}

/// A diff notification: the revision step plus its typed changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CibDiff {
    pub from: CibRevision,
    pub to: CibRevision,
    pub changes: Vec<CibChange>,
}

impl CibDiff {
    /// Transition magic of every op record in this diff, in order. The graph
    /// engine scans these to match completions of actions it fired.
    pub fn op_magics(&self) -> impl Iterator<Item = (&str, &ResourceOpRecord)> {
        self.changes.iter().filter_map(|c| match c {
            CibChange::OpRecord { node, record, .. } => Some((node.as_str(), record)),
            _ => None,
        })
    }
}

/// Builds an op record from result fields. Timestamps default to now.
#[allow(clippy::too_many_arguments)]
pub fn build_op_record(
    rsc_id: &str,
    op_type: &str,
    interval_ms: u32,
    call_id: i32,
    rc: i32,
    op_status: OpStatus,
    transition_key: Option<&TransitionKey>,
    exec_time_ms: u64,
    queue_time_ms: u64,
) -> ResourceOpRecord {
    let magic = transition_key.map(|key| TransitionMagic::new(op_status, rc, *key).to_string());
    ResourceOpRecord {
        id: crate::core::types::op_key(rsc_id, op_type, interval_ms),
        op_type: op_type.to_string(),
        call_id,
        rc,
        op_status,
        interval_ms,
        last_run: Some(now_ms()),
        last_rc_change: Some(now_ms()),
        exec_time_ms,
        queue_time_ms,
        op_digest: None,
        op_restart_digest: None,
        op_secure_digest: None,
        transition_key: transition_key.map(|k| k.to_string()),
        transition_magic: magic,
    }
}
