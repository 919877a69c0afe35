// src/core/cib/mod.rs

//! Client shim for the cluster-wide configuration/status store (the CIB).
//!
//! The store itself is replicated elsewhere; the controller submits scoped
//! updates, tracks its call ids, and consumes typed diff notifications. An
//! in-memory backend provides the same contract for tests and single-node
//! operation.

pub mod records;

pub use records::{
    CibChange, CibDiff, CibDocument, CibRevision, NodeStateRecord, ResourceOpRecord,
    ResourceStateRecord, build_op_record,
};

use crate::core::HelmsmanError;
use crate::core::types::{ResourceSpec, agent_rc};
use async_trait::async_trait;
use bitflags::bitflags;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

bitflags! {
    /// Submission options. The replicated store interprets these; the
    /// in-memory backend only validates them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CibCallOptions: u32 {
        /// Apply even without quorum (fencing results, self state).
        const QUORUM_OVERRIDE = 1 << 0;
        /// The request targets a path, not a whole section.
        const XPATH_SCOPED    = 1 << 1;
        /// No completion payload needed.
        const DISCARD_REPLY   = 1 << 2;
    }
}

/// A scoped mutation of the store.
#[derive(Debug, Clone, PartialEq)]
pub enum CibRequest {
    /// Create/replace one op record under a node's resource history,
    /// creating the resource entry if needed. Failures are mirrored into
    /// the retained last-failure record.
    RecordOp {
        node: String,
        rsc: ResourceSpec,
        record: ResourceOpRecord,
        lock_time: Option<u64>,
    },
    /// Remove op records for a resource. `keep_last_failure` preserves the
    /// retained failure entry; `only_op_id` limits the erase to one record.
    EraseOpHistory {
        node: String,
        rsc_id: String,
        keep_last_failure: bool,
        only_op_id: Option<String>,
    },
    /// Remove a resource's whole history from a node.
    DeleteResource { node: String, rsc_id: String },
    /// Set or clear the shutdown lock on a resource.
    SetShutdownLock {
        node: String,
        rsc_id: String,
        lock_time: Option<u64>,
    },
    /// Update a node_state entry's membership attributes.
    NodeState {
        node: String,
        node_id: u32,
        in_ccm: Option<bool>,
        controller_online: Option<bool>,
        join: Option<String>,
        expected: Option<String>,
    },
    /// Record the elected DC.
    SetDc(Option<String>),
    /// Replace a node's entire resource-history section (refresh).
    RefreshNode {
        node: String,
        resources: Vec<ResourceStateRecord>,
    },
}

/// What the store consumer must provide.
#[async_trait]
pub trait CibBackend: Send + Sync {
    /// Applies one request transactionally and returns the new revision.
    async fn apply(
        &self,
        request: CibRequest,
        options: CibCallOptions,
    ) -> Result<CibRevision, HelmsmanError>;

    /// Subscribes to diff notifications.
    fn subscribe(&self) -> broadcast::Receiver<CibDiff>;

    /// Full document snapshot (scheduler input).
    async fn snapshot(&self) -> CibDocument;
}

/// The controller-side client: call-id allocation and submission tracking
/// on top of a backend.
pub struct CibClient {
    backend: Arc<dyn CibBackend>,
    call_id: AtomicI32,
    last_call_id: AtomicI32,
}

impl CibClient {
    pub fn new(backend: Arc<dyn CibBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            call_id: AtomicI32::new(1),
            last_call_id: AtomicI32::new(0),
        })
    }

    /// Allocates the next call id, wrapping within `[1, i32::MAX]`.
    fn next_call_id(&self) -> i32 {
        let id = self.call_id.fetch_add(1, Ordering::AcqRel);
        if id == i32::MAX {
            self.call_id.store(1, Ordering::Release);
        }
        id
    }

    /// The call id of the most recently completed submission.
    pub fn last_call_id(&self) -> i32 {
        self.last_call_id.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CibDiff> {
        self.backend.subscribe()
    }

    pub async fn snapshot(&self) -> CibDocument {
        self.backend.snapshot().await
    }

    /// Submits a request and returns its call id once the store confirms.
    pub async fn submit(
        &self,
        request: CibRequest,
        options: CibCallOptions,
    ) -> Result<i32, HelmsmanError> {
        let call_id = self.next_call_id();
        trace!("CIB call {}: {:?}", call_id, request);
        let revision = self.backend.apply(request, options).await?;
        self.last_call_id.store(call_id, Ordering::Release);
        trace!("CIB call {} confirmed at revision {}", call_id, revision);
        Ok(call_id)
    }
}

impl std::fmt::Debug for CibClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CibClient")
            .field("last_call_id", &self.last_call_id())
            .finish()
    }
}

/// Whether a result counts as a failure for last-failure retention.
fn op_failed(record: &ResourceOpRecord) -> bool {
    use crate::core::types::OpStatus;
    match record.op_status {
        OpStatus::Done => !matches!(
            record.rc,
            agent_rc::OK | agent_rc::NOT_RUNNING | agent_rc::RUNNING_MASTER
        ),
        OpStatus::Cancelled | OpStatus::Pending => false,
        _ => true,
    }
}

/// The in-memory store: a faithful single-process stand-in for the
/// replicated CIB, including typed diff notifications.
pub struct InMemoryCib {
    doc: RwLock<CibDocument>,
    diff_tx: broadcast::Sender<CibDiff>,
}

impl InMemoryCib {
    pub fn new() -> Arc<Self> {
        let (diff_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            doc: RwLock::new(CibDocument::default()),
            diff_tx,
        })
    }

    fn publish(&self, from: CibRevision, to: CibRevision, changes: Vec<CibChange>) {
        if changes.is_empty() {
            return;
        }
        let diff = CibDiff { from, to, changes };
        if self.diff_tx.send(diff).is_err() {
            trace!("CIB diff published with no subscribers");
        }
    }

    /// Directly replaces the configuration section, as an administrator
    /// would. Emits a config-changed diff.
    pub fn set_config_value(&self, path: &str, value: serde_json::Value) {
        let (from, to) = {
            let mut doc = self.doc.write();
            let from = doc.revision;
            doc.config.insert(path.to_string(), value);
            doc.revision.bump_epoch();
            (from, doc.revision)
        };
        self.publish(
            from,
            to,
            vec![CibChange::ConfigChanged {
                path: path.to_string(),
            }],
        );
    }
}

#[async_trait]
impl CibBackend for InMemoryCib {
    async fn apply(
        &self,
        request: CibRequest,
        _options: CibCallOptions,
    ) -> Result<CibRevision, HelmsmanError> {
        let mut changes = Vec::new();
        let (from, to) = {
            let mut doc = self.doc.write();
            let from = doc.revision;

            match request {
                CibRequest::RecordOp {
                    node,
                    rsc,
                    record,
                    lock_time,
                } => {
                    let node_entry = doc
                        .nodes
                        .entry(node.clone())
                        .or_insert_with(|| NodeStateRecord::new(&node, 0));
                    let rsc_entry = node_entry
                        .resources
                        .entry(rsc.id.clone())
                        .or_insert_with(|| ResourceStateRecord::new(rsc.clone()));

                    rsc_entry.shutdown_lock = lock_time;

                    if op_failed(&record) {
                        let mut failure = record.clone();
                        failure.id = ResourceOpRecord::last_failure_id(&rsc.id);
                        rsc_entry.ops.insert(failure.id.clone(), failure.clone());
                        changes.push(CibChange::OpRecord {
                            node: node.clone(),
                            rsc_id: rsc.id.clone(),
                            record: failure,
                        });
                    }

                    rsc_entry.ops.insert(record.id.clone(), record.clone());
                    changes.push(CibChange::OpRecord {
                        node,
                        rsc_id: rsc.id,
                        record,
                    });
                }
                CibRequest::EraseOpHistory {
                    node,
                    rsc_id,
                    keep_last_failure,
                    only_op_id,
                } => {
                    if let Some(node_entry) = doc.nodes.get_mut(&node)
                        && let Some(rsc_entry) = node_entry.resources.get_mut(&rsc_id)
                    {
                        let failure_id = ResourceOpRecord::last_failure_id(&rsc_id);
                        let victims: Vec<String> = rsc_entry
                            .ops
                            .keys()
                            .filter(|id| match &only_op_id {
                                Some(only) => *id == only,
                                None => true,
                            })
                            .filter(|id| !(keep_last_failure && **id == failure_id))
                            .cloned()
                            .collect();
                        for op_id in victims {
                            rsc_entry.ops.remove(&op_id);
                            changes.push(CibChange::OpRecordRemoved {
                                node: node.clone(),
                                rsc_id: rsc_id.clone(),
                                op_id,
                            });
                        }
                    }
                }
                CibRequest::DeleteResource { node, rsc_id } => {
                    if let Some(node_entry) = doc.nodes.get_mut(&node)
                        && node_entry.resources.remove(&rsc_id).is_some()
                    {
                        changes.push(CibChange::ResourceRemoved { node, rsc_id });
                    }
                }
                CibRequest::SetShutdownLock {
                    node,
                    rsc_id,
                    lock_time,
                } => {
                    if let Some(node_entry) = doc.nodes.get_mut(&node)
                        && let Some(rsc_entry) = node_entry.resources.get_mut(&rsc_id)
                    {
                        rsc_entry.shutdown_lock = lock_time;
                        changes.push(CibChange::NodeState { node });
                    }
                }
                CibRequest::NodeState {
                    node,
                    node_id,
                    in_ccm,
                    controller_online,
                    join,
                    expected,
                } => {
                    let entry = doc
                        .nodes
                        .entry(node.clone())
                        .or_insert_with(|| NodeStateRecord::new(&node, node_id));
                    if node_id != 0 {
                        entry.node_id = node_id;
                    }
                    if let Some(v) = in_ccm {
                        entry.in_ccm = v;
                    }
                    if let Some(v) = controller_online {
                        entry.controller_online = v;
                    }
                    if let Some(v) = join {
                        entry.join = v;
                    }
                    if let Some(v) = expected {
                        entry.expected = v;
                    }
                    changes.push(CibChange::NodeState { node });
                }
                CibRequest::SetDc(dc) => {
                    if doc.dc != dc {
                        doc.dc = dc.clone();
                        changes.push(CibChange::DcChanged { dc });
                    }
                }
                CibRequest::RefreshNode { node, resources } => {
                    let entry = doc
                        .nodes
                        .entry(node.clone())
                        .or_insert_with(|| NodeStateRecord::new(&node, 0));
                    entry.resources = resources
                        .into_iter()
                        .map(|r| (r.rsc.id.clone(), r))
                        .collect();
                    changes.push(CibChange::NodeState { node });
                }
            }

            if !changes.is_empty() {
                doc.revision.bump_update();
            }
            (from, doc.revision)
        };

        if changes.is_empty() {
            debug!("CIB request was a no-op at revision {}", from);
        }
        self.publish(from, to, changes);
        Ok(to)
    }

    fn subscribe(&self) -> broadcast::Receiver<CibDiff> {
        self.diff_tx.subscribe()
    }

    async fn snapshot(&self) -> CibDocument {
        self.doc.read().clone()
    }
}

impl std::fmt::Debug for InMemoryCib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let doc = self.doc.read();
        f.debug_struct("InMemoryCib")
            .field("revision", &doc.revision)
            .field("nodes", &doc.nodes.len())
            .finish()
    }
}

/// Helper used on fence notifications: the DC records the fenced node as
/// down without waiting for the membership layer.
pub async fn record_fenced_node(
    cib: &CibClient,
    uname: &str,
) -> Result<i32, HelmsmanError> {
    let request = CibRequest::NodeState {
        node: uname.to_string(),
        node_id: 0,
        in_ccm: Some(false),
        controller_online: Some(false),
        join: Some("down".to_string()),
        expected: Some("down".to_string()),
    };
    let call_id = cib
        .submit(request, CibCallOptions::QUORUM_OVERRIDE)
        .await?;
    warn!("Recorded fenced node '{}' as down (call {})", uname, call_id);
    Ok(call_id)
}
