// src/core/executor/client.rs

//! The per-node executor client: issues operations against the local (or a
//! remote) executor daemon, tracks pending invocations, maintains the
//! resource-history cache, and reconciles every result against the CIB.

use crate::config::{ExecutorConfig, ShutdownLockConfig};
use crate::core::HelmsmanError;
use crate::core::cib::{CibCallOptions, CibClient, CibRequest, ResourceStateRecord, build_op_record};
use crate::core::executor::backend::{CancelOutcome, ExecRequest, ExecutorBackend, ExecutorEvent};
use crate::core::executor::history::ResourceHistory;
use crate::core::executor::metadata::{
    MetadataCache, compute_digest, compute_restart_digest, compute_secure_digest,
};
use crate::core::executor::ops::{OpEvent, PendingOp, PendingOpFlags, stop_id};
use crate::core::types::{OpStatus, ResourceSpec, agent_rc, is_recordable, now_ms, version_lt};
use parking_lot::RwLock;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

/// First protocol version whose peers understand the newer op statuses.
/// Results reported to an older DC are remapped to the legacy encoding.
const STATUS_REMAP_VERSION: &str = "3.2.0";

/// Events the executor client surfaces to the controller.
#[derive(Debug, Clone)]
pub enum ExecutorNotice {
    /// A result was fully processed. `direct_ack` marks results that were
    /// not (or could not be) recorded in the CIB: the graph engine must be
    /// confirmed directly or it would wait forever for a diff.
    OpResult {
        node: String,
        event: OpEvent,
        direct_ack: bool,
    },
    /// The executor connection died and could not be re-established within
    /// the configured attempts.
    ConnectionLost { node: String, fatal: bool },
}

/// The specification of one operation submission.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub rsc_id: String,
    pub action: String,
    pub params: BTreeMap<String, String>,
    pub interval_ms: u32,
    pub timeout_ms: u64,
    pub start_delay_ms: u64,
    /// Encoded transition key, when a graph action fired this.
    pub user_data: Option<String>,
}

/// Executor client state for one target node (the local node, or a remote
/// node proxied through a connection resource).
pub struct ExecutorState {
    node_name: String,
    backend: Arc<dyn ExecutorBackend>,
    resources: DashMap<String, ResourceSpec>,
    history: DashMap<String, ResourceHistory>,
    /// Keyed by `<rsc>:<call-id>`.
    pending: DashMap<String, PendingOp>,
    /// CIB call ids of in-flight history deletions, by resource.
    deletions: DashMap<i32, String>,
    metadata: Arc<MetadataCache>,
    cib: Arc<CibClient>,
    notices: mpsc::Sender<ExecutorNotice>,
    shutting_down: AtomicBool,
    dc_version: RwLock<Option<String>>,
    /// Source of ids for synthesized results, counting down from -1 so they
    /// can never collide with executor-assigned ids.
    fake_call_id: AtomicI32,
    exec_config: ExecutorConfig,
    lock_config: ShutdownLockConfig,
}

impl ExecutorState {
    pub fn new(
        node_name: &str,
        backend: Arc<dyn ExecutorBackend>,
        metadata: Arc<MetadataCache>,
        cib: Arc<CibClient>,
        notices: mpsc::Sender<ExecutorNotice>,
        exec_config: ExecutorConfig,
        lock_config: ShutdownLockConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name: node_name.to_string(),
            backend,
            resources: DashMap::new(),
            history: DashMap::new(),
            pending: DashMap::new(),
            deletions: DashMap::new(),
            metadata,
            cib,
            notices,
            shutting_down: AtomicBool::new(false),
            dc_version: RwLock::new(None),
            fake_call_id: AtomicI32::new(-1),
            exec_config,
            lock_config,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    /// Marks the controller as shutting down: starts are NACK'd from now on.
    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Records the DC's advertised protocol version for status remapping.
    pub fn set_dc_version(&self, version: Option<String>) {
        *self.dc_version.write() = version;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_snapshot(&self) -> Vec<PendingOp> {
        self.pending.iter().map(|p| p.clone()).collect()
    }

    pub fn history_snapshot(&self, rsc_id: &str) -> Option<ResourceHistory> {
        self.history.get(rsc_id).map(|h| h.clone())
    }

    pub fn registered_resources(&self) -> Vec<ResourceSpec> {
        self.resources.iter().map(|r| r.clone()).collect()
    }

    /// Registers a resource with the executor and caches its agent metadata.
    pub async fn register(&self, rsc: &ResourceSpec) -> Result<(), HelmsmanError> {
        self.backend.register(rsc).await?;
        self.resources.insert(rsc.id.clone(), rsc.clone());

        if self.metadata.get(rsc).is_none() {
            match self.backend.get_metadata(rsc).await {
                Ok(raw) => match crate::core::executor::metadata::AgentMetadata::parse(&raw) {
                    Ok(parsed) => {
                        self.metadata.insert(rsc, parsed);
                    }
                    Err(e) => debug!("Metadata for {} unusable: {}", rsc.agent_spec(), e),
                },
                Err(e) => debug!("No metadata for {}: {}", rsc.agent_spec(), e),
            }
        }
        Ok(())
    }

    pub async fn unregister(&self, rsc_id: &str) -> Result<(), HelmsmanError> {
        self.backend.unregister(rsc_id).await?;
        self.resources.remove(rsc_id);
        Ok(())
    }

    /// Submits an operation. During shutdown, start requests are refused
    /// with a synthesized NACK so the initiating transition fails cleanly;
    /// stops continue to be accepted.
    pub async fn exec(&self, spec: ExecSpec) -> Result<i32, HelmsmanError> {
        if self.shutting_down.load(Ordering::Acquire) && spec.action == "start" {
            warn!(
                "Refusing start of '{}' while shutting down",
                spec.rsc_id
            );
            let call_id = self.next_fake_call_id();
            let event = OpEvent {
                rsc_id: spec.rsc_id.clone(),
                op_type: spec.action.clone(),
                interval_ms: spec.interval_ms,
                call_id,
                rc: agent_rc::DIRECT_NACK,
                op_status: OpStatus::Invalid,
                output: Some("Controller is shutting down".to_string()),
                user_data: spec.user_data.clone(),
                rsc_deleted: false,
                exec_time_ms: 0,
                queue_time_ms: 0,
                params: spec.params.clone(),
            };
            self.process_event(event, None).await;
            return Ok(call_id);
        }

        let rsc = self
            .resources
            .get(&spec.rsc_id)
            .map(|r| r.clone())
            .ok_or_else(|| HelmsmanError::UnknownResource(spec.rsc_id.clone()))?;

        let request = ExecRequest {
            rsc_id: rsc.id.clone(),
            action: spec.action.clone(),
            user_data: spec.user_data.clone(),
            interval_ms: spec.interval_ms,
            timeout_ms: spec.timeout_ms,
            start_delay_ms: spec.start_delay_ms,
            params: spec.params.clone(),
        };
        let call_id = self.backend.exec(request).await?;

        let mut pending = PendingOp::new(
            call_id,
            &spec.rsc_id,
            &spec.action,
            spec.interval_ms,
            spec.user_data,
            spec.params,
            spec.timeout_ms,
            spec.start_delay_ms,
        );
        if self.lock_config.enabled {
            pending.lock_time = Some(now_ms());
        }
        debug!(
            "Submitted {} (call {}) on node '{}'",
            pending.op_key, call_id, self.node_name
        );
        self.pending.insert(stop_id(&spec.rsc_id, call_id), pending);
        Ok(call_id)
    }

    /// Requests cancellation of an operation by identity. Returns the
    /// truthful executor-side state: when there is nothing to cancel, the
    /// pending record has already been dropped here and the caller must not
    /// wait for a cancelled result.
    pub async fn cancel(
        &self,
        rsc_id: &str,
        action: &str,
        interval_ms: u32,
    ) -> Result<CancelOutcome, HelmsmanError> {
        let key = crate::core::types::op_key(rsc_id, action, interval_ms);
        let entry = self.pending.iter().find_map(|p| {
            (p.op_key == key).then(|| (stop_id(&p.rsc_id, p.call_id), p.call_id))
        });

        let Some((pending_key, call_id)) = entry else {
            trace!("No pending record for {}, nothing to cancel", key);
            return Ok(CancelOutcome::NothingToCancel);
        };

        {
            let mut pending = self
                .pending
                .get_mut(&pending_key)
                .ok_or_else(|| HelmsmanError::Internal("Pending op vanished".to_string()))?;
            if pending.flags.contains(PendingOpFlags::CANCELLED) {
                debug!("Operation {} already being cancelled", key);
                return Ok(CancelOutcome::Cancelled);
            }
            pending
                .flags
                .insert(PendingOpFlags::CANCELLED | PendingOpFlags::REMOVE);
        }

        match self.backend.cancel(rsc_id, action, interval_ms).await? {
            CancelOutcome::Cancelled => {
                debug!("Op {} (call {}): cancellation in progress", key, call_id);
                Ok(CancelOutcome::Cancelled)
            }
            CancelOutcome::NothingToCancel => {
                // Never started; the cancelled completion will never come,
                // so the pending record is ours to drop.
                debug!("Op {} (call {}): nothing to cancel", key, call_id);
                self.pending.remove(&pending_key);
                Ok(CancelOutcome::NothingToCancel)
            }
        }
    }

    /// Cancels every pending recurring operation. Returns how many
    /// cancellations were initiated or resolved.
    pub async fn cancel_recurring(&self) -> usize {
        let targets: Vec<(String, String, u32)> = self
            .pending
            .iter()
            .filter(|p| p.is_recurring() && !p.flags.contains(PendingOpFlags::CANCELLED))
            .map(|p| (p.rsc_id.clone(), p.op_type.clone(), p.interval_ms))
            .collect();

        let mut cancelled = 0;
        for (rsc_id, action, interval_ms) in targets {
            match self.cancel(&rsc_id, &action, interval_ms).await {
                Ok(_) => cancelled += 1,
                Err(e) => warn!(
                    "Could not cancel recurring {}:{} ({}ms): {}",
                    rsc_id, action, interval_ms, e
                ),
            }
        }
        cancelled
    }

    /// Erases executor state and CIB history for a resource.
    pub async fn delete(&self, rsc_id: &str) -> Result<(), HelmsmanError> {
        info!("Deleting resource '{}' on node '{}'", rsc_id, self.node_name);
        let _ = self.backend.unregister(rsc_id).await;
        self.resources.remove(rsc_id);
        self.history.remove(rsc_id);
        self.pending.retain(|_, p| p.rsc_id != rsc_id);

        let call_id = self
            .cib
            .submit(
                CibRequest::DeleteResource {
                    node: self.node_name.clone(),
                    rsc_id: rsc_id.to_string(),
                },
                CibCallOptions::empty(),
            )
            .await?;
        self.deletions.insert(call_id, rsc_id.to_string());
        Ok(())
    }

    /// Acknowledges a completed CIB deletion submitted by `delete`.
    pub fn confirm_deletion(&self, cib_call_id: i32) -> Option<String> {
        self.deletions.remove(&cib_call_id).map(|(_, rsc)| rsc)
    }

    /// Forces a full resync of the locally known history into the CIB.
    pub async fn refresh(&self) -> Result<(), HelmsmanError> {
        let records = self.build_resource_records();
        info!(
            "Refreshing {} resource histories for node '{}' into the CIB",
            records.len(),
            self.node_name
        );
        self.cib
            .submit(
                CibRequest::RefreshNode {
                    node: self.node_name.clone(),
                    resources: records,
                },
                CibCallOptions::empty(),
            )
            .await?;
        Ok(())
    }

    /// Unregisters every non-remote-connection resource, erases local and
    /// CIB history, and thereby forces re-detection. Remote-connection
    /// resources are left to the caller, which must recurse into the remote
    /// node first.
    pub async fn reprobe(&self) -> Result<usize, HelmsmanError> {
        let victims: Vec<String> = self
            .history
            .iter()
            .filter(|h| !h.rsc.is_remote_connection())
            .map(|h| h.rsc.id.clone())
            .collect();

        info!(
            "Reprobe on node '{}': wiping {} resources",
            self.node_name,
            victims.len()
        );
        for rsc_id in &victims {
            self.delete(rsc_id).await?;
        }
        Ok(victims.len())
    }

    /// Synthesizes a failed result as though the executor had reported it.
    /// Resources have no generic failure concept, so this injects a failed
    /// one-shot monitor the scheduler reacts to.
    pub async fn fail(&self, rsc_id: &str, reason: &str) -> Result<(), HelmsmanError> {
        if !self.resources.contains_key(rsc_id) && !self.history.contains_key(rsc_id) {
            return Err(HelmsmanError::UnknownResource(rsc_id.to_string()));
        }
        info!("Injecting failure for '{}': {}", rsc_id, reason);
        let event = OpEvent {
            rsc_id: rsc_id.to_string(),
            op_type: "asyncmon".to_string(),
            interval_ms: 0,
            call_id: self.next_fake_call_id(),
            rc: agent_rc::UNKNOWN_ERROR,
            op_status: OpStatus::Done,
            output: Some(reason.to_string()),
            user_data: None,
            rsc_deleted: false,
            exec_time_ms: 0,
            queue_time_ms: 0,
            params: BTreeMap::new(),
        };
        self.process_event(event, None).await;
        Ok(())
    }

    fn next_fake_call_id(&self) -> i32 {
        self.fake_call_id.fetch_sub(1, Ordering::AcqRel)
    }

    /// Synthesizes results for operations pending implausibly long, so a
    /// wedged agent cannot stall a transition forever.
    pub async fn fake_overdue_results(&self) -> usize {
        let grace_ms = self.exec_config.fake_result_after.as_millis() as u64;
        let now = now_ms();
        let overdue: Vec<OpEvent> = self
            .pending
            .iter()
            .filter(|p| now.saturating_sub(p.start_time) > p.overdue_after_ms(grace_ms))
            .map(|p| OpEvent {
                rsc_id: p.rsc_id.clone(),
                op_type: p.op_type.clone(),
                interval_ms: p.interval_ms,
                call_id: p.call_id,
                rc: agent_rc::UNKNOWN_ERROR,
                op_status: OpStatus::Timeout,
                output: Some("Result overdue, faking failure".to_string()),
                user_data: p.user_data.clone(),
                rsc_deleted: false,
                exec_time_ms: 0,
                queue_time_ms: 0,
                params: p.params.clone(),
            })
            .collect();

        let count = overdue.len();
        for event in overdue {
            error!(
                "Faking timeout for overdue op {} (call {})",
                event.op_key(),
                event.call_id
            );
            self.process_event(event, None).await;
        }
        count
    }

    /// Processes one result event: remaps legacy statuses, normalizes
    /// scheduler-owned "errors", decides between CIB recording and direct
    /// acknowledgement, maintains the history cache and shutdown locks, and
    /// finally drops the pending record.
    pub async fn process_event(&self, mut op: OpEvent, fallback_rsc: Option<ResourceSpec>) {
        // Peers running an older protocol do not know the newer statuses.
        if let Some(dc_version) = self.dc_version.read().clone()
            && version_lt(&dc_version, STATUS_REMAP_VERSION)
        {
            match op.op_status {
                OpStatus::NotConnected => {
                    op.op_status = OpStatus::Error;
                    op.rc = agent_rc::CONNECTION_DIED;
                }
                OpStatus::Invalid => {
                    op.op_status = OpStatus::Error;
                    op.rc = agent_rc::DIRECT_NACK;
                }
                _ => {}
            }
        }

        // These are states, not errors; the scheduler decides what they mean.
        if op.op_status == OpStatus::Error
            && matches!(
                op.rc,
                agent_rc::NOT_RUNNING
                    | agent_rc::RUNNING_MASTER
                    | agent_rc::DEGRADED
                    | agent_rc::DEGRADED_MASTER
            )
        {
            op.op_status = OpStatus::Done;
        }

        let pending_key = stop_id(&op.rsc_id, op.call_id);
        let pending = self.pending.get(&pending_key).map(|p| p.clone());

        let rsc = self
            .resources
            .get(&op.rsc_id)
            .map(|r| r.clone())
            .or_else(|| self.history.get(&op.rsc_id).map(|h| h.rsc.clone()))
            .or(fallback_rsc);

        let op_key = op.op_key();
        let mut need_direct_ack = false;

        if op.op_status != OpStatus::Cancelled {
            // We might not record the result; acknowledge directly instead so
            // the initiator does not wait out its timer.
            need_direct_ack = true;

            if is_recordable(&op.op_type) {
                match &rsc {
                    Some(rsc) => {
                        self.record_in_cib(rsc, &op, pending.as_ref()).await;
                        need_direct_ack = false;
                    }
                    None if op.rsc_deleted => {
                        info!(
                            "Not recording {} in CIB: resource information was removed while it ran",
                            op_key
                        );
                    }
                    None => {
                        error!(
                            "Unable to record {} in CIB: no resource information",
                            op_key
                        );
                    }
                }
            }
        } else if op.interval_ms == 0 {
            // A cancelled one-shot was most likely removed from the executor
            // queue before it ever started.
            need_direct_ack = true;
        } else if pending.is_none() {
            // Cancelled recurring op nobody was waiting on.
        } else if op.user_data.is_none() {
            error!(
                "Recurring operation {} was cancelled without transition information",
                op_key
            );
        } else if pending
            .as_ref()
            .is_some_and(|p| p.flags.contains(PendingOpFlags::REMOVE))
        {
            // We asked for this cancellation; erase its history record.
            self.erase_history_by_op(&op).await;

            // If the op had failed, the failure record is deliberately kept,
            // so no deletion confirmation will ever arrive for this op key.
            // Acknowledge the cancel directly to keep the transition moving.
            if self
                .history
                .get(&op.rsc_id)
                .is_some_and(|h| h.has_failure_for(&op.op_type, op.interval_ms))
            {
                need_direct_ack = true;
            }
        } else if op.rsc_deleted {
            debug!("Recurring op {} was cancelled due to resource deletion", op_key);
            need_direct_ack = true;
        }
        // Otherwise: cancelled by the executor itself ahead of a stop;
        // nothing special to do.

        self.update_history(&rsc, &op);

        if op.interval_ms == 0 || op.op_status == OpStatus::Cancelled {
            if self.pending.remove(&pending_key).is_some() {
                trace!(
                    "Op {} (call {}): confirmed, {} still pending",
                    op_key,
                    op.call_id,
                    self.pending.len()
                );
            }
        }

        let rc_desc = if op.op_status == OpStatus::Done {
            format!("rc={}", op.rc)
        } else {
            format!("status={}", op.op_status)
        };
        info!(
            "Result of {} on '{}': {} (call {})",
            op_key, self.node_name, rc_desc, op.call_id
        );

        let notice = ExecutorNotice::OpResult {
            node: self.node_name.clone(),
            event: op,
            direct_ack: need_direct_ack,
        };
        if self.notices.send(notice).await.is_err() {
            warn!("Executor notice channel closed, result dropped");
        }
    }

    async fn record_in_cib(&self, rsc: &ResourceSpec, op: &OpEvent, pending: Option<&PendingOp>) {
        let key = op
            .user_data
            .as_deref()
            .and_then(|ud| crate::core::keys::TransitionKey::parse(ud).ok());

        let mut record = build_op_record(
            &op.rsc_id,
            &op.op_type,
            op.interval_ms,
            op.call_id,
            op.rc,
            op.op_status,
            key.as_ref(),
            op.exec_time_ms,
            op.queue_time_ms,
        );

        if !op.params.is_empty() {
            record.op_digest = Some(compute_digest(&op.params));
            if let Some(metadata) = self.metadata.get(rsc) {
                record.op_restart_digest = Some(compute_restart_digest(&op.params, &metadata));
                record.op_secure_digest = Some(compute_secure_digest(&op.params, &metadata));
            }
        }

        // Shutdown locks follow clean stops; any other result releases them.
        let lock_time = if self.lock_config.enabled
            && ((op.op_type == "stop" && op.rc == agent_rc::OK)
                || (op.op_type == "monitor" && op.rc == agent_rc::NOT_RUNNING))
        {
            pending.and_then(|p| p.lock_time).or_else(|| Some(now_ms()))
        } else {
            None
        };

        let request = CibRequest::RecordOp {
            node: self.node_name.clone(),
            rsc: rsc.clone(),
            record,
            lock_time,
        };
        if let Err(e) = self.cib.submit(request, CibCallOptions::empty()).await {
            error!("Could not record {} in CIB: {}", op.op_key(), e);
        }
    }

    async fn erase_history_by_op(&self, op: &OpEvent) {
        let request = CibRequest::EraseOpHistory {
            node: self.node_name.clone(),
            rsc_id: op.rsc_id.clone(),
            keep_last_failure: true,
            only_op_id: Some(op.op_key()),
        };
        if let Err(e) = self.cib.submit(request, CibCallOptions::empty()).await {
            warn!("Could not erase history entry {}: {}", op.op_key(), e);
        }
    }

    fn update_history(&self, rsc: &Option<ResourceSpec>, op: &OpEvent) {
        if op.rsc_deleted {
            debug!("Purging history for '{}' after {}", op.rsc_id, op.op_type);
            self.history.remove(&op.rsc_id);
            return;
        }
        if op.op_type == "notify" {
            return;
        }

        let mut entry = match self.history.get_mut(&op.rsc_id) {
            Some(entry) => entry,
            None => match rsc {
                Some(rsc) => self
                    .history
                    .entry(op.rsc_id.clone())
                    .or_insert_with(|| ResourceHistory::new(rsc.clone())),
                None => {
                    info!(
                        "Resource '{}' no longer exists, not updating cache",
                        op.rsc_id
                    );
                    return;
                }
            },
        };
        entry.update(op);
    }

    /// Checks that nothing is running before the controller exits. Recurring
    /// operations are cancelled; pending one-shots and active resources
    /// block shutdown unless `terminating` forces the issue, in which case
    /// they are reported and abandoned.
    pub async fn verify_stopped(&self, terminating: bool) -> bool {
        debug!("Checking for active resources before exit");

        if self.is_connected() {
            let stopped = self.cancel_recurring().await;
            let remaining = self.pending.len();
            if stopped > 0 || remaining > 0 {
                info!(
                    "Stopped {} recurring operations at shutdown ({} remaining)",
                    stopped, remaining
                );
            }
        }

        let blocking: Vec<String> = self
            .pending
            .iter()
            .filter(|p| !p.is_recurring())
            .map(|p| p.op_key.clone())
            .collect();

        if !blocking.is_empty() {
            for key in &blocking {
                if terminating {
                    error!("Pending action at shutdown: {}", key);
                } else {
                    info!("Waiting on pending action: {}", key);
                }
            }
            if !terminating {
                return false;
            }
        }

        let mut active = 0usize;
        for entry in self.history.iter() {
            if entry.is_active() {
                active += 1;
                if terminating {
                    error!("Resource '{}' still active at shutdown", entry.rsc.id);
                } else {
                    debug!("Resource '{}' still active", entry.rsc.id);
                }
            }
        }

        if active > 0 && !terminating {
            return false;
        }
        true
    }

    /// Builds the CIB resource records for everything this node knows,
    /// used by refresh.
    pub fn build_resource_records(&self) -> Vec<ResourceStateRecord> {
        self.history
            .iter()
            .map(|entry| {
                let mut record = ResourceStateRecord::new(entry.rsc.clone());
                let mut push = |op: &OpEvent| {
                    let key = op
                        .user_data
                        .as_deref()
                        .and_then(|ud| crate::core::keys::TransitionKey::parse(ud).ok());
                    let rec = build_op_record(
                        &op.rsc_id,
                        &op.op_type,
                        op.interval_ms,
                        op.call_id,
                        op.rc,
                        op.op_status,
                        key.as_ref(),
                        op.exec_time_ms,
                        op.queue_time_ms,
                    );
                    record.ops.insert(rec.id.clone(), rec);
                };

                if let Some(failed) = &entry.failed {
                    push(failed);
                }
                if let Some(last) = &entry.last {
                    push(last);
                }
                for op in entry.recurring.values() {
                    push(op);
                }
                record
            })
            .collect()
    }
}

impl std::fmt::Debug for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorState")
            .field("node", &self.node_name)
            .field("resources", &self.resources.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}


enum PumpExit {
    Disconnected,
    Shutdown,
}

async fn pump_events(
    state: &Arc<ExecutorState>,
    events: &mut mpsc::Receiver<ExecutorEvent>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> PumpExit {
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(ExecutorEvent::ExecComplete(op)) => {
                        state.process_event(op, None).await;
                    }
                    Some(ExecutorEvent::Poke) | Some(ExecutorEvent::NewClient) => {
                        trace!("Executor poke on '{}'", state.node_name());
                    }
                    Some(ExecutorEvent::Disconnect) | None => {
                        return PumpExit::Disconnected;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                return PumpExit::Shutdown;
            }
        }
    }
}

/// Supervises the executor connection for one node: consumes events, and on
/// disconnect retries the connection a bounded number of times with backoff
/// before giving up and escalating a fatal notice.
pub async fn run_connection(
    state: Arc<ExecutorState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Executor connection for '{}' started", state.node_name());
    let Some(mut events) = state.backend.take_events() else {
        error!(
            "Executor event stream for '{}' already claimed",
            state.node_name()
        );
        return;
    };

    loop {
        match pump_events(&state, &mut events, &mut shutdown_rx).await {
            PumpExit::Shutdown => {
                debug!("Executor connection for '{}' stopping", state.node_name());
                return;
            }
            PumpExit::Disconnected => {
                warn!("Executor connection for '{}' lost", state.node_name());
            }
        }

        let mut reconnected = false;
        for attempt in 1..=state.exec_config.max_connect_attempts {
            tokio::select! {
                _ = tokio::time::sleep(state.exec_config.reconnect_backoff) => {}
                _ = shutdown_rx.recv() => return,
            }
            match state.backend.reconnect().await {
                Ok(stream) => {
                    info!(
                        "Executor connection for '{}' re-established (attempt {})",
                        state.node_name(),
                        attempt
                    );
                    events = stream;
                    reconnected = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        "Executor reconnect {}/{} for '{}' failed: {}",
                        attempt,
                        state.exec_config.max_connect_attempts,
                        state.node_name(),
                        e
                    );
                }
            }
        }

        if !reconnected {
            error!(
                "Giving up on executor connection for '{}'",
                state.node_name()
            );
            let notice = ExecutorNotice::ConnectionLost {
                node: state.node_name().to_string(),
                fatal: true,
            };
            let _ = state.notices.send(notice).await;
            return;
        }
    }
}
