// src/core/executor/ops.rs

//! Operation records shared across the executor client: the event shape
//! results arrive in, pending-operation bookkeeping, and call-id allocation.

use crate::core::keys::TransitionKey;
use crate::core::types::{OpStatus, agent_rc, now_ms, op_key};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};

/// A completed (or cancelled, or synthesized) operation result, as reported
/// by the executor or faked by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct OpEvent {
    pub rsc_id: String,
    pub op_type: String,
    pub interval_ms: u32,
    pub call_id: i32,
    pub rc: i32,
    pub op_status: OpStatus,
    pub output: Option<String>,
    /// Opaque round-tripped user data; the controller stores transition keys
    /// here.
    pub user_data: Option<String>,
    /// The executor no longer knows this resource (cleanup raced the op).
    pub rsc_deleted: bool,
    pub exec_time_ms: u64,
    pub queue_time_ms: u64,
    /// Instance parameters in effect for this invocation.
    pub params: BTreeMap<String, String>,
}

impl OpEvent {
    /// The `<rsc>_<op>_<interval>` identity of this event.
    pub fn op_key(&self) -> String {
        op_key(&self.rsc_id, &self.op_type, self.interval_ms)
    }

    /// The rc the initiator hoped for, recovered from the transition key.
    pub fn expected_rc(&self) -> Option<i32> {
        self.user_data
            .as_deref()
            .and_then(|ud| TransitionKey::parse(ud).ok())
            .map(|key| key.target_rc)
    }

    /// Whether this result is a failure from the cluster's point of view:
    /// a non-clean status, or a clean run with an unexpected rc.
    pub fn failed(&self) -> bool {
        match self.op_status {
            OpStatus::Done => match self.expected_rc() {
                Some(target) => self.rc != target,
                None => !matches!(
                    self.rc,
                    agent_rc::OK | agent_rc::NOT_RUNNING | agent_rc::RUNNING_MASTER
                ),
            },
            OpStatus::Cancelled | OpStatus::Pending => false,
            _ => true,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.interval_ms > 0
    }
}

bitflags! {
    /// Lifecycle flags on a pending operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingOpFlags: u8 {
        /// A cancellation was requested.
        const CANCELLED = 1 << 0;
        /// We asked for the cancellation and are waiting to clean up the
        /// history entry when it lands.
        const REMOVE    = 1 << 1;
    }
}

/// One in-flight invocation, kept until its result arrives (or is faked).
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub call_id: i32,
    pub rsc_id: String,
    pub op_type: String,
    pub interval_ms: u32,
    pub op_key: String,
    /// Transition key, when a graph action fired this.
    pub user_data: Option<String>,
    pub params: BTreeMap<String, String>,
    /// Epoch ms at submission.
    pub start_time: u64,
    pub timeout_ms: u64,
    pub start_delay_ms: u64,
    /// Shutdown-lock stamp to propagate into the CIB with the result.
    pub lock_time: Option<u64>,
    pub flags: PendingOpFlags,
}

impl PendingOp {
    pub fn new(
        call_id: i32,
        rsc_id: &str,
        op_type: &str,
        interval_ms: u32,
        user_data: Option<String>,
        params: BTreeMap<String, String>,
        timeout_ms: u64,
        start_delay_ms: u64,
    ) -> Self {
        Self {
            call_id,
            rsc_id: rsc_id.to_string(),
            op_type: op_type.to_string(),
            interval_ms,
            op_key: op_key(rsc_id, op_type, interval_ms),
            user_data,
            params,
            start_time: now_ms(),
            timeout_ms,
            start_delay_ms,
            lock_time: None,
            flags: PendingOpFlags::empty(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.interval_ms > 0
    }

    /// How long this op may remain pending before the controller synthesizes
    /// a result (`timeout + start_delay + grace`).
    pub fn overdue_after_ms(&self, grace_ms: u64) -> u64 {
        self.timeout_ms + self.start_delay_ms + grace_ms
    }
}

/// The map key for a pending operation: `<rsc>:<call-id>`.
pub fn stop_id(rsc_id: &str, call_id: i32) -> String {
    format!("{rsc_id}:{call_id}")
}

/// Monotonic call ids in `[1, i32::MAX]`, wrapping back to 1.
#[derive(Debug)]
pub struct CallIdAllocator {
    next: AtomicI32,
}

impl Default for CallIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CallIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }

    pub fn next(&self) -> i32 {
        let id = self.next.fetch_add(1, Ordering::AcqRel);
        if id == i32::MAX {
            self.next.store(1, Ordering::Release);
        }
        id
    }

    /// The most recently handed-out id, for deriving fake ids below it.
    pub fn current(&self) -> i32 {
        self.next.load(Ordering::Acquire).saturating_sub(1)
    }
}
