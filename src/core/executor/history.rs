// src/core/executor/history.rs

//! The in-memory resource history cache: one entry per resource per node,
//! tracking the last result, the last failure, the active recurring
//! operations, and the parameters a future stop must use.

use crate::core::executor::ops::OpEvent;
use crate::core::types::{ResourceSpec, agent_rc};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Instance-parameter keys that are controller plumbing, never agent input.
/// They are excluded from the cached stop parameters.
const META_PARAM_PREFIX: &str = "crm_";

/// Per-resource history on one node.
#[derive(Debug, Clone)]
pub struct ResourceHistory {
    pub rsc: ResourceSpec,
    /// Last completed non-recurring result.
    pub last: Option<OpEvent>,
    /// Most recent failure (survives later successes of other op types).
    pub failed: Option<OpEvent>,
    /// Active recurring operations, keyed by `(op_type, interval_ms)`.
    pub recurring: BTreeMap<(String, u32), OpEvent>,
    /// Instance parameters from the last successful start/reload/monitor,
    /// used to stop the resource with historical attributes.
    pub stop_params: Option<BTreeMap<String, String>>,
    pub last_call_id: i32,
}

impl ResourceHistory {
    pub fn new(rsc: ResourceSpec) -> Self {
        Self {
            rsc,
            last: None,
            failed: None,
            recurring: BTreeMap::new(),
            stop_params: None,
            last_call_id: 0,
        }
    }

    /// Applies one result to this entry. Mirrors the recording rules the
    /// cluster depends on:
    ///  - recurring cancellations remove their recurring entry and nothing else;
    ///  - failures replace `failed`;
    ///  - non-recurring successes replace `last` and, for start/reload/monitor,
    ///    refresh the cached stop parameters;
    ///  - recurring results (re)register themselves, deduplicated by
    ///    `(op_type, interval)`;
    ///  - a non-recurring, non-monitor completion drops every recurring entry.
    pub fn update(&mut self, op: &OpEvent) {
        self.last_call_id = op.call_id;

        if op.op_status == crate::core::types::OpStatus::Cancelled {
            if op.is_recurring() {
                trace!("Removing cancelled recurring op {}", op.op_key());
                self.recurring
                    .remove(&(op.op_type.clone(), op.interval_ms));
            } else {
                trace!(
                    "Skipping cancelled non-recurring {} (rc={})",
                    op.op_key(),
                    op.rc
                );
            }
            return;
        }

        if op.failed() {
            // Keep failed monitors here; a later stop must not erase the
            // evidence the scheduler acts on.
            self.failed = Some(op.clone());
        } else if !op.is_recurring() {
            self.last = Some(op.clone());

            if !op.params.is_empty()
                && matches!(op.op_type.as_str(), "start" | "reload" | "monitor")
            {
                let cached: BTreeMap<String, String> = op
                    .params
                    .iter()
                    .filter(|(k, _)| !k.starts_with(META_PARAM_PREFIX))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.stop_params = Some(cached);
            }
        }

        if op.is_recurring() {
            // Re-registering an interval replaces the old entry outright.
            self.recurring
                .insert((op.op_type.clone(), op.interval_ms), op.clone());
        } else if !self.recurring.is_empty() && op.op_type != "monitor" {
            debug!(
                "Dropping {} recurring ops for '{}' after {}",
                self.recurring.len(),
                op.rsc_id,
                op.op_type
            );
            self.recurring.clear();
        }
    }

    /// Whether the resource is active on this node according to its history:
    /// anything but a clean stop, a successful migrate-away, a not-running
    /// probe, or a fatal misconfiguration counts as active.
    pub fn is_active(&self) -> bool {
        let Some(last) = &self.last else {
            return false;
        };

        match (last.op_type.as_str(), last.rc) {
            ("stop", rc) if rc == agent_rc::OK => false,
            ("migrate_to", rc) if rc == agent_rc::OK => false,
            ("monitor", rc) if rc == agent_rc::NOT_RUNNING => false,
            (_, rc)
                if rc == agent_rc::NOT_CONFIGURED
                    || rc == agent_rc::INVALID_PARAM
                    || rc == agent_rc::INSUFFICIENT_PRIV =>
            {
                // A resource the agent cannot even interpret is not running.
                false
            }
            _ => true,
        }
    }

    /// Drops the failure entry matching the given op identity, if any.
    pub fn clear_failure_for(&mut self, op_type: &str, interval_ms: u32) -> bool {
        if let Some(failed) = &self.failed
            && failed.op_type == op_type
            && failed.interval_ms == interval_ms
        {
            self.failed = None;
            return true;
        }
        false
    }

    /// Whether a failure is recorded for the given op identity.
    pub fn has_failure_for(&self, op_type: &str, interval_ms: u32) -> bool {
        self.failed
            .as_ref()
            .is_some_and(|f| f.op_type == op_type && f.interval_ms == interval_ms)
    }
}
