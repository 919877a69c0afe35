// src/core/transition/graph.rs

//! The transition graph: actions and synapses in arena storage, with
//! integer indices instead of owning cross-references.

use crate::core::keys::TransitionKey;
use crate::core::types::{OpStatus, ResourceSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// What a graph action asks of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// A resource operation on some node's executor.
    RscOp,
    /// Pure ordering; confirmed the moment it fires.
    Pseudo,
    /// A cluster event: fencing, or a controller-level operation.
    CrmEvent,
}

/// What to do once an aborted graph has wound down. Ordered by severity;
/// merges take the maximum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum AbortAction {
    #[default]
    Done,
    Restart,
    Shutdown,
    Terminate,
}

/// A dependency edge: the referenced action must be confirmed, and its
/// result must match the guard when one is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInput {
    pub action_id: u32,
    pub target_rc: Option<i32>,
}

/// An action as produced by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub id: u32,
    pub kind: ActionKind,
    pub task: String,
    pub target: Option<String>,
    pub rsc: Option<ResourceSpec>,
    #[serde(default)]
    pub interval_ms: u32,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub start_delay_ms: u64,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub can_fail: bool,
    #[serde(default)]
    pub target_rc: i32,
}

/// A synapse as produced by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynapseSpec {
    pub id: u32,
    #[serde(default)]
    pub priority: i32,
    pub actions: Vec<u32>,
    #[serde(default)]
    pub inputs: Vec<ActionInput>,
}

/// The scheduler's whole output for one transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphSpec {
    #[serde(default)]
    pub batch_limit: u32,
    pub actions: Vec<ActionSpec>,
    pub synapses: Vec<SynapseSpec>,
}

/// Runtime state of one action.
#[derive(Debug, Clone)]
pub struct GraphAction {
    pub spec: ActionSpec,
    pub executed: bool,
    pub confirmed: bool,
    pub failed: bool,
    pub observed_rc: Option<i32>,
}

impl GraphAction {
    fn new(spec: ActionSpec) -> Self {
        Self {
            spec,
            executed: false,
            confirmed: false,
            failed: false,
            observed_rc: None,
        }
    }

    /// The key that will ride through the executor/fencer and come back on
    /// the confirmation.
    pub fn transition_key(&self, graph_id: u64, graph_uuid: Uuid) -> TransitionKey {
        TransitionKey::new(graph_id, self.spec.id, self.spec.target_rc, graph_uuid)
    }
}

/// Runtime state of one synapse.
#[derive(Debug, Clone)]
pub struct Synapse {
    pub id: u32,
    pub priority: i32,
    /// Indices into the action arena.
    pub actions: Vec<usize>,
    pub inputs: Vec<ActionInput>,
    pub fired: bool,
    pub confirmed: bool,
    pub failed: bool,
}

/// What applying a confirmation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// First confirmation for the action; state advanced.
    Applied,
    /// The action was already confirmed; idempotent no-op.
    Duplicate,
    /// The key belongs to another graph generation; discarded.
    Stale,
    /// No action in this graph has the id.
    Unknown,
}

/// A transition graph plus its execution state. Owned exclusively by the
/// engine; replaced atomically when the scheduler recomputes.
#[derive(Debug, Clone)]
pub struct TransitionGraph {
    pub id: u64,
    pub uuid: Uuid,
    pub batch_limit: u32,
    pub global_timeout: Duration,
    pub complete: bool,
    pub abort_priority: i32,
    pub abort_action: AbortAction,
    pub abort_reason: Option<String>,
    pub actions: Vec<GraphAction>,
    pub synapses: Vec<Synapse>,
    by_action_id: HashMap<u32, usize>,
}

impl TransitionGraph {
    /// Materializes a scheduler spec into an executable graph. Synapse
    /// action references must resolve; dangling ids are a scheduler bug and
    /// rejected wholesale.
    pub fn from_spec(
        id: u64,
        spec: GraphSpec,
        global_timeout: Duration,
    ) -> Result<Self, crate::core::HelmsmanError> {
        let actions: Vec<GraphAction> = spec.actions.into_iter().map(GraphAction::new).collect();
        let by_action_id: HashMap<u32, usize> = actions
            .iter()
            .enumerate()
            .map(|(idx, action)| (action.spec.id, idx))
            .collect();

        let mut synapses = Vec::with_capacity(spec.synapses.len());
        for syn in spec.synapses {
            let mut indices = Vec::with_capacity(syn.actions.len());
            for action_id in &syn.actions {
                match by_action_id.get(action_id) {
                    Some(idx) => indices.push(*idx),
                    None => {
                        return Err(crate::core::HelmsmanError::Protocol(format!(
                            "Synapse {} references unknown action {}",
                            syn.id, action_id
                        )));
                    }
                }
            }
            synapses.push(Synapse {
                id: syn.id,
                priority: syn.priority,
                actions: indices,
                inputs: syn.inputs,
                fired: false,
                confirmed: false,
                failed: false,
            });
        }

        info!(
            "Unpacked transition {}: {} actions in {} synapses",
            id,
            actions.len(),
            synapses.len()
        );
        Ok(Self {
            id,
            uuid: Uuid::new_v4(),
            batch_limit: spec.batch_limit,
            global_timeout,
            complete: false,
            abort_priority: 0,
            abort_action: AbortAction::Done,
            abort_reason: None,
            actions,
            synapses,
            by_action_id,
        })
    }

    pub fn action_index(&self, action_id: u32) -> Option<usize> {
        self.by_action_id.get(&action_id).copied()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_priority > 0 || self.abort_action > AbortAction::Done
    }

    /// Raises the abort priority and action; both merge by maximum so a
    /// terminate can never be downgraded by a later restart.
    pub fn abort(&mut self, priority: i32, action: AbortAction, reason: &str) {
        let first = !self.is_aborted();
        if priority > self.abort_priority {
            self.abort_priority = priority;
        }
        if action > self.abort_action {
            self.abort_action = action;
        }
        if first {
            self.abort_reason = Some(reason.to_string());
            info!(
                "Transition {} aborted: {} (priority {}, {:?})",
                self.id, reason, self.abort_priority, self.abort_action
            );
        } else {
            debug!(
                "Transition {} abort update: {} (priority {}, {:?})",
                self.id, reason, self.abort_priority, self.abort_action
            );
        }
    }

    /// Applies one confirmation. Stale and duplicate confirmations have no
    /// effect; the first matching one records the result and settles any
    /// synapse whose actions are now all confirmed.
    pub fn confirm(
        &mut self,
        key: &TransitionKey,
        op_status: OpStatus,
        rc: i32,
    ) -> ConfirmOutcome {
        if key.graph_id != self.id || key.uuid != self.uuid {
            trace!(
                "Ignoring confirmation for graph {} (current is {})",
                key.graph_id, self.id
            );
            return ConfirmOutcome::Stale;
        }

        let Some(idx) = self.action_index(key.action_id) else {
            warn!(
                "Confirmation for unknown action {} in transition {}",
                key.action_id, self.id
            );
            return ConfirmOutcome::Unknown;
        };

        {
            let action = &mut self.actions[idx];
            if action.confirmed {
                trace!(
                    "Action {} in transition {} already confirmed",
                    key.action_id, self.id
                );
                return ConfirmOutcome::Duplicate;
            }

            action.confirmed = true;
            action.observed_rc = Some(rc);
            action.failed = !(op_status == OpStatus::Done && rc == key.target_rc);

            if action.failed {
                info!(
                    "Action {} ({}) in transition {} failed: status={} rc={} (wanted {})",
                    key.action_id, action.spec.task, self.id, op_status, rc, key.target_rc
                );
            } else {
                debug!(
                    "Action {} ({}) in transition {} confirmed",
                    key.action_id, action.spec.task, self.id
                );
            }
        }

        self.settle_synapses();
        ConfirmOutcome::Applied
    }

    /// Marks synapses confirmed once every one of their actions is.
    pub fn settle_synapses(&mut self) {
        for syn_idx in 0..self.synapses.len() {
            if self.synapses[syn_idx].confirmed || !self.synapses[syn_idx].fired {
                continue;
            }
            let all_confirmed = self.synapses[syn_idx]
                .actions
                .iter()
                .all(|idx| self.actions[*idx].confirmed);
            if all_confirmed {
                trace!(
                    "Synapse {} of transition {} complete",
                    self.synapses[syn_idx].id, self.id
                );
                self.synapses[syn_idx].confirmed = true;
            }
        }
    }

    /// Whether every synapse has fired and confirmed.
    pub fn all_confirmed(&self) -> bool {
        self.synapses.iter().all(|s| s.confirmed)
    }

    /// Count of dispatched-but-unconfirmed resource operations, the number
    /// the batch limit constrains.
    pub fn outstanding_rsc_ops(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.spec.kind == ActionKind::RscOp && a.executed && !a.confirmed)
            .count()
    }

    /// Marks every unconfirmed fencing action failed (the fencing daemon
    /// went away mid-transition). Returns whether anything was failed.
    pub fn fail_incompletable_fencing(&mut self) -> bool {
        let mut any = false;
        for syn_idx in 0..self.synapses.len() {
            if self.synapses[syn_idx].confirmed {
                continue;
            }
            for action_idx in self.synapses[syn_idx].actions.clone() {
                let action = &mut self.actions[action_idx];
                if action.spec.kind != ActionKind::CrmEvent
                    || action.confirmed
                    || action.spec.task != "stonith"
                {
                    continue;
                }
                action.failed = true;
                action.confirmed = true;
                any = true;
                warn!(
                    "Failing action {} ({}): fencing daemon terminated",
                    action.spec.id, action.spec.task
                );
            }
        }
        if any {
            self.settle_synapses();
        }
        any
    }
}
