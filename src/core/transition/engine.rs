// src/core/transition/engine.rs

//! The transition engine: fires synapses in dependency order under the
//! batch limit, absorbs confirmations, runs the action and global timers,
//! and reports the graph's fate.

use crate::core::HelmsmanError;
use crate::core::keys::TransitionKey;
use crate::core::throttle::Throttle;
use crate::core::transition::graph::{
    AbortAction, ActionKind, ConfirmOutcome, GraphSpec, TransitionGraph,
};
use crate::core::triggers::Trigger;
use crate::core::types::{OpStatus, ResourceSpec, agent_rc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphStatus {
    /// Actions are outstanding.
    Active,
    /// Nothing fireable; waiting on external input.
    Pending,
    /// Every synapse confirmed.
    Complete,
    /// Aborted, or a fatal action failure ended the graph.
    Terminated,
}

/// A firing handed to the controller for routing to the right executor.
#[derive(Debug, Clone)]
pub enum ActionDispatch {
    /// Run a resource operation on a node's executor (local or remote).
    ResourceOp {
        node: String,
        rsc: Option<ResourceSpec>,
        task: String,
        interval_ms: u32,
        timeout_ms: u64,
        start_delay_ms: u64,
        params: BTreeMap<String, String>,
        key: TransitionKey,
    },
    /// Ask the fencing subsystem to fence a node.
    Fence {
        target: String,
        action: String,
        timeout_ms: u64,
        key: TransitionKey,
    },
    /// Send a controller-level operation to a peer (e.g. do_shutdown).
    ClusterOp {
        target: String,
        task: String,
        key: TransitionKey,
    },
}

/// The engine. Owned by the controller task; all methods take `&mut self`,
/// preserving the single-writer discipline.
pub struct TransitionEngine {
    graph: Option<TransitionGraph>,
    next_graph_id: u64,
    throttle: Arc<Throttle>,
    dispatcher: mpsc::Sender<ActionDispatch>,
    trigger: Arc<Trigger>,
    /// Per-action timers: `(deadline, action_id)`.
    action_deadlines: Vec<(Instant, u32)>,
    global_deadline: Option<Instant>,
    action_slack: Duration,
}

impl TransitionEngine {
    pub fn new(
        throttle: Arc<Throttle>,
        dispatcher: mpsc::Sender<ActionDispatch>,
        trigger: Arc<Trigger>,
        action_slack: Duration,
    ) -> Self {
        Self {
            graph: None,
            next_graph_id: 1,
            throttle,
            dispatcher,
            trigger,
            action_deadlines: Vec::new(),
            global_deadline: None,
            action_slack,
        }
    }

    pub fn trigger(&self) -> Arc<Trigger> {
        Arc::clone(&self.trigger)
    }

    pub fn graph_id(&self) -> Option<u64> {
        self.graph.as_ref().map(|g| g.id)
    }

    pub fn has_graph(&self) -> bool {
        self.graph.is_some()
    }

    pub fn graph(&self) -> Option<&TransitionGraph> {
        self.graph.as_ref()
    }

    /// Installs a freshly computed graph, replacing any previous one. The
    /// replaced graph's unfinished actions are abandoned; their late
    /// confirmations will be discarded as stale.
    pub fn start(
        &mut self,
        spec: GraphSpec,
        global_timeout: Duration,
    ) -> Result<u64, HelmsmanError> {
        let id = self.next_graph_id;
        self.next_graph_id += 1;

        if let Some(old) = &self.graph
            && !old.complete
        {
            warn!(
                "Replacing incomplete transition {} with transition {}",
                old.id, id
            );
        }

        let graph = TransitionGraph::from_spec(id, spec, global_timeout)?;
        self.global_deadline = Some(Instant::now() + graph.global_timeout);
        self.action_deadlines.clear();
        self.graph = Some(graph);
        self.trigger.set();
        Ok(id)
    }

    /// Drops the graph entirely (DC relinquishing).
    pub fn clear(&mut self) {
        self.graph = None;
        self.action_deadlines.clear();
        self.global_deadline = None;
    }

    /// Raises the abort state of the running graph. Returns false when
    /// there is nothing to abort (no graph, or already complete); the
    /// caller may schedule a recomputation instead.
    pub fn abort(&mut self, priority: i32, action: AbortAction, reason: &str) -> bool {
        match &mut self.graph {
            Some(graph) if !graph.complete => {
                graph.abort(priority, action, reason);
                self.trigger.set();
                true
            }
            Some(graph) => {
                debug!(
                    "Abort '{}' after transition {} completed; recompute instead",
                    reason, graph.id
                );
                false
            }
            None => {
                debug!("Abort '{}' with no transition in flight", reason);
                false
            }
        }
    }

    /// Applies a confirmation arriving from any source (CIB diff, direct
    /// ack, fence notification).
    pub fn confirm(&mut self, key: &TransitionKey, op_status: OpStatus, rc: i32) -> ConfirmOutcome {
        let Some(graph) = &mut self.graph else {
            trace!("Confirmation with no transition in flight");
            return ConfirmOutcome::Stale;
        };

        let outcome = graph.confirm(key, op_status, rc);
        if outcome == ConfirmOutcome::Applied {
            self.action_deadlines.retain(|(_, id)| *id != key.action_id);

            // A failed action without permission to fail ends the graph.
            if let Some(idx) = graph.action_index(key.action_id) {
                let action = &graph.actions[idx];
                if action.failed && !action.spec.can_fail {
                    graph.abort(
                        i32::MAX,
                        AbortAction::Restart,
                        &format!("Action {} failed", key.action_id),
                    );
                }
            }
            self.trigger.set();
        }
        outcome
    }

    /// Fails every unconfirmed fencing action (fencing daemon loss) and
    /// aborts for recomputation.
    pub fn fail_incompletable_fencing(&mut self) -> bool {
        let Some(graph) = &mut self.graph else {
            return false;
        };
        if graph.fail_incompletable_fencing() {
            error!("Fencing daemon failure resulted in unrunnable actions");
            graph.abort(i32::MAX, AbortAction::Restart, "Fencing failure");
            self.trigger.set();
            true
        } else {
            false
        }
    }

    /// Synthesizes timeout failures for expired action timers and enforces
    /// the global transition timer. Call from a periodic tick.
    pub fn expire_timers(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .action_deadlines
            .iter()
            .filter(|(deadline, _)| *deadline <= now)
            .map(|(_, id)| *id)
            .collect();

        let graph_identity = self.graph.as_ref().map(|g| (g.id, g.uuid));
        if let Some((graph_id, graph_uuid)) = graph_identity {
            for action_id in expired {
                let target_rc = match self
                    .graph
                    .as_ref()
                    .and_then(|g| g.action_index(action_id).map(|idx| g.actions[idx].spec.target_rc))
                {
                    Some(rc) => rc,
                    None => continue,
                };
                error!(
                    "Action {} of transition {} timed out, faking failure",
                    action_id, graph_id
                );
                let key = TransitionKey::new(graph_id, action_id, target_rc, graph_uuid);
                self.confirm(&key, OpStatus::Timeout, agent_rc::UNKNOWN_ERROR);
            }
        }

        if let Some(deadline) = self.global_deadline
            && deadline <= now
            && self
                .graph
                .as_ref()
                .is_some_and(|g| !g.complete && !g.all_confirmed())
        {
            self.global_deadline = None;
            self.abort(i32::MAX, AbortAction::Restart, "Transition timer expired");
        }
    }

    /// The earliest pending deadline, for the controller's tick scheduling.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.action_deadlines
            .iter()
            .map(|(deadline, _)| *deadline)
            .chain(self.global_deadline)
            .min()
    }

    /// One scheduling pass: refresh the batch limit, fire every eligible
    /// synapse, and report where the graph stands.
    pub async fn run_pass(&mut self) -> GraphStatus {
        let Some(graph) = &mut self.graph else {
            return GraphStatus::Pending;
        };

        if graph.complete {
            return if graph.is_aborted() {
                GraphStatus::Terminated
            } else {
                GraphStatus::Complete
            };
        }

        if graph.is_aborted() {
            info!(
                "Transition {} terminated: {} ({:?})",
                graph.id,
                graph.abort_reason.as_deref().unwrap_or("aborted"),
                graph.abort_action
            );
            graph.complete = true;
            return GraphStatus::Terminated;
        }

        // The configured limit is refreshed from system load on every pass.
        let limit = self.throttle.total_job_limit(graph.batch_limit);
        let mut outstanding = graph.outstanding_rsc_ops();
        let mut fired_any = false;

        // Keep sweeping until a pass fires nothing; firing a synapse can
        // make a downstream one eligible within the same scheduling round
        // (pseudo actions confirm instantly).
        loop {
            let mut progressed = false;

            for syn_idx in 0..graph.synapses.len() {
                if graph.synapses[syn_idx].fired || graph.synapses[syn_idx].failed {
                    continue;
                }

                match synapse_eligible(graph, syn_idx) {
                    Eligibility::Ready => {}
                    Eligibility::Waiting => continue,
                    Eligibility::Unrunnable(input_id) => {
                        graph.synapses[syn_idx].failed = true;
                        graph.synapses[syn_idx].fired = true;
                        graph.synapses[syn_idx].confirmed = true;
                        graph.abort(
                            i32::MAX,
                            AbortAction::Restart,
                            &format!("Unrunnable synapse (failed input {input_id})"),
                        );
                        continue;
                    }
                }

                // Batch limit: a synapse only fires when all its resource
                // ops fit in the remaining budget.
                let rsc_ops = graph.synapses[syn_idx]
                    .actions
                    .iter()
                    .filter(|idx| graph.actions[**idx].spec.kind == ActionKind::RscOp)
                    .count();
                if limit > 0 && outstanding + rsc_ops > limit as usize {
                    trace!(
                        "Deferring synapse {} ({} ops, {} outstanding, limit {})",
                        graph.synapses[syn_idx].id, rsc_ops, outstanding, limit
                    );
                    continue;
                }

                let action_indices = graph.synapses[syn_idx].actions.clone();
                graph.synapses[syn_idx].fired = true;
                fired_any = true;
                progressed = true;
                outstanding += rsc_ops;

                for idx in action_indices {
                    let key = graph.actions[idx].transition_key(graph.id, graph.uuid);
                    let (kind, task) = {
                        let action = &mut graph.actions[idx];
                        action.executed = true;
                        (action.spec.kind, action.spec.task.clone())
                    };

                    match kind {
                        ActionKind::Pseudo => {
                            trace!("Pseudo action {} confirmed on firing", key.action_id);
                            let action = &mut graph.actions[idx];
                            action.confirmed = true;
                            action.observed_rc = Some(key.target_rc);
                        }
                        ActionKind::RscOp => {
                            let action = &graph.actions[idx];
                            let node = action.spec.target.clone().unwrap_or_default();
                            let dispatch = ActionDispatch::ResourceOp {
                                node,
                                rsc: action.spec.rsc.clone(),
                                task,
                                interval_ms: action.spec.interval_ms,
                                timeout_ms: action.spec.timeout_ms,
                                start_delay_ms: action.spec.start_delay_ms,
                                params: action.spec.params.clone(),
                                key,
                            };
                            let deadline = Instant::now()
                                + Duration::from_millis(
                                    action.spec.timeout_ms + action.spec.start_delay_ms,
                                )
                                + self.action_slack;
                            self.action_deadlines.push((deadline, key.action_id));
                            if self.dispatcher.send(dispatch).await.is_err() {
                                error!("Action dispatcher closed; aborting transition");
                                graph.abort(i32::MAX, AbortAction::Restart, "Dispatcher closed");
                            }
                        }
                        ActionKind::CrmEvent => {
                            let action = &graph.actions[idx];
                            let target = action.spec.target.clone().unwrap_or_default();
                            let dispatch = if task == "stonith" {
                                ActionDispatch::Fence {
                                    target,
                                    action: action
                                        .spec
                                        .params
                                        .get("stonith_action")
                                        .cloned()
                                        .unwrap_or_else(|| "reboot".to_string()),
                                    timeout_ms: action.spec.timeout_ms,
                                    key,
                                }
                            } else {
                                ActionDispatch::ClusterOp { target, task, key }
                            };
                            let deadline = Instant::now()
                                + Duration::from_millis(graph.actions[idx].spec.timeout_ms)
                                + self.action_slack;
                            self.action_deadlines.push((deadline, key.action_id));
                            if self.dispatcher.send(dispatch).await.is_err() {
                                error!("Action dispatcher closed; aborting transition");
                                graph.abort(i32::MAX, AbortAction::Restart, "Dispatcher closed");
                            }
                        }
                    }
                }

                graph.settle_synapses();
            }

            if !progressed {
                break;
            }
        }

        if graph.is_aborted() {
            // Unrunnable synapses or a dispatch failure raised the abort
            // mid-pass; report it on the next trigger firing.
            self.trigger.set();
            return GraphStatus::Active;
        }

        if graph.all_confirmed() {
            info!("Transition {} is now complete", graph.id);
            graph.complete = true;
            return GraphStatus::Complete;
        }

        let outstanding_now = graph.outstanding_rsc_ops();
        if fired_any || outstanding_now > 0 {
            trace!(
                "Transition {} active ({} outstanding)",
                graph.id, outstanding_now
            );
            GraphStatus::Active
        } else {
            trace!("Transition {} pending external input", graph.id);
            GraphStatus::Pending
        }
    }
}

enum Eligibility {
    Ready,
    Waiting,
    /// A required input failed and may not fail.
    Unrunnable(u32),
}

fn synapse_eligible(graph: &TransitionGraph, syn_idx: usize) -> Eligibility {
    for input in &graph.synapses[syn_idx].inputs {
        let Some(idx) = graph.action_index(input.action_id) else {
            // Inputs outside the graph are treated as satisfied; the
            // scheduler prunes cross-transition edges.
            continue;
        };
        let action = &graph.actions[idx];
        if !action.confirmed {
            return Eligibility::Waiting;
        }
        if action.failed && !action.spec.can_fail {
            return Eligibility::Unrunnable(input.action_id);
        }
        if let Some(guard) = input.target_rc
            && action.observed_rc != Some(guard)
        {
            return Eligibility::Waiting;
        }
    }
    Eligibility::Ready
}

impl std::fmt::Debug for TransitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionEngine")
            .field("graph", &self.graph_id())
            .field("timers", &self.action_deadlines.len())
            .finish()
    }
}
