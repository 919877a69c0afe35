// src/core/fsm/machine.rs

//! The state machine proper: an input queue processed in registration
//! order, a current state, and the audit trail of applied transitions.

use crate::core::fsm::matrix::{Transition, transition};
use crate::core::fsm::states::{FsmActions, FsmInput, FsmState};
use crate::core::triggers::Trigger;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// One applied transition, handed back for the controller to execute.
#[derive(Debug)]
pub struct AppliedTransition {
    pub input: FsmInput,
    pub from: FsmState,
    pub to: FsmState,
    pub actions: FsmActions,
    pub cause: Option<&'static str>,
}

/// The per-node controller state machine. Owned by the controller task;
/// `enqueue` is the only operation other tasks reach (via channels).
pub struct StateMachine {
    state: FsmState,
    queue: VecDeque<FsmInput>,
    trigger: Arc<Trigger>,
    transitions_applied: u64,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: FsmState::Starting,
            queue: VecDeque::new(),
            trigger: Trigger::new(),
            transitions_applied: 0,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn trigger(&self) -> Arc<Trigger> {
        Arc::clone(&self.trigger)
    }

    pub fn pending_inputs(&self) -> usize {
        self.queue.len()
    }

    pub fn transitions_applied(&self) -> u64 {
        self.transitions_applied
    }

    /// Registers an input. Inputs are processed strictly in the order
    /// registered; the trigger only coalesces wake-ups.
    pub fn enqueue(&mut self, input: FsmInput) {
        trace!("Queued {} in {}", input.id(), self.state);
        self.queue.push_back(input);
        self.trigger.set();
    }

    /// Processes one queued input. Returns the applied transition for the
    /// controller to act on, or `None` when the queue is drained.
    pub fn step(&mut self) -> Option<AppliedTransition> {
        let input = self.queue.pop_front()?;
        let Transition {
            next,
            actions,
            cause,
        } = transition(self.state, input.id());

        let from = self.state;
        self.state = next;
        self.transitions_applied += 1;

        if from != next {
            info!(
                "State transition {} -> {} [ input={} cause={} ]",
                from,
                next,
                input.id(),
                cause.unwrap_or("none")
            );
        } else {
            debug!(
                "Processed {} in {} [ actions={:?} ]",
                input.id(),
                from,
                actions
            );
        }

        Some(AppliedTransition {
            input,
            from,
            to: next,
            actions,
            cause,
        })
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state)
            .field("queued", &self.queue.len())
            .finish()
    }
}
