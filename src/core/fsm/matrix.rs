// src/core/fsm/matrix.rs

//! The transition matrix: every (state, input) pair maps to a next state,
//! an action bitmask, and a cause tag for the audit trail.
//!
//! The matrix is total. Pairs that represent protocol violations map to
//! `S_TERMINATE` with `A_EXIT_FAIL`; pairs that are merely uninteresting
//! absorb the input with `A_LOG`.

use crate::core::fsm::states::{FsmActions, FsmState, InputId};
use crate::core::fsm::states::InputId as I;

/// The result of one matrix lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: FsmState,
    pub actions: FsmActions,
    pub cause: Option<&'static str>,
}

const fn to(next: FsmState, actions: FsmActions) -> Transition {
    Transition {
        next,
        actions,
        cause: None,
    }
}

const fn because(next: FsmState, actions: FsmActions, cause: &'static str) -> Transition {
    Transition {
        next,
        actions,
        cause: Some(cause),
    }
}

/// Looks up the transition for a (state, input) pair.
pub fn transition(state: FsmState, input: InputId) -> Transition {
    use FsmState::*;

    // A machine that somehow reached S_ILLEGAL gets no further inputs.
    if state == Illegal {
        return because(
            Terminate,
            FsmActions::A_EXIT_FAIL,
            "machine reached S_ILLEGAL",
        );
    }

    // Inputs with the same meaning everywhere come first.
    match input {
        I::Error => {
            return because(
                Terminate,
                FsmActions::A_EXIT_FAIL | FsmActions::A_LRM_DISCONNECT,
                "fatal subsystem error",
            );
        }
        I::Terminate => {
            return to(
                Terminate,
                FsmActions::A_LRM_DISCONNECT | FsmActions::A_EXIT_OK,
            );
        }
        I::Halt => {
            if !matches!(state, Stopping | Terminate) {
                return because(
                    Halt,
                    FsmActions::A_TE_HALT | FsmActions::A_WARN,
                    "halt requested",
                );
            }
        }
        I::Fail => return fail_transition(state),
        I::Vote => {
            // Votes are answered in every state; only elections change state.
            if state != Election && !matches!(state, Stopping | Terminate) {
                return to(state, FsmActions::A_ELECTION_CHECK);
            }
        }
        _ => {}
    }

    match (state, input) {
        // --- S_STARTING -----------------------------------------------------
        (Starting, I::Started) => to(Pending, FsmActions::A_HELLO | FsmActions::A_LOG),
        (Starting, I::Shutdown) => to(Stopping, FsmActions::A_SHUTDOWN),
        (Starting, I::NodeJoin | I::NodeLeft | I::CibUpdate | I::LrmEvent) => {
            to(Starting, FsmActions::A_LOG)
        }
        (Starting, _) => because(Terminate, FsmActions::A_EXIT_FAIL, "input before startup"),

        // --- S_PENDING ------------------------------------------------------
        (Pending, I::Election) => to(Election, FsmActions::A_ELECTION_VOTE),
        (Pending, I::ElectionDc) => to(
            Integration,
            FsmActions::A_DC_TAKEOVER
                | FsmActions::A_INTEGRATE_TIMER_START
                | FsmActions::A_JOIN_OFFER_ALL,
        ),
        (Pending, I::JoinOffer) => to(Pending, FsmActions::A_JOIN_REQUEST),
        (Pending, I::JoinResult) => to(NotDc, FsmActions::A_LOG),
        (Pending, I::Shutdown | I::Stop) => to(Stopping, FsmActions::A_SHUTDOWN),
        (Pending, _) => to(Pending, FsmActions::A_LOG),

        // --- S_ELECTION -----------------------------------------------------
        (Election, I::Vote) => to(Election, FsmActions::A_ELECTION_CHECK),
        (Election, I::NoVote) => to(Election, FsmActions::A_ELECTION_CHECK),
        (Election, I::Election) => to(Election, FsmActions::A_ELECTION_VOTE),
        (Election, I::ElectionDc) => to(
            Integration,
            FsmActions::A_DC_TAKEOVER
                | FsmActions::A_INTEGRATE_TIMER_START
                | FsmActions::A_JOIN_OFFER_ALL,
        ),
        (Election, I::JoinOffer) => because(
            Pending,
            FsmActions::A_JOIN_REQUEST,
            "conceded to the elected DC",
        ),
        (Election, I::NodeJoin | I::NodeLeft) => to(Election, FsmActions::A_ELECTION_CHECK),
        (Election, I::Shutdown) => to(Stopping, FsmActions::A_SHUTDOWN),
        (Election, _) => to(Election, FsmActions::A_LOG),

        // --- S_INTEGRATION --------------------------------------------------
        (Integration, I::JoinRequest) => to(Integration, FsmActions::A_JOIN_PROCESS_REQ),
        // The DC answers its own offer like any other joiner.
        (Integration, I::JoinOffer) => to(Integration, FsmActions::A_JOIN_REQUEST),
        (Integration, I::NodeJoin) => to(Integration, FsmActions::A_JOIN_OFFER_ONE),
        (Integration, I::NodeLeft) => to(Integration, FsmActions::A_LOG),
        (Integration, I::IntegrationDone) => to(
            FinalizeJoin,
            FsmActions::A_INTEGRATE_TIMER_STOP
                | FsmActions::A_FINALIZE_TIMER_START
                | FsmActions::A_JOIN_FINALIZE,
        ),
        (Integration, I::IntegrationTimeout) => because(
            FinalizeJoin,
            FsmActions::A_INTEGRATE_TIMER_STOP
                | FsmActions::A_FINALIZE_TIMER_START
                | FsmActions::A_JOIN_FINALIZE
                | FsmActions::A_WARN,
            "integration timer popped",
        ),
        (Integration, I::Election) => to(
            Election,
            FsmActions::A_DC_RELEASE | FsmActions::A_ELECTION_VOTE,
        ),
        (Integration, I::Shutdown) => {
            to(Stopping, FsmActions::A_SHUTDOWN | FsmActions::A_DC_RELEASE)
        }
        (Integration, _) => to(Integration, FsmActions::A_LOG),

        // --- S_FINALIZE_JOIN ------------------------------------------------
        (FinalizeJoin, I::FinalizeDone) => to(
            PolicyEngine,
            FsmActions::A_FINALIZE_TIMER_STOP | FsmActions::A_PE_INVOKE,
        ),
        (FinalizeJoin, I::FinalizeTimeout) => because(
            PolicyEngine,
            FsmActions::A_FINALIZE_TIMER_STOP | FsmActions::A_PE_INVOKE | FsmActions::A_WARN,
            "finalization timer popped",
        ),
        (FinalizeJoin, I::JoinRequest) => because(
            Integration,
            FsmActions::A_FINALIZE_TIMER_STOP
                | FsmActions::A_INTEGRATE_TIMER_START
                | FsmActions::A_JOIN_PROCESS_REQ,
            "late joiner",
        ),
        (FinalizeJoin, I::NodeJoin) => because(
            Integration,
            FsmActions::A_FINALIZE_TIMER_STOP
                | FsmActions::A_INTEGRATE_TIMER_START
                | FsmActions::A_JOIN_OFFER_ONE,
            "node appeared mid-finalization",
        ),
        (FinalizeJoin, I::Election) => to(
            Election,
            FsmActions::A_DC_RELEASE | FsmActions::A_ELECTION_VOTE,
        ),
        (FinalizeJoin, I::Shutdown) => {
            to(Stopping, FsmActions::A_SHUTDOWN | FsmActions::A_DC_RELEASE)
        }
        (FinalizeJoin, _) => to(FinalizeJoin, FsmActions::A_LOG),

        // --- S_POLICY_ENGINE ------------------------------------------------
        (PolicyEngine, I::PeSuccess) => to(TransitionEngine, FsmActions::A_TE_START),
        (PolicyEngine, I::PeCalc) => to(PolicyEngine, FsmActions::A_PE_INVOKE),
        (PolicyEngine, I::CibUpdate) => to(PolicyEngine, FsmActions::A_PE_INVOKE),
        (PolicyEngine, I::TeAborted) => to(PolicyEngine, FsmActions::A_PE_INVOKE),
        (PolicyEngine, I::NodeJoin) => because(
            Integration,
            FsmActions::A_INTEGRATE_TIMER_START | FsmActions::A_JOIN_OFFER_ONE,
            "node appeared mid-computation",
        ),
        (PolicyEngine, I::NodeLeft) => to(PolicyEngine, FsmActions::A_PE_INVOKE),
        (PolicyEngine, I::Election) => to(
            Election,
            FsmActions::A_DC_RELEASE | FsmActions::A_ELECTION_VOTE,
        ),
        (PolicyEngine, I::Shutdown) => {
            to(Stopping, FsmActions::A_SHUTDOWN | FsmActions::A_DC_RELEASE)
        }
        (PolicyEngine, _) => to(PolicyEngine, FsmActions::A_LOG),

        // --- S_TRANSITION_ENGINE --------------------------------------------
        (TransitionEngine, I::TeSuccess) => to(Idle, FsmActions::A_LOG),
        (TransitionEngine, I::TeAborted) => to(PolicyEngine, FsmActions::A_PE_INVOKE),
        (TransitionEngine, I::PeCalc) => to(
            PolicyEngine,
            FsmActions::A_TE_CANCEL | FsmActions::A_PE_INVOKE,
        ),
        (TransitionEngine, I::NodeJoin) => because(
            Integration,
            FsmActions::A_TE_CANCEL
                | FsmActions::A_INTEGRATE_TIMER_START
                | FsmActions::A_JOIN_OFFER_ONE,
            "node appeared mid-transition",
        ),
        (TransitionEngine, I::NodeLeft) => to(
            PolicyEngine,
            FsmActions::A_TE_CANCEL | FsmActions::A_PE_INVOKE,
        ),
        (TransitionEngine, I::Election) => to(
            Election,
            FsmActions::A_TE_CANCEL | FsmActions::A_DC_RELEASE | FsmActions::A_ELECTION_VOTE,
        ),
        (TransitionEngine, I::Shutdown) => to(
            Stopping,
            FsmActions::A_TE_CANCEL | FsmActions::A_SHUTDOWN | FsmActions::A_DC_RELEASE,
        ),
        (TransitionEngine, _) => to(TransitionEngine, FsmActions::A_LOG),

        // --- S_IDLE ---------------------------------------------------------
        (Idle, I::PeCalc) => to(PolicyEngine, FsmActions::A_PE_INVOKE),
        (Idle, I::CibUpdate) => to(PolicyEngine, FsmActions::A_PE_INVOKE),
        (Idle, I::NodeLeft) => to(PolicyEngine, FsmActions::A_PE_INVOKE),
        (Idle, I::NodeJoin) => to(
            Integration,
            FsmActions::A_INTEGRATE_TIMER_START | FsmActions::A_JOIN_OFFER_ONE,
        ),
        (Idle, I::JoinRequest) => to(
            Integration,
            FsmActions::A_INTEGRATE_TIMER_START | FsmActions::A_JOIN_PROCESS_REQ,
        ),
        (Idle, I::Election) => to(
            Election,
            FsmActions::A_DC_RELEASE | FsmActions::A_ELECTION_VOTE,
        ),
        (Idle, I::Shutdown) => to(Stopping, FsmActions::A_SHUTDOWN | FsmActions::A_DC_RELEASE),
        (Idle, _) => to(Idle, FsmActions::A_LOG),

        // --- S_NOT_DC -------------------------------------------------------
        (NotDc, I::Election) => to(Election, FsmActions::A_ELECTION_VOTE),
        (NotDc, I::ElectionDc) => to(
            Integration,
            FsmActions::A_DC_TAKEOVER
                | FsmActions::A_INTEGRATE_TIMER_START
                | FsmActions::A_JOIN_OFFER_ALL,
        ),
        (NotDc, I::JoinOffer) => to(NotDc, FsmActions::A_JOIN_REQUEST),
        (NotDc, I::Shutdown) => to(NotDc, FsmActions::A_SHUTDOWN_REQ),
        (NotDc, I::Stop) => to(Stopping, FsmActions::A_SHUTDOWN),
        (NotDc, _) => to(NotDc, FsmActions::A_LOG),

        // --- S_RECOVERY -----------------------------------------------------
        (Recovery, I::Election) => to(Election, FsmActions::A_ELECTION_VOTE),
        (Recovery, I::Shutdown) => to(Stopping, FsmActions::A_SHUTDOWN),
        (Recovery, _) => to(Recovery, FsmActions::A_LOG),

        // --- S_HALT ---------------------------------------------------------
        (Halt, I::Shutdown | I::Stop) => to(Stopping, FsmActions::A_SHUTDOWN),
        (Halt, I::Election) => to(Election, FsmActions::A_ELECTION_VOTE),
        (Halt, _) => to(Halt, FsmActions::A_LOG),

        // --- S_STOPPING -----------------------------------------------------
        (Stopping, I::LrmEvent) => to(Stopping, FsmActions::A_LRM_VERIFY_STOPPED),
        (Stopping, I::Shutdown | I::Stop) => to(Stopping, FsmActions::A_LRM_VERIFY_STOPPED),
        (Stopping, _) => to(Stopping, FsmActions::A_LOG),

        // --- S_TERMINATE ----------------------------------------------------
        (Terminate | Illegal, _) => to(Terminate, FsmActions::A_LOG),
    }
}

/// Failure handling by state class: running states attempt local recovery,
/// non-running states treat failures as fatal.
pub fn fail_transition(state: FsmState) -> Transition {
    if state.suppresses_graph() {
        because(
            FsmState::Terminate,
            FsmActions::A_EXIT_FAIL,
            "failure while not running",
        )
    } else {
        because(
            FsmState::Recovery,
            FsmActions::A_RECOVER | FsmActions::A_WARN,
            "subsystem failure",
        )
    }
}
