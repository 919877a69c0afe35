use helmsman::core::fsm::{FsmActions, FsmState, InputId, transition};
use strum::IntoEnumIterator;

#[test]
fn test_matrix_is_total() {
    // Every (state, input) pair resolves; terminal and illegal states only
    // ever lead to S_TERMINATE.
    for state in FsmState::iter() {
        for input in InputId::iter() {
            let t = transition(state, input);
            if matches!(state, FsmState::Terminate | FsmState::Illegal) {
                assert_eq!(t.next, FsmState::Terminate, "({state}, {input})");
            }
        }
    }
}

#[test]
fn test_election_win_starts_integration() {
    let t = transition(FsmState::NotDc, InputId::ElectionDc);
    assert_eq!(t.next, FsmState::Integration);
    assert!(t.actions.contains(FsmActions::A_DC_TAKEOVER));
    assert!(t.actions.contains(FsmActions::A_INTEGRATE_TIMER_START));
    assert!(t.actions.contains(FsmActions::A_JOIN_OFFER_ALL));
}

#[test]
fn test_join_sequence_reaches_the_scheduler() {
    let t = transition(FsmState::Integration, InputId::IntegrationDone);
    assert_eq!(t.next, FsmState::FinalizeJoin);
    assert!(t.actions.contains(FsmActions::A_JOIN_FINALIZE));

    let t = transition(FsmState::FinalizeJoin, InputId::FinalizeDone);
    assert_eq!(t.next, FsmState::PolicyEngine);
    assert!(t.actions.contains(FsmActions::A_PE_INVOKE));
}

#[test]
fn test_scheduler_success_starts_the_transition_engine() {
    let t = transition(FsmState::PolicyEngine, InputId::PeSuccess);
    assert_eq!(t.next, FsmState::TransitionEngine);
    assert!(t.actions.contains(FsmActions::A_TE_START));
}

#[test]
fn test_transition_outcomes() {
    let t = transition(FsmState::TransitionEngine, InputId::TeSuccess);
    assert_eq!(t.next, FsmState::Idle);

    let t = transition(FsmState::TransitionEngine, InputId::TeAborted);
    assert_eq!(t.next, FsmState::PolicyEngine);
    assert!(t.actions.contains(FsmActions::A_PE_INVOKE));
}

#[test]
fn test_errors_are_unconditionally_fatal() {
    for state in [
        FsmState::Starting,
        FsmState::Pending,
        FsmState::Election,
        FsmState::Integration,
        FsmState::FinalizeJoin,
        FsmState::PolicyEngine,
        FsmState::TransitionEngine,
        FsmState::Idle,
        FsmState::NotDc,
        FsmState::Recovery,
        FsmState::Halt,
        FsmState::Stopping,
    ] {
        let t = transition(state, InputId::Error);
        assert_eq!(t.next, FsmState::Terminate, "I_ERROR in {state}");
        assert!(t.actions.contains(FsmActions::A_EXIT_FAIL));
    }
}

#[test]
fn test_failures_recover_in_running_states_only() {
    let t = transition(FsmState::Idle, InputId::Fail);
    assert_eq!(t.next, FsmState::Recovery);
    assert!(t.actions.contains(FsmActions::A_RECOVER));

    let t = transition(FsmState::Stopping, InputId::Fail);
    assert_eq!(t.next, FsmState::Terminate);
}

#[test]
fn test_dc_shutdown_releases_the_role() {
    for state in [
        FsmState::Integration,
        FsmState::FinalizeJoin,
        FsmState::PolicyEngine,
        FsmState::Idle,
    ] {
        let t = transition(state, InputId::Shutdown);
        assert_eq!(t.next, FsmState::Stopping, "I_SHUTDOWN in {state}");
        assert!(t.actions.contains(FsmActions::A_SHUTDOWN));
        assert!(t.actions.contains(FsmActions::A_DC_RELEASE));
    }
}

#[test]
fn test_transition_engine_shutdown_also_cancels_the_graph() {
    let t = transition(FsmState::TransitionEngine, InputId::Shutdown);
    assert_eq!(t.next, FsmState::Stopping);
    assert!(t.actions.contains(FsmActions::A_TE_CANCEL));
}

#[test]
fn test_non_dc_shutdown_asks_the_dc_first() {
    let t = transition(FsmState::NotDc, InputId::Shutdown);
    assert_eq!(t.next, FsmState::NotDc);
    assert!(t.actions.contains(FsmActions::A_SHUTDOWN_REQ));

    let t = transition(FsmState::NotDc, InputId::Stop);
    assert_eq!(t.next, FsmState::Stopping);
    assert!(t.actions.contains(FsmActions::A_SHUTDOWN));
}

#[test]
fn test_elections_interrupt_dc_states() {
    for state in [
        FsmState::Integration,
        FsmState::PolicyEngine,
        FsmState::Idle,
    ] {
        let t = transition(state, InputId::Election);
        assert_eq!(t.next, FsmState::Election, "I_ELECTION in {state}");
        assert!(t.actions.contains(FsmActions::A_DC_RELEASE));
        assert!(t.actions.contains(FsmActions::A_ELECTION_VOTE));
    }
}

#[test]
fn test_abort_suppression_set_matches_non_running_states() {
    for state in [
        FsmState::Starting,
        FsmState::Pending,
        FsmState::NotDc,
        FsmState::Halt,
        FsmState::Stopping,
        FsmState::Terminate,
        FsmState::Illegal,
    ] {
        assert!(state.suppresses_graph(), "{state} must suppress aborts");
    }
    for state in [
        FsmState::Election,
        FsmState::Integration,
        FsmState::FinalizeJoin,
        FsmState::PolicyEngine,
        FsmState::TransitionEngine,
        FsmState::Idle,
    ] {
        assert!(!state.suppresses_graph(), "{state} must process aborts");
    }
}

#[test]
fn test_terminate_is_terminal() {
    for input in [
        InputId::Election,
        InputId::PeCalc,
        InputId::Shutdown,
        InputId::NodeJoin,
        InputId::Error,
    ] {
        let t = transition(FsmState::Terminate, input);
        assert_eq!(t.next, FsmState::Terminate);
    }
}

#[test]
fn test_unexpected_input_before_startup_is_fatal() {
    let t = transition(FsmState::Starting, InputId::PeSuccess);
    assert_eq!(t.next, FsmState::Terminate);
    assert!(t.actions.contains(FsmActions::A_EXIT_FAIL));
    assert!(t.cause.is_some());
}

#[test]
fn test_halt_is_reachable_from_running_states() {
    let t = transition(FsmState::Idle, InputId::Halt);
    assert_eq!(t.next, FsmState::Halt);
    assert!(t.actions.contains(FsmActions::A_TE_HALT));
}

#[test]
fn test_dc_state_classification() {
    assert!(FsmState::Idle.is_dc());
    assert!(FsmState::TransitionEngine.is_dc());
    assert!(!FsmState::NotDc.is_dc());
    assert!(!FsmState::Election.is_dc());
}
