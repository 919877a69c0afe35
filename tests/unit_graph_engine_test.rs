use helmsman::core::keys::TransitionKey;
use helmsman::core::throttle::Throttle;
use helmsman::core::transition::{
    AbortAction, ActionDispatch, ActionInput, ActionKind, ActionSpec, ConfirmOutcome, GraphSpec,
    GraphStatus, SynapseSpec, TransitionEngine,
};
use helmsman::core::triggers::Trigger;
use helmsman::core::types::{OpStatus, ResourceSpec, agent_rc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

fn rsc_op(id: u32, rsc: &str, task: &str, target: &str) -> ActionSpec {
    ActionSpec {
        id,
        kind: ActionKind::RscOp,
        task: task.to_string(),
        target: Some(target.to_string()),
        rsc: Some(ResourceSpec::new(rsc, "ocf", Some("heartbeat"), "Dummy")),
        interval_ms: 0,
        timeout_ms: 60_000,
        start_delay_ms: 0,
        params: Default::default(),
        can_fail: false,
        target_rc: 0,
    }
}

fn pseudo(id: u32, task: &str) -> ActionSpec {
    ActionSpec {
        id,
        kind: ActionKind::Pseudo,
        task: task.to_string(),
        target: None,
        rsc: None,
        interval_ms: 0,
        timeout_ms: 0,
        start_delay_ms: 0,
        params: Default::default(),
        can_fail: false,
        target_rc: 0,
    }
}

fn synapse(id: u32, actions: &[u32], inputs: &[u32]) -> SynapseSpec {
    SynapseSpec {
        id,
        priority: 0,
        actions: actions.to_vec(),
        inputs: inputs
            .iter()
            .map(|action_id| ActionInput {
                action_id: *action_id,
                target_rc: None,
            })
            .collect(),
    }
}

struct Harness {
    engine: TransitionEngine,
    dispatches: mpsc::Receiver<ActionDispatch>,
}

fn harness() -> Harness {
    let (tx, dispatches) = mpsc::channel(64);
    let engine = TransitionEngine::new(
        Arc::new(Throttle::with_cpus(64)),
        tx,
        Trigger::new(),
        Duration::from_secs(5),
    );
    Harness { engine, dispatches }
}

fn dispatched_key(dispatch: &ActionDispatch) -> TransitionKey {
    match dispatch {
        ActionDispatch::ResourceOp { key, .. } => *key,
        ActionDispatch::Fence { key, .. } => *key,
        ActionDispatch::ClusterOp { key, .. } => *key,
    }
}

#[tokio::test]
async fn test_pseudo_only_graph_completes_in_one_pass() {
    let mut h = harness();
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![pseudo(1, "all_stopped")],
        synapses: vec![synapse(1, &[1], &[])],
    };
    h.engine.start(spec, Duration::from_secs(60)).unwrap();
    assert_eq!(h.engine.run_pass().await, GraphStatus::Complete);
}

#[tokio::test]
async fn test_dependencies_gate_firing_until_confirmation() {
    let mut h = harness();
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![rsc_op(1, "rscA", "stop", "alpha"), rsc_op(2, "rscA", "start", "beta")],
        synapses: vec![synapse(1, &[1], &[]), synapse(2, &[2], &[1])],
    };
    h.engine.start(spec, Duration::from_secs(60)).unwrap();

    assert_eq!(h.engine.run_pass().await, GraphStatus::Active);
    let first = h.dispatches.try_recv().unwrap();
    let first_key = dispatched_key(&first);
    assert_eq!(first_key.action_id, 1);
    // The dependent synapse must not fire yet.
    assert!(h.dispatches.try_recv().is_err());

    assert_eq!(
        h.engine.confirm(&first_key, OpStatus::Done, 0),
        ConfirmOutcome::Applied
    );
    assert_eq!(h.engine.run_pass().await, GraphStatus::Active);
    let second = h.dispatches.try_recv().unwrap();
    assert_eq!(dispatched_key(&second).action_id, 2);

    h.engine
        .confirm(&dispatched_key(&second), OpStatus::Done, 0);
    assert_eq!(h.engine.run_pass().await, GraphStatus::Complete);
}

#[tokio::test]
async fn test_confirmations_are_idempotent() {
    let mut h = harness();
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![rsc_op(1, "rscA", "start", "alpha")],
        synapses: vec![synapse(1, &[1], &[])],
    };
    h.engine.start(spec, Duration::from_secs(60)).unwrap();
    h.engine.run_pass().await;
    let key = dispatched_key(&h.dispatches.try_recv().unwrap());

    assert_eq!(h.engine.confirm(&key, OpStatus::Done, 0), ConfirmOutcome::Applied);
    assert_eq!(
        h.engine.confirm(&key, OpStatus::Done, 0),
        ConfirmOutcome::Duplicate
    );
    // A second, contradictory confirmation must not change the outcome.
    assert_eq!(
        h.engine.confirm(&key, OpStatus::Error, 1),
        ConfirmOutcome::Duplicate
    );
    assert_eq!(h.engine.run_pass().await, GraphStatus::Complete);
}

#[tokio::test]
async fn test_stale_graph_confirmations_are_discarded() {
    let mut h = harness();
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![rsc_op(1, "rscA", "start", "alpha")],
        synapses: vec![synapse(1, &[1], &[])],
    };
    let graph_id = h.engine.start(spec, Duration::from_secs(60)).unwrap();
    h.engine.run_pass().await;
    let live_key = dispatched_key(&h.dispatches.try_recv().unwrap());

    // Same action id, older graph generation.
    let stale = TransitionKey::new(graph_id.wrapping_sub(1), 1, 0, Uuid::new_v4());
    assert_eq!(
        h.engine.confirm(&stale, OpStatus::Done, 0),
        ConfirmOutcome::Stale
    );
    // Same graph id but a different uuid is also stale.
    let wrong_uuid = TransitionKey::new(graph_id, 1, 0, Uuid::new_v4());
    assert_eq!(
        h.engine.confirm(&wrong_uuid, OpStatus::Done, 0),
        ConfirmOutcome::Stale
    );
    assert_eq!(h.engine.run_pass().await, GraphStatus::Active);

    h.engine.confirm(&live_key, OpStatus::Done, 0);
    assert_eq!(h.engine.run_pass().await, GraphStatus::Complete);
}

#[tokio::test]
async fn test_failed_action_aborts_with_restart() {
    let mut h = harness();
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![rsc_op(1, "rscA", "start", "alpha"), rsc_op(2, "rscB", "start", "alpha")],
        synapses: vec![synapse(1, &[1], &[]), synapse(2, &[2], &[1])],
    };
    h.engine.start(spec, Duration::from_secs(60)).unwrap();
    h.engine.run_pass().await;
    let key = dispatched_key(&h.dispatches.try_recv().unwrap());

    h.engine.confirm(&key, OpStatus::Done, agent_rc::UNKNOWN_ERROR);
    assert_eq!(h.engine.run_pass().await, GraphStatus::Terminated);
    // The dependent action never fired.
    assert!(h.dispatches.try_recv().is_err());
}

#[tokio::test]
async fn test_can_fail_actions_do_not_kill_the_graph() {
    let mut h = harness();
    let mut tolerant = rsc_op(1, "rscA", "monitor", "alpha");
    tolerant.can_fail = true;
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![tolerant, pseudo(2, "done")],
        synapses: vec![synapse(1, &[1], &[]), synapse(2, &[2], &[1])],
    };
    h.engine.start(spec, Duration::from_secs(60)).unwrap();
    h.engine.run_pass().await;
    let key = dispatched_key(&h.dispatches.try_recv().unwrap());

    h.engine.confirm(&key, OpStatus::Done, agent_rc::UNKNOWN_ERROR);
    assert_eq!(h.engine.run_pass().await, GraphStatus::Complete);
}

#[tokio::test]
async fn test_batch_limit_caps_outstanding_resource_ops() {
    let mut h = harness();
    let spec = GraphSpec {
        batch_limit: 2,
        actions: (1..=4).map(|id| rsc_op(id, &format!("rsc{id}"), "start", "alpha")).collect(),
        synapses: (1..=4).map(|id| synapse(id, &[id], &[])).collect(),
    };
    h.engine.start(spec, Duration::from_secs(60)).unwrap();

    assert_eq!(h.engine.run_pass().await, GraphStatus::Active);
    let mut keys = Vec::new();
    while let Ok(dispatch) = h.dispatches.try_recv() {
        keys.push(dispatched_key(&dispatch));
    }
    assert_eq!(keys.len(), 2);

    // Confirming one frees one slot.
    h.engine.confirm(&keys[0], OpStatus::Done, 0);
    h.engine.run_pass().await;
    let mut more = 0;
    while h.dispatches.try_recv().is_ok() {
        more += 1;
    }
    assert_eq!(more, 1);
}

#[tokio::test]
async fn test_abort_merges_priority_and_action_upward() {
    let mut h = harness();
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![rsc_op(1, "rscA", "start", "alpha")],
        synapses: vec![synapse(1, &[1], &[])],
    };
    h.engine.start(spec, Duration::from_secs(60)).unwrap();
    h.engine.run_pass().await;

    assert!(h.engine.abort(10, AbortAction::Restart, "first"));
    assert!(h.engine.abort(5, AbortAction::Shutdown, "second"));
    {
        let graph = h.engine.graph().unwrap();
        // Priority keeps its maximum, the action escalates.
        assert_eq!(graph.abort_priority, 10);
        assert_eq!(graph.abort_action, AbortAction::Shutdown);
    }

    assert_eq!(h.engine.run_pass().await, GraphStatus::Terminated);
    // Aborting a completed graph reports false so the caller recomputes.
    assert!(!h.engine.abort(1, AbortAction::Restart, "late"));
}

#[tokio::test]
async fn test_action_timer_synthesizes_failure() {
    let mut h = harness();
    let mut quick = rsc_op(1, "rscA", "start", "alpha");
    quick.timeout_ms = 1;
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![quick],
        synapses: vec![synapse(1, &[1], &[])],
    };
    h.engine.start(spec, Duration::from_secs(60)).unwrap();
    h.engine.run_pass().await;
    assert!(h.engine.next_deadline().is_some());

    // Well past timeout + slack.
    h.engine
        .expire_timers(Instant::now() + Duration::from_secs(600));
    assert_eq!(h.engine.run_pass().await, GraphStatus::Terminated);
}

#[tokio::test]
async fn test_global_timer_aborts_the_transition() {
    let mut h = harness();
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![rsc_op(1, "rscA", "start", "alpha")],
        synapses: vec![synapse(1, &[1], &[])],
    };
    h.engine.start(spec, Duration::from_millis(10)).unwrap();
    h.engine.run_pass().await;

    h.engine
        .expire_timers(Instant::now() + Duration::from_secs(600));
    assert_eq!(h.engine.run_pass().await, GraphStatus::Terminated);
}

#[tokio::test]
async fn test_fence_daemon_loss_fails_unconfirmed_fence_actions() {
    let mut h = harness();
    let fence = ActionSpec {
        id: 1,
        kind: ActionKind::CrmEvent,
        task: "stonith".to_string(),
        target: Some("nodeX".to_string()),
        rsc: None,
        interval_ms: 0,
        timeout_ms: 60_000,
        start_delay_ms: 0,
        params: Default::default(),
        can_fail: false,
        target_rc: 0,
    };
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![fence],
        synapses: vec![synapse(1, &[1], &[])],
    };
    h.engine.start(spec, Duration::from_secs(60)).unwrap();
    h.engine.run_pass().await;
    assert!(matches!(
        h.dispatches.try_recv().unwrap(),
        ActionDispatch::Fence { .. }
    ));

    assert!(h.engine.fail_incompletable_fencing());
    assert_eq!(h.engine.run_pass().await, GraphStatus::Terminated);
}

#[tokio::test]
async fn test_unknown_synapse_reference_is_rejected() {
    let mut h = harness();
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![pseudo(1, "noop")],
        synapses: vec![synapse(1, &[42], &[])],
    };
    assert!(h.engine.start(spec, Duration::from_secs(60)).is_err());
}

#[tokio::test]
async fn test_target_rc_guard_blocks_mismatched_results() {
    let mut h = harness();
    let probe = rsc_op(1, "rscA", "monitor", "alpha");
    let start = rsc_op(2, "rscA", "start", "alpha");
    let spec = GraphSpec {
        batch_limit: 0,
        actions: vec![probe, start],
        synapses: vec![
            synapse(1, &[1], &[]),
            SynapseSpec {
                id: 2,
                priority: 0,
                actions: vec![2],
                inputs: vec![ActionInput {
                    action_id: 1,
                    // Only fire the start if the probe said "not running".
                    target_rc: Some(agent_rc::NOT_RUNNING),
                }],
            },
        ],
    };
    h.engine.start(spec, Duration::from_secs(60)).unwrap();
    h.engine.run_pass().await;
    let probe_key = dispatched_key(&h.dispatches.try_recv().unwrap());

    // Probe found the resource running: guard mismatch, start never fires.
    h.engine.confirm(&probe_key, OpStatus::Done, agent_rc::OK);
    let status = h.engine.run_pass().await;
    assert_eq!(status, GraphStatus::Pending);
    assert!(h.dispatches.try_recv().is_err());
}