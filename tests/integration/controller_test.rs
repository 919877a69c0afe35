// tests/integration/controller_test.rs

//! End-to-end controller scenarios on a single-node cluster: DC election,
//! join, transition execution, external aborts, and eviction.

use super::fixtures::{LOCAL_NODE, start_cluster, wait_for};
use helmsman::core::transition::{
    ActionInput, ActionKind, ActionSpec, GraphSpec, SynapseSpec,
};
use helmsman::core::types::{OpStatus, ResourceSpec, agent_rc};
use std::collections::BTreeMap;

fn start_action(id: u32, rsc: &str) -> ActionSpec {
    ActionSpec {
        id,
        kind: ActionKind::RscOp,
        task: "start".to_string(),
        target: Some(LOCAL_NODE.to_string()),
        rsc: Some(ResourceSpec::new(rsc, "ocf", Some("heartbeat"), "Dummy")),
        interval_ms: 0,
        timeout_ms: 60_000,
        start_delay_ms: 0,
        params: BTreeMap::new(),
        can_fail: false,
        target_rc: 0,
    }
}

fn single_action_graph(action: ActionSpec) -> GraphSpec {
    GraphSpec {
        batch_limit: 0,
        actions: vec![action],
        synapses: vec![SynapseSpec {
            id: 1,
            priority: 0,
            actions: vec![1],
            inputs: vec![],
        }],
    }
}

#[tokio::test]
async fn test_lone_node_elects_itself_dc() {
    let harness = start_cluster(None).await;

    wait_for("the local node to become DC", || async {
        harness.snapshot().await.dc.as_deref() == Some(LOCAL_NODE)
    })
    .await;

    // The join round completed: our node_state entry says member.
    wait_for("the join round to finalize", || async {
        harness
            .snapshot()
            .await
            .nodes
            .get(LOCAL_NODE)
            .is_some_and(|n| n.join == "member")
    })
    .await;

    harness.stop();
}

#[tokio::test]
async fn test_successful_start_flows_into_cib_and_completes() {
    let harness = start_cluster(Some(single_action_graph(start_action(1, "rscA")))).await;
    harness.executor.auto_complete(OpStatus::Done, agent_rc::OK);

    // The action result lands in the status section with matching magic.
    wait_for("the start result to be recorded", || async {
        let doc = harness.snapshot().await;
        doc.nodes
            .get(LOCAL_NODE)
            .and_then(|n| n.resources.get("rscA"))
            .and_then(|r| r.ops.get("rscA_start_0"))
            .and_then(|op| op.magic())
            .is_some_and(|magic| magic.matches_target())
    })
    .await;

    let history = harness
        .ctx
        .executors
        .local()
        .unwrap()
        .history_snapshot("rscA")
        .unwrap();
    assert_eq!(history.last.unwrap().op_type, "start");

    // The transition completed and the controller went idle: a later
    // configuration change triggers a recomputation, and the executor never
    // sees more than the one start.
    let invocations_before = harness.scheduler.invocations();
    harness
        .cib
        .set_config_value("stonith-enabled", serde_json::json!(true));
    wait_for("a post-completion recomputation", || async {
        harness.scheduler.invocations() > invocations_before
    })
    .await;
    assert!(harness.executor.active_requests().is_empty());

    harness.stop();
}

#[tokio::test]
async fn test_ordered_start_then_stop_graph() {
    let stop = ActionSpec {
        id: 2,
        task: "stop".to_string(),
        ..start_action(2, "rscA")
    };
    let graph = GraphSpec {
        batch_limit: 0,
        actions: vec![start_action(1, "rscA"), stop],
        synapses: vec![
            SynapseSpec {
                id: 1,
                priority: 0,
                actions: vec![1],
                inputs: vec![],
            },
            SynapseSpec {
                id: 2,
                priority: 0,
                actions: vec![2],
                inputs: vec![ActionInput {
                    action_id: 1,
                    target_rc: None,
                }],
            },
        ],
    };

    let harness = start_cluster(Some(graph)).await;
    harness.executor.auto_complete(OpStatus::Done, agent_rc::OK);

    wait_for("both results to be recorded in order", || async {
        let doc = harness.snapshot().await;
        let Some(rsc) = doc
            .nodes
            .get(LOCAL_NODE)
            .and_then(|n| n.resources.get("rscA"))
        else {
            return false;
        };
        match (rsc.ops.get("rscA_start_0"), rsc.ops.get("rscA_stop_0")) {
            (Some(start), Some(stop)) => start.call_id < stop.call_id,
            _ => false,
        }
    })
    .await;

    harness.stop();
}

#[tokio::test]
async fn test_external_cib_change_aborts_a_live_transition() {
    let harness = start_cluster(Some(single_action_graph(start_action(1, "rscA")))).await;
    // No auto-complete: the action stays in flight.

    wait_for("the action to reach the executor", || async {
        !harness.executor.active_requests().is_empty()
    })
    .await;
    let invocations_before = harness.scheduler.invocations();

    // An administrator edits the configuration mid-transition.
    harness
        .cib
        .set_config_value("maintenance-mode", serde_json::json!(true));

    // The abort terminates the graph and the scheduler runs again.
    wait_for("the transition to be recomputed", || async {
        harness.scheduler.invocations() > invocations_before
    })
    .await;

    // The in-flight operation was left to run; nothing cancelled it.
    assert_eq!(harness.executor.active_requests().len(), 1);

    harness.stop();
}

#[tokio::test]
async fn test_transport_eviction_terminates_the_controller() {
    let harness = start_cluster(None).await;

    wait_for("the local node to become DC", || async {
        harness.snapshot().await.dc.as_deref() == Some(LOCAL_NODE)
    })
    .await;

    // A membership view without us: the transport evicted this node.
    harness
        .transport
        .inject_membership(vec![7, 8], vec![], vec![])
        .await;

    let exit_code = harness.handle.await.expect("controller task must not panic");
    assert_eq!(exit_code, 1);
}
