// tests/integration/fencing_flow_test.rs

//! Fencing scenarios through the full controller: fallback devices,
//! cluster-wide notifications, and the self-fence path.

use super::fixtures::{LOCAL_NODE, start_cluster, wait_for};
use helmsman::core::fencing::{AgentResult, DeviceRegistration};
use helmsman::core::messaging::{ControlMessage, FenceNotification};
use std::collections::BTreeMap;
use std::time::Duration;

fn device(id: &str, agent: &str, priority: i32) -> DeviceRegistration {
    DeviceRegistration {
        id: id.to_string(),
        agent: agent.to_string(),
        namespace: "stonith-ng".to_string(),
        params: BTreeMap::from([
            ("pcmk_host_list".to_string(), "nodeX".to_string()),
            ("priority".to_string(), priority.to_string()),
        ]),
    }
}

#[tokio::test]
async fn test_fence_request_falls_back_and_records_the_victim_down() {
    let harness = start_cluster(None).await;
    wait_for("the local node to become DC", || async {
        harness.snapshot().await.dc.as_deref() == Some(LOCAL_NODE)
    })
    .await;

    harness
        .ctx
        .fencing
        .register_device(device("d1", "fence_a", 10))
        .unwrap();
    harness
        .ctx
        .fencing
        .register_device(device("d2", "fence_b", 5))
        .unwrap();

    harness.runner.script(
        "fence_a",
        "reboot",
        AgentResult {
            rc: 1,
            output: "plug unreachable".to_string(),
            timed_out: false,
        },
    );
    harness.runner.script(
        "fence_b",
        "reboot",
        AgentResult {
            rc: 0,
            output: String::new(),
            timed_out: false,
        },
    );

    // A peer asks us to fence nodeX.
    harness
        .inject_from_peer(
            2,
            "beta",
            ControlMessage::FenceRequest {
                target: "nodeX".to_string(),
                action: "reboot".to_string(),
                origin: "beta".to_string(),
                client_id: "client-9".to_string(),
                call_id: 1,
                timeout_ms: 30_000,
                user_data: None,
            },
        )
        .await;

    // The broadcast notification loops back to us; as DC we record the
    // fenced node as down.
    wait_for("the fenced node to be recorded down", || async {
        harness
            .snapshot()
            .await
            .nodes
            .get("nodeX")
            .is_some_and(|n| n.join == "down" && !n.in_ccm)
    })
    .await;

    // The primary device was tried first, then the fallback.
    let reboots: Vec<String> = harness
        .runner
        .invocations()
        .iter()
        .filter(|i| i.action == "reboot")
        .map(|i| i.agent.clone())
        .collect();
    assert_eq!(reboots, vec!["fence_a", "fence_b"]);

    harness.stop();
}

#[tokio::test]
async fn test_self_fence_notification_exits_with_code_100() {
    let harness = start_cluster(None).await;
    wait_for("the local node to become DC", || async {
        harness.snapshot().await.dc.as_deref() == Some(LOCAL_NODE)
    })
    .await;

    harness
        .inject_from_peer(
            2,
            "nodeY",
            ControlMessage::FenceNotify(FenceNotification {
                target: LOCAL_NODE.to_string(),
                action: "reboot".to_string(),
                result: 0,
                executioner: "nodeY".to_string(),
                origin: "nodeY".to_string(),
                client_id: "client-1".to_string(),
                call_id: 4,
                device: Some("dY".to_string()),
                output: None,
                user_data: None,
            }),
        )
        .await;

    // The controller attempts a halt, fails (test power control), and
    // exits 100 without any further cleanup.
    let result = harness.handle.await;
    assert!(result.is_err(), "the controller task must have died abruptly");
    wait_for("the recorded exit code", || async {
        harness.power.exit_code() == Some(100)
    })
    .await;
}

#[tokio::test]
async fn test_failed_fence_notification_is_not_a_self_fence() {
    let harness = start_cluster(None).await;
    wait_for("the local node to become DC", || async {
        harness.snapshot().await.dc.as_deref() == Some(LOCAL_NODE)
    })
    .await;

    harness
        .inject_from_peer(
            2,
            "nodeY",
            ControlMessage::FenceNotify(FenceNotification {
                target: LOCAL_NODE.to_string(),
                action: "reboot".to_string(),
                result: 1,
                executioner: "nodeY".to_string(),
                origin: "nodeY".to_string(),
                client_id: "client-1".to_string(),
                call_id: 5,
                device: None,
                output: None,
                user_data: None,
            }),
        )
        .await;

    // A failed fence of ourselves changes nothing locally.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness.power.exit_code().is_none());
    assert!(!harness.handle.is_finished());

    harness.stop();
}
