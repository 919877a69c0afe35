use helmsman::config::FencingConfig;
use helmsman::core::fencing::{
    AgentResult, DeviceRegistration, FenceCallOptions, FenceOutcome, FencingCoordinator,
    HostCheck, ScriptedAgentRunner, fence_rc,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn registration(id: &str, agent: &str, pairs: &[(&str, &str)]) -> DeviceRegistration {
    DeviceRegistration {
        id: id.to_string(),
        agent: agent.to_string(),
        namespace: "stonith-ng".to_string(),
        params: params(pairs),
    }
}

fn ok() -> AgentResult {
    AgentResult {
        rc: 0,
        output: String::new(),
        timed_out: false,
    }
}

fn failed(rc: i32) -> AgentResult {
    AgentResult {
        rc,
        output: "boom".to_string(),
        timed_out: false,
    }
}

struct Harness {
    coordinator: Arc<FencingCoordinator>,
    runner: Arc<ScriptedAgentRunner>,
    outcomes: mpsc::Receiver<FenceOutcome>,
    _shutdown: broadcast::Sender<()>,
}

fn harness() -> Harness {
    let runner = ScriptedAgentRunner::new();
    let (outcomes_tx, outcomes) = mpsc::channel(64);
    let (shutdown, _) = broadcast::channel(4);
    let coordinator = FencingCoordinator::new(
        "alpha",
        runner.clone(),
        outcomes_tx,
        FencingConfig::default(),
        shutdown.clone(),
    );
    Harness {
        coordinator,
        runner,
        outcomes,
        _shutdown: shutdown,
    }
}

async fn next_outcome(rx: &mut mpsc::Receiver<FenceOutcome>) -> FenceOutcome {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a fence outcome")
        .expect("outcome channel closed")
}

#[test]
fn test_registration_derives_host_structures() {
    let reg = registration(
        "d1",
        "fence_ipmi",
        &[
            ("pcmk_host_list", "nodeX nodeY"),
            ("pcmk_host_map", "nodeX:port1;nodeY:port2"),
            ("ipaddr", "10.0.0.9"),
            ("priority", "7"),
        ],
    );
    let device = helmsman::core::fencing::FenceDevice::from_registration(reg).unwrap();
    assert_eq!(device.host_check, HostCheck::StaticList);
    assert_eq!(device.priority, 7);
    assert_eq!(device.host_list, vec!["nodeX", "nodeY"]);
    assert_eq!(device.alias_for("nodeX"), "port1");
    assert_eq!(device.alias_for("unmapped"), "unmapped");
    // Coordinator-interpreted keys never reach the agent.
    assert!(device.agent_params.contains_key("ipaddr"));
    assert!(!device.agent_params.keys().any(|k| k.starts_with("pcmk_")));
}

#[test]
fn test_host_check_defaults_to_dynamic_without_a_list() {
    let reg = registration("d1", "fence_x", &[("ipaddr", "10.0.0.9")]);
    let device = helmsman::core::fencing::FenceDevice::from_registration(reg).unwrap();
    assert_eq!(device.host_check, HostCheck::DynamicList);
}

#[test]
fn test_action_remapping() {
    let reg = registration("d1", "fence_x", &[("pcmk_reboot_action", "off")]);
    let device = helmsman::core::fencing::FenceDevice::from_registration(reg).unwrap();
    assert_eq!(device.mapped_action("reboot"), "off");
    assert_eq!(device.mapped_action("on"), "on");
}

#[tokio::test]
async fn test_can_fence_static_list() {
    let h = harness();
    h.coordinator
        .register_device(registration(
            "d1",
            "fence_x",
            &[("pcmk_host_list", "nodeX,nodeY")],
        ))
        .unwrap();
    let device = h.coordinator.get_device("d1").unwrap();
    assert!(h.coordinator.can_fence(&device, "nodeX").await);
    assert!(!h.coordinator.can_fence(&device, "nodeZ").await);
}

#[tokio::test]
async fn test_can_fence_dynamic_list_refresh_and_disable() {
    let h = harness();
    h.coordinator
        .register_device(registration(
            "d1",
            "fence_x",
            &[("pcmk_host_check", "dynamic-list")],
        ))
        .unwrap();
    let device = h.coordinator.get_device("d1").unwrap();

    h.runner.script(
        "fence_x",
        "list",
        AgentResult {
            rc: 0,
            output: "nodeX\nnodeY\n".to_string(),
            timed_out: false,
        },
    );
    assert!(h.coordinator.can_fence(&device, "nodeX").await);
    assert!(!h.coordinator.can_fence(&device, "nodeZ").await);

    // A failing list disables future queries on the device.
    let h2 = harness();
    h2.coordinator
        .register_device(registration(
            "d2",
            "fence_y",
            &[("pcmk_host_check", "dynamic-list")],
        ))
        .unwrap();
    let device2 = h2.coordinator.get_device("d2").unwrap();
    h2.runner.script("fence_y", "list", failed(1));
    assert!(!h2.coordinator.can_fence(&device2, "nodeX").await);
    assert!(device2.list_disabled.load(std::sync::atomic::Ordering::Acquire));
    // Only the first probe ran; the device stays ineligible without retries.
    assert!(!h2.coordinator.can_fence(&device2, "nodeX").await);
    assert_eq!(
        h2.runner
            .invocations()
            .iter()
            .filter(|i| i.action == "list")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_can_fence_status_codes() {
    let h = harness();
    h.coordinator
        .register_device(registration(
            "d1",
            "fence_x",
            &[("pcmk_host_check", "status")],
        ))
        .unwrap();
    let device = h.coordinator.get_device("d1").unwrap();

    // rc=2 means "target inactive" and still proves the device knows it.
    h.runner.script("fence_x", "status", failed(2));
    assert!(h.coordinator.can_fence(&device, "nodeX").await);

    let h2 = harness();
    h2.coordinator
        .register_device(registration(
            "d2",
            "fence_y",
            &[("pcmk_host_check", "status")],
        ))
        .unwrap();
    let device2 = h2.coordinator.get_device("d2").unwrap();
    h2.runner.script("fence_y", "status", failed(1));
    assert!(!h2.coordinator.can_fence(&device2, "nodeX").await);
}

#[tokio::test]
async fn test_fence_with_fallback_device() {
    let mut h = harness();
    h.coordinator
        .register_device(registration(
            "d1",
            "fence_a",
            &[("pcmk_host_list", "nodeX"), ("priority", "10")],
        ))
        .unwrap();
    h.coordinator
        .register_device(registration(
            "d2",
            "fence_b",
            &[("pcmk_host_list", "nodeX"), ("priority", "5")],
        ))
        .unwrap();

    // The high-priority device fails; the fallback succeeds.
    h.runner.script("fence_a", "reboot", failed(1));
    h.runner.script("fence_b", "reboot", ok());

    h.coordinator
        .fence_request(
            "nodeX",
            "reboot",
            "alpha",
            "client-1",
            FenceCallOptions::empty(),
            None,
            None,
        )
        .await;

    let outcome = next_outcome(&mut h.outcomes).await;
    assert!(outcome.broadcast);
    assert_eq!(outcome.notification.result, fence_rc::OK);
    assert_eq!(outcome.notification.target, "nodeX");
    assert_eq!(outcome.notification.executioner, "alpha");
    assert_eq!(outcome.notification.device.as_deref(), Some("d2"));

    // Both agents ran, best priority first.
    let fences: Vec<String> = h
        .runner
        .invocations()
        .iter()
        .filter(|i| i.action == "reboot")
        .map(|i| i.agent.clone())
        .collect();
    assert_eq!(fences, vec!["fence_a", "fence_b"]);
}

#[tokio::test]
async fn test_fence_fails_without_capable_devices() {
    let mut h = harness();
    h.coordinator
        .register_device(registration(
            "d1",
            "fence_a",
            &[("pcmk_host_list", "nodeY")],
        ))
        .unwrap();

    h.coordinator
        .fence_request(
            "nodeX",
            "reboot",
            "alpha",
            "client-1",
            FenceCallOptions::empty(),
            None,
            None,
        )
        .await;

    let outcome = next_outcome(&mut h.outcomes).await;
    assert!(!outcome.broadcast);
    assert_eq!(outcome.notification.result, fence_rc::NONE_AVAILABLE);
}

#[tokio::test]
async fn test_manual_ack_skips_devices() {
    let mut h = harness();
    h.coordinator
        .fence_request(
            "nodeX",
            "off",
            "alpha",
            "client-1",
            FenceCallOptions::MANUAL_ACK,
            None,
            None,
        )
        .await;

    let outcome = next_outcome(&mut h.outcomes).await;
    assert!(outcome.broadcast);
    assert_eq!(outcome.notification.result, fence_rc::OK);
    assert!(outcome.notification.device.is_none());
    assert!(h.runner.invocations().is_empty());
}

#[tokio::test]
async fn test_device_commands_run_serially_in_fifo_order() {
    let mut h = harness();
    h.coordinator
        .register_device(registration("d1", "fence_a", &[("pcmk_host_list", "nodeX")]))
        .unwrap();
    h.runner.script("fence_a", "reboot", ok());

    for _ in 0..3 {
        h.coordinator
            .fence_request(
                "nodeX",
                "reboot",
                "alpha",
                "client-1",
                FenceCallOptions::empty(),
                None,
                None,
            )
            .await;
    }

    let mut call_ids = Vec::new();
    for _ in 0..3 {
        call_ids.push(next_outcome(&mut h.outcomes).await.notification.call_id);
    }
    let mut sorted = call_ids.clone();
    sorted.sort_unstable();
    assert_eq!(call_ids, sorted);
}

#[tokio::test]
async fn test_metadata_output_is_cached_and_unicast() {
    let mut h = harness();
    h.coordinator
        .register_device(registration("d1", "fence_a", &[("pcmk_host_list", "nodeX")]))
        .unwrap();
    h.runner.script(
        "fence_a",
        "metadata",
        AgentResult {
            rc: 0,
            output: "<resource-agent name=\"fence_a\"/>".to_string(),
            timed_out: false,
        },
    );

    h.coordinator
        .device_action(
            "d1",
            helmsman::core::fencing::FenceOperation::Metadata,
            "alpha",
            "client-1",
        )
        .unwrap();

    let outcome = next_outcome(&mut h.outcomes).await;
    assert!(!outcome.broadcast);
    assert!(outcome.notification.output.as_deref().unwrap().contains("resource-agent"));

    let device = h.coordinator.get_device("d1").unwrap();
    assert!(device.metadata.lock().is_some());
}

#[tokio::test]
async fn test_unknown_device_action_is_rejected() {
    let h = harness();
    assert!(
        h.coordinator
            .device_action(
                "missing",
                helmsman::core::fencing::FenceOperation::Status,
                "alpha",
                "c",
            )
            .is_err()
    );
}

#[tokio::test]
async fn test_removed_device_fails_queued_commands() {
    let mut h = harness();
    h.coordinator
        .register_device(registration("d1", "fence_a", &[("pcmk_host_list", "nodeX")]))
        .unwrap();

    // The first command occupies the device long enough for a second to
    // queue behind it and for the device to be removed meanwhile.
    h.runner
        .script_delayed("fence_a", "reboot", ok(), Duration::from_millis(300));
    for _ in 0..2 {
        h.coordinator
            .fence_request(
                "nodeX",
                "reboot",
                "alpha",
                "client-1",
                FenceCallOptions::empty(),
                None,
                None,
            )
            .await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.coordinator.remove_device("d1"));

    // The in-flight command completes normally; the queued one is failed.
    let first = next_outcome(&mut h.outcomes).await;
    assert_eq!(first.notification.result, fence_rc::OK);
    let second = next_outcome(&mut h.outcomes).await;
    assert_eq!(second.notification.result, fence_rc::UNKNOWN_DEVICE);
    assert_eq!(h.coordinator.device_count(), 0);
}
