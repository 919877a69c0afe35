// tests/integration/fixtures.rs

//! A full-controller harness: real controller loop, in-process transport,
//! in-memory CIB, scripted executor and fence agents.

use helmsman::config::Config;
use helmsman::core::HelmsmanError;
use helmsman::core::cib::{CibBackend, InMemoryCib};
use helmsman::core::executor::ScriptedExecutor;
use helmsman::core::fencing::{PowerControl, ScriptedAgentRunner};
use helmsman::core::messaging::{ControlMessage, EndpointId, HostSpec, LoopbackTransport, WireFrame};
use helmsman::core::scheduler::Scheduler;
use helmsman::core::transition::GraphSpec;
use helmsman::server::{Controller, ControllerContext, spawner};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const LOCAL_NODE: &str = "alpha";
pub const LOCAL_NODE_ID: u32 = 1;

/// Power control that records the exit instead of taking the host down.
pub struct TestPower {
    exit_code: Mutex<Option<i32>>,
}

impl TestPower {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            exit_code: Mutex::new(None),
        })
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }
}

impl PowerControl for TestPower {
    fn halt(&self) -> Result<(), HelmsmanError> {
        Err(HelmsmanError::Unavailable("test power control".to_string()))
    }

    fn exit(&self, code: i32) -> ! {
        *self.exit_code.lock() = Some(code);
        panic!("controller exit({code})");
    }
}

/// Serves one prepared graph on the first invocation, then empty graphs.
pub struct OneShotScheduler {
    spec: Mutex<Option<GraphSpec>>,
    invocations: AtomicUsize,
}

impl OneShotScheduler {
    pub fn new(spec: Option<GraphSpec>) -> Arc<Self> {
        Arc::new(Self {
            spec: Mutex::new(spec),
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Scheduler for OneShotScheduler {
    fn compute(&self, _snapshot: &helmsman::core::cib::CibDocument) -> GraphSpec {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.spec.lock().take().unwrap_or_default()
    }
}

/// A running single-node cluster.
pub struct ClusterHarness {
    pub ctx: Arc<ControllerContext>,
    pub transport: Arc<LoopbackTransport>,
    pub cib: Arc<InMemoryCib>,
    pub executor: Arc<ScriptedExecutor>,
    pub runner: Arc<ScriptedAgentRunner>,
    pub power: Arc<TestPower>,
    pub scheduler: Arc<OneShotScheduler>,
    pub handle: JoinHandle<i32>,
    /// Keeps the messaging/executor background tasks alive for the
    /// harness's lifetime.
    _background: tokio::task::JoinSet<()>,
}

/// Fast timers so tests converge quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.node.uname = LOCAL_NODE.to_string();
    config.fsm.election_timeout = Duration::from_secs(2);
    config.fsm.integration_timeout = Duration::from_secs(5);
    config.fsm.finalization_timeout = Duration::from_secs(5);
    config
}

/// Boots a full controller on the loopback transport.
pub async fn start_cluster(graph: Option<GraphSpec>) -> ClusterHarness {
    let transport = LoopbackTransport::new(LOCAL_NODE_ID);
    transport
        .inject_membership(vec![LOCAL_NODE_ID], vec![LOCAL_NODE_ID], vec![])
        .await;

    let cib = InMemoryCib::new();
    let executor = ScriptedExecutor::new();
    let runner = ScriptedAgentRunner::new();
    let power = TestPower::new();
    let scheduler = OneShotScheduler::new(graph);

    let mut init = ControllerContext::initialize(
        test_config(),
        transport.clone(),
        cib.clone(),
        executor.clone(),
        scheduler.clone(),
        runner.clone(),
        power.clone(),
    )
    .unwrap();

    let ctx = Arc::clone(&init.context);
    spawner::spawn_all(&mut init);
    let background = std::mem::take(&mut init.background_tasks);
    let handle = tokio::spawn(Controller::new(init).run());

    ClusterHarness {
        ctx,
        transport,
        cib,
        executor,
        runner,
        power,
        scheduler,
        handle,
        _background: background,
    }
}

impl ClusterHarness {
    /// Injects a control message as though a peer had multicast it.
    pub async fn inject_from_peer(&self, node_id: u32, uname: &str, message: ControlMessage) {
        let frame = WireFrame::build(
            EndpointId {
                node_id,
                pid: 1000 + node_id,
                uname: uname.to_string(),
            },
            HostSpec::broadcast(),
            1,
            &message,
            64 * 1024,
        )
        .unwrap();
        self.transport
            .inject_delivery(node_id, 1000 + node_id, frame.encode().unwrap())
            .await;
    }

    pub async fn snapshot(&self) -> helmsman::core::cib::CibDocument {
        self.cib.snapshot().await
    }

    /// Tears the harness down without going through a full shutdown.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

/// Polls a condition until it holds or the timeout expires.
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
