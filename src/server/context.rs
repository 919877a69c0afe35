// src/server/context.rs

//! The shared controller context: every subsystem handle, created once and
//! threaded through the tasks (no process-wide singletons).

use crate::config::Config;
use crate::core::HelmsmanError;
use crate::core::cib::{CibBackend, CibClient, CibDiff};
use crate::core::executor::{
    ExecutorBackend, ExecutorNotice, ExecutorRegistry, ExecutorState, MetadataCache,
};
use crate::core::fencing::{
    AgentRunner, FenceNotificationHandler, FenceOutcome, FencingCoordinator, PowerControl,
};
use crate::core::membership::{Election, PeerCache};
use crate::core::messaging::{
    ClusterTransport, InboundEvent, MessagingLayer, Outbox, TransportEvent,
};
use crate::core::scheduler::Scheduler;
use crate::core::throttle::Throttle;
use crate::core::transition::{ActionDispatch, TransitionEngine};
use crate::core::fsm::StateMachine;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::info;

/// Capacity of the controller-facing event channels. Bursts beyond this
/// apply backpressure to the producing subsystem, never loss.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything the controller's tasks share.
pub struct ControllerContext {
    pub config: Config,
    pub peers: Arc<PeerCache>,
    pub election: Arc<Election>,
    pub messaging: Arc<MessagingLayer>,
    pub outbox: Arc<Outbox>,
    pub transport: Arc<dyn ClusterTransport>,
    pub executors: Arc<ExecutorRegistry>,
    pub fencing: Arc<FencingCoordinator>,
    pub fence_notify: Arc<FenceNotificationHandler>,
    pub cib: Arc<CibClient>,
    pub scheduler: Arc<dyn Scheduler>,
    pub throttle: Arc<Throttle>,
    pub shutdown_tx: broadcast::Sender<()>,
    /// Sender for executor notices, for wiring up remote-node states after
    /// startup.
    pub executor_notices_tx: mpsc::Sender<ExecutorNotice>,
}

/// Created once by `initialize` and consumed by the spawner/controller.
pub struct ControllerInit {
    pub context: Arc<ControllerContext>,
    pub machine: StateMachine,
    pub engine: TransitionEngine,
    pub inbound_rx: mpsc::Receiver<InboundEvent>,
    pub transport_events: mpsc::Receiver<TransportEvent>,
    pub executor_notices_rx: mpsc::Receiver<ExecutorNotice>,
    pub fence_outcomes_rx: mpsc::Receiver<FenceOutcome>,
    pub dispatch_rx: mpsc::Receiver<ActionDispatch>,
    pub cib_diffs: broadcast::Receiver<CibDiff>,
    pub background_tasks: JoinSet<()>,
}

impl ControllerContext {
    /// Wires every subsystem together. The collaborator seams (transport,
    /// CIB backend, executor backend, scheduler, agent runner, power
    /// control) are injected; everything else is built here.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        config: Config,
        transport: Arc<dyn ClusterTransport>,
        cib_backend: Arc<dyn CibBackend>,
        executor_backend: Arc<dyn ExecutorBackend>,
        scheduler: Arc<dyn Scheduler>,
        agent_runner: Arc<dyn AgentRunner>,
        power: Arc<dyn PowerControl>,
    ) -> Result<ControllerInit, HelmsmanError> {
        let uname = config.node.uname.clone();
        info!("Initializing controller for node '{}'", uname);

        let (shutdown_tx, _) = broadcast::channel(8);
        let (inbound_tx, inbound_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (executor_notices_tx, executor_notices_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (fence_outcomes_tx, fence_outcomes_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let peers = PeerCache::new(config.cluster.autoreap);
        // Seed ourselves so the cache can resolve the local uname at once.
        let local = peers.get_or_create(Some(transport.local_node_id()), Some(&uname))?;
        peers.update_state(
            local.id,
            crate::core::membership::MembershipState::Member,
            0,
        )?;

        let election = Arc::new(Election::new(&uname, env!("CARGO_PKG_VERSION")));

        let outbox = Outbox::new(config.cluster.queue_warn);
        let messaging = MessagingLayer::new(
            Arc::clone(&transport),
            Arc::clone(&outbox),
            Arc::clone(&peers),
            config.cluster.clone(),
            uname.clone(),
            inbound_tx,
        );
        let transport_events = transport.take_events().ok_or_else(|| {
            HelmsmanError::Internal("Transport event stream already claimed".to_string())
        })?;

        let cib = CibClient::new(cib_backend);
        let cib_diffs = cib.subscribe();

        let metadata = Arc::new(MetadataCache::new());
        let executors = ExecutorRegistry::new(&uname);
        let local_executor = ExecutorState::new(
            &uname,
            executor_backend,
            Arc::clone(&metadata),
            Arc::clone(&cib),
            executor_notices_tx.clone(),
            config.executor.clone(),
            config.shutdown_lock.clone(),
        );
        executors.insert(&uname, local_executor);

        let fencing = FencingCoordinator::new(
            &uname,
            agent_runner,
            fence_outcomes_tx,
            config.fencing.clone(),
            shutdown_tx.clone(),
        );

        let fence_notify =
            FenceNotificationHandler::new(&uname, Arc::clone(&peers), Arc::clone(&cib), power);

        let throttle = Arc::new(Throttle::new());
        let machine = StateMachine::new();
        let engine = TransitionEngine::new(
            Arc::clone(&throttle),
            dispatch_tx,
            crate::core::triggers::Trigger::new(),
            config.transition.action_slack,
        );

        let context = Arc::new(ControllerContext {
            config,
            peers,
            election,
            messaging,
            outbox,
            transport,
            executors,
            fencing,
            fence_notify,
            cib,
            scheduler,
            throttle,
            shutdown_tx,
            executor_notices_tx,
        });

        Ok(ControllerInit {
            context,
            machine,
            engine,
            inbound_rx,
            transport_events,
            executor_notices_rx,
            fence_outcomes_rx,
            dispatch_rx,
            cib_diffs,
            background_tasks: JoinSet::new(),
        })
    }
}

impl std::fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerContext")
            .field("uname", &self.config.node.uname)
            .field("peers", &self.peers.len())
            .finish()
    }
}
