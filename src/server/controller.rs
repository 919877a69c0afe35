// src/server/controller.rs

//! The controller task: the single owner of the state machine and the
//! transition engine. Every subsystem event funnels in here, becomes a
//! typed FSM input or an engine call, and every state transition's action
//! bits are executed here.

use crate::core::cib::{CibChange, CibDiff};
use crate::core::executor::{CancelOutcome, ExecSpec, ExecutorNotice};
use crate::core::fencing::{FenceCallOptions, FenceNotifyEffect, FenceOutcome};
use crate::core::fsm::{AppliedTransition, FsmActions, FsmInput, FsmState, StateMachine};
use crate::core::keys::TransitionKey;
use crate::core::membership::{ElectionNoVote, ElectionOutcome, MembershipState, Peer, ProcMask, VoteVerdict};
use crate::core::messaging::{
    ControlMessage, Destination, FenceNotification, InboundEvent, InboundMessage, NodeSummary,
    RemoteResourceOp,
};
use crate::core::transition::{AbortAction, ActionDispatch, GraphStatus, TransitionEngine};
use crate::core::types::{OpStatus, ResourceSpec};
use rand::Rng;
use crate::server::context::{ControllerContext, ControllerInit};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

/// How often the controller sweeps its timers.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Join-round bookkeeping on the DC.
#[derive(Debug, Default)]
struct JoinRound {
    id: u64,
    offered: HashSet<String>,
    integrated: HashSet<String>,
    confirmed: HashSet<String>,
}

/// The controller itself. Constructed from `ControllerInit`; `run`
/// consumes it and returns the process exit code.
pub struct Controller {
    ctx: Arc<ControllerContext>,
    machine: StateMachine,
    engine: TransitionEngine,
    inbound_rx: mpsc::Receiver<InboundEvent>,
    executor_notices_rx: mpsc::Receiver<ExecutorNotice>,
    fence_outcomes_rx: mpsc::Receiver<FenceOutcome>,
    dispatch_rx: mpsc::Receiver<ActionDispatch>,
    cib_diffs: broadcast::Receiver<CibDiff>,

    /// The DC this node currently recognizes (possibly itself).
    dc: Option<String>,
    join: JoinRound,
    election_deadline: Option<Instant>,
    integration_deadline: Option<Instant>,
    finalize_deadline: Option<Instant>,
    halted: bool,
    exit_code: i32,
}

impl Controller {
    pub fn new(init: ControllerInit) -> Self {
        Self {
            ctx: init.context,
            machine: init.machine,
            engine: init.engine,
            inbound_rx: init.inbound_rx,
            executor_notices_rx: init.executor_notices_rx,
            fence_outcomes_rx: init.fence_outcomes_rx,
            dispatch_rx: init.dispatch_rx,
            cib_diffs: init.cib_diffs,
            dc: None,
            join: JoinRound::default(),
            election_deadline: None,
            integration_deadline: None,
            finalize_deadline: None,
            halted: false,
            exit_code: 0,
        }
    }

    fn local_uname(&self) -> String {
        self.ctx.config.node.uname.clone()
    }

    fn is_dc(&self) -> bool {
        self.dc.as_deref() == Some(self.ctx.config.node.uname.as_str())
    }

    /// The controller main loop. Returns the exit code once the machine
    /// reaches `S_TERMINATE`.
    pub async fn run(mut self) -> i32 {
        info!("Controller starting as '{}'", self.local_uname());
        self.machine.enqueue(FsmInput::Started);

        let fsm_trigger = self.machine.trigger();
        let te_trigger = self.engine.trigger();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = fsm_trigger.fired() => {
                    self.drain_machine().await;
                }
                _ = te_trigger.fired() => {
                    self.run_engine_pass().await;
                }
                Some(event) = self.inbound_rx.recv() => {
                    self.handle_inbound(event).await;
                }
                Some(notice) = self.executor_notices_rx.recv() => {
                    self.handle_executor_notice(notice).await;
                }
                Some(outcome) = self.fence_outcomes_rx.recv() => {
                    self.handle_fence_outcome(outcome).await;
                }
                Some(dispatch) = self.dispatch_rx.recv() => {
                    self.handle_dispatch(dispatch).await;
                }
                diff = self.cib_diffs.recv() => {
                    match diff {
                        Ok(diff) => self.handle_cib_diff(diff).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Missed {} CIB diffs, forcing recomputation", missed);
                            self.machine.enqueue(FsmInput::PeCalc {
                                reason: "diff stream lagged".to_string(),
                            });
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.machine.enqueue(FsmInput::Error {
                                reason: "CIB diff stream closed".to_string(),
                            });
                        }
                    }
                }
                _ = tick.tick() => {
                    self.handle_tick().await;
                }
            }

            // Drain any inputs the handlers enqueued before sleeping again.
            self.drain_machine().await;

            if self.machine.state() == FsmState::Terminate {
                break;
            }
        }

        info!("Controller terminating with code {}", self.exit_code);
        self.ctx.fencing.clear_devices();
        let _ = self.ctx.shutdown_tx.send(());
        self.exit_code
    }

    async fn drain_machine(&mut self) {
        while let Some(applied) = self.machine.step() {
            self.execute_actions(applied).await;
            if self.machine.state() == FsmState::Terminate {
                return;
            }
        }
    }

    // --- FSM action execution ----------------------------------------------

    async fn execute_actions(&mut self, applied: AppliedTransition) {
        let actions = applied.actions;

        if actions.contains(FsmActions::A_WARN) {
            warn!(
                "Input {} in {}: {}",
                applied.input.id(),
                applied.from,
                applied.cause.unwrap_or("no cause recorded")
            );
        } else if actions.contains(FsmActions::A_LOG) {
            trace!("Input {} absorbed in {}", applied.input.id(), applied.from);
        }

        if actions.contains(FsmActions::A_HELLO) {
            self.send_hello().await;
        }
        if actions.contains(FsmActions::A_TE_HALT) {
            self.halted = true;
            self.engine.clear();
        }
        if actions.contains(FsmActions::A_TE_CANCEL) {
            // The graph is abandoned; in-flight results will be stale.
            self.engine.clear();
        }
        if actions.contains(FsmActions::A_DC_RELEASE) {
            self.release_dc().await;
        }
        if actions.contains(FsmActions::A_ELECTION_VOTE) {
            self.start_election().await;
        }
        if actions.contains(FsmActions::A_ELECTION_CHECK) {
            self.election_check(&applied.input).await;
        }
        if actions.contains(FsmActions::A_DC_TAKEOVER) {
            self.dc_takeover().await;
        }
        if actions.contains(FsmActions::A_INTEGRATE_TIMER_START) {
            self.integration_deadline =
                Some(Instant::now() + self.ctx.config.fsm.integration_timeout);
        }
        if actions.contains(FsmActions::A_INTEGRATE_TIMER_STOP) {
            self.integration_deadline = None;
        }
        if actions.contains(FsmActions::A_FINALIZE_TIMER_START) {
            self.finalize_deadline =
                Some(Instant::now() + self.ctx.config.fsm.finalization_timeout);
        }
        if actions.contains(FsmActions::A_FINALIZE_TIMER_STOP) {
            self.finalize_deadline = None;
        }
        if actions.contains(FsmActions::A_JOIN_OFFER_ALL) {
            self.join_offer_all().await;
        }
        if actions.contains(FsmActions::A_JOIN_OFFER_ONE) {
            if let FsmInput::NodeJoin { uname } = &applied.input {
                let uname = uname.clone();
                self.join_offer_one(&uname).await;
            }
        }
        if actions.contains(FsmActions::A_JOIN_REQUEST) {
            if let FsmInput::JoinOffer { dc, join_id } = &applied.input {
                let (dc, join_id) = (dc.clone(), *join_id);
                self.answer_join_offer(&dc, join_id).await;
            }
        }
        if actions.contains(FsmActions::A_JOIN_PROCESS_REQ) {
            if let FsmInput::JoinRequest { uname, join_id } = &applied.input {
                let (uname, join_id) = (uname.clone(), *join_id);
                self.process_join_request(&uname, join_id).await;
            }
        }
        if actions.contains(FsmActions::A_JOIN_FINALIZE) {
            self.finalize_join_round().await;
        }
        if actions.contains(FsmActions::A_PE_INVOKE) {
            self.invoke_scheduler().await;
        }
        if actions.contains(FsmActions::A_TE_START) {
            if let FsmInput::PeSuccess(spec) = &applied.input {
                self.start_transition(spec.clone()).await;
            }
        }
        if actions.contains(FsmActions::A_SHUTDOWN_REQ) {
            self.request_shutdown().await;
        }
        if actions.contains(FsmActions::A_SHUTDOWN) {
            self.begin_shutdown().await;
        }
        if actions.contains(FsmActions::A_LRM_VERIFY_STOPPED) {
            self.verify_stopped().await;
        }
        if actions.contains(FsmActions::A_LRM_DISCONNECT) {
            debug!("Releasing executor connections");
        }
        if actions.contains(FsmActions::A_RECOVER) {
            self.recover().await;
        }
        if actions.contains(FsmActions::A_EXIT_OK) && self.exit_code == 0 {
            self.exit_code = 0;
        }
        if actions.contains(FsmActions::A_EXIT_FAIL) {
            if let FsmInput::Error { reason } = &applied.input {
                error!("Terminating on fatal error: {}", reason);
            }
            self.exit_code = 1;
        }
    }

    async fn send_hello(&mut self) {
        let hello = ControlMessage::Hello {
            uname: self.local_uname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            processes: (ProcMask::CONTROLLER | ProcMask::EXECUTOR | ProcMask::FENCER).bits(),
        };
        if let Err(e) = self
            .ctx
            .messaging
            .send(hello, Destination::Broadcast, false)
            .await
        {
            warn!("Could not announce ourselves: {}", e);
        }
        // With no DC in sight, force the question.
        if self.dc.is_none() {
            self.machine.enqueue(FsmInput::Election);
        }
    }

    async fn start_election(&mut self) {
        let vote = self.ctx.election.start();
        // Jitter keeps simultaneous restarts from thundering in lockstep.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        self.election_deadline =
            Some(Instant::now() + self.ctx.config.fsm.election_timeout + jitter);
        if let Err(e) = self
            .ctx
            .messaging
            .send(
                ControlMessage::Vote(vote),
                Destination::Broadcast,
                false,
            )
            .await
        {
            warn!("Could not broadcast vote: {}", e);
        }
        self.evaluate_election().await;
    }

    async fn election_check(&mut self, input: &FsmInput) {
        match input {
            FsmInput::Vote(vote) => {
                match self.ctx.election.compare(vote) {
                    VoteVerdict::RemoteWins => {
                        let novote = ControlMessage::NoVote(ElectionNoVote {
                            round: vote.round,
                            uname: self.local_uname(),
                        });
                        let _ = self
                            .ctx
                            .messaging
                            .send(novote, Destination::Node(vote.uname.clone()), false)
                            .await;
                    }
                    VoteVerdict::LocalWins => {
                        // Someone is running an election we would win; make
                        // sure we are actually standing in it.
                        if self.machine.state() != FsmState::Election {
                            self.machine.enqueue(FsmInput::Election);
                        }
                    }
                }
            }
            FsmInput::NoVote(novote) => {
                self.ctx.election.record_concession(novote);
            }
            _ => {}
        }
        self.evaluate_election().await;
    }

    async fn evaluate_election(&mut self) {
        if self.machine.state() != FsmState::Election {
            return;
        }
        let others = self.other_controllers();
        match self.ctx.election.outcome(&others) {
            ElectionOutcome::Won => {
                info!("Election round {} won", self.ctx.election.round());
                self.election_deadline = None;
                self.machine.enqueue(FsmInput::ElectionDc);
            }
            ElectionOutcome::Lost => {
                debug!("Election round {} conceded", self.ctx.election.round());
            }
            ElectionOutcome::Pending => {}
        }
    }

    fn other_controllers(&self) -> Vec<String> {
        let local = self.local_uname();
        self.ctx
            .peers
            .snapshot()
            .into_iter()
            .filter(|peer| peer.is_member())
            .filter_map(|peer| peer.uname)
            .filter(|uname| *uname != local)
            .collect()
    }

    async fn dc_takeover(&mut self) {
        let local = self.local_uname();
        info!("Taking over as DC");
        self.dc = Some(local.clone());
        self.join = JoinRound {
            id: self.join.id + 1,
            ..JoinRound::default()
        };
        if let Err(e) = self
            .ctx
            .cib
            .submit(
                crate::core::cib::CibRequest::SetDc(Some(local)),
                crate::core::cib::CibCallOptions::QUORUM_OVERRIDE,
            )
            .await
        {
            warn!("Could not record DC in the CIB: {}", e);
        }
    }

    async fn release_dc(&mut self) {
        if self.is_dc() {
            info!("Releasing the DC role");
            let _ = self
                .ctx
                .cib
                .submit(
                    crate::core::cib::CibRequest::SetDc(None),
                    crate::core::cib::CibCallOptions::QUORUM_OVERRIDE,
                )
                .await;
        }
        self.dc = None;
        self.engine.clear();
        self.integration_deadline = None;
        self.finalize_deadline = None;
    }

    async fn join_offer_all(&mut self) {
        let members: Vec<Peer> = self
            .ctx
            .peers
            .snapshot()
            .into_iter()
            .filter(|p| p.is_member())
            .collect();
        info!(
            "Offering join round {} to {} members",
            self.join.id,
            members.len()
        );
        for peer in members {
            if let Some(uname) = peer.uname {
                self.join_offer_one(&uname).await;
            }
        }
    }

    async fn join_offer_one(&mut self, uname: &str) {
        let offer = ControlMessage::JoinOffer {
            dc: self.local_uname(),
            join_id: self.join.id,
        };
        self.join.offered.insert(uname.to_string());
        if let Some(peer) = self.ctx.peers.get_by_uname(uname) {
            let _ = self
                .ctx
                .peers
                .update_join(peer.id, crate::core::membership::JoinPhase::Welcomed);
        }
        let local_echo = uname == self.local_uname();
        if let Err(e) = self
            .ctx
            .messaging
            .send(offer, Destination::Node(uname.to_string()), local_echo)
            .await
        {
            warn!("Could not offer membership to '{}': {}", uname, e);
        }
    }

    async fn answer_join_offer(&mut self, dc: &str, join_id: u64) {
        info!("Answering join offer {} from '{}'", join_id, dc);
        self.dc = Some(dc.to_string());
        let request = ControlMessage::JoinRequest {
            uname: self.local_uname(),
            join_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let local_echo = dc == self.local_uname();
        if let Err(e) = self
            .ctx
            .messaging
            .send(request, Destination::Node(dc.to_string()), local_echo)
            .await
        {
            warn!("Could not answer join offer: {}", e);
        }
    }

    async fn process_join_request(&mut self, uname: &str, join_id: u64) {
        if join_id != self.join.id {
            warn!(
                "Ignoring join request from '{}' for stale round {} (current {})",
                uname, join_id, self.join.id
            );
            return;
        }
        info!("Admitting '{}' into join round {}", uname, join_id);
        self.join.integrated.insert(uname.to_string());
        if let Some(peer) = self.ctx.peers.get_by_uname(uname) {
            let _ = self
                .ctx
                .peers
                .update_join(peer.id, crate::core::membership::JoinPhase::Integrated);
            let _ = self.ctx.peers.update_expected(peer.id, "member");
        }
        let ack = ControlMessage::JoinAckNak {
            uname: uname.to_string(),
            join_id,
            ack: true,
        };
        let local_echo = uname == self.local_uname();
        let _ = self
            .ctx
            .messaging
            .send(ack, Destination::Node(uname.to_string()), local_echo)
            .await;

        if self.join.integrated.is_superset(&self.join.offered)
            && self.machine.state() == FsmState::Integration
        {
            self.machine.enqueue(FsmInput::IntegrationDone);
        }
    }

    async fn finalize_join_round(&mut self) {
        info!(
            "Finalizing join round {} ({} integrated)",
            self.join.id,
            self.join.integrated.len()
        );
        for uname in self.join.integrated.clone() {
            if let Some(peer) = self.ctx.peers.get_by_uname(&uname) {
                let _ = self
                    .ctx
                    .peers
                    .update_join(peer.id, crate::core::membership::JoinPhase::Finalized);
            }
            let _ = self
                .ctx
                .cib
                .submit(
                    crate::core::cib::CibRequest::NodeState {
                        node: uname.clone(),
                        node_id: 0,
                        in_ccm: Some(true),
                        controller_online: Some(true),
                        join: Some("member".to_string()),
                        expected: Some("member".to_string()),
                    },
                    crate::core::cib::CibCallOptions::empty(),
                )
                .await;
        }
    }

    async fn handle_join_confirm(&mut self, uname: &str, join_id: u64) {
        if join_id != self.join.id {
            return;
        }
        self.join.confirmed.insert(uname.to_string());
        if let Some(peer) = self.ctx.peers.get_by_uname(uname) {
            let _ = self
                .ctx
                .peers
                .update_join(peer.id, crate::core::membership::JoinPhase::Confirmed);
        }
        if self.join.confirmed.is_superset(&self.join.integrated)
            && self.machine.state() == FsmState::FinalizeJoin
        {
            self.machine.enqueue(FsmInput::FinalizeDone);
        }
    }

    async fn invoke_scheduler(&mut self) {
        if self.halted {
            warn!("Graph processing is halted; not invoking the scheduler");
            return;
        }
        let snapshot = self.ctx.cib.snapshot().await;
        let spec = self.ctx.scheduler.compute(&snapshot);
        debug!(
            "Scheduler produced {} actions in {} synapses",
            spec.actions.len(),
            spec.synapses.len()
        );
        self.machine.enqueue(FsmInput::PeSuccess(spec));
    }

    async fn start_transition(&mut self, spec: crate::core::transition::GraphSpec) {
        match self
            .engine
            .start(spec, self.ctx.config.transition.global_timeout)
        {
            Ok(id) => debug!("Transition {} installed", id),
            Err(e) => {
                error!("Unusable transition graph: {}", e);
                self.machine.enqueue(FsmInput::Error {
                    reason: format!("scheduler output unusable: {e}"),
                });
            }
        }
    }

    async fn run_engine_pass(&mut self) {
        if self.machine.state() != FsmState::TransitionEngine {
            // Pokes arriving outside the running state are harmless; the
            // graph resumes when the FSM returns here.
            if self.engine.has_graph() {
                trace!(
                    "Graph trigger in {}; deferring pass",
                    self.machine.state()
                );
            }
            return;
        }
        match self.engine.run_pass().await {
            GraphStatus::Complete => {
                self.engine.clear();
                self.machine.enqueue(FsmInput::TeSuccess);
            }
            GraphStatus::Terminated => {
                self.engine.clear();
                self.machine.enqueue(FsmInput::TeAborted);
            }
            GraphStatus::Active | GraphStatus::Pending => {}
        }
    }

    /// Transition aborts funnel through here so state-based suppression is
    /// uniform for every trigger source.
    fn abort_transition(&mut self, priority: i32, action: AbortAction, reason: &str) {
        let state = self.machine.state();
        if state.suppresses_graph() {
            debug!("Suppressing transition abort '{}' in {}", reason, state);
            return;
        }
        if !self.engine.abort(priority, action, reason) {
            // Nothing running: recompute instead.
            self.machine.enqueue(FsmInput::PeCalc {
                reason: reason.to_string(),
            });
        }
    }

    async fn request_shutdown(&mut self) {
        let req = ControlMessage::ShutdownReq {
            uname: self.local_uname(),
        };
        let destination = match &self.dc {
            Some(dc) => Destination::Node(dc.clone()),
            None => Destination::Broadcast,
        };
        info!("Requesting shutdown from the DC");
        if let Err(e) = self.ctx.messaging.send(req, destination, false).await {
            warn!("Could not request shutdown, stopping locally: {}", e);
            self.machine.enqueue(FsmInput::Stop);
        }
    }

    async fn begin_shutdown(&mut self) {
        info!("Beginning local shutdown");
        if let Some(executor) = self.ctx.executors.local() {
            executor.set_shutting_down();
        }
        self.verify_stopped().await;
    }

    async fn verify_stopped(&mut self) {
        let terminating = self.machine.state() == FsmState::Terminate;
        let mut all_stopped = true;
        for node in self.ctx.executors.nodes() {
            if let Some(executor) = self.ctx.executors.get(&node) {
                all_stopped &= executor.verify_stopped(terminating).await;
            }
        }
        if all_stopped && self.machine.state() == FsmState::Stopping {
            info!("All resources stopped, terminating");
            self.machine.enqueue(FsmInput::Terminate);
        }
    }

    async fn recover(&mut self) {
        warn!("Attempting recovery from subsystem failure");
        if self.is_dc() {
            self.release_dc().await;
        }
        self.machine.enqueue(FsmInput::Election);
    }

    // --- Inbound cluster messages ------------------------------------------

    async fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => self.route_message(message).await,
            InboundEvent::Disconnected => {
                self.machine.enqueue(FsmInput::Error {
                    reason: "evicted from the cluster membership".to_string(),
                });
            }
        }
    }

    async fn route_message(&mut self, inbound: InboundMessage) {
        let sender_uname = inbound.sender_uname.clone();
        match inbound.message {
            ControlMessage::Hello {
                uname, processes, ..
            } => {
                if let Ok(peer) = self.ctx.peers.get_or_create(Some(inbound.sender_id), Some(&uname))
                {
                    let _ = self
                        .ctx
                        .peers
                        .update_proc(peer.id, ProcMask::from_bits_truncate(processes));
                }
                if uname != self.local_uname() {
                    self.machine.enqueue(FsmInput::NodeJoin { uname });
                }
            }
            ControlMessage::JoinOffer { dc, join_id } => {
                self.machine.enqueue(FsmInput::JoinOffer { dc, join_id });
            }
            ControlMessage::JoinRequest { uname, join_id, .. } => {
                self.machine.enqueue(FsmInput::JoinRequest { uname, join_id });
            }
            ControlMessage::JoinAckNak { uname, join_id, ack } => {
                if uname == self.local_uname() {
                    if ack {
                        self.complete_local_join(join_id).await;
                    }
                    self.machine.enqueue(FsmInput::JoinResult { ack, join_id });
                }
            }
            ControlMessage::JoinConfirm { uname, join_id } => {
                self.handle_join_confirm(&uname, join_id).await;
            }
            ControlMessage::NodeInfo(NodeSummary {
                node_id,
                uname,
                uuid,
                processes,
            }) => {
                if let Ok(peer) = self.ctx.peers.get_or_create(Some(node_id), Some(&uname)) {
                    if let Some(uuid) = uuid {
                        let _ = self.ctx.peers.update_uuid(peer.id, &uuid);
                    }
                    let _ = self
                        .ctx
                        .peers
                        .update_proc(peer.id, ProcMask::from_bits_truncate(processes));
                }
            }
            ControlMessage::Shutdown { uname } => {
                if uname == self.local_uname() {
                    info!("DC instructed us to stop");
                    self.machine.enqueue(FsmInput::Stop);
                }
            }
            ControlMessage::ShutdownReq { uname } => {
                info!("'{}' asked to be shut down", uname);
                if let Some(peer) = self.ctx.peers.get_by_uname(&uname) {
                    let _ = self.ctx.peers.update_expected(peer.id, "down");
                }
                if self.is_dc() {
                    self.machine.enqueue(FsmInput::PeCalc {
                        reason: format!("shutdown of '{uname}' requested"),
                    });
                }
            }
            ControlMessage::Ping { from } => {
                trace!("Ping from '{}'", from);
            }
            ControlMessage::Throttle { from, level } => {
                trace!("Throttle level {} advertised by '{}'", level, from);
            }
            ControlMessage::LrmDelete { rsc_id } => {
                if let Some(executor) = self.ctx.executors.local()
                    && let Err(e) = executor.delete(&rsc_id).await
                {
                    warn!("Could not delete '{}': {}", rsc_id, e);
                }
            }
            ControlMessage::LrmFail { rsc_id, reason } => {
                if let Some(executor) = self.ctx.executors.local()
                    && let Err(e) = executor.fail(&rsc_id, &reason).await
                {
                    warn!("Could not fail '{}': {}", rsc_id, e);
                }
            }
            ControlMessage::LrmRefresh => {
                if let Some(executor) = self.ctx.executors.local()
                    && let Err(e) = executor.refresh().await
                {
                    warn!("Refresh failed: {}", e);
                }
            }
            ControlMessage::LrmQuery { reply_to } => {
                // Queries are answered through the CIB: resync our history
                // so the asker (and everyone else) sees the current state.
                debug!("Resource query from '{}'", reply_to);
                if let Some(executor) = self.ctx.executors.local()
                    && let Err(e) = executor.refresh().await
                {
                    warn!("Could not answer resource query: {}", e);
                }
            }
            ControlMessage::Reprobe => {
                let local = self.local_uname();
                if let Err(e) = self.ctx.executors.reprobe_node(&local).await {
                    warn!("Reprobe failed: {}", e);
                }
            }
            ControlMessage::InvokeLrm(op) => {
                self.invoke_local_op(op).await;
            }
            ControlMessage::TeAbort { reason, priority } => {
                self.abort_transition(priority, AbortAction::Restart, &reason);
            }
            ControlMessage::TeHalt { reason } => {
                self.machine.enqueue(FsmInput::Halt { reason });
            }
            ControlMessage::Vote(vote) => {
                self.machine.enqueue(FsmInput::Vote(vote));
            }
            ControlMessage::NoVote(novote) => {
                self.machine.enqueue(FsmInput::NoVote(novote));
            }
            ControlMessage::FenceRequest {
                target,
                action,
                origin,
                client_id,
                timeout_ms,
                user_data,
                ..
            } => {
                self.ctx
                    .fencing
                    .fence_request(
                        &target,
                        &action,
                        &origin,
                        &client_id,
                        FenceCallOptions::empty(),
                        Some(Duration::from_millis(timeout_ms)),
                        user_data,
                    )
                    .await;
            }
            ControlMessage::FenceNotify(notification) => {
                self.handle_fence_notification(notification, sender_uname)
                    .await;
            }
        }
    }

    async fn complete_local_join(&mut self, join_id: u64) {
        info!("Join {} acknowledged; publishing our state", join_id);
        if let Some(executor) = self.ctx.executors.local()
            && let Err(e) = executor.refresh().await
        {
            warn!("Could not publish resource history: {}", e);
        }
        if let Some(dc) = self.dc.clone() {
            let confirm = ControlMessage::JoinConfirm {
                uname: self.local_uname(),
                join_id,
            };
            let local_echo = dc == self.local_uname();
            let _ = self
                .ctx
                .messaging
                .send(confirm, Destination::Node(dc), local_echo)
                .await;
        }
    }

    async fn invoke_local_op(&mut self, op: RemoteResourceOp) {
        let Some(executor) = self.ctx.executors.local() else {
            warn!("No local executor for relayed operation");
            return;
        };
        let rsc = ResourceSpec {
            id: op.rsc_id.clone(),
            standard: op.standard,
            provider: op.provider,
            agent_type: op.agent_type,
        };
        if let Err(e) = executor.register(&rsc).await {
            warn!("Could not register '{}': {}", rsc.id, e);
            return;
        }
        let spec = ExecSpec {
            rsc_id: op.rsc_id,
            action: op.task,
            params: op.params,
            interval_ms: op.interval_ms,
            timeout_ms: op.timeout_ms,
            start_delay_ms: op.start_delay_ms,
            user_data: Some(op.user_data),
        };
        if let Err(e) = executor.exec(spec).await {
            warn!("Relayed operation failed to submit: {}", e);
        }
    }

    async fn handle_fence_notification(
        &mut self,
        notification: FenceNotification,
        _sender: Option<String>,
    ) {
        // A fence fired by our own graph confirms its action regardless of
        // which node executed it.
        if let Some(user_data) = &notification.user_data
            && let Ok(key) = TransitionKey::parse(user_data)
        {
            let (status, rc) = if notification.succeeded() {
                (OpStatus::Done, key.target_rc)
            } else {
                (OpStatus::Error, notification.result)
            };
            self.engine.confirm(&key, status, rc);
        }

        let effect = self
            .ctx
            .fence_notify
            .handle(&notification, self.is_dc())
            .await;

        match effect {
            FenceNotifyEffect::PeerFenced { target } => {
                if notification.origin != self.local_uname() {
                    self.abort_transition(
                        i32::MAX,
                        AbortAction::Restart,
                        &format!("'{target}' was fenced"),
                    );
                }
            }
            FenceNotifyEffect::Failed { target, result } => {
                if self.is_dc() {
                    warn!(
                        "Fencing of '{}' failed ({}), recomputing",
                        target, result
                    );
                    self.machine.enqueue(FsmInput::PeCalc {
                        reason: format!("fencing of '{target}' failed"),
                    });
                }
            }
        }
    }

    // --- Executor notices ---------------------------------------------------

    async fn handle_executor_notice(&mut self, notice: ExecutorNotice) {
        match notice {
            ExecutorNotice::OpResult {
                node,
                event,
                direct_ack,
            } => {
                // Results that were not recorded in the CIB must confirm the
                // graph action directly, or the transition would stall.
                if direct_ack
                    && let Some(user_data) = &event.user_data
                    && let Ok(key) = TransitionKey::parse(user_data)
                {
                    trace!("Direct ack for action {} on '{}'", key.action_id, node);
                    self.engine.confirm(&key, event.op_status, event.rc);
                }
                self.machine.enqueue(FsmInput::LrmEvent(event));
            }
            ExecutorNotice::ConnectionLost { node, fatal } => {
                if node == self.local_uname() && fatal {
                    self.machine.enqueue(FsmInput::Error {
                        reason: "local executor connection lost".to_string(),
                    });
                } else {
                    self.engine.fail_incompletable_fencing();
                    self.machine.enqueue(FsmInput::Fail {
                        reason: format!("executor connection to '{node}' lost"),
                    });
                }
            }
        }
    }

    // --- Fence outcomes from the local coordinator --------------------------

    async fn handle_fence_outcome(&mut self, outcome: FenceOutcome) {
        let origin = outcome.notification.origin.clone();
        let message = ControlMessage::FenceNotify(outcome.notification);
        let local = self.local_uname();

        let (destination, local_echo) = if outcome.broadcast {
            (Destination::Broadcast, true)
        } else if origin != local {
            (Destination::Node(origin), false)
        } else {
            (Destination::Node(local), true)
        };

        if let Err(e) = self.ctx.messaging.send(message, destination, local_echo).await {
            error!("Could not deliver fence outcome: {}", e);
        }
    }

    // --- Graph action dispatch ----------------------------------------------

    async fn handle_dispatch(&mut self, dispatch: ActionDispatch) {
        match dispatch {
            ActionDispatch::ResourceOp {
                node,
                rsc,
                task,
                interval_ms,
                timeout_ms,
                start_delay_ms,
                params,
                key,
            } => {
                let local = self.local_uname();
                if node.is_empty() || node == local {
                    self.exec_local_op(
                        rsc,
                        task,
                        interval_ms,
                        timeout_ms,
                        start_delay_ms,
                        params,
                        key,
                    )
                    .await;
                } else {
                    let Some(rsc) = rsc else {
                        error!("Remote operation without resource information");
                        self.engine
                            .confirm(&key, OpStatus::Error, crate::core::types::agent_rc::UNKNOWN_ERROR);
                        return;
                    };
                    let op = RemoteResourceOp {
                        rsc_id: rsc.id.clone(),
                        standard: rsc.standard.clone(),
                        provider: rsc.provider.clone(),
                        agent_type: rsc.agent_type.clone(),
                        task,
                        interval_ms,
                        timeout_ms,
                        start_delay_ms,
                        params,
                        user_data: key.to_string(),
                    };
                    if let Err(e) = self
                        .ctx
                        .messaging
                        .send(
                            ControlMessage::InvokeLrm(op),
                            Destination::Node(node.clone()),
                            false,
                        )
                        .await
                    {
                        error!("Could not relay operation to '{}': {}", node, e);
                        self.engine
                            .confirm(&key, OpStatus::Error, crate::core::types::agent_rc::UNKNOWN_ERROR);
                    }
                }
            }
            ActionDispatch::Fence {
                target,
                action,
                timeout_ms,
                key,
            } => {
                let local = self.local_uname();
                self.ctx
                    .fencing
                    .fence_request(
                        &target,
                        &action,
                        &local,
                        "controller",
                        FenceCallOptions::empty(),
                        Some(Duration::from_millis(timeout_ms)),
                        Some(key.to_string()),
                    )
                    .await;
            }
            ActionDispatch::ClusterOp { target, task, key } => {
                let message = match task.as_str() {
                    "do_shutdown" => ControlMessage::Shutdown {
                        uname: target.clone(),
                    },
                    other => {
                        warn!("Unknown cluster action '{}'", other);
                        self.engine
                            .confirm(&key, OpStatus::Error, crate::core::types::agent_rc::UNIMPLEMENTED);
                        return;
                    }
                };
                let local_echo = target == self.local_uname();
                match self
                    .ctx
                    .messaging
                    .send(message, Destination::Node(target), local_echo)
                    .await
                {
                    Ok(()) => {
                        // Cluster ops confirm on dispatch; the peer's state
                        // change arrives through membership.
                        self.engine.confirm(&key, OpStatus::Done, key.target_rc);
                    }
                    Err(e) => {
                        error!("Could not send cluster action: {}", e);
                        self.engine
                            .confirm(&key, OpStatus::Error, crate::core::types::agent_rc::UNKNOWN_ERROR);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn exec_local_op(
        &mut self,
        rsc: Option<ResourceSpec>,
        task: String,
        interval_ms: u32,
        timeout_ms: u64,
        start_delay_ms: u64,
        params: std::collections::BTreeMap<String, String>,
        key: TransitionKey,
    ) {
        let Some(executor) = self.ctx.executors.local() else {
            error!("No local executor; failing action {}", key.action_id);
            self.engine
                .confirm(&key, OpStatus::Error, crate::core::types::agent_rc::UNKNOWN_ERROR);
            return;
        };
        let Some(rsc) = rsc else {
            error!("Resource operation without resource information");
            self.engine
                .confirm(&key, OpStatus::Error, crate::core::types::agent_rc::UNKNOWN_ERROR);
            return;
        };

        if let Err(e) = executor.register(&rsc).await {
            warn!("Could not register '{}': {}", rsc.id, e);
            self.engine
                .confirm(&key, OpStatus::Error, crate::core::types::agent_rc::NOT_CONFIGURED);
            return;
        }

        // A stop first cancels the resource's recurring operations, and
        // falls back to the parameters of the last successful start.
        let mut params = params;
        if task == "stop" {
            let recurring: Vec<(String, u32)> = executor
                .history_snapshot(&rsc.id)
                .map(|h| h.recurring.keys().cloned().collect())
                .unwrap_or_default();
            for (op_type, interval) in recurring {
                match executor.cancel(&rsc.id, &op_type, interval).await {
                    Ok(CancelOutcome::Cancelled) => {}
                    Ok(CancelOutcome::NothingToCancel) => {
                        trace!(
                            "Recurring {}:{} was not active",
                            rsc.id, op_type
                        );
                    }
                    Err(e) => warn!("Could not cancel recurring op: {}", e),
                }
            }
            if params.is_empty()
                && let Some(history) = executor.history_snapshot(&rsc.id)
                && let Some(stop_params) = history.stop_params
            {
                params = stop_params;
            }
        }

        let spec = ExecSpec {
            rsc_id: rsc.id.clone(),
            action: task,
            params,
            interval_ms,
            timeout_ms,
            start_delay_ms,
            user_data: Some(key.to_string()),
        };
        if let Err(e) = executor.exec(spec).await {
            error!("Could not submit operation for '{}': {}", rsc.id, e);
            self.engine
                .confirm(&key, OpStatus::Error, crate::core::types::agent_rc::UNKNOWN_ERROR);
        }
    }

    // --- CIB diffs -----------------------------------------------------------

    async fn handle_cib_diff(&mut self, diff: CibDiff) {
        let mut external_change = false;

        for change in &diff.changes {
            match change {
                CibChange::OpRecord { record, .. } => {
                    match record.magic() {
                        Some(magic) => {
                            use crate::core::transition::ConfirmOutcome;
                            match self.engine.confirm(&magic.key, magic.op_status, magic.rc) {
                                ConfirmOutcome::Applied | ConfirmOutcome::Duplicate => {}
                                ConfirmOutcome::Stale | ConfirmOutcome::Unknown => {
                                    // A result we did not ask for: the world
                                    // changed behind the graph's back.
                                    external_change = true;
                                }
                            }
                        }
                        None => external_change = true,
                    }
                }
                CibChange::OpRecordRemoved { op_id, .. } => {
                    trace!("History entry {} removed", op_id);
                }
                CibChange::ResourceRemoved { node, rsc_id } => {
                    debug!("History of '{}' on '{}' removed", rsc_id, node);
                    external_change = true;
                }
                CibChange::NodeState { .. } => {}
                CibChange::DcChanged { dc } => {
                    if dc.as_deref() != self.dc.as_deref() {
                        debug!("CIB records DC as {:?}", dc);
                    }
                }
                CibChange::ConfigChanged { path } => {
                    debug!("Configuration change under '{}'", path);
                    external_change = true;
                }
                CibChange::Replaced => {
                    warn!("CIB was replaced wholesale");
                    external_change = true;
                }
            }
        }

        if external_change && self.is_dc() {
            self.abort_transition(i32::MAX, AbortAction::Restart, "external CIB change");
        }

        self.machine.enqueue(FsmInput::CibUpdate(diff));
    }

    // --- Timers ---------------------------------------------------------------

    async fn handle_tick(&mut self) {
        let now = Instant::now();
        self.engine.expire_timers(now);

        if let Some(deadline) = self.election_deadline
            && deadline <= now
        {
            self.election_deadline = None;
            if self.machine.state() == FsmState::Election {
                warn!("Election timed out, restarting it");
                self.machine.enqueue(FsmInput::Election);
            }
        }

        if let Some(deadline) = self.integration_deadline
            && deadline <= now
        {
            self.integration_deadline = None;
            if self.machine.state() == FsmState::Integration {
                self.machine.enqueue(FsmInput::IntegrationTimeout);
            }
        }

        if let Some(deadline) = self.finalize_deadline
            && deadline <= now
        {
            self.finalize_deadline = None;
            if self.machine.state() == FsmState::FinalizeJoin {
                self.machine.enqueue(FsmInput::FinalizeTimeout);
            }
        }

        for node in self.ctx.executors.nodes() {
            if let Some(executor) = self.ctx.executors.get(&node) {
                executor.fake_overdue_results().await;
            }
        }

        // Wake the engine if a deadline is close; the next tick would be
        // too late for sub-second timeouts.
        if self
            .engine
            .next_deadline()
            .is_some_and(|deadline| deadline <= now + TICK_INTERVAL)
        {
            self.engine.trigger().set();
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.machine.state())
            .field("dc", &self.dc)
            .finish()
    }
}
