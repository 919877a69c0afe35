// src/core/fsm/states.rs

//! The controller state machine's vocabulary: states, typed inputs, and the
//! action bitmask subsystem operations are keyed from.

use crate::core::cib::CibDiff;
use crate::core::executor::OpEvent;
use crate::core::membership::{ElectionNoVote, ElectionVote};
use crate::core::transition::GraphSpec;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

/// The closed set of controller states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
pub enum FsmState {
    #[strum(serialize = "S_STARTING")]
    Starting,
    #[strum(serialize = "S_PENDING")]
    Pending,
    #[strum(serialize = "S_ELECTION")]
    Election,
    #[strum(serialize = "S_INTEGRATION")]
    Integration,
    #[strum(serialize = "S_FINALIZE_JOIN")]
    FinalizeJoin,
    #[strum(serialize = "S_POLICY_ENGINE")]
    PolicyEngine,
    #[strum(serialize = "S_TRANSITION_ENGINE")]
    TransitionEngine,
    #[strum(serialize = "S_IDLE")]
    Idle,
    #[strum(serialize = "S_NOT_DC")]
    NotDc,
    #[strum(serialize = "S_RECOVERY")]
    Recovery,
    #[strum(serialize = "S_HALT")]
    Halt,
    #[strum(serialize = "S_STOPPING")]
    Stopping,
    #[strum(serialize = "S_TERMINATE")]
    Terminate,
    #[strum(serialize = "S_ILLEGAL")]
    Illegal,
}

impl FsmState {
    /// States in which this node is (or is becoming) the DC.
    pub fn is_dc(self) -> bool {
        matches!(
            self,
            FsmState::Integration
                | FsmState::FinalizeJoin
                | FsmState::PolicyEngine
                | FsmState::TransitionEngine
                | FsmState::Idle
        )
    }

    /// States with no graph running: transition-abort requests arriving
    /// here are swallowed (and logged), never an error.
    pub fn suppresses_graph(self) -> bool {
        matches!(
            self,
            FsmState::Starting
                | FsmState::Pending
                | FsmState::NotDc
                | FsmState::Halt
                | FsmState::Stopping
                | FsmState::Terminate
                | FsmState::Illegal
        )
    }
}

/// A typed input delivered to the state machine.
#[derive(Debug, Clone)]
pub enum FsmInput {
    /// Subsystem connections are up; leave `S_STARTING`.
    Started,
    /// A DC invited us to join.
    JoinOffer { dc: String, join_id: u64 },
    /// A node asked us (the DC) to admit it.
    JoinRequest { uname: String, join_id: u64 },
    /// The DC answered our join request.
    JoinResult { ack: bool, join_id: u64 },
    /// Every welcomed joiner has been integrated (DC internal).
    IntegrationDone,
    /// Every integrated joiner confirmed finalization (DC internal).
    FinalizeDone,
    /// The integration window expired with joiners missing.
    IntegrationTimeout,
    /// The finalization window expired.
    FinalizeTimeout,
    NodeJoin { uname: String },
    NodeLeft { uname: String },
    /// Placement must be recomputed.
    PeCalc { reason: String },
    /// The scheduler produced a graph.
    PeSuccess(GraphSpec),
    TeSuccess,
    TeAborted,
    CibUpdate(CibDiff),
    LrmEvent(OpEvent),
    /// An election round must be (re)started.
    Election,
    /// We won: take over as DC.
    ElectionDc,
    /// Stop being DC without stopping the controller.
    ReleaseDc,
    /// A vote arrived from a candidate.
    Vote(ElectionVote),
    /// A concession arrived.
    NoVote(ElectionNoVote),
    /// Local shutdown requested (signal or DC directive to self).
    Shutdown,
    /// The DC told us to stop now.
    Stop,
    /// Stop graph processing entirely.
    Halt { reason: String },
    /// A recoverable subsystem failure.
    Fail { reason: String },
    /// An unrecoverable error; the controller must exit.
    Error { reason: String },
    Terminate,
}

/// The payload-free discriminant used to index the transition matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum InputId {
    #[strum(serialize = "I_STARTED")]
    Started,
    #[strum(serialize = "I_JOIN_OFFER")]
    JoinOffer,
    #[strum(serialize = "I_JOIN_REQUEST")]
    JoinRequest,
    #[strum(serialize = "I_JOIN_RESULT")]
    JoinResult,
    #[strum(serialize = "I_INTEGRATED")]
    IntegrationDone,
    #[strum(serialize = "I_FINALIZED")]
    FinalizeDone,
    #[strum(serialize = "I_INTEGRATE_TIMEOUT")]
    IntegrationTimeout,
    #[strum(serialize = "I_FINALIZE_TIMEOUT")]
    FinalizeTimeout,
    #[strum(serialize = "I_NODE_JOIN")]
    NodeJoin,
    #[strum(serialize = "I_NODE_LEFT")]
    NodeLeft,
    #[strum(serialize = "I_PE_CALC")]
    PeCalc,
    #[strum(serialize = "I_PE_SUCCESS")]
    PeSuccess,
    #[strum(serialize = "I_TE_SUCCESS")]
    TeSuccess,
    #[strum(serialize = "I_TE_ABORTED")]
    TeAborted,
    #[strum(serialize = "I_CIB_UPDATE")]
    CibUpdate,
    #[strum(serialize = "I_LRM_EVENT")]
    LrmEvent,
    #[strum(serialize = "I_ELECTION")]
    Election,
    #[strum(serialize = "I_ELECTION_DC")]
    ElectionDc,
    #[strum(serialize = "I_RELEASE_DC")]
    ReleaseDc,
    #[strum(serialize = "I_VOTE")]
    Vote,
    #[strum(serialize = "I_NOVOTE")]
    NoVote,
    #[strum(serialize = "I_SHUTDOWN")]
    Shutdown,
    #[strum(serialize = "I_STOP")]
    Stop,
    #[strum(serialize = "I_HALT")]
    Halt,
    #[strum(serialize = "I_FAIL")]
    Fail,
    #[strum(serialize = "I_ERROR")]
    Error,
    #[strum(serialize = "I_TERMINATE")]
    Terminate,
}

impl FsmInput {
    pub fn id(&self) -> InputId {
        match self {
            FsmInput::Started => InputId::Started,
            FsmInput::JoinOffer { .. } => InputId::JoinOffer,
            FsmInput::JoinRequest { .. } => InputId::JoinRequest,
            FsmInput::JoinResult { .. } => InputId::JoinResult,
            FsmInput::IntegrationDone => InputId::IntegrationDone,
            FsmInput::FinalizeDone => InputId::FinalizeDone,
            FsmInput::IntegrationTimeout => InputId::IntegrationTimeout,
            FsmInput::FinalizeTimeout => InputId::FinalizeTimeout,
            FsmInput::NodeJoin { .. } => InputId::NodeJoin,
            FsmInput::NodeLeft { .. } => InputId::NodeLeft,
            FsmInput::PeCalc { .. } => InputId::PeCalc,
            FsmInput::PeSuccess(_) => InputId::PeSuccess,
            FsmInput::TeSuccess => InputId::TeSuccess,
            FsmInput::TeAborted => InputId::TeAborted,
            FsmInput::CibUpdate(_) => InputId::CibUpdate,
            FsmInput::LrmEvent(_) => InputId::LrmEvent,
            FsmInput::Election => InputId::Election,
            FsmInput::ElectionDc => InputId::ElectionDc,
            FsmInput::ReleaseDc => InputId::ReleaseDc,
            FsmInput::Vote(_) => InputId::Vote,
            FsmInput::NoVote(_) => InputId::NoVote,
            FsmInput::Shutdown => InputId::Shutdown,
            FsmInput::Stop => InputId::Stop,
            FsmInput::Halt { .. } => InputId::Halt,
            FsmInput::Fail { .. } => InputId::Fail,
            FsmInput::Error { .. } => InputId::Error,
            FsmInput::Terminate => InputId::Terminate,
        }
    }
}

bitflags! {
    /// Side-effecting subsystem operations keyed from state transitions.
    /// Handlers are idempotent with respect to their bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FsmActions: u64 {
        const A_LOG                   = 1 << 0;
        const A_WARN                  = 1 << 1;
        /// Announce ourselves to the cluster.
        const A_HELLO                 = 1 << 2;
        /// Start (or restart) an election round and vote.
        const A_ELECTION_VOTE         = 1 << 3;
        /// Evaluate the current round for a winner.
        const A_ELECTION_CHECK        = 1 << 4;
        /// Become the DC: record it, subscribe, reset join bookkeeping.
        const A_DC_TAKEOVER           = 1 << 5;
        /// Stop being the DC: clear the graph, release the CIB record.
        const A_DC_RELEASE            = 1 << 6;
        const A_INTEGRATE_TIMER_START = 1 << 7;
        const A_INTEGRATE_TIMER_STOP  = 1 << 8;
        const A_FINALIZE_TIMER_START  = 1 << 9;
        const A_FINALIZE_TIMER_STOP   = 1 << 10;
        /// Offer membership to every known peer.
        const A_JOIN_OFFER_ALL        = 1 << 11;
        /// Offer membership to one (new) peer.
        const A_JOIN_OFFER_ONE        = 1 << 12;
        /// Process a pending join request (welcome + integrate).
        const A_JOIN_PROCESS_REQ      = 1 << 13;
        /// Answer our own join offer from the DC.
        const A_JOIN_REQUEST          = 1 << 14;
        /// Finalize the join round (push state to joiners).
        const A_JOIN_FINALIZE         = 1 << 15;
        /// Ask the scheduler for a new graph.
        const A_PE_INVOKE             = 1 << 16;
        /// Hand the computed graph to the transition engine.
        const A_TE_START              = 1 << 17;
        /// Abandon the running graph.
        const A_TE_CANCEL             = 1 << 18;
        /// Stop graph processing entirely.
        const A_TE_HALT               = 1 << 19;
        /// Ask the DC to orchestrate our shutdown.
        const A_SHUTDOWN_REQ          = 1 << 20;
        /// Begin the local stop sequence (NACK starts, stop resources).
        const A_SHUTDOWN              = 1 << 21;
        /// Re-check whether everything is stopped.
        const A_LRM_VERIFY_STOPPED    = 1 << 22;
        /// Tear down the executor connection.
        const A_LRM_DISCONNECT        = 1 << 23;
        /// Attempt local recovery from a subsystem failure.
        const A_RECOVER               = 1 << 24;
        /// Exit cleanly.
        const A_EXIT_OK               = 1 << 25;
        /// Exit with a failure code.
        const A_EXIT_FAIL             = 1 << 26;
    }
}
