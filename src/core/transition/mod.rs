// src/core/transition/mod.rs

//! The transition graph engine: the DC's instrument for driving a computed
//! set of cluster actions to completion.

pub mod engine;
pub mod graph;

pub use engine::{ActionDispatch, GraphStatus, TransitionEngine};
pub use graph::{
    AbortAction, ActionInput, ActionKind, ActionSpec, ConfirmOutcome, GraphAction, GraphSpec,
    Synapse, SynapseSpec, TransitionGraph,
};
