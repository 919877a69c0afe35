// src/core/scheduler.rs

//! The seam to the policy engine: a pure function from a CIB snapshot to a
//! transition graph. The real scheduler lives outside this crate.

use crate::core::cib::CibDocument;
use crate::core::transition::GraphSpec;

/// Computes placement. Implementations must be deterministic for a given
/// snapshot; the controller may invoke them repeatedly.
pub trait Scheduler: Send + Sync {
    fn compute(&self, snapshot: &CibDocument) -> GraphSpec;
}

/// A scheduler that never wants anything done. Useful for bring-up and for
/// exercising the controller without placement logic.
#[derive(Debug, Default)]
pub struct NullScheduler;

impl Scheduler for NullScheduler {
    fn compute(&self, _snapshot: &CibDocument) -> GraphSpec {
        GraphSpec::default()
    }
}
