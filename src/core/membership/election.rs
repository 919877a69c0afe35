// src/core/membership/election.rs

//! DC election: every controller votes for itself, concedes to better
//! candidates, and claims the coordinator role once every other live
//! controller has conceded.
//!
//! The comparison is total: newer software wins, then longer uptime, then
//! the lexicographically smaller node name. Ties are impossible between
//! distinct nodes.

use crate::core::types::{now_ms, version_lt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// A vote broadcast by a candidate (always for itself).
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode, PartialEq)]
pub struct ElectionVote {
    pub round: u64,
    pub uname: String,
    /// Milliseconds since this controller started.
    pub uptime_ms: u64,
    pub version: String,
}

/// A concession sent to a candidate judged better than ourselves.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode, PartialEq)]
pub struct ElectionNoVote {
    pub round: u64,
    pub uname: String,
}

/// How an incoming vote compares to the local candidacy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteVerdict {
    /// The local node is the better candidate; the sender should concede.
    LocalWins,
    /// The sender is better; concede and stop counting this round.
    RemoteWins,
}

/// Where the local candidacy stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    Pending,
    Lost,
    Won,
}

/// Per-node election bookkeeping. One instance lives on the controller
/// context for the lifetime of the process.
pub struct Election {
    uname: String,
    version: String,
    started_at_ms: u64,
    round: AtomicU64,
    /// Controllers that conceded the current round.
    concessions: Mutex<HashSet<String>>,
    /// Set once we conceded the current round ourselves.
    conceded: Mutex<Option<String>>,
}

impl Election {
    pub fn new(uname: &str, version: &str) -> Self {
        Self {
            uname: uname.to_string(),
            version: version.to_string(),
            started_at_ms: now_ms(),
            round: AtomicU64::new(0),
            concessions: Mutex::new(HashSet::new()),
            conceded: Mutex::new(None),
        }
    }

    pub fn round(&self) -> u64 {
        self.round.load(Ordering::Acquire)
    }

    fn uptime_ms(&self) -> u64 {
        now_ms().saturating_sub(self.started_at_ms)
    }

    /// Opens a new round and returns the vote to broadcast.
    pub fn start(&self) -> ElectionVote {
        let round = self.round.fetch_add(1, Ordering::AcqRel) + 1;
        self.concessions.lock().clear();
        *self.conceded.lock() = None;
        info!("Started election round {}", round);
        ElectionVote {
            round,
            uname: self.uname.clone(),
            uptime_ms: self.uptime_ms(),
            version: self.version.clone(),
        }
    }

    /// Judges an incoming vote against the local candidacy. Also fast-forwards
    /// the local round if the sender is ahead.
    pub fn compare(&self, vote: &ElectionVote) -> VoteVerdict {
        let current = self.round.load(Ordering::Acquire);
        if vote.round > current {
            trace!(
                "Fast-forwarding election round {} -> {} (vote from '{}')",
                current, vote.round, vote.uname
            );
            self.round.store(vote.round, Ordering::Release);
            self.concessions.lock().clear();
            *self.conceded.lock() = None;
        }

        if vote.uname == self.uname {
            return VoteVerdict::LocalWins;
        }

        let verdict = if version_lt(&self.version, &vote.version) {
            VoteVerdict::RemoteWins
        } else if version_lt(&vote.version, &self.version) {
            VoteVerdict::LocalWins
        } else {
            let local_uptime = self.uptime_ms();
            if vote.uptime_ms != local_uptime {
                if vote.uptime_ms > local_uptime {
                    VoteVerdict::RemoteWins
                } else {
                    VoteVerdict::LocalWins
                }
            } else if vote.uname.as_str() < self.uname.as_str() {
                VoteVerdict::RemoteWins
            } else {
                VoteVerdict::LocalWins
            }
        };

        if verdict == VoteVerdict::RemoteWins {
            debug!(
                "Conceding election round {} to '{}'",
                vote.round, vote.uname
            );
            *self.conceded.lock() = Some(vote.uname.clone());
        }
        verdict
    }

    /// Records a concession from a peer controller.
    pub fn record_concession(&self, novote: &ElectionNoVote) {
        let current = self.round.load(Ordering::Acquire);
        if novote.round != current {
            warn!(
                "Ignoring stale concession from '{}' (round {} != {})",
                novote.uname, novote.round, current
            );
            return;
        }
        self.concessions.lock().insert(novote.uname.clone());
    }

    /// Evaluates the current round against the set of other live
    /// controllers. Winning requires a concession from each of them.
    pub fn outcome(&self, other_controllers: &[String]) -> ElectionOutcome {
        if self.conceded.lock().is_some() {
            return ElectionOutcome::Lost;
        }
        let concessions = self.concessions.lock();
        if other_controllers
            .iter()
            .all(|uname| concessions.contains(uname))
        {
            ElectionOutcome::Won
        } else {
            ElectionOutcome::Pending
        }
    }
}

impl std::fmt::Debug for Election {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Election")
            .field("uname", &self.uname)
            .field("round", &self.round())
            .finish()
    }
}
