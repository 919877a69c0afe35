// src/core/membership/mod.rs

//! Cluster membership: the unified peer cache and the DC election.

pub mod cache;
pub mod election;

pub use cache::{JoinPhase, MembershipState, Peer, PeerCache, PeerChange, PeerFlags, ProcMask};
pub use election::{Election, ElectionNoVote, ElectionOutcome, ElectionVote, VoteVerdict};
