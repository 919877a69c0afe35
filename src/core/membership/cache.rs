// src/core/membership/cache.rs

//! The unified peer cache: one local view of every cluster and remote node,
//! keyed by node id and by node name.
//!
//! Entries are owned exclusively by the cache; every other subsystem sees
//! snapshots. Mutations go through the update methods so the status-change
//! callback observes every externally visible transition.

use crate::core::HelmsmanError;
use crate::core::types::now_ms;
use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

bitflags! {
    /// Which cluster daemons a peer is known to be running.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ProcMask: u32 {
        const CONTROLLER = 1 << 0;
        const EXECUTOR   = 1 << 1;
        const FENCER     = 1 << 2;
        const CIB        = 1 << 3;
    }
}

bitflags! {
    /// Miscellaneous peer attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct PeerFlags: u32 {
        /// The peer is a remote (proxied) node, not a full cluster member.
        const REMOTE      = 1 << 0;
        /// The entry has changes not yet reflected in the CIB node section.
        const CACHE_DIRTY = 1 << 1;
    }
}

/// Cluster-level membership of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MembershipState {
    Member,
    Lost,
    #[default]
    Pending,
}

/// Where a peer stands in the DC join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPhase {
    Nack,
    #[default]
    None,
    Welcomed,
    Integrated,
    Finalized,
    Confirmed,
}

/// A single peer entry. Cloned out of the cache as a read-only snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: u32,
    pub uname: Option<String>,
    pub uuid: Option<String>,
    pub flags: PeerFlags,
    pub state: MembershipState,
    /// Epoch milliseconds of the last time membership reported this peer.
    pub last_seen: u64,
    pub join: JoinPhase,
    /// The join state this peer is expected to be in (set from join ACKs).
    pub expected: Option<String>,
    pub processes: ProcMask,
    /// Set when the transport group and the cluster membership disagree
    /// about this peer; cleared when they reconcile.
    #[serde(skip)]
    pub when_lost: Option<Instant>,
}

impl Peer {
    fn new(id: u32) -> Self {
        Self {
            id,
            uname: None,
            uuid: None,
            flags: PeerFlags::empty(),
            state: MembershipState::Pending,
            last_seen: 0,
            join: JoinPhase::None,
            expected: None,
            processes: ProcMask::empty(),
            when_lost: None,
        }
    }

    pub fn is_member(&self) -> bool {
        self.state == MembershipState::Member
    }
}

/// What changed about a peer, delivered to the status-change callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChange {
    Uname,
    State,
    Processes,
}

type StatusCallback = Box<dyn Fn(PeerChange, &Peer) + Send + Sync>;

/// The cache itself. Keys are node ids; a secondary index maps unames to ids.
pub struct PeerCache {
    peers: DashMap<u32, Peer>,
    by_uname: DashMap<String, u32>,
    /// Drop entries as soon as their membership is lost.
    autoreap: bool,
    callback: RwLock<Option<StatusCallback>>,
    /// Ids are assigned from here for remote peers that have no transport id.
    synthetic_id: std::sync::atomic::AtomicU32,
}

impl std::fmt::Debug for PeerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCache")
            .field("peers", &self.peers.len())
            .field("autoreap", &self.autoreap)
            .finish()
    }
}

impl PeerCache {
    pub fn new(autoreap: bool) -> Arc<Self> {
        Arc::new(Self {
            peers: DashMap::new(),
            by_uname: DashMap::new(),
            autoreap,
            callback: RwLock::new(None),
            // Remote peers live above the 24-bit id space used by transports.
            synthetic_id: std::sync::atomic::AtomicU32::new(1 << 24),
        })
    }

    /// Registers the status-change callback. At most one is active; the FSM
    /// owns it in production.
    pub fn set_status_callback(&self, cb: StatusCallback) {
        *self.callback.write() = Some(cb);
    }

    fn notify(&self, change: PeerChange, peer: &Peer) {
        if let Some(cb) = self.callback.read().as_ref() {
            cb(change, peer);
        }
    }

    /// Number of cached peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Looks up a peer snapshot by id.
    pub fn get(&self, id: u32) -> Option<Peer> {
        self.peers.get(&id).map(|p| p.clone())
    }

    /// Looks up a peer snapshot by uname.
    pub fn get_by_uname(&self, uname: &str) -> Option<Peer> {
        self.by_uname
            .get(uname)
            .and_then(|id| self.peers.get(&id).map(|p| p.clone()))
    }

    /// Snapshots every peer currently cached.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.iter().map(|p| p.clone()).collect()
    }

    /// Counts peers currently in the `member` state.
    pub fn active_members(&self) -> usize {
        self.peers.iter().filter(|p| p.is_member()).count()
    }

    /// Finds or creates the entry for a peer, identified by id, uname, or
    /// both. A remote peer known only by name receives a synthetic id.
    pub fn get_or_create(
        &self,
        id: Option<u32>,
        uname: Option<&str>,
    ) -> Result<Peer, HelmsmanError> {
        let resolved_id = match (id, uname) {
            (Some(id), _) if id != 0 => Some(id),
            (_, Some(uname)) => self.by_uname.get(uname).map(|e| *e),
            _ => None,
        };

        if let Some(id) = resolved_id
            && let Some(mut entry) = self.peers.get_mut(&id)
        {
            // Learning a uname for an existing entry is the one in-place
            // identity change allowed; a *different* uname for a live
            // cluster peer is a protocol violation.
            if let Some(uname) = uname {
                match &entry.uname {
                    None => {
                        entry.uname = Some(uname.to_string());
                        self.by_uname.insert(uname.to_string(), id);
                        let snapshot = entry.clone();
                        drop(entry);
                        info!("Node {} is now known as '{}'", id, uname);
                        self.notify(PeerChange::Uname, &snapshot);
                        return Ok(snapshot);
                    }
                    Some(existing) if existing != uname && !entry.flags.contains(PeerFlags::REMOTE) => {
                        return Err(HelmsmanError::Protocol(format!(
                            "Node id {} claimed by both '{}' and '{}'",
                            id, existing, uname
                        )));
                    }
                    _ => {}
                }
            }
            return Ok(entry.clone());
        }

        if id.is_none() && uname.is_none() {
            return Err(HelmsmanError::InvalidRequest(
                "Peer lookup requires an id or a uname".to_string(),
            ));
        }

        let new_id = id.filter(|id| *id != 0).unwrap_or_else(|| {
            self.synthetic_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        });

        let mut peer = Peer::new(new_id);
        if let Some(uname) = uname {
            peer.uname = Some(uname.to_string());
            self.by_uname.insert(uname.to_string(), new_id);
        }
        trace!("Created peer cache entry for node {:?}/{:?}", id, uname);
        self.peers.insert(new_id, peer.clone());
        Ok(peer)
    }

    /// Marks a peer as a remote (proxied) node.
    pub fn mark_remote(&self, uname: &str) -> Result<Peer, HelmsmanError> {
        self.get_or_create(None, Some(uname))?;
        self.mutate(None, Some(uname), |peer| {
            peer.flags.insert(PeerFlags::REMOTE);
            None
        })
    }

    /// Records a uuid for a peer. The mapping is monotonic: once set it can
    /// never silently change for a live peer.
    pub fn update_uuid(&self, id: u32, uuid: &str) -> Result<Peer, HelmsmanError> {
        self.mutate(Some(id), None, |peer| {
            match &peer.uuid {
                None => peer.uuid = Some(uuid.to_string()),
                Some(existing) if existing != uuid => {
                    warn!(
                        "Ignoring uuid change for live node {} ({} -> {})",
                        peer.id, existing, uuid
                    );
                }
                _ => {}
            }
            None
        })
    }

    /// Updates membership state. Transitions to `lost` always reset the join
    /// phase; with autoreap enabled they also drop the entry (after the
    /// callback has run).
    pub fn update_state(
        &self,
        id: u32,
        state: MembershipState,
        seen: u64,
    ) -> Result<Peer, HelmsmanError> {
        let snapshot = self.mutate(Some(id), None, |peer| {
            let old = peer.state;
            peer.state = state;
            if state == MembershipState::Member {
                peer.last_seen = if seen != 0 { seen } else { now_ms() };
                peer.when_lost = None;
            } else if state == MembershipState::Lost {
                peer.join = JoinPhase::None;
            }
            (old != state).then_some(PeerChange::State)
        })?;

        if snapshot.state == MembershipState::Lost && self.autoreap {
            debug!("Autoreaping lost node {}", snapshot.id);
            self.remove(&snapshot);
        }
        Ok(snapshot)
    }

    /// Updates the join phase of a peer.
    pub fn update_join(&self, id: u32, phase: JoinPhase) -> Result<Peer, HelmsmanError> {
        self.mutate(Some(id), None, |peer| {
            if peer.join != phase {
                trace!("Node {} join phase {:?} -> {:?}", peer.id, peer.join, phase);
                peer.join = phase;
            }
            None
        })
    }

    /// Updates the known process mask of a peer.
    pub fn update_proc(&self, id: u32, processes: ProcMask) -> Result<Peer, HelmsmanError> {
        self.mutate(Some(id), None, |peer| {
            let old = peer.processes;
            peer.processes = processes;
            (old != processes).then_some(PeerChange::Processes)
        })
    }

    /// Updates the expected-state attribute.
    pub fn update_expected(&self, id: u32, value: &str) -> Result<Peer, HelmsmanError> {
        self.mutate(Some(id), None, |peer| {
            peer.expected = Some(value.to_string());
            None
        })
    }

    /// Records that the transport group and cluster membership disagree
    /// about this peer being alive. Returns the instant the contradiction
    /// was first observed.
    pub fn note_contradiction(&self, id: u32) -> Result<Instant, HelmsmanError> {
        let snapshot = self.mutate(Some(id), None, |peer| {
            if peer.when_lost.is_none() {
                peer.when_lost = Some(Instant::now());
            }
            None
        })?;
        Ok(snapshot.when_lost.unwrap_or_else(Instant::now))
    }

    /// Explicitly removes a peer, by id and/or uname.
    pub fn reap(&self, id: Option<u32>, uname: Option<&str>) -> bool {
        let id = match (id, uname) {
            (Some(id), _) => Some(id),
            (None, Some(uname)) => self.by_uname.get(uname).map(|e| *e),
            (None, None) => None,
        };
        let Some(id) = id else { return false };
        match self.peers.get(&id).map(|p| p.clone()) {
            Some(peer) => {
                self.remove(&peer);
                info!(
                    "Reaped node {} ('{}') from the peer cache",
                    id,
                    peer.uname.as_deref().unwrap_or("unknown")
                );
                true
            }
            None => false,
        }
    }

    fn remove(&self, peer: &Peer) {
        if let Some(uname) = &peer.uname {
            self.by_uname.remove(uname);
        }
        self.peers.remove(&peer.id);
    }

    fn mutate<F>(
        &self,
        id: Option<u32>,
        uname: Option<&str>,
        f: F,
    ) -> Result<Peer, HelmsmanError>
    where
        F: FnOnce(&mut Peer) -> Option<PeerChange>,
    {
        let id = match (id, uname) {
            (Some(id), _) => id,
            (None, Some(uname)) => self
                .by_uname
                .get(uname)
                .map(|e| *e)
                .ok_or_else(|| HelmsmanError::PeerUnreachable(uname.to_string()))?,
            (None, None) => {
                return Err(HelmsmanError::InvalidRequest(
                    "Peer mutation requires an id or a uname".to_string(),
                ));
            }
        };

        let (change, snapshot) = {
            let mut entry = self
                .peers
                .get_mut(&id)
                .ok_or_else(|| HelmsmanError::PeerUnreachable(format!("node id {id}")))?;
            let change = f(&mut entry);
            (change, entry.clone())
        };

        if let Some(change) = change {
            self.notify(change, &snapshot);
        }
        Ok(snapshot)
    }
}
