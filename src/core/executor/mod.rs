// src/core/executor/mod.rs

//! The executor (LRM) client: per-node operation tracking, resource
//! history, metadata/digests, and the seam to the executor daemon.

pub mod backend;
pub mod client;
pub mod history;
pub mod metadata;
pub mod ops;

pub use backend::{
    CancelOutcome, ExecRequest, ExecutorBackend, ExecutorEvent, ExecutorRequest, ScriptedExecutor,
};
pub use client::{ExecSpec, ExecutorNotice, ExecutorState, run_connection};
pub use history::ResourceHistory;
pub use metadata::{AgentMetadata, AgentParameter, MetadataCache, compute_digest};
pub use ops::{CallIdAllocator, OpEvent, PendingOp, PendingOpFlags, stop_id};

use crate::core::HelmsmanError;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// All executor states this controller manages: the local node plus any
/// remote nodes proxied through connection resources.
pub struct ExecutorRegistry {
    local_node: String,
    states: DashMap<String, Arc<ExecutorState>>,
}

impl ExecutorRegistry {
    pub fn new(local_node: &str) -> Arc<Self> {
        Arc::new(Self {
            local_node: local_node.to_string(),
            states: DashMap::new(),
        })
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    pub fn insert(&self, node: &str, state: Arc<ExecutorState>) {
        self.states.insert(node.to_string(), state);
    }

    pub fn get(&self, node: &str) -> Option<Arc<ExecutorState>> {
        self.states.get(node).map(|s| Arc::clone(&s))
    }

    pub fn local(&self) -> Option<Arc<ExecutorState>> {
        self.get(&self.local_node)
    }

    pub fn remove(&self, node: &str) -> Option<Arc<ExecutorState>> {
        self.states.remove(node).map(|(_, s)| s)
    }

    pub fn nodes(&self) -> Vec<String> {
        self.states.iter().map(|s| s.key().clone()).collect()
    }

    /// Reprobes a node. When the node hosts remote-connection resources,
    /// the remote nodes' executor state is wiped first, then the connection
    /// resources are unregistered, then everything else is re-detected.
    pub async fn reprobe_node(&self, node: &str) -> Result<usize, HelmsmanError> {
        let state = self
            .get(node)
            .ok_or_else(|| HelmsmanError::Unavailable(format!("no executor state for '{node}'")))?;

        let mut wiped = 0usize;
        let connections: Vec<String> = state
            .registered_resources()
            .into_iter()
            .filter(|rsc| rsc.is_remote_connection())
            .map(|rsc| rsc.id)
            .collect();

        for remote in connections {
            // By convention the connection resource id names the remote node.
            if remote == node {
                warn!("Remote connection '{}' points at its own node", remote);
                continue;
            }
            if self.states.contains_key(&remote) {
                info!("Reprobe recursing into remote node '{}'", remote);
                wiped += Box::pin(self.reprobe_node(&remote)).await?;
            }
            state.unregister(&remote).await?;
        }

        wiped += state.reprobe().await?;
        Ok(wiped)
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("local_node", &self.local_node)
            .field("nodes", &self.states.len())
            .finish()
    }
}
