// src/core/executor/metadata.rs

//! Agent metadata: parameter classes extracted from agent self-description,
//! an LRU cache keyed by agent spec, and the operation digests derived from
//! instance parameters.
//!
//! Three digests are recorded with every operation:
//!  - `op-digest`: all instance parameters;
//!  - `op-restart-digest`: parameters whose change requires a restart
//!    (everything not marked reloadable);
//!  - `op-secure-digest`: all parameters minus the private (sensitive) ones,
//!    so the sensitive values never have to appear in the status section.

use crate::core::HelmsmanError;
use crate::core::types::ResourceSpec;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

const METADATA_CACHE_CAPACITY: usize = 256;

/// One agent parameter and its classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentParameter {
    pub name: String,
    /// Identity parameter: two instances differing here are different
    /// resources.
    #[serde(default)]
    pub unique: bool,
    /// Sensitive; masked out of recorded digests.
    #[serde(default)]
    pub private: bool,
    /// Change can be applied by a reload instead of a restart.
    #[serde(default)]
    pub reloadable: bool,
}

/// Parsed agent self-description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentMetadata {
    #[serde(default)]
    pub parameters: Vec<AgentParameter>,
}

impl AgentMetadata {
    /// Parses the metadata document an executor hands back.
    pub fn parse(raw: &str) -> Result<Self, HelmsmanError> {
        serde_json::from_str(raw).map_err(|e| {
            HelmsmanError::Protocol(format!("Unparseable agent metadata: {e}"))
        })
    }

    fn class_names(&self, f: impl Fn(&AgentParameter) -> bool) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| f(p))
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn private_params(&self) -> Vec<&str> {
        self.class_names(|p| p.private)
    }

    pub fn reloadable_params(&self) -> Vec<&str> {
        self.class_names(|p| p.reloadable)
    }
}

/// LRU cache of parsed metadata, keyed by the agent spec string.
pub struct MetadataCache {
    cache: Mutex<LruCache<String, Arc<AgentMetadata>>>,
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataCache {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(METADATA_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn get(&self, rsc: &ResourceSpec) -> Option<Arc<AgentMetadata>> {
        self.cache.lock().get(&rsc.agent_spec()).cloned()
    }

    pub fn insert(&self, rsc: &ResourceSpec, metadata: AgentMetadata) -> Arc<AgentMetadata> {
        let metadata = Arc::new(metadata);
        trace!(
            "Cached metadata for {} ({} parameters)",
            rsc.agent_spec(),
            metadata.parameters.len()
        );
        self.cache
            .lock()
            .put(rsc.agent_spec(), Arc::clone(&metadata));
        metadata
    }

    pub fn forget(&self, rsc: &ResourceSpec) {
        self.cache.lock().pop(&rsc.agent_spec());
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("entries", &self.len())
            .finish()
    }
}

/// Deterministic digest over a canonicalized parameter map. Equal content
/// yields equal digests regardless of insertion order.
pub fn compute_digest(params: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in params {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Digest of the parameters whose change forces a restart: everything the
/// agent did not declare reloadable.
pub fn compute_restart_digest(
    params: &BTreeMap<String, String>,
    metadata: &AgentMetadata,
) -> String {
    let reloadable = metadata.reloadable_params();
    let filtered: BTreeMap<String, String> = params
        .iter()
        .filter(|(k, _)| !reloadable.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    compute_digest(&filtered)
}

/// Digest with sensitive parameters masked out, safe to persist.
pub fn compute_secure_digest(
    params: &BTreeMap<String, String>,
    metadata: &AgentMetadata,
) -> String {
    let private = metadata.private_params();
    let filtered: BTreeMap<String, String> = params
        .iter()
        .filter(|(k, _)| !private.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    compute_digest(&filtered)
}
