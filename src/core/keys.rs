// src/core/keys.rs

//! Transition keys and transition magic: the strings that bind an action
//! fired by the graph engine to the completion event it eventually produces.
//!
//! A transition key `<graph-id>:<action-id>:<target-rc>:<uuid>` rides along
//! as opaque user-data through the executor or fence agent and comes back
//! attached to the result. Transition magic prefixes the key with the
//! observed `<op-status>:<rc>` so a CIB diff alone is enough to decide
//! whether a change completes an in-flight action.

use crate::core::HelmsmanError;
use crate::core::types::OpStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Uniquely binds an action to its future completion event.
/// Encoding is a bijection on `(graph_id, action_id, target_rc, uuid)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionKey {
    pub graph_id: u64,
    pub action_id: u32,
    pub target_rc: i32,
    pub uuid: Uuid,
}

impl TransitionKey {
    pub fn new(graph_id: u64, action_id: u32, target_rc: i32, uuid: Uuid) -> Self {
        Self {
            graph_id,
            action_id,
            target_rc,
            uuid,
        }
    }

    pub fn parse(s: &str) -> Result<Self, HelmsmanError> {
        let mut parts = s.splitn(4, ':');
        let (graph, action, rc, uuid) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(g), Some(a), Some(rc), Some(u)) => (g, a, rc, u),
            _ => {
                return Err(HelmsmanError::Protocol(format!(
                    "Malformed transition key '{s}'"
                )));
            }
        };
        Ok(Self {
            graph_id: graph.parse()?,
            action_id: action.parse()?,
            target_rc: rc.parse()?,
            uuid: Uuid::parse_str(uuid)?,
        })
    }
}

impl std::fmt::Display for TransitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.graph_id, self.action_id, self.target_rc, self.uuid
        )
    }
}

/// A completed operation as recorded in the CIB: observed status and rc,
/// plus the key of the action that initiated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionMagic {
    pub op_status: OpStatus,
    pub rc: i32,
    pub key: TransitionKey,
}

impl TransitionMagic {
    pub fn new(op_status: OpStatus, rc: i32, key: TransitionKey) -> Self {
        Self { op_status, rc, key }
    }

    pub fn parse(s: &str) -> Result<Self, HelmsmanError> {
        let mut parts = s.splitn(3, ':');
        let (status, rc, key) = match (parts.next(), parts.next(), parts.next()) {
            (Some(st), Some(rc), Some(key)) => (st, rc, key),
            _ => {
                return Err(HelmsmanError::Protocol(format!(
                    "Malformed transition magic '{s}'"
                )));
            }
        };
        let status_code: i32 = status.parse()?;
        let op_status = OpStatus::from_code(status_code).ok_or_else(|| {
            HelmsmanError::Protocol(format!("Unknown op-status code {status_code} in magic '{s}'"))
        })?;
        Ok(Self {
            op_status,
            rc: rc.parse()?,
            key: TransitionKey::parse(key)?,
        })
    }

    /// Whether the recorded result is the one the initiating action hoped for.
    pub fn matches_target(&self) -> bool {
        self.op_status == OpStatus::Done && self.rc == self.key.target_rc
    }
}

impl std::fmt::Display for TransitionMagic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.op_status.as_code(), self.rc, self.key)
    }
}
