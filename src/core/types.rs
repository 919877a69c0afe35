// src/core/types.rs

//! Shared vocabulary for operation results: executor operation statuses and
//! agent return codes, as they appear on the wire, in the CIB, and in
//! transition magic strings.

use serde::{Deserialize, Serialize};

/// Agent return codes with cluster-level meaning. Values outside this table
/// are passed through verbatim and left for the scheduler to classify.
pub mod agent_rc {
    pub const OK: i32 = 0;
    pub const UNKNOWN_ERROR: i32 = 1;
    pub const INVALID_PARAM: i32 = 2;
    pub const UNIMPLEMENTED: i32 = 3;
    pub const INSUFFICIENT_PRIV: i32 = 4;
    pub const NOT_INSTALLED: i32 = 5;
    pub const NOT_CONFIGURED: i32 = 6;
    pub const NOT_RUNNING: i32 = 7;
    pub const RUNNING_MASTER: i32 = 8;
    pub const FAILED_MASTER: i32 = 9;
    pub const CONNECTION_DIED: i32 = 189;
    pub const DEGRADED: i32 = 190;
    pub const DEGRADED_MASTER: i32 = 191;
    /// Distinguished rc used when the controller NACKs an operation without
    /// ever handing it to the executor (e.g. a start received after shutdown
    /// began). Outside the 0-255 agent range on purpose.
    pub const DIRECT_NACK: i32 = 256;
}

/// Returns true if the rc is fatal for the resource on this node: the
/// scheduler will not retry locally regardless of the failure policy.
pub fn rc_is_fatal(rc: i32) -> bool {
    matches!(
        rc,
        agent_rc::INVALID_PARAM | agent_rc::INSUFFICIENT_PRIV | agent_rc::NOT_CONFIGURED
    )
}

/// The executor-level disposition of an operation, orthogonal to the agent rc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(bincode::Encode, bincode::Decode)]
#[serde(rename_all = "kebab-case")]
pub enum OpStatus {
    Pending,
    Done,
    Cancelled,
    Timeout,
    Error,
    NotConnected,
    Invalid,
}

impl OpStatus {
    /// The integer encoding used inside transition magic strings and CIB
    /// history entries. The values are part of the persisted format and must
    /// not change.
    pub fn as_code(self) -> i32 {
        match self {
            OpStatus::Pending => -1,
            OpStatus::Done => 0,
            OpStatus::Cancelled => 1,
            OpStatus::Timeout => 2,
            OpStatus::Error => 4,
            OpStatus::NotConnected => 8,
            OpStatus::Invalid => 9,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(OpStatus::Pending),
            0 => Some(OpStatus::Done),
            1 => Some(OpStatus::Cancelled),
            2 => Some(OpStatus::Timeout),
            4 => Some(OpStatus::Error),
            8 => Some(OpStatus::NotConnected),
            9 => Some(OpStatus::Invalid),
            _ => None,
        }
    }

    /// Whether this status represents a finished operation (successfully or
    /// not), as opposed to one still in flight.
    pub fn is_terminal(self) -> bool {
        !matches!(self, OpStatus::Pending)
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpStatus::Pending => "pending",
            OpStatus::Done => "done",
            OpStatus::Cancelled => "cancelled",
            OpStatus::Timeout => "timeout",
            OpStatus::Error => "error",
            OpStatus::NotConnected => "not-connected",
            OpStatus::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Identity of a resource agent binding: which agent implements a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct ResourceSpec {
    pub id: String,
    /// Agent standard (`ocf`, `systemd`, `service`, ...).
    pub standard: String,
    /// Provider namespace, for standards that have one.
    pub provider: Option<String>,
    /// Agent name within the standard/provider.
    pub agent_type: String,
}

impl ResourceSpec {
    pub fn new(id: &str, standard: &str, provider: Option<&str>, agent_type: &str) -> Self {
        Self {
            id: id.to_string(),
            standard: standard.to_string(),
            provider: provider.map(str::to_string),
            agent_type: agent_type.to_string(),
        }
    }

    /// `standard[:provider]:type`, the display form used in logs.
    pub fn agent_spec(&self) -> String {
        match &self.provider {
            Some(provider) => format!("{}:{}:{}", self.standard, provider, self.agent_type),
            None => format!("{}:{}", self.standard, self.agent_type),
        }
    }

    /// Whether this resource is a remote-node connection rather than a
    /// workload: its "start" establishes an executor proxy on another host.
    pub fn is_remote_connection(&self) -> bool {
        self.standard == "ocf" && self.agent_type == "remote"
    }
}

/// Dotted-numeric version comparison (`3.1.9 < 3.2.0`, `9.0.0 < 10.0.0`).
/// Non-numeric segments compare as zero.
pub fn version_lt(a: &str, b: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    parse(a) < parse(b)
}

/// Helper to get the current system time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Builds the canonical operation key `<rsc>_<op>_<interval>` used for CIB
/// history ids and recurring-op identity.
pub fn op_key(rsc_id: &str, op_type: &str, interval_ms: u32) -> String {
    format!("{rsc_id}_{op_type}_{interval_ms}")
}

/// Whether an operation result should normally be recorded in the CIB status
/// section. Probes, starts, stops, promotes and migrations are recordable;
/// purely informational tasks are not.
pub fn is_recordable(op_type: &str) -> bool {
    !matches!(op_type, "cancel" | "delete" | "metadata" | "notify")
}
