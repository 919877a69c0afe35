// src/core/fencing/device.rs

//! Fencing devices: registration parsing, target lists and alias maps, and
//! the per-device command queue with its single execution slot.

use crate::core::HelmsmanError;
use crate::core::triggers::Trigger;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Parameters interpreted by the coordinator itself rather than passed to
/// the agent.
pub const ATTR_HOST_LIST: &str = "pcmk_host_list";
pub const ATTR_HOST_MAP: &str = "pcmk_host_map";
pub const ATTR_HOST_CHECK: &str = "pcmk_host_check";
pub const ATTR_PRIORITY: &str = "priority";

/// How a device decides whether it can fence a given target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostCheck {
    /// Any target is eligible.
    None,
    /// Eligible iff the target is in the configured host list.
    StaticList,
    /// Eligible iff the agent's `list` action reports the target (alias).
    #[default]
    DynamicList,
    /// Eligible iff the agent's `status` action recognizes the target.
    Status,
    /// Eligibility is probed with `status` and the eventual action is
    /// forced to a reboot.
    Reboot,
}

impl HostCheck {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(HostCheck::None),
            "static-list" => Some(HostCheck::StaticList),
            "dynamic-list" => Some(HostCheck::DynamicList),
            "status" => Some(HostCheck::Status),
            "reboot" => Some(HostCheck::Reboot),
            _ => None,
        }
    }
}

/// A device registration as received from configuration or a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub id: String,
    pub agent: String,
    pub namespace: String,
    pub params: BTreeMap<String, String>,
}

/// Splits a `pcmk_host_list` style value on commas, semicolons and spaces.
pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split([',', ';', ' ', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses a `pcmk_host_map` value (`node1:port1;node2:port2`). Map targets
/// also serve as a fallback static target list.
pub fn parse_host_map(raw: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for pair in raw.split([';', ',', ' ']) {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once([':', '=']) {
            Some((node, port)) if !node.is_empty() && !port.is_empty() => {
                map.insert(node.trim().to_string(), port.trim().to_string());
            }
            _ => warn!("Ignoring malformed host-map entry '{}'", pair),
        }
    }
    map
}

/// The dynamic target cache: agent-reported targets plus their age.
#[derive(Debug, Default)]
pub struct DynamicTargets {
    pub targets: Option<Vec<String>>,
    pub refreshed: Option<Instant>,
}

/// One registered fencing device.
pub struct FenceDevice {
    pub id: String,
    pub agent: String,
    pub namespace: String,
    /// Parameters passed to the agent (coordinator-interpreted `pcmk_*`
    /// keys removed).
    pub agent_params: BTreeMap<String, String>,
    /// The full original parameter map, for `pcmk_<action>_action` lookups.
    pub raw_params: BTreeMap<String, String>,
    pub host_list: Vec<String>,
    pub host_map: BTreeMap<String, String>,
    pub host_check: HostCheck,
    pub priority: i32,
    /// Refreshed output of the agent's `list` action.
    pub dynamic: Mutex<DynamicTargets>,
    /// A failed `list` invocation disables future queries permanently.
    pub list_disabled: AtomicBool,
    /// Cached `metadata` output.
    pub metadata: Mutex<Option<String>>,
    /// Commands awaiting the execution slot, strict FIFO.
    pub queue: Mutex<VecDeque<super::coordinator::FenceCommand>>,
    /// Set while a child agent process runs for this device.
    pub busy: AtomicBool,
    /// Poked when a command is enqueued or a child exits.
    pub work: Arc<Trigger>,
    /// Set on removal; the worker drains out.
    pub removed: AtomicBool,
}

impl FenceDevice {
    /// Builds a device from its registration, deriving the host-selection
    /// structures. With no explicit host-check: a configured host list means
    /// `static-list`, otherwise `dynamic-list`.
    pub fn from_registration(reg: DeviceRegistration) -> Result<Arc<Self>, HelmsmanError> {
        if reg.id.is_empty() || reg.agent.is_empty() {
            return Err(HelmsmanError::BadConfig(
                "Device registration requires an id and an agent".to_string(),
            ));
        }

        let host_list = reg
            .params
            .get(ATTR_HOST_LIST)
            .map(|raw| parse_host_list(raw))
            .unwrap_or_default();
        let host_map = reg
            .params
            .get(ATTR_HOST_MAP)
            .map(|raw| parse_host_map(raw))
            .unwrap_or_default();

        let host_check = match reg.params.get(ATTR_HOST_CHECK) {
            Some(raw) => HostCheck::parse(raw).ok_or_else(|| {
                HelmsmanError::BadConfig(format!("Unknown host-check policy '{raw}'"))
            })?,
            None if !host_list.is_empty() || !host_map.is_empty() => HostCheck::StaticList,
            None => HostCheck::DynamicList,
        };

        let priority = reg
            .params
            .get(ATTR_PRIORITY)
            .and_then(|p| p.parse::<i32>().ok())
            .unwrap_or(0);

        let agent_params: BTreeMap<String, String> = reg
            .params
            .iter()
            .filter(|(k, _)| !k.starts_with("pcmk_") && *k != ATTR_PRIORITY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        debug!(
            "Built device '{}' (agent {}, {:?}, priority {})",
            reg.id, reg.agent, host_check, priority
        );

        Ok(Arc::new(Self {
            id: reg.id,
            agent: reg.agent,
            namespace: reg.namespace,
            agent_params,
            raw_params: reg.params,
            host_list,
            host_map,
            host_check,
            priority,
            dynamic: Mutex::new(DynamicTargets::default()),
            list_disabled: AtomicBool::new(false),
            metadata: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            busy: AtomicBool::new(false),
            work: Trigger::new(),
            removed: AtomicBool::new(false),
        }))
    }

    /// The device-level name for a target: the host-map alias when one is
    /// configured, otherwise the target itself.
    pub fn alias_for<'a>(&'a self, target: &'a str) -> &'a str {
        self.host_map.get(target).map(String::as_str).unwrap_or(target)
    }

    /// The action the agent should actually run, honoring any
    /// `pcmk_<action>_action` override.
    pub fn mapped_action(&self, action: &str) -> String {
        let override_key = format!("pcmk_{action}_action");
        match self.raw_params.get(&override_key) {
            Some(mapped) => {
                debug!(
                    "Device '{}' remaps action '{}' to '{}'",
                    self.id, action, mapped
                );
                mapped.clone()
            }
            None => action.to_string(),
        }
    }

    /// The static targets: the configured host list, falling back to the
    /// host-map keys.
    pub fn static_targets(&self) -> Vec<&str> {
        if !self.host_list.is_empty() {
            self.host_list.iter().map(String::as_str).collect()
        } else {
            self.host_map.keys().map(String::as_str).collect()
        }
    }

    /// Enqueues a command and pokes the worker.
    pub fn enqueue(&self, command: super::coordinator::FenceCommand) {
        self.queue.lock().push_back(command);
        self.work.set();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for FenceDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceDevice")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("host_check", &self.host_check)
            .field("priority", &self.priority)
            .field("queued", &self.queue_len())
            .finish()
    }
}
