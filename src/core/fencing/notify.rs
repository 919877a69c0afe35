// src/core/fencing/notify.rs

//! Cluster-wide fence notification handling: peer-state bookkeeping, DC
//! status recording, and the self-fence halt path.

use crate::core::HelmsmanError;
use crate::core::cib::{CibClient, record_fenced_node};
use crate::core::membership::{MembershipState, PeerCache, ProcMask};
use crate::core::messaging::FenceNotification;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Hardware control for the self-fence path, kept behind a trait so the
/// handler can be exercised without rebooting the test machine.
pub trait PowerControl: Send + Sync {
    /// Attempts an immediate hardware halt. Returning at all means failure.
    fn halt(&self) -> Result<(), HelmsmanError>;
    /// Terminates the process with the given code.
    fn exit(&self, code: i32) -> !;
}

/// Exit code used when the local node learns it was fenced and cannot halt.
pub const SELF_FENCE_EXIT_CODE: i32 = 100;

/// The real thing.
pub struct SystemPower;

impl PowerControl for SystemPower {
    fn halt(&self) -> Result<(), HelmsmanError> {
        unsafe {
            libc::sync();
            if libc::reboot(libc::LINUX_REBOOT_CMD_HALT) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    fn exit(&self, code: i32) -> ! {
        std::process::exit(code)
    }
}

/// What a notification amounted to, for the controller to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceNotifyEffect {
    /// A peer was successfully fenced; abort foreign transitions.
    PeerFenced { target: String },
    /// The fence failed; the DC may schedule another attempt.
    Failed { target: String, result: i32 },
}

/// Processes incoming `FenceNotify` messages.
pub struct FenceNotificationHandler {
    local_uname: String,
    peers: Arc<PeerCache>,
    cib: Arc<CibClient>,
    /// Local per-target failure counters, cleared when a fence lands.
    fail_counts: DashMap<String, u32>,
    power: Arc<dyn PowerControl>,
}

impl FenceNotificationHandler {
    pub fn new(
        local_uname: &str,
        peers: Arc<PeerCache>,
        cib: Arc<CibClient>,
        power: Arc<dyn PowerControl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_uname: local_uname.to_string(),
            peers,
            cib,
            fail_counts: DashMap::new(),
            power,
        })
    }

    /// Bumps the failure counter for a target (failed resource actions).
    pub fn note_failure(&self, target: &str) {
        *self.fail_counts.entry(target.to_string()).or_insert(0) += 1;
    }

    pub fn fail_count(&self, target: &str) -> u32 {
        self.fail_counts.get(target).map(|c| *c).unwrap_or(0)
    }

    /// Handles one notification. `is_dc` selects the DC-only bookkeeping.
    ///
    /// A successful self-fence never returns: the node halts, or failing
    /// that exits with code 100, skipping all cleanup. A log that stops
    /// mid-line here is expected.
    pub async fn handle(
        &self,
        notification: &FenceNotification,
        is_dc: bool,
    ) -> FenceNotifyEffect {
        if !notification.succeeded() {
            warn!(
                "Fencing of '{}' by '{}' failed: result {}",
                notification.target, notification.executioner, notification.result
            );
            return FenceNotifyEffect::Failed {
                target: notification.target.clone(),
                result: notification.result,
            };
        }

        if notification.target == self.local_uname {
            error!(
                "We were allegedly just fenced by '{}' for '{}'!",
                notification.executioner, notification.origin
            );
            if self.power.halt().is_err() {
                error!("Could not halt, exiting instead");
            }
            self.power.exit(SELF_FENCE_EXIT_CODE);
        }

        info!(
            "Peer '{}' was fenced ({}) by '{}' on behalf of '{}'",
            notification.target,
            notification.action,
            notification.executioner,
            notification.origin
        );

        // The fence wiped the node; stale failure counters with it.
        self.fail_counts.remove(&notification.target);

        if let Some(peer) = self.peers.get_by_uname(&notification.target) {
            let _ = self.peers.update_proc(peer.id, ProcMask::empty());
            let _ = self
                .peers
                .update_state(peer.id, MembershipState::Lost, 0);
            let _ = self.peers.update_expected(peer.id, "down");
        }

        if is_dc
            && let Err(e) = record_fenced_node(&self.cib, &notification.target).await
        {
            error!(
                "Could not record fencing of '{}' in the CIB: {}",
                notification.target, e
            );
        }

        FenceNotifyEffect::PeerFenced {
            target: notification.target.clone(),
        }
    }
}

impl std::fmt::Debug for FenceNotificationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceNotificationHandler")
            .field("local_uname", &self.local_uname)
            .finish()
    }
}
