// src/core/fencing/coordinator.rs

//! The fencing coordinator: device registry, capability matching, per-device
//! serial scheduling with fallback chains, and outcome fan-out.

use crate::config::FencingConfig;
use crate::core::HelmsmanError;
use crate::core::executor::ops::CallIdAllocator;
use crate::core::fencing::agent::{AgentInvocation, AgentResult, AgentRunner};
use crate::core::fencing::device::{DeviceRegistration, FenceDevice, HostCheck, parse_host_list};
use crate::core::messaging::FenceNotification;
use bitflags::bitflags;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

bitflags! {
    /// Request options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FenceCallOptions: u32 {
        /// An operator vouches the target is down; synthesize success
        /// without touching any device.
        const MANUAL_ACK = 1 << 0;
    }
}

/// What kind of request a command is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceOperation {
    /// A targetable power action against a victim.
    Fence,
    Status,
    List,
    Monitor,
    Metadata,
}

/// One asynchronous fencing command, queued on a device.
#[derive(Debug, Clone)]
pub struct FenceCommand {
    pub call_id: i32,
    pub options: FenceCallOptions,
    pub timeout: Duration,
    /// The node that requested the operation.
    pub origin: String,
    pub client_id: String,
    pub operation: FenceOperation,
    pub action: String,
    pub victim: Option<String>,
    /// Round-tripped transition key for graph-initiated fences.
    pub user_data: Option<String>,
    /// The device the command is currently scheduled on.
    pub device: Option<String>,
    /// Remaining devices to try, best first.
    pub fallback: VecDeque<String>,
}

/// A finished command plus its delivery scope.
#[derive(Debug, Clone)]
pub struct FenceOutcome {
    pub notification: FenceNotification,
    /// Broadcast cluster-wide (terminal targetable actions) vs unicast to
    /// the originator.
    pub broadcast: bool,
}

/// Coordinator-level failure codes carried in `FenceNotification::result`
/// alongside positive agent rcs.
pub mod fence_rc {
    pub const OK: i32 = 0;
    pub const NONE_AVAILABLE: i32 = -1;
    pub const UNKNOWN_DEVICE: i32 = -2;
}

pub struct FencingCoordinator {
    /// Weak self-handle so device registration can hand the worker task an
    /// owning reference.
    myself: Weak<FencingCoordinator>,
    local_uname: String,
    devices: DashMap<String, Arc<FenceDevice>>,
    runner: Arc<dyn AgentRunner>,
    call_ids: CallIdAllocator,
    outcomes: mpsc::Sender<FenceOutcome>,
    config: FencingConfig,
    shutdown: broadcast::Sender<()>,
}

impl FencingCoordinator {
    pub fn new(
        local_uname: &str,
        runner: Arc<dyn AgentRunner>,
        outcomes: mpsc::Sender<FenceOutcome>,
        config: FencingConfig,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|myself| Self {
            myself: myself.clone(),
            local_uname: local_uname.to_string(),
            devices: DashMap::new(),
            runner,
            call_ids: CallIdAllocator::new(),
            outcomes,
            config,
            shutdown,
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn get_device(&self, id: &str) -> Option<Arc<FenceDevice>> {
        self.devices.get(id).map(|d| Arc::clone(&d))
    }

    /// Registers (or replaces) a device and starts its worker.
    pub fn register_device(&self, registration: DeviceRegistration) -> Result<(), HelmsmanError> {
        let device = FenceDevice::from_registration(registration)?;
        let id = device.id.clone();

        if let Some(old) = self.devices.insert(id.clone(), Arc::clone(&device)) {
            info!("Replacing fencing device '{}'", id);
            old.removed.store(true, Ordering::Release);
            old.work.set();
        } else {
            info!("Registered fencing device '{}' ({})", id, device.agent);
        }

        match self.myself.upgrade() {
            Some(coordinator) => {
                tokio::spawn(run_device_worker(coordinator, device));
            }
            None => {
                return Err(HelmsmanError::Unavailable(
                    "Fencing coordinator is shutting down".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Removes a device. Its queued commands fail with `UNKNOWN_DEVICE`.
    pub fn remove_device(&self, id: &str) -> bool {
        match self.devices.remove(id) {
            Some((_, device)) => {
                info!("Removed fencing device '{}'", id);
                device.removed.store(true, Ordering::Release);
                device.work.set();
                true
            }
            None => false,
        }
    }

    /// Drops every device (coordinator shutdown).
    pub fn clear_devices(&self) {
        let ids: Vec<String> = self.devices.iter().map(|d| d.id.clone()).collect();
        for id in ids {
            self.remove_device(&id);
        }
    }

    /// Decides whether a device can fence a target, per its host-check
    /// policy. Dynamic policies may invoke the agent.
    pub async fn can_fence(&self, device: &Arc<FenceDevice>, target: &str) -> bool {
        let alias = device.alias_for(target).to_string();

        let can = match device.host_check {
            HostCheck::None => true,
            HostCheck::StaticList => device
                .static_targets()
                .iter()
                .any(|candidate| *candidate == target),
            HostCheck::DynamicList => self.check_dynamic_list(device, &alias).await,
            HostCheck::Status | HostCheck::Reboot => self.check_status(device, target, &alias).await,
        };

        if alias == target {
            info!(
                "{} can{} fence {}: {:?}",
                device.id,
                if can { "" } else { " not" },
                target,
                device.host_check
            );
        } else {
            info!(
                "{} can{} fence {} (aka. '{}'): {:?}",
                device.id,
                if can { "" } else { " not" },
                target,
                alias,
                device.host_check
            );
        }
        can
    }

    async fn check_dynamic_list(&self, device: &Arc<FenceDevice>, alias: &str) -> bool {
        if device.list_disabled.load(Ordering::Acquire) {
            trace!("Port list queries disabled for {}", device.id);
        } else {
            let stale = {
                let dynamic = device.dynamic.lock();
                match (&dynamic.targets, dynamic.refreshed) {
                    (Some(_), Some(at)) => at.elapsed() > self.config.dynamic_list_ttl,
                    _ => true,
                }
            };

            if stale {
                let invocation = AgentInvocation {
                    agent: device.agent.clone(),
                    action: "list".to_string(),
                    nodename: None,
                    port: None,
                    params: device.agent_params.clone(),
                    timeout: self.config.default_timeout,
                };
                match self.runner.run(invocation).await {
                    Ok(result) if result.rc == 0 => {
                        let targets: Vec<String> = result
                            .output
                            .lines()
                            .flat_map(parse_host_list)
                            .collect();
                        info!(
                            "Refreshed port list for {} ({} targets)",
                            device.id,
                            targets.len()
                        );
                        let mut dynamic = device.dynamic.lock();
                        dynamic.targets = Some(targets);
                        dynamic.refreshed = Some(Instant::now());
                    }
                    Ok(result) => {
                        warn!(
                            "Disabling port list queries for {} (rc={}): {}",
                            device.id, result.rc, result.output
                        );
                        device.list_disabled.store(true, Ordering::Release);
                        device.dynamic.lock().targets = None;
                    }
                    Err(e) => {
                        warn!("Disabling port list queries for {}: {}", device.id, e);
                        device.list_disabled.store(true, Ordering::Release);
                        device.dynamic.lock().targets = None;
                    }
                }
            }
        }

        let dynamic = device.dynamic.lock();
        dynamic
            .targets
            .as_ref()
            .is_some_and(|targets| targets.iter().any(|t| t == alias))
    }

    async fn check_status(&self, device: &Arc<FenceDevice>, target: &str, alias: &str) -> bool {
        let invocation = AgentInvocation {
            agent: device.agent.clone(),
            action: "status".to_string(),
            nodename: Some(target.to_string()),
            port: Some(alias.to_string()),
            params: device.agent_params.clone(),
            timeout: self.config.default_timeout,
        };
        match self.runner.run(invocation).await {
            // 0 = target active, 2 = target inactive; both prove the device
            // knows the target.
            Ok(result) if result.rc == 0 || result.rc == 2 => true,
            Ok(result) if result.rc == 1 => {
                trace!("Host {} is not known by {}", target, device.id);
                false
            }
            Ok(result) => {
                error!(
                    "Unknown result calling status for {} with {}: rc={}",
                    target, device.id, result.rc
                );
                false
            }
            Err(e) => {
                error!("Could not invoke {}: {}", device.id, e);
                false
            }
        }
    }

    /// Every device currently able to fence a target, best priority first.
    pub async fn capable_devices(&self, target: &str) -> Vec<Arc<FenceDevice>> {
        let all: Vec<Arc<FenceDevice>> =
            self.devices.iter().map(|d| Arc::clone(&d)).collect();
        let mut capable = Vec::new();
        for device in all {
            if self.can_fence(&device, target).await {
                capable.push(device);
            }
        }
        // Descending by priority.
        capable.sort_by(|a, b| b.priority.cmp(&a.priority));
        capable
    }

    /// Handles a fence request: manual-ack shortcut, device search, priority
    /// assignment, and scheduling. Returns the call id the outcome will
    /// carry.
    pub async fn fence_request(
        &self,
        target: &str,
        action: &str,
        origin: &str,
        client_id: &str,
        options: FenceCallOptions,
        timeout: Option<Duration>,
        user_data: Option<String>,
    ) -> i32 {
        let call_id = self.call_ids.next();
        let action = if action.is_empty() {
            self.config.default_action.clone()
        } else {
            action.to_string()
        };

        if options.contains(FenceCallOptions::MANUAL_ACK) {
            info!(
                "Manual acknowledgement of '{}' {} (call {})",
                target, action, call_id
            );
            self.emit(FenceOutcome {
                notification: FenceNotification {
                    target: target.to_string(),
                    action,
                    result: fence_rc::OK,
                    executioner: self.local_uname.clone(),
                    origin: origin.to_string(),
                    client_id: client_id.to_string(),
                    call_id,
                    device: None,
                    output: None,
                    user_data: user_data.clone(),
                },
                broadcast: true,
            })
            .await;
            return call_id;
        }

        let capable = self.capable_devices(target).await;
        info!(
            "Found {} matching devices for '{}'",
            capable.len(),
            target
        );

        if capable.is_empty() {
            self.emit(FenceOutcome {
                notification: FenceNotification {
                    target: target.to_string(),
                    action,
                    result: fence_rc::NONE_AVAILABLE,
                    executioner: self.local_uname.clone(),
                    origin: origin.to_string(),
                    client_id: client_id.to_string(),
                    call_id,
                    device: None,
                    output: Some("No capable fencing device".to_string()),
                    user_data: user_data.clone(),
                },
                broadcast: false,
            })
            .await;
            return call_id;
        }

        let primary = &capable[0];
        let fallback: VecDeque<String> =
            capable.iter().skip(1).map(|d| d.id.clone()).collect();

        let command = FenceCommand {
            call_id,
            options,
            timeout: timeout.unwrap_or(self.config.default_timeout),
            origin: origin.to_string(),
            client_id: client_id.to_string(),
            operation: FenceOperation::Fence,
            action,
            victim: Some(target.to_string()),
            user_data,
            device: Some(primary.id.clone()),
            fallback,
        };
        primary.enqueue(command);
        call_id
    }

    /// Queues a non-targetable device operation (status/list/monitor/
    /// metadata) on a specific device.
    pub fn device_action(
        &self,
        device_id: &str,
        operation: FenceOperation,
        origin: &str,
        client_id: &str,
    ) -> Result<i32, HelmsmanError> {
        let device = self
            .get_device(device_id)
            .ok_or_else(|| HelmsmanError::UnknownDevice(device_id.to_string()))?;

        let call_id = self.call_ids.next();
        let action = match operation {
            FenceOperation::Status => "status",
            FenceOperation::List => "list",
            FenceOperation::Monitor => "monitor",
            FenceOperation::Metadata => "metadata",
            FenceOperation::Fence => {
                return Err(HelmsmanError::InvalidRequest(
                    "Fence operations need a target, not a device".to_string(),
                ));
            }
        };

        device.enqueue(FenceCommand {
            call_id,
            options: FenceCallOptions::empty(),
            timeout: self.config.default_timeout,
            origin: origin.to_string(),
            client_id: client_id.to_string(),
            operation,
            action: action.to_string(),
            victim: None,
            user_data: None,
            device: Some(device.id.clone()),
            fallback: VecDeque::new(),
        });
        Ok(call_id)
    }

    async fn emit(&self, outcome: FenceOutcome) {
        if self.outcomes.send(outcome).await.is_err() {
            error!("Fence outcome channel closed, result lost");
        }
    }

    fn log_operation(&self, command: &FenceCommand, result: &AgentResult, next: Option<&str>) {
        let next = if result.rc == 0 { None } else { next };
        let device = command.device.as_deref().unwrap_or("<none>");

        match &command.victim {
            Some(victim) => {
                let line = format!(
                    "Operation '{}' (call {} from {}) for host '{}' with device '{}' returned: {}{}",
                    command.action,
                    command.call_id,
                    command.client_id,
                    victim,
                    device,
                    result.rc,
                    next.map(|n| format!(". Trying: {n}")).unwrap_or_default()
                );
                if result.rc == 0 {
                    info!("{}", line);
                } else {
                    error!("{}", line);
                }
            }
            None => {
                debug!(
                    "Operation '{}' for device '{}' returned: {}",
                    command.action, device, result.rc
                );
            }
        }

        // One log line per line of output keeps the journal greppable.
        if command.operation != FenceOperation::Metadata && !result.output.is_empty() {
            for line in result.output.lines() {
                if result.rc == 0 {
                    info!("{}: {}", device, line);
                } else {
                    error!("{}: {}", device, line);
                }
            }
        }
    }
}

impl std::fmt::Debug for FencingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FencingCoordinator")
            .field("local_uname", &self.local_uname)
            .field("devices", &self.devices.len())
            .finish()
    }
}

/// The per-device worker: waits on the work trigger, runs one queued
/// command at a time, and walks the fallback chain on failure.
pub async fn run_device_worker(
    coordinator: Arc<FencingCoordinator>,
    device: Arc<FenceDevice>,
) {
    let mut shutdown = coordinator.shutdown.subscribe();
    debug!("Worker for device '{}' started", device.id);

    loop {
        tokio::select! {
            _ = device.work.fired() => {}
            _ = shutdown.recv() => {
                debug!("Worker for device '{}' stopping", device.id);
                return;
            }
        }

        loop {
            if device.removed.load(Ordering::Acquire) {
                fail_orphans(&coordinator, &device).await;
                debug!("Worker for removed device '{}' exiting", device.id);
                return;
            }
            let Some(command) = device.queue.lock().pop_front() else {
                break;
            };
            device.busy.store(true, Ordering::Release);
            execute_command(&coordinator, &device, command).await;
            device.busy.store(false, Ordering::Release);
        }
    }
}

async fn fail_orphans(coordinator: &Arc<FencingCoordinator>, device: &Arc<FenceDevice>) {
    let orphans: Vec<FenceCommand> = device.queue.lock().drain(..).collect();
    for command in orphans {
        coordinator
            .emit(FenceOutcome {
                notification: FenceNotification {
                    target: command.victim.clone().unwrap_or_default(),
                    action: command.action.clone(),
                    result: fence_rc::UNKNOWN_DEVICE,
                    executioner: coordinator.local_uname.clone(),
                    origin: command.origin.clone(),
                    client_id: command.client_id.clone(),
                    call_id: command.call_id,
                    device: Some(device.id.clone()),
                    output: Some("Device removed".to_string()),
                    user_data: command.user_data.clone(),
                },
                broadcast: false,
            })
            .await;
    }
}

async fn execute_command(
    coordinator: &Arc<FencingCoordinator>,
    device: &Arc<FenceDevice>,
    mut command: FenceCommand,
) {
    let action = device.mapped_action(&command.action);
    let invocation = AgentInvocation {
        agent: device.agent.clone(),
        action,
        nodename: command.victim.clone(),
        port: command
            .victim
            .as_deref()
            .map(|victim| device.alias_for(victim).to_string()),
        params: device.agent_params.clone(),
        timeout: command.timeout,
    };

    let result = match coordinator.runner.run(invocation).await {
        Ok(result) => result,
        Err(e) => AgentResult {
            rc: 1,
            output: e.to_string(),
            timed_out: false,
        },
    };

    if command.operation == FenceOperation::Metadata && result.rc == 0 {
        *device.metadata.lock() = Some(result.output.clone());
    }

    // Failed with devices left to try: log with the successor and reschedule.
    if result.rc != 0 {
        while let Some(next_id) = command.fallback.pop_front() {
            if let Some(next) = coordinator.get_device(&next_id) {
                coordinator.log_operation(&command, &result, Some(&next_id));
                command.device = Some(next_id);
                next.enqueue(command);
                return;
            }
            trace!("Fallback device '{}' disappeared, skipping", next_id);
        }
    }

    coordinator.log_operation(&command, &result, None);

    // Terminal results of targetable actions go cluster-wide so every peer
    // processes the fence, not just the requester.
    let targetable = command.operation == FenceOperation::Fence
        && matches!(
            command.action.as_str(),
            "on" | "off" | "reboot" | "poweron" | "poweroff"
        );

    let output = if command.operation == FenceOperation::Metadata {
        // Too verbose for notifications; it is cached on the device.
        Some(result.output.clone())
    } else if result.output.is_empty() {
        None
    } else {
        Some(result.output.clone())
    };

    coordinator
        .emit(FenceOutcome {
            notification: FenceNotification {
                target: command.victim.clone().unwrap_or_default(),
                action: command.action.clone(),
                result: result.rc,
                executioner: coordinator.local_uname.clone(),
                origin: command.origin.clone(),
                client_id: command.client_id.clone(),
                call_id: command.call_id,
                device: command.device.clone(),
                output,
                user_data: command.user_data.clone(),
            },
            broadcast: targetable,
        })
        .await;
}
