// src/core/fencing/mod.rs

//! The fencing coordinator and its supporting pieces: the device registry,
//! fence-agent child processes, and cluster-wide fence notifications.

pub mod agent;
pub mod coordinator;
pub mod device;
pub mod notify;

pub use agent::{AgentInvocation, AgentResult, AgentRunner, ProcessAgentRunner, ScriptedAgentRunner};
pub use coordinator::{
    FenceCallOptions, FenceCommand, FenceOperation, FenceOutcome, FencingCoordinator, fence_rc,
    run_device_worker,
};
pub use device::{DeviceRegistration, FenceDevice, HostCheck};
pub use notify::{
    FenceNotificationHandler, FenceNotifyEffect, PowerControl, SELF_FENCE_EXIT_CODE, SystemPower,
};
