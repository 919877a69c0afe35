// src/config.rs

//! Manages controller configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use sysinfo::System;

/// Identity of the local node inside the cluster.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeConfig {
    /// The node name announced to the cluster. Defaults to the OS hostname.
    #[serde(default = "default_uname")]
    pub uname: String,
    /// Fixed node id for transports that do not assign one. `0` lets the
    /// transport-reported id win.
    #[serde(default)]
    pub node_id: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            uname: default_uname(),
            node_id: 0,
        }
    }
}

fn default_uname() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Tuning for the cluster messaging layer and peer cache.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    /// Payloads at or above this size are compressed before multicast.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Maximum frames drained from the send queue per flush pass.
    #[serde(default = "default_flush_batch")]
    pub flush_batch: usize,
    /// Initial retry delay after the transport reports backpressure.
    #[serde(with = "humantime_serde", default = "default_flush_backoff_min")]
    pub flush_backoff_min: Duration,
    /// Upper bound on the scaled retry delay.
    #[serde(with = "humantime_serde", default = "default_flush_backoff_max")]
    pub flush_backoff_max: Duration,
    /// Queue length at which the first warning is emitted.
    #[serde(default = "default_queue_warn")]
    pub queue_warn: usize,
    /// How long a group-membership / cluster-membership contradiction may
    /// persist before the peer is forcibly promoted back to member.
    #[serde(with = "humantime_serde", default = "default_contradiction_timeout")]
    pub membership_contradiction_timeout: Duration,
    /// Drop peer-cache entries as soon as membership is lost.
    #[serde(default = "default_autoreap")]
    pub autoreap: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            compression_threshold: default_compression_threshold(),
            flush_batch: default_flush_batch(),
            flush_backoff_min: default_flush_backoff_min(),
            flush_backoff_max: default_flush_backoff_max(),
            queue_warn: default_queue_warn(),
            membership_contradiction_timeout: default_contradiction_timeout(),
            autoreap: default_autoreap(),
        }
    }
}

fn default_compression_threshold() -> usize {
    64 * 1024
}
fn default_flush_batch() -> usize {
    200
}
fn default_flush_backoff_min() -> Duration {
    Duration::from_millis(100)
}
fn default_flush_backoff_max() -> Duration {
    Duration::from_millis(1000)
}
fn default_queue_warn() -> usize {
    200
}
fn default_contradiction_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_autoreap() -> bool {
    true
}

/// Tuning for the local executor client.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutorConfig {
    /// Bounded reconnection attempts before the controller gives up and
    /// escalates to a fatal error.
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Delay between reconnection attempts.
    #[serde(with = "humantime_serde", default = "default_reconnect_backoff")]
    pub reconnect_backoff: Duration,
    /// Operations pending longer than their timeout plus this much are given
    /// a synthesized result so the transition engine can proceed.
    #[serde(with = "humantime_serde", default = "default_fake_result_after")]
    pub fake_result_after: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: default_max_connect_attempts(),
            reconnect_backoff: default_reconnect_backoff(),
            fake_result_after: default_fake_result_after(),
        }
    }
}

fn default_max_connect_attempts() -> u32 {
    10
}
fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(2)
}
fn default_fake_result_after() -> Duration {
    Duration::from_secs(300)
}

/// Tuning for the fencing coordinator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FencingConfig {
    /// Action to take when a fence request does not name one.
    #[serde(default = "default_fence_action")]
    pub default_action: String,
    /// Grace between SIGTERM and SIGKILL for a hung fence agent.
    #[serde(with = "humantime_serde", default = "default_kill_grace")]
    pub kill_grace: Duration,
    /// Grace between SIGKILL and the "still alive" warning.
    #[serde(with = "humantime_serde", default = "default_kill_grace")]
    pub warn_grace: Duration,
    /// How long a dynamic target list stays fresh before `list` is re-run.
    #[serde(with = "humantime_serde", default = "default_dynamic_list_ttl")]
    pub dynamic_list_ttl: Duration,
    /// Default per-command timeout when a request does not carry one.
    #[serde(with = "humantime_serde", default = "default_fence_timeout")]
    pub default_timeout: Duration,
}

impl Default for FencingConfig {
    fn default() -> Self {
        Self {
            default_action: default_fence_action(),
            kill_grace: default_kill_grace(),
            warn_grace: default_kill_grace(),
            dynamic_list_ttl: default_dynamic_list_ttl(),
            default_timeout: default_fence_timeout(),
        }
    }
}

fn default_fence_action() -> String {
    "reboot".to_string()
}
fn default_kill_grace() -> Duration {
    Duration::from_secs(5)
}
fn default_dynamic_list_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_fence_timeout() -> Duration {
    Duration::from_secs(120)
}

/// Tuning for the transition graph engine.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransitionConfig {
    /// Maximum concurrently outstanding resource operations. `0` defers
    /// entirely to the load throttle.
    #[serde(default)]
    pub batch_limit: u32,
    /// Global bound on a single transition's execution.
    #[serde(with = "humantime_serde", default = "default_global_timeout")]
    pub global_timeout: Duration,
    /// Slack added on top of `timeout + start_delay` for per-action timers.
    #[serde(with = "humantime_serde", default = "default_action_slack")]
    pub action_slack: Duration,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            batch_limit: 0,
            global_timeout: default_global_timeout(),
            action_slack: default_action_slack(),
        }
    }
}

fn default_global_timeout() -> Duration {
    Duration::from_secs(900)
}
fn default_action_slack() -> Duration {
    Duration::from_secs(5)
}

/// Timers driving the controller state machine.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FsmConfig {
    /// How long an election may run before it is restarted.
    #[serde(with = "humantime_serde", default = "default_election_timeout")]
    pub election_timeout: Duration,
    /// How long the DC waits for all joiners during integration.
    #[serde(with = "humantime_serde", default = "default_integration_timeout")]
    pub integration_timeout: Duration,
    /// How long the DC waits for join finalization before recomputing.
    #[serde(with = "humantime_serde", default = "default_finalization_timeout")]
    pub finalization_timeout: Duration,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            election_timeout: default_election_timeout(),
            integration_timeout: default_integration_timeout(),
            finalization_timeout: default_finalization_timeout(),
        }
    }
}

fn default_election_timeout() -> Duration {
    Duration::from_secs(20)
}
fn default_integration_timeout() -> Duration {
    Duration::from_secs(180)
}
fn default_finalization_timeout() -> Duration {
    Duration::from_secs(1800)
}

/// Resource shutdown locks: keep resources pinned to a cleanly shut down
/// node until it returns or the lock expires.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ShutdownLockConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `0` means locks never expire on their own.
    #[serde(with = "humantime_serde", default = "default_lock_limit")]
    pub limit: Duration,
}

fn default_lock_limit() -> Duration {
    Duration::ZERO
}

/// The complete controller configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub fencing: FencingConfig,
    #[serde(default)]
    pub transition: TransitionConfig,
    #[serde(default)]
    pub fsm: FsmConfig,
    #[serde(default)]
    pub shutdown_lock: ShutdownLockConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-checks cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.node.uname.is_empty() {
            return Err(anyhow!("node.uname must not be empty"));
        }
        if self.cluster.flush_batch == 0 {
            return Err(anyhow!("cluster.flush_batch must be at least 1"));
        }
        if self.cluster.flush_backoff_min > self.cluster.flush_backoff_max {
            return Err(anyhow!(
                "cluster.flush_backoff_min must not exceed cluster.flush_backoff_max"
            ));
        }
        if self.executor.max_connect_attempts == 0 {
            return Err(anyhow!("executor.max_connect_attempts must be at least 1"));
        }
        if self.fencing.default_timeout.is_zero() {
            return Err(anyhow!("fencing.default_timeout must be non-zero"));
        }
        if self.transition.global_timeout.is_zero() {
            return Err(anyhow!("transition.global_timeout must be non-zero"));
        }
        Ok(())
    }
}
