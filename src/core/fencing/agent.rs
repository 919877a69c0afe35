// src/core/fencing/agent.rs

//! Fence-agent child processes: spawn the agent, feed it a `key=value`
//! stream on stdin, capture stdout, and escalate from SIGTERM to SIGKILL
//! when it overstays its timeout.

use crate::core::HelmsmanError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// One agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentInvocation {
    pub agent: String,
    pub action: String,
    /// Cluster name of the fence target.
    pub nodename: Option<String>,
    /// Device-level port/alias for the target.
    pub port: Option<String>,
    /// Agent-specific options, passed through verbatim.
    pub params: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl AgentInvocation {
    /// The newline-separated `key=value` stream written to the agent.
    pub fn stdin_stream(&self) -> String {
        let mut stream = String::new();
        stream.push_str(&format!("action={}\n", self.action));
        if let Some(nodename) = &self.nodename {
            stream.push_str(&format!("nodename={nodename}\n"));
        }
        if let Some(port) = &self.port {
            stream.push_str(&format!("port={port}\n"));
        }
        for (key, value) in &self.params {
            stream.push_str(&format!("{key}={value}\n"));
        }
        stream
    }
}

/// The outcome of an agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResult {
    /// Agent exit code: 0 success, 1 generic failure, 2 offline (status),
    /// anything else device-specific. Signal deaths report as failures.
    pub rc: i32,
    pub output: String,
    pub timed_out: bool,
}

impl AgentResult {
    pub fn succeeded(&self) -> bool {
        self.rc == 0
    }
}

/// The seam between scheduling and process execution, so host-check probes
/// and command execution share one pipeline and tests can script agents.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, invocation: AgentInvocation) -> Result<AgentResult, HelmsmanError>;
}

/// Runs agents as real child processes.
pub struct ProcessAgentRunner {
    kill_grace: Duration,
    warn_grace: Duration,
}

impl ProcessAgentRunner {
    pub fn new(kill_grace: Duration, warn_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            kill_grace,
            warn_grace,
        })
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run(&self, invocation: AgentInvocation) -> Result<AgentResult, HelmsmanError> {
        debug!(
            "Running agent {} action={} target={:?}",
            invocation.agent, invocation.action, invocation.nodename
        );

        let mut child = Command::new(&invocation.agent)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        // Feed the argument stream and close stdin so the agent sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(invocation.stdin_stream().as_bytes())
                .await?;
            stdin.shutdown().await?;
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| HelmsmanError::Internal("Agent stdout was not piped".to_string()))?;

        // Drain stdout concurrently with waiting; a blocked pipe must not
        // look like a hung agent.
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf).await;
            buf
        });

        let mut timed_out = false;
        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::time::sleep(invocation.timeout) => None,
        };

        let status = match status {
            Some(status) => status,
            None => {
                timed_out = true;
                let pid = child.id();
                warn!(
                    "Agent {} [{}] exceeded {:?}, sending SIGTERM",
                    invocation.agent,
                    pid.unwrap_or(0),
                    invocation.timeout
                );
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }

                match tokio::time::timeout(self.kill_grace, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        warn!(
                            "Agent {} ignored SIGTERM, sending SIGKILL",
                            invocation.agent
                        );
                        let _ = child.kill().await;
                        match tokio::time::timeout(self.warn_grace, child.wait()).await {
                            Ok(status) => status?,
                            Err(_) => {
                                error!(
                                    "Agent {} still alive after SIGKILL",
                                    invocation.agent
                                );
                                child.wait().await?
                            }
                        }
                    }
                }
            }
        };

        let output_bytes = reader
            .await
            .map_err(|e| HelmsmanError::Internal(format!("Agent output reader died: {e}")))?;
        let output = String::from_utf8_lossy(&output_bytes).into_owned();

        let rc = if timed_out {
            1
        } else {
            status.code().unwrap_or(1)
        };

        if rc == 0 {
            info!(
                "Agent {} action '{}' completed (rc=0, {} bytes of output)",
                invocation.agent,
                invocation.action,
                output.len()
            );
        } else {
            warn!(
                "Agent {} action '{}' failed (rc={}, timed_out={})",
                invocation.agent, invocation.action, rc, timed_out
            );
        }

        Ok(AgentResult {
            rc,
            output,
            timed_out,
        })
    }
}

/// A scripted runner for tests: results are keyed by `(agent, action)`;
/// unscripted invocations fail generically. Every invocation is recorded.
pub struct ScriptedAgentRunner {
    results: Mutex<BTreeMap<(String, String), Vec<(AgentResult, Duration)>>>,
    invocations: Mutex<Vec<AgentInvocation>>,
}

impl ScriptedAgentRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(BTreeMap::new()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    /// Scripts the next result for `(agent, action)`. Multiple results for
    /// the same key are consumed in order, the last one sticking.
    pub fn script(&self, agent: &str, action: &str, result: AgentResult) {
        self.script_delayed(agent, action, result, Duration::ZERO);
    }

    /// Like `script`, but the invocation takes `delay` to complete, for
    /// exercising in-flight behavior.
    pub fn script_delayed(&self, agent: &str, action: &str, result: AgentResult, delay: Duration) {
        self.results
            .lock()
            .entry((agent.to_string(), action.to_string()))
            .or_default()
            .push((result, delay));
    }

    pub fn invocations(&self) -> Vec<AgentInvocation> {
        self.invocations.lock().clone()
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgentRunner {
    async fn run(&self, invocation: AgentInvocation) -> Result<AgentResult, HelmsmanError> {
        self.invocations.lock().push(invocation.clone());
        let key = (invocation.agent.clone(), invocation.action.clone());
        let (result, delay) = {
            let mut results = self.results.lock();
            match results.get_mut(&key) {
                Some(queue) if !queue.is_empty() => {
                    if queue.len() == 1 {
                        queue[0].clone()
                    } else {
                        queue.remove(0)
                    }
                }
                _ => (
                    AgentResult {
                        rc: 1,
                        output: format!("unscripted invocation of {} {}", key.0, key.1),
                        timed_out: false,
                    },
                    Duration::ZERO,
                ),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(result)
    }
}
