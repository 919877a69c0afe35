// src/server/mod.rs

use crate::config::Config;
use crate::core::cib::CibBackend;
use crate::core::executor::ExecutorBackend;
use crate::core::fencing::{AgentRunner, PowerControl};
use crate::core::messaging::ClusterTransport;
use crate::core::scheduler::Scheduler;
use anyhow::Result;
use std::sync::Arc;

pub mod context;
pub mod controller;
pub mod spawner;

pub use context::{ControllerContext, ControllerInit};
pub use controller::Controller;

/// The collaborator seams a deployment must provide.
pub struct Collaborators {
    pub transport: Arc<dyn ClusterTransport>,
    pub cib: Arc<dyn CibBackend>,
    pub executor: Arc<dyn ExecutorBackend>,
    pub scheduler: Arc<dyn Scheduler>,
    pub agent_runner: Arc<dyn AgentRunner>,
    pub power: Arc<dyn PowerControl>,
}

/// The main controller startup function: initialize shared state, spawn the
/// background tasks, and run the controller loop until termination.
/// Returns the process exit code.
pub async fn run(config: Config, collaborators: Collaborators) -> Result<i32> {
    let mut init = ControllerContext::initialize(
        config,
        collaborators.transport,
        collaborators.cib,
        collaborators.executor,
        collaborators.scheduler,
        collaborators.agent_runner,
        collaborators.power,
    )?;

    spawner::spawn_all(&mut init);

    let background = std::mem::take(&mut init.background_tasks);
    let controller = Controller::new(init);
    let exit_code = controller.run().await;

    // The controller signalled shutdown; give the background tasks a moment
    // to drain.
    let mut background = background;
    while let Some(result) = background.join_next().await {
        if let Err(e) = result
            && !e.is_cancelled()
        {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }

    Ok(exit_code)
}
