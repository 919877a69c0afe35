// src/main.rs

//! The main entry point for the Helmsman controller daemon.

use anyhow::Result;
use helmsman::config::Config;
use helmsman::core::cib::InMemoryCib;
use helmsman::core::executor::ScriptedExecutor;
use helmsman::core::fencing::{ProcessAgentRunner, SystemPower};
use helmsman::core::messaging::LoopbackTransport;
use helmsman::core::scheduler::NullScheduler;
use helmsman::server::{self, Collaborators};
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("Helmsman version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise, it defaults to "helmsman.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("helmsman.toml");

    let config = if std::path::Path::new(config_path).exists() {
        match Config::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{config_path}\": {e}");
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // Setup logging with reloading capabilities. The initial level comes
    // from the environment, falling back to the config file.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true),
        )
        .init();
    let _reload_handle = Arc::new(reload_handle);

    info!("Starting Helmsman {} on '{}'", VERSION, config.node.uname);

    // The collaborator daemons (transport stack, replicated CIB, executor)
    // are separate deployments; standalone operation runs against the
    // in-process implementations.
    let transport = LoopbackTransport::new(1);
    transport.inject_membership(vec![1], vec![1], vec![]).await;

    let collaborators = Collaborators {
        transport,
        cib: InMemoryCib::new(),
        executor: ScriptedExecutor::new(),
        scheduler: Arc::new(NullScheduler),
        agent_runner: ProcessAgentRunner::new(
            config.fencing.kill_grace,
            config.fencing.warn_grace,
        ),
        power: Arc::new(SystemPower),
    };

    match server::run(config, collaborators).await {
        Ok(code) if code == 0 => Ok(()),
        Ok(code) => {
            error!("Controller exited with code {}", code);
            std::process::exit(code);
        }
        Err(e) => {
            error!("Controller runtime error: {}", e);
            Err(e)
        }
    }
}
