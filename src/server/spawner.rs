// src/server/spawner.rs

//! Spawns the controller's long-running background tasks.

use crate::core::executor::client::run_connection;
use crate::core::messaging::{run_flusher, run_receiver};
use crate::server::context::ControllerInit;
use tracing::info;

/// Spawns the messaging flusher/receiver and the executor connection
/// supervisor into the init's JoinSet. The controller loop itself stays on
/// the caller's task.
pub fn spawn_all(init: &mut ControllerInit) {
    let ctx = &init.context;

    let outbox = std::sync::Arc::clone(&ctx.outbox);
    let transport = std::sync::Arc::clone(&ctx.transport);
    let cluster_config = ctx.config.cluster.clone();
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    init.background_tasks.spawn(async move {
        run_flusher(outbox, transport, cluster_config, shutdown_rx).await;
    });

    let messaging = std::sync::Arc::clone(&ctx.messaging);
    let events = std::mem::replace(&mut init.transport_events, tokio::sync::mpsc::channel(1).1);
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    init.background_tasks.spawn(async move {
        run_receiver(messaging, events, shutdown_rx).await;
    });

    if let Some(local_executor) = ctx.executors.local() {
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        init.background_tasks.spawn(async move {
            run_connection(local_executor, shutdown_rx).await;
        });
    }

    info!("Background tasks spawned");
}
