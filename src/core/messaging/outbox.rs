// src/core/messaging/outbox.rs

//! The process-wide send queue and its flusher.
//!
//! Sends never touch the transport directly: frames are queued here, and a
//! single flusher task drains the queue in bounded passes, backing off when
//! the transport pushes back.

use crate::core::HelmsmanError;
use crate::core::messaging::transport::{ClusterTransport, MulticastOutcome};
use crate::core::triggers::Trigger;
use crate::config::ClusterConfig;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

/// FIFO of encoded frames awaiting multicast.
pub struct Outbox {
    queue: Mutex<VecDeque<Bytes>>,
    trigger: Arc<Trigger>,
    seq: AtomicU64,
    sent_total: AtomicU64,
    warn_threshold: usize,
}

impl Outbox {
    pub fn new(warn_threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            trigger: Trigger::new(),
            seq: AtomicU64::new(1),
            sent_total: AtomicU64::new(0),
            warn_threshold,
        })
    }

    /// Allocates the next frame sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn sent_total(&self) -> u64 {
        self.sent_total.load(Ordering::Relaxed)
    }

    /// Queues a frame and pokes the flusher. Queue growth past the warning
    /// threshold is reported once, then again at every multiple of 1000.
    pub fn enqueue(&self, frame: Bytes) {
        let len = {
            let mut queue = self.queue.lock();
            queue.push_back(frame);
            queue.len()
        };

        if len == self.warn_threshold {
            warn!("Cluster send queue has grown to {}", len);
        } else if len > 1 && len % 1000 == 0 {
            error!("Cluster send queue has grown to {}", len);
        }

        self.trigger.set();
    }

    fn pop(&self) -> Option<Bytes> {
        self.queue.lock().pop_front()
    }

    fn push_front(&self, frame: Bytes) {
        self.queue.lock().push_front(frame);
    }
}

/// Drains the outbox until shutdown. One flush pass sends at most
/// `flush_batch` frames; transport backpressure stops the pass and re-arms a
/// retry delay scaled by the queue length.
pub async fn run_flusher(
    outbox: Arc<Outbox>,
    transport: Arc<dyn ClusterTransport>,
    config: ClusterConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Messaging flusher started");
    loop {
        tokio::select! {
            _ = outbox.trigger.fired() => {}
            _ = shutdown_rx.recv() => {
                let left = outbox.len();
                if left > 0 {
                    warn!("Messaging flusher stopping with {} frames unsent", left);
                }
                return;
            }
        }

        let mut sent = 0usize;
        let mut backpressure = false;

        while sent < config.flush_batch {
            let Some(frame) = outbox.pop() else { break };

            match transport.multicast(frame.clone()).await {
                Ok(MulticastOutcome::Accepted) => {
                    sent += 1;
                    outbox.sent_total.fetch_add(1, Ordering::Relaxed);
                    trace!("Multicast frame of {} bytes", frame.len());
                }
                Ok(MulticastOutcome::Backpressure) => {
                    outbox.push_front(frame);
                    backpressure = true;
                    break;
                }
                Err(e) => {
                    // The frame is lost; peers recover via the join/CIB
                    // reconciliation paths, not via transport retry.
                    error!("Multicast failed, dropping frame: {}", e);
                    sent += 1;
                }
            }
        }

        let remaining = outbox.len();
        if sent > 1 || remaining > 0 {
            info!("Sent {} cluster messages ({} remaining)", sent, remaining);
        }

        if remaining > 0 {
            if backpressure {
                let scaled = config.flush_backoff_min
                    + Duration::from_millis(10) * (remaining as u32).min(100);
                let delay = scaled.min(config.flush_backoff_max);
                trace!("Transport backpressure, retrying flush in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
            outbox.trigger.set();
        }
    }
}
