// src/core/triggers.rs

//! Edge-triggered, coalescing wake sources.
//!
//! A `Trigger` is the cluster-daemon equivalent of a level-less "poke": any
//! number of `set()` calls between two wake-ups collapse into a single
//! firing. Handlers that run off a trigger must re-derive the work to do from
//! shared state, never from the number of pokes received.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A coalescing wake source for a single consumer task.
///
/// `set()` is cheap, re-entrancy safe, and may be called from any task or
/// from a completion callback. `fired()` waits until at least one `set()`
/// has happened since the last time it returned.
#[derive(Debug, Default)]
pub struct Trigger {
    armed: AtomicBool,
    notify: Notify,
}

impl Trigger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arms the trigger. Multiple sets before the consumer wakes coalesce
    /// into one firing.
    pub fn set(&self) {
        if !self.armed.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    /// Waits for the trigger to fire, then disarms it. Cancel-safe: dropping
    /// the future before completion leaves the armed state untouched.
    pub async fn fired(&self) {
        loop {
            if self.armed.swap(false, Ordering::AcqRel) {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking probe: consumes and reports a pending firing.
    pub fn take(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    /// Whether a firing is pending without consuming it.
    pub fn is_set(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}
