// src/core/throttle.rs

//! Load-aware throttling for the transition engine.
//!
//! The graph engine refreshes its batch limit from here on every scheduling
//! pass, so a loaded node automatically slows the rate at which the DC pushes
//! resource operations at it.

use std::num::NonZeroUsize;
use sysinfo::System;
use tracing::{debug, trace};

/// Discrete load bands, from the ratio of the 1-minute load average to the
/// number of available CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadMode {
    Low,
    Medium,
    High,
    Extreme,
}

/// Computes job limits for the transition engine based on system load.
#[derive(Debug)]
pub struct Throttle {
    cpus: usize,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

impl Throttle {
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self { cpus }
    }

    /// Test constructor with a pinned CPU count.
    pub fn with_cpus(cpus: usize) -> Self {
        Self { cpus: cpus.max(1) }
    }

    fn classify(&self, load_one: f64) -> LoadMode {
        let ratio = load_one / self.cpus as f64;
        if ratio >= 2.0 {
            LoadMode::Extreme
        } else if ratio >= 1.4 {
            LoadMode::High
        } else if ratio >= 1.0 {
            LoadMode::Medium
        } else {
            LoadMode::Low
        }
    }

    /// Derives a concrete job limit for one scheduling pass.
    ///
    /// `configured` is the graph's own batch limit; `0` means unlimited. The
    /// returned limit only ever tightens the configured value, it never
    /// loosens it.
    pub fn total_job_limit(&self, configured: u32) -> u32 {
        let load_one = System::load_average().one;
        self.job_limit_for_load(configured, load_one)
    }

    /// Limit derivation for a given load reading, split out so policy can
    /// be tested without depending on the host's actual load average.
    pub fn job_limit_for_load(&self, configured: u32, load_one: f64) -> u32 {
        let mode = self.classify(load_one);
        let derived = match mode {
            LoadMode::Low => (self.cpus * 2) as u32,
            LoadMode::Medium => self.cpus.max(1) as u32,
            LoadMode::High => (self.cpus / 2).max(1) as u32,
            LoadMode::Extreme => 1,
        };

        let limit = if configured == 0 {
            derived
        } else {
            configured.min(derived)
        };

        if mode != LoadMode::Low {
            debug!(
                "Throttling batch limit to {} ({:?} load {:.2} across {} CPUs)",
                limit, mode, load_one, self.cpus
            );
        } else {
            trace!("Batch limit {} ({:?} load)", limit, mode);
        }
        limit
    }
}
