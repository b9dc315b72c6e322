// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource admission control.
//!
//! Admission is evaluated against the totals currently committed to running
//! jobs. A request that would push any single dimension past its ceiling is
//! rejected outright.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ConfigError, env_bool, env_or};

/// Tolerance used when comparing fractional core counts.
pub const DOUBLE_EQUALITY_THRESHOLD: f64 = 1e-5;

/// Cores, memory and threads requested for (or committed to) a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Physical cores.
    pub max_cores: f64,
    /// Memory in MiB.
    pub max_memory_mb: i64,
    /// Thread ceiling.
    pub max_threads: i64,
}

impl ResourceLimits {
    /// Build a limit triple.
    pub fn new(max_cores: f64, max_memory_mb: i64, max_threads: i64) -> Self {
        Self {
            max_cores,
            max_memory_mb,
            max_threads,
        }
    }
}

impl std::ops::Add for ResourceLimits {
    type Output = ResourceLimits;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            max_cores: self.max_cores + rhs.max_cores,
            max_memory_mb: self.max_memory_mb + rhs.max_memory_mb,
            max_threads: self.max_threads + rhs.max_threads,
        }
    }
}

impl fmt::Display for ResourceLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cores={}, memory_mb={}, threads={}",
            self.max_cores, self.max_memory_mb, self.max_threads
        )
    }
}

/// Why a new job was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobRejectionReason {
    /// The fleet-wide instance ceiling is reached.
    MaxInstancesExceeded,
    /// Not enough cores left.
    CpuAllocationExceeded,
    /// Not enough memory left.
    MemoryAllocationExceeded,
    /// Not enough threads left.
    ThreadsAllocationExceeded,
}

impl fmt::Display for JobRejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MaxInstancesExceeded => "max instances exceeded",
            Self::CpuAllocationExceeded => "cpu allocation exceeded",
            Self::MemoryAllocationExceeded => "memory allocation exceeded",
            Self::ThreadsAllocationExceeded => "threads allocation exceeded",
        };
        f.write_str(s)
    }
}

/// Fleet-wide ceilings.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Physical cores available to workers.
    pub total_cores: f64,
    /// Threads available to workers.
    pub total_threads: i64,
    /// Memory available to workers, in MiB.
    pub total_memory_mb: i64,
    /// Enforce the core ceiling.
    pub cpu_check_enabled: bool,
    /// Enforce the thread ceiling.
    pub threads_check_enabled: bool,
    /// Enforce the memory ceiling.
    pub memory_check_enabled: bool,
    /// Multiplier applied to `total_cores`.
    pub cpu_over_allocation_ratio: f64,
    /// Multiplier applied to `total_threads`.
    pub threads_over_allocation_ratio: f64,
    /// Multiplier applied to `total_memory_mb`.
    pub memory_over_allocation_ratio: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            total_cores: 0.0,
            total_threads: 0,
            total_memory_mb: 0,
            cpu_check_enabled: false,
            threads_check_enabled: false,
            memory_check_enabled: false,
            cpu_over_allocation_ratio: 1.0,
            threads_over_allocation_ratio: 1.0,
            memory_over_allocation_ratio: 1.0,
        }
    }
}

impl AdmissionConfig {
    /// Load from `GRIDFLEET_ADMISSION_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            total_cores: env_or("GRIDFLEET_ADMISSION_TOTAL_CORES", d.total_cores)?,
            total_threads: env_or("GRIDFLEET_ADMISSION_TOTAL_THREADS", d.total_threads)?,
            total_memory_mb: env_or("GRIDFLEET_ADMISSION_TOTAL_MEMORY_MB", d.total_memory_mb)?,
            cpu_check_enabled: env_bool("GRIDFLEET_ADMISSION_CPU_CHECK", d.cpu_check_enabled),
            threads_check_enabled: env_bool(
                "GRIDFLEET_ADMISSION_THREADS_CHECK",
                d.threads_check_enabled,
            ),
            memory_check_enabled: env_bool(
                "GRIDFLEET_ADMISSION_MEMORY_CHECK",
                d.memory_check_enabled,
            ),
            cpu_over_allocation_ratio: env_or(
                "GRIDFLEET_ADMISSION_CPU_RATIO",
                d.cpu_over_allocation_ratio,
            )?,
            threads_over_allocation_ratio: env_or(
                "GRIDFLEET_ADMISSION_THREADS_RATIO",
                d.threads_over_allocation_ratio,
            )?,
            memory_over_allocation_ratio: env_or(
                "GRIDFLEET_ADMISSION_MEMORY_RATIO",
                d.memory_over_allocation_ratio,
            )?,
        })
    }
}

/// Tracks committed resources and answers admission queries.
pub struct ResourceTracker {
    config: AdmissionConfig,
    max_instances: Option<usize>,
    allocated: Mutex<ResourceLimits>,
}

impl ResourceTracker {
    /// Create a tracker. `max_instances` is the fleet-wide instance ceiling.
    pub fn new(config: AdmissionConfig, max_instances: Option<usize>) -> Self {
        Self {
            config,
            max_instances,
            allocated: Mutex::new(ResourceLimits::default()),
        }
    }

    /// A tracker that admits everything.
    pub fn unlimited() -> Self {
        Self::new(AdmissionConfig::default(), None)
    }

    /// Whether any per-resource check is enabled.
    pub fn is_resource_allocation_check_enabled(&self) -> bool {
        self.config.cpu_check_enabled
            || self.config.threads_check_enabled
            || self.config.memory_check_enabled
    }

    /// Instance ceiling, if any.
    pub fn max_instances(&self) -> Option<usize> {
        self.max_instances
    }

    /// Replace the committed totals.
    pub fn update_resource_allocation(&self, allocated: ResourceLimits) {
        *self.lock() = allocated;
    }

    /// Committed totals.
    pub fn allocated(&self) -> ResourceLimits {
        *self.lock()
    }

    /// Instance-count gate. `instances_after` is the fleet size if the
    /// request were admitted.
    pub fn check_instance_count(&self, instances_after: usize) -> Result<(), JobRejectionReason> {
        match self.max_instances {
            Some(max) if instances_after > max => Err(JobRejectionReason::MaxInstancesExceeded),
            _ => Ok(()),
        }
    }

    /// Per-resource gate against the committed totals.
    ///
    /// Cores are checked first, then threads, then memory.
    pub fn is_resource_available(&self, needed: &ResourceLimits) -> Result<(), JobRejectionReason> {
        let allocated = self.allocated();
        let c = &self.config;

        let cpu_ok = needed.max_cores <= 0.0
            || !c.cpu_check_enabled
            || allocated.max_cores + needed.max_cores
                < c.total_cores * c.cpu_over_allocation_ratio + DOUBLE_EQUALITY_THRESHOLD;
        if !cpu_ok {
            debug!(allocated = %allocated, needed = %needed, "Rejecting request: cores");
            return Err(JobRejectionReason::CpuAllocationExceeded);
        }

        let threads_ok = needed.max_threads <= 0
            || !c.threads_check_enabled
            || ((allocated.max_threads + needed.max_threads) as f64)
                < c.total_threads as f64 * c.threads_over_allocation_ratio
                    + DOUBLE_EQUALITY_THRESHOLD;
        if !threads_ok {
            debug!(allocated = %allocated, needed = %needed, "Rejecting request: threads");
            return Err(JobRejectionReason::ThreadsAllocationExceeded);
        }

        let memory_ok = needed.max_memory_mb <= 0
            || !c.memory_check_enabled
            || ((allocated.max_memory_mb + needed.max_memory_mb) as f64)
                < c.total_memory_mb as f64 * c.memory_over_allocation_ratio
                    + DOUBLE_EQUALITY_THRESHOLD;
        if !memory_ok {
            debug!(allocated = %allocated, needed = %needed, "Rejecting request: memory");
            return Err(JobRejectionReason::MemoryAllocationExceeded);
        }

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResourceLimits> {
        self.allocated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
