// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background reconciliation of the fleet against the host.
//!
//! [`Reconciler`] first blocks until a worker version is resolved and
//! recovers workers left running by a previous manager. It then repeats, on
//! a fixed interval:
//! 1. version check (rollout runs in the background so a slow image pull
//!    never delays the rest of the pass),
//! 2. unexpected-exit detection,
//! 3. recovery of untracked running workers,
//! 4. reserve pool top-up.
//!
//! [`ExpiredJobSweeper`] closes jobs whose lease lapsed, on its own shorter
//! interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, env_millis, env_secs};
use crate::job_manager::JobManager;

/// Reconciliation timings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,
    /// Interval between expired-job sweeps.
    pub expired_sweep_interval: Duration,
    /// How long past its lease a job may run before it is closed.
    pub expiry_grace: Duration,
    /// Lease given to jobs found running on recovered workers.
    pub recovered_job_lease: Duration,
    /// Retry interval while waiting for the first worker version.
    pub version_retry_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            expired_sweep_interval: Duration::from_secs(3),
            expiry_grace: Duration::from_secs(5),
            recovered_job_lease: Duration::from_secs(300),
            version_retry_interval: Duration::from_secs(1),
        }
    }
}

impl ReconcilerConfig {
    /// Load from `GRIDFLEET_*` reconciler variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            reconcile_interval: env_secs("GRIDFLEET_RECONCILE_INTERVAL_SECS", d.reconcile_interval)?,
            expired_sweep_interval: env_secs(
                "GRIDFLEET_EXPIRED_SWEEP_INTERVAL_SECS",
                d.expired_sweep_interval,
            )?,
            expiry_grace: env_secs("GRIDFLEET_EXPIRY_GRACE_SECS", d.expiry_grace)?,
            recovered_job_lease: env_secs(
                "GRIDFLEET_RECOVERED_JOB_LEASE_SECS",
                d.recovered_job_lease,
            )?,
            version_retry_interval: env_millis(
                "GRIDFLEET_VERSION_RETRY_INTERVAL_MS",
                d.version_retry_interval,
            )?,
        })
    }
}

/// Periodic reconciliation loop.
pub struct Reconciler {
    manager: Arc<JobManager>,
    config: ReconcilerConfig,
    version_check_running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a reconciler for `manager`.
    pub fn new(manager: Arc<JobManager>, config: ReconcilerConfig) -> Self {
        Self {
            manager,
            config,
            version_check_running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run start-up recovery, then reconcile until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Reconciler started"
        );

        if self.startup().await {
            loop {
                tokio::select! {
                    biased;

                    _ = self.shutdown.notified() => {
                        info!("Reconciler received shutdown signal");
                        break;
                    }

                    _ = tokio::time::sleep(self.config.reconcile_interval) => {
                        self.reconcile_once().await;
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Block until the first worker version resolves, then adopt every
    /// worker already running on the host. Returns false if shutdown was
    /// signalled first.
    pub async fn startup(&self) -> bool {
        while self.manager.get_version().is_none() {
            self.manager.check_version(true).await;
            if self.manager.get_version().is_some() {
                break;
            }

            warn!(
                retry_in_ms = self.config.version_retry_interval.as_millis() as u64,
                "Worker version not resolved yet"
            );
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler received shutdown signal during start-up");
                    return false;
                }

                _ = tokio::time::sleep(self.config.version_retry_interval) => {}
            }
        }

        let summary = self
            .manager
            .recover_running_instances(true, self.config.recovered_job_lease)
            .await;
        info!(
            version = ?self.manager.get_version(),
            mapped = summary.mapped,
            pooled = summary.pooled,
            killed = summary.killed,
            left_alone = summary.left_alone,
            "Start-up recovery complete"
        );

        self.manager.top_up_reserve_pool();
        true
    }

    /// One reconciliation pass.
    pub async fn reconcile_once(&self) {
        self.spawn_version_check();

        let exited = self.manager.detect_unexpected_exits().await;
        if !exited.is_empty() {
            error!(
                count = exited.len(),
                job_ids = ?exited.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(),
                "Jobs lost their instance unexpectedly"
            );
        }

        self.manager
            .recover_running_instances(false, self.config.recovered_job_lease)
            .await;

        let spawned = self.manager.top_up_reserve_pool();
        debug!(
            instances = self.manager.get_instance_count(),
            ready_instances = self.manager.get_ready_instance_count(),
            active_jobs = self.manager.get_active_jobs_count(),
            populating = spawned.len(),
            "Reconciliation pass complete"
        );
    }

    fn spawn_version_check(&self) {
        if self.version_check_running.swap(true, Ordering::SeqCst) {
            debug!("Version check still running, skipping");
            return;
        }

        let manager = self.manager.clone();
        let running = self.version_check_running.clone();
        tokio::spawn(async move {
            manager.check_version(false).await;
            running.store(false, Ordering::SeqCst);
        });
    }
}

/// Closes jobs whose lease lapsed or whose instance exited.
pub struct ExpiredJobSweeper {
    manager: Arc<JobManager>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl ExpiredJobSweeper {
    /// Create a sweeper for `manager`.
    pub fn new(manager: Arc<JobManager>, config: ReconcilerConfig) -> Self {
        Self {
            manager,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Sweep until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            sweep_interval_secs = self.config.expired_sweep_interval.as_secs(),
            expiry_grace_secs = self.config.expiry_grace.as_secs(),
            "Expired job sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Expired job sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.expired_sweep_interval) => {
                    let closed = self.manager.clear_expired_jobs(self.config.expiry_grace).await;
                    if closed > 0 {
                        info!(closed = closed, "Closed expired jobs");
                    }
                }
            }
        }

        info!("Expired job sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
        assert_eq!(config.expired_sweep_interval, Duration::from_secs(3));
        assert_eq!(config.expiry_grace, Duration::from_secs(5));
        assert_eq!(config.recovered_job_lease, Duration::from_secs(300));
    }
}
