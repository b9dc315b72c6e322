// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job manager - maps jobs to worker instances.
//!
//! The manager owns every instance it creates or adopts. Jobs are assigned
//! either a pre-warmed instance from the reserve pool or a freshly
//! provisioned one; closing a job recycles or disposes its instance.
//!
//! Bookkeeping lives in concurrent maps that are never held across an
//! `.await`: provisioning, health probing and disposal run with no lock
//! held, so a slow worker never stalls operations on other workers.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendFactory, UnmanagedInstance};
use crate::config::{ConfigError, env_opt, env_or};
use crate::error::{Error, Result};
use crate::instance::{Disposal, InstanceOptions, InstanceState, Job, ResourceJob, WorkerInstance};
use crate::port_allocator::PortAllocator;
use crate::resources::{JobRejectionReason, ResourceLimits, ResourceTracker};
use crate::rpc::{RpcError, RpcHandle, RpcRequest, RpcTransport, parse_jobs};

/// Reserve pool, reuse and instance ceilings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Fleet-wide instance ceiling
    pub max_instances: Option<usize>,
    /// Ready instances to keep warm
    pub ready_in_reserve: usize,
    /// Concurrent pool top-up provisions
    pub populate_threads: usize,
    /// Jobs an instance may serve before it is disposed
    pub max_instance_reuses: u32,
    /// Ceilings applied to instances created without an explicit request
    pub instance_limits: ResourceLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: None,
            ready_in_reserve: 2,
            populate_threads: 1,
            max_instance_reuses: 1,
            instance_limits: ResourceLimits::default(),
        }
    }
}

impl PoolConfig {
    /// Load from `GRIDFLEET_*` pool variables.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            max_instances: env_opt("GRIDFLEET_MAX_INSTANCES")?,
            ready_in_reserve: env_or("GRIDFLEET_READY_IN_RESERVE", d.ready_in_reserve)?,
            populate_threads: env_or("GRIDFLEET_POPULATE_THREADS", d.populate_threads)?,
            max_instance_reuses: env_or("GRIDFLEET_MAX_INSTANCE_REUSES", d.max_instance_reuses)?,
            instance_limits: ResourceLimits {
                max_cores: env_or("GRIDFLEET_INSTANCE_MAX_CORES", 0.0)?,
                max_memory_mb: env_or("GRIDFLEET_INSTANCE_MAX_MEMORY_MB", 0)?,
                max_threads: env_or("GRIDFLEET_INSTANCE_MAX_THREADS", 0)?,
            },
        })
    }
}

/// Result of [`JobManager::new_job`].
#[derive(Debug)]
pub enum NewJobOutcome {
    /// The job was assigned an instance.
    Assigned {
        /// Job-scoped RPC handle.
        handle: RpcHandle,
        /// Instance serving the job.
        instance: Arc<WorkerInstance>,
    },
    /// Admission control turned the job down; nothing was provisioned.
    Rejected(JobRejectionReason),
}

impl NewJobOutcome {
    /// RPC handle, if assigned.
    pub fn handle(&self) -> Option<&RpcHandle> {
        match self {
            Self::Assigned { handle, .. } => Some(handle),
            Self::Rejected(_) => None,
        }
    }

    /// Instance, if assigned.
    pub fn instance(&self) -> Option<&Arc<WorkerInstance>> {
        match self {
            Self::Assigned { instance, .. } => Some(instance),
            Self::Rejected(_) => None,
        }
    }

    /// Rejection reason, if rejected.
    pub fn rejection(&self) -> Option<JobRejectionReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            Self::Assigned { .. } => None,
        }
    }
}

/// What recovery did with one discovered worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Already tracked, or its port belongs to an in-flight provision.
    Skipped,
    /// Port or version unknown; left running and untracked.
    LeftAlone,
    /// Adopted as the instance of a job it was already running.
    MappedToJob(String),
    /// Adopted into the reserve pool.
    Pooled,
    /// Out of date or unhealthy; terminated.
    Killed,
}

/// Tally of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Workers mapped to a job.
    pub mapped: usize,
    /// Workers added to the reserve pool.
    pub pooled: usize,
    /// Workers terminated.
    pub killed: usize,
    /// Workers left alone.
    pub left_alone: usize,
    /// Workers already known.
    pub skipped: usize,
}

impl RecoverySummary {
    fn record(&mut self, outcome: &RecoveryOutcome) {
        match outcome {
            RecoveryOutcome::Skipped => self.skipped += 1,
            RecoveryOutcome::LeftAlone => self.left_alone += 1,
            RecoveryOutcome::MappedToJob(_) => self.mapped += 1,
            RecoveryOutcome::Pooled => self.pooled += 1,
            RecoveryOutcome::Killed => self.killed += 1,
        }
    }
}

#[derive(Clone)]
struct ActiveJob {
    job: Job,
    instance: Arc<WorkerInstance>,
    assignment: u64,
}

/// Decrements an in-flight counter on drop.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Worker ids seen by one listing of the backend.
struct RunningWorkers {
    ids: HashSet<String>,
    listed_at: DateTime<Utc>,
}

impl RunningWorkers {
    /// Absent from the listing. Instances created after the listing began
    /// cannot be in it and never count as missing.
    fn is_missing(&self, instance: &WorkerInstance) -> bool {
        instance.created_at() < self.listed_at && !self.ids.contains(instance.id())
    }

    fn has_exited(&self, instance: &WorkerInstance) -> bool {
        instance.state() == InstanceState::Disposed || self.is_missing(instance)
    }
}

/// Maps jobs to worker instances.
pub struct JobManager {
    pool: PoolConfig,
    factory: Arc<dyn BackendFactory>,
    ports: Arc<PortAllocator>,
    resources: Arc<ResourceTracker>,
    transport: Arc<dyn RpcTransport>,
    rpc_timeout: Duration,
    active_jobs: DashMap<String, ActiveJob>,
    instances: DashMap<String, Arc<WorkerInstance>>,
    ready: Mutex<Vec<Arc<WorkerInstance>>>,
    populating: AtomicUsize,
    provisioning: AtomicUsize,
    unexpected_exits: Mutex<Vec<Job>>,
    version: RwLock<Option<String>>,
}

impl JobManager {
    /// Create a manager. Nothing is provisioned until the first job or
    /// the first pool top-up.
    pub fn new(
        pool: PoolConfig,
        factory: Arc<dyn BackendFactory>,
        ports: Arc<PortAllocator>,
        resources: Arc<ResourceTracker>,
        transport: Arc<dyn RpcTransport>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            factory,
            ports,
            resources,
            transport,
            rpc_timeout,
            active_jobs: DashMap::new(),
            instances: DashMap::new(),
            ready: Mutex::new(Vec::new()),
            populating: AtomicUsize::new(0),
            provisioning: AtomicUsize::new(0),
            unexpected_exits: Mutex::new(Vec::new()),
            version: RwLock::new(None),
        }
    }

    /// Pool configuration.
    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool
    }

    /// Backend factory.
    pub fn factory(&self) -> &Arc<dyn BackendFactory> {
        &self.factory
    }

    // ========================================================================
    // Job lifecycle
    // ========================================================================

    /// Assign `job` to an instance.
    ///
    /// Admission control runs first; a rejection consumes no instance and
    /// no port. Otherwise a ready instance is taken from the reserve pool,
    /// or one is provisioned synchronously when the pool is empty or
    /// `wait_for_ready` is set. The handle is only returned once the instance
    /// has passed its health probe.
    ///
    /// With `add_to_active_jobs == false` the caller owns the assignment
    /// and must release it through [`JobManager::close_unmapped_instance`].
    pub async fn new_job(
        &self,
        job: Job,
        wait_for_ready: bool,
        add_to_active_jobs: bool,
    ) -> Result<NewJobOutcome> {
        if add_to_active_jobs && self.active_jobs.contains_key(&job.id) {
            return Err(Error::JobAlreadyExists(job.id));
        }
        let version = self.require_version()?;
        let needed = job.resources.unwrap_or(self.pool.instance_limits);

        if let Err(reason) = self.is_resource_available(&needed).await {
            info!(job_id = %job.id, reason = %reason, "Job rejected by admission control");
            return Ok(NewJobOutcome::Rejected(reason));
        }

        let pooled = if wait_for_ready {
            None
        } else {
            self.pop_ready_instance(&version).await
        };

        let instance = match pooled {
            Some(instance) => {
                if job.resources.is_some() && instance.resource_limits() != needed {
                    self.apply_limits(&instance, needed).await;
                }
                instance
            }
            None => {
                self.provisioning.fetch_add(1, Ordering::SeqCst);
                let _slot = InFlight(&self.provisioning);
                let fleet_after = self.instances.len()
                    + self.populating.load(Ordering::SeqCst)
                    + self.provisioning.load(Ordering::SeqCst);
                if let Err(reason) = self.resources.check_instance_count(fleet_after) {
                    info!(
                        job_id = %job.id,
                        reason = %reason,
                        instances = self.instances.len(),
                        "Job rejected by admission control"
                    );
                    return Ok(NewJobOutcome::Rejected(reason));
                }

                self.provision_instance(&version, needed).await.map_err(|e| {
                    error!(job_id = %job.id, error = %e, "Failed to provision instance for job");
                    e
                })?
            }
        };

        instance.set_persistent(job.persistent);
        instance.set_lease(job.expiration_seconds);
        let assignment = instance.begin_assignment();

        if add_to_active_jobs {
            let mapped = match self.active_jobs.entry(job.id.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(ActiveJob {
                        job: job.clone(),
                        instance: instance.clone(),
                        assignment,
                    });
                    true
                }
            };
            if !mapped {
                // Lost a race with a concurrent new_job for the same id.
                self.close_unmapped_instance(instance, true).await;
                return Err(Error::JobAlreadyExists(job.id));
            }
        }

        info!(
            job_id = %job.id,
            instance_id = %instance.id(),
            port = instance.port(),
            version = %instance.version(),
            active_jobs = self.active_jobs.len(),
            ready_instances = self.get_ready_instance_count(),
            "Assigned instance to job"
        );

        let handle = RpcHandle::new(
            job.id,
            instance.clone(),
            assignment,
            self.transport.clone(),
            self.rpc_timeout,
        );
        Ok(NewJobOutcome::Assigned { handle, instance })
    }

    /// Handle for an active job.
    ///
    /// A job whose instance has exited is removed and reported as
    /// [`Error::InstanceExited`].
    pub async fn get_job(&self, job_id: &str) -> Result<RpcHandle> {
        let active = self
            .active_jobs
            .get(job_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        if active.instance.has_exited().await {
            warn!(job_id = %job_id, instance_id = %active.instance.id(), "Job instance has exited");
            self.remove_mapping(job_id, &active.instance);
            self.dispose_instance(&active.instance).await;
            return Err(Error::InstanceExited(job_id.to_string()));
        }

        Ok(self.handle_for(job_id, &active))
    }

    /// Close a job and recycle or dispose its instance.
    ///
    /// Closing an unknown job is a no-op. With `remove_from_active_jobs ==
    /// false` the mapping stays in place for the caller to drop and the
    /// instance is disposed rather than recycled. Returns whether a job was
    /// closed.
    pub async fn close_job(&self, job_id: &str, remove_from_active_jobs: bool) -> bool {
        let active = if remove_from_active_jobs {
            self.active_jobs.remove(job_id).map(|(_, active)| active)
        } else {
            self.active_jobs.get(job_id).map(|entry| entry.value().clone())
        };
        let Some(active) = active else {
            debug!(job_id = %job_id, "Close of unknown job ignored");
            return false;
        };

        info!(
            job_id = %job_id,
            instance_id = %active.instance.id(),
            "Closing job"
        );
        self.close_unmapped_instance(active.instance, remove_from_active_jobs)
            .await;
        true
    }

    /// Release an instance that is not (or no longer) mapped to a job.
    ///
    /// Outstanding handles are invalidated. The instance returns to the
    /// reserve pool when `attempt_to_recycle` is set, it is still alive and
    /// idle, it runs the current version, and its reuse budget is not spent;
    /// otherwise it is disposed.
    pub async fn close_unmapped_instance(
        &self,
        instance: Arc<WorkerInstance>,
        attempt_to_recycle: bool,
    ) {
        instance.begin_assignment();
        instance.set_persistent(false);

        if attempt_to_recycle && instance.is_poolable() && !instance.has_exited().await {
            let use_count = instance.increment_use_count();
            let current = self.get_version();

            if use_count < self.pool.max_instance_reuses {
                if current.as_deref() == Some(instance.version())
                    && instance.state() == InstanceState::Ready
                {
                    if instance.resource_limits() != self.pool.instance_limits {
                        self.apply_limits(&instance, self.pool.instance_limits).await;
                    }
                    instance.clear_lease();
                    self.push_ready(instance.clone());
                    info!(
                        instance_id = %instance.id(),
                        use_count = use_count,
                        ready_instances = self.get_ready_instance_count(),
                        "Recycled instance into reserve pool"
                    );
                    return;
                }
                info!(
                    instance_id = %instance.id(),
                    instance_version = %instance.version(),
                    current_version = ?current,
                    state = %instance.state(),
                    "Not recycling instance"
                );
            }
        }

        self.dispose_instance(&instance).await;
    }

    /// Extend an active job's lease. Never shortens it; no effect on jobs
    /// without a lease or whose instance has exited. Returns whether the
    /// expiry moved.
    pub async fn renew_lease(&self, job_id: &str, lease_time_in_seconds: f64) -> bool {
        let Some(instance) = self
            .active_jobs
            .get(job_id)
            .map(|entry| entry.instance.clone())
        else {
            return false;
        };
        if instance.lease().is_none() || instance.has_exited().await {
            return false;
        }

        let extended = instance.extend_lease(lease_time_in_seconds);
        if extended {
            debug!(
                job_id = %job_id,
                expires_at = ?instance.expires_at(),
                "Renewed job lease"
            );
        }
        extended
    }

    /// Push new ceilings to the instance serving `resource_job.job_id`.
    ///
    /// Returns whether the backend enforces them on the running worker; the
    /// process backend only records them.
    pub async fn update_grid_server_instance(&self, resource_job: &ResourceJob) -> Result<bool> {
        let instance = self
            .active_jobs
            .get(&resource_job.job_id)
            .map(|entry| entry.instance.clone())
            .ok_or_else(|| Error::JobNotFound(resource_job.job_id.clone()))?;

        if instance.has_exited().await {
            return Err(Error::InstanceExited(resource_job.job_id.clone()));
        }

        instance
            .backend()
            .update_resource_limits(resource_job.limits)
            .await?;
        instance.set_resource_limits(resource_job.limits);

        let enforced = instance.backend().supports_live_resource_update();
        info!(
            job_id = %resource_job.job_id,
            instance_id = %instance.id(),
            limits = %resource_job.limits,
            enforced = enforced,
            "Updated instance resource limits"
        );
        Ok(enforced)
    }

    /// Run `action` against the handle of every active job whose instance
    /// is alive, one after another. A failure is logged and collected; it
    /// never stops the broadcast.
    pub async fn dispatch_request_to_all_active_jobs<F, Fut>(
        &self,
        action: F,
    ) -> Vec<(String, RpcError)>
    where
        F: Fn(RpcHandle) -> Fut,
        Fut: Future<Output = std::result::Result<(), RpcError>>,
    {
        let active_jobs = self.snapshot_active_jobs();
        if active_jobs.is_empty() {
            return Vec::new();
        }
        let running = self.running_snapshot().await;
        let mut failures = Vec::new();

        for (job_id, active) in active_jobs {
            if running.as_ref().is_some_and(|r| r.has_exited(&active.instance)) {
                continue;
            }
            if let Err(e) = action(self.handle_for(&job_id, &active)).await {
                warn!(job_id = %job_id, error = %e, "Dispatch to active job failed");
                failures.push((job_id, e));
            }
        }
        failures
    }

    /// Map `job` to `instance`, replacing any existing mapping, and return
    /// a handle for the new assignment.
    pub fn add_or_update_active_job(&self, job: Job, instance: Arc<WorkerInstance>) -> RpcHandle {
        self.instances
            .entry(instance.id().to_string())
            .or_insert_with(|| instance.clone());

        let assignment = instance.begin_assignment();
        let previous = self.active_jobs.insert(
            job.id.clone(),
            ActiveJob {
                job: job.clone(),
                instance: instance.clone(),
                assignment,
            },
        );
        if let Some(previous) = previous
            && !Arc::ptr_eq(&previous.instance, &instance)
        {
            warn!(
                job_id = %job.id,
                previous_instance_id = %previous.instance.id(),
                instance_id = %instance.id(),
                "Replaced instance mapped to job"
            );
        }

        RpcHandle::new(
            job.id,
            instance,
            assignment,
            self.transport.clone(),
            self.rpc_timeout,
        )
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Resources committed to running active jobs, or `None` when no
    /// resource check is enabled.
    ///
    /// Liveness comes from a single worker listing. When the listing fails
    /// every active job is counted.
    pub async fn get_allocated_resource(&self) -> Option<ResourceLimits> {
        if !self.resources.is_resource_allocation_check_enabled() {
            return None;
        }

        let active_jobs = self.snapshot_active_jobs();
        let running = if active_jobs.is_empty() {
            None
        } else {
            self.running_snapshot().await
        };

        let mut allocated = ResourceLimits::default();
        for (_, active) in active_jobs {
            if !running.as_ref().is_some_and(|r| r.has_exited(&active.instance)) {
                allocated = allocated + active.instance.resource_limits();
            }
        }
        self.resources.update_resource_allocation(allocated);
        Some(allocated)
    }

    /// Whether `request` fits under the fleet ceilings right now.
    pub async fn is_resource_available(
        &self,
        request: &ResourceLimits,
    ) -> std::result::Result<(), JobRejectionReason> {
        if self.get_allocated_resource().await.is_none() {
            return Ok(());
        }
        self.resources.is_resource_available(request)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Instances tracked (ready and active).
    pub fn get_instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Instances waiting in the reserve pool.
    pub fn get_ready_instance_count(&self) -> usize {
        self.lock_ready().len()
    }

    /// Jobs currently mapped.
    pub fn get_active_jobs_count(&self) -> usize {
        self.active_jobs.len()
    }

    /// Ids of every mapped job.
    pub fn get_all_running_job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active_jobs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Jobs found to have lost their instance since the last call.
    pub fn get_unexpected_exit_game_jobs(&self) -> Vec<Job> {
        std::mem::take(
            &mut *self
                .unexpected_exits
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
        )
    }

    /// Id of the instance serving `job_id`.
    pub fn get_grid_server_instance_id(&self, job_id: &str) -> Option<String> {
        self.active_jobs
            .get(job_id)
            .map(|entry| entry.instance.id().to_string())
    }

    /// Worker version new instances are created with.
    pub fn get_version(&self) -> Option<String> {
        self.version.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Provisions in flight for the reserve pool.
    pub fn get_populating_count(&self) -> usize {
        self.populating.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Compare the published version with the current one and roll over
    /// on change: the backend prepares the new version, then out-of-date
    /// pool instances are culled. Running jobs are not touched. Returns
    /// whether the version changed.
    pub async fn check_version(&self, is_startup: bool) -> bool {
        let Some(latest) = self.factory.latest_version().await else {
            debug!("No worker version published");
            return false;
        };
        let current = self.get_version();
        if current.as_deref() == Some(latest.as_str()) {
            return false;
        }

        info!(
            current_version = ?current,
            new_version = %latest,
            is_startup = is_startup,
            "Worker version changed or loaded for the first time"
        );

        if !self.factory.on_version_change(&latest, is_startup).await {
            warn!(
                current_version = ?current,
                new_version = %latest,
                "Failed to change worker version"
            );
            return false;
        }

        *self.version.write().unwrap_or_else(|p| p.into_inner()) = Some(latest.clone());
        info!(version = %latest, "Worker version changed");
        self.kill_out_of_date_ready_instances().await;
        true
    }

    /// Dispose every pool instance not on the current version.
    pub async fn kill_out_of_date_ready_instances(&self) -> usize {
        let Some(current) = self.get_version() else {
            return 0;
        };
        let drained = std::mem::take(&mut *self.lock_ready());

        let (current_instances, stale): (Vec<_>, Vec<_>) = drained
            .into_iter()
            .partition(|instance| instance.version() == current);
        self.lock_ready().extend(current_instances);

        for instance in &stale {
            info!(
                instance_id = %instance.id(),
                version = %instance.version(),
                "Killing out-of-date ready instance"
            );
            self.dispose_instance(instance).await;
        }
        stale.len()
    }

    /// Close every active job whose instance no longer appears among the
    /// running workers, and remember it for
    /// [`JobManager::get_unexpected_exit_game_jobs`].
    ///
    /// Skipped entirely when the worker listing fails.
    pub async fn detect_unexpected_exits(&self) -> Vec<Job> {
        let Some(running) = self.running_snapshot().await else {
            warn!("Skipping unexpected exit detection, listing failed");
            return Vec::new();
        };

        let mut exited = Vec::new();
        for (job_id, active) in self.snapshot_active_jobs() {
            if !running.is_missing(&active.instance) {
                continue;
            }
            if !self.remove_mapping(&job_id, &active.instance) {
                continue;
            }

            warn!(
                job_id = %job_id,
                instance_id = %active.instance.id(),
                port = active.instance.port(),
                "Job instance exited unexpectedly"
            );
            self.dispose_instance(&active.instance).await;
            exited.push(active.job);
        }

        if !exited.is_empty() {
            self.unexpected_exits
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .extend(exited.iter().cloned());
        }
        exited
    }

    /// Close, without recycling, every job whose instance has exited or
    /// whose lease lapsed more than `grace` ago. Persistent jobs are exempt
    /// from lease expiry. Returns the number of jobs closed.
    ///
    /// Exits are read from a single worker listing; when it fails only
    /// lapsed leases are closed.
    pub async fn clear_expired_jobs(&self, grace: Duration) -> usize {
        let active_jobs = self.snapshot_active_jobs();
        if active_jobs.is_empty() {
            return 0;
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let running = self.running_snapshot().await;
        let mut closed = 0;

        for (job_id, active) in active_jobs {
            let lease_lapsed = !active.instance.is_persistent()
                && active
                    .instance
                    .expires_at()
                    .is_some_and(|expires_at| expires_at < cutoff);
            let exited = running.as_ref().is_some_and(|r| r.has_exited(&active.instance));

            if !lease_lapsed && !exited {
                continue;
            }
            if !self.remove_mapping(&job_id, &active.instance) {
                continue;
            }

            info!(
                job_id = %job_id,
                instance_id = %active.instance.id(),
                lease_lapsed = lease_lapsed,
                "Closing expired job"
            );
            self.close_unmapped_instance(active.instance, false).await;
            closed += 1;
        }
        closed
    }

    /// Recover every running worker this manager does not track.
    ///
    /// `force_wait` keeps probing workers that look exited (start-up).
    pub async fn recover_running_instances(
        &self,
        force_wait: bool,
        recovered_job_lease: Duration,
    ) -> RecoverySummary {
        let mut summary = RecoverySummary::default();
        let workers = self.factory.list_running_workers().await;

        for unmanaged in &workers {
            let outcome = self
                .recover_unmanaged(unmanaged, force_wait, recovered_job_lease)
                .await;
            summary.record(&outcome);
        }

        if summary != RecoverySummary::default() && summary.skipped != workers.len() {
            info!(
                discovered = workers.len(),
                mapped = summary.mapped,
                pooled = summary.pooled,
                killed = summary.killed,
                left_alone = summary.left_alone,
                "Recovered running instances"
            );
        }
        summary
    }

    /// Adopt one discovered worker.
    ///
    /// A worker already running a job is mapped to it with a lease of
    /// `recovered_job_lease`; an idle worker on the current version joins the
    /// reserve pool; an idle out-of-date worker is killed.
    pub async fn recover_unmanaged(
        &self,
        unmanaged: &UnmanagedInstance,
        force_wait: bool,
        recovered_job_lease: Duration,
    ) -> RecoveryOutcome {
        if self.instances.contains_key(&unmanaged.id) {
            return RecoveryOutcome::Skipped;
        }
        if let Some(port) = unmanaged.port
            && let Some(reservation) = self.ports.reservation(port)
        {
            debug!(
                id = %unmanaged.id,
                port = port,
                owner = ?reservation.owner_instance_id,
                "Worker port already reserved, skipping"
            );
            return RecoveryOutcome::Skipped;
        }

        let Some(recovered) = self.factory.recover_worker(unmanaged).await else {
            debug!(id = %unmanaged.id, "Worker cannot be recovered, leaving it alone");
            return RecoveryOutcome::LeftAlone;
        };
        let backend = recovered.backend;
        let port = backend.port();

        if !self.ports.reserve(port, Some(&unmanaged.id)) {
            return RecoveryOutcome::Skipped;
        }

        if let Err(e) = backend.wait_until_available(force_wait).await {
            warn!(id = %unmanaged.id, port = port, error = %e, "Recovered worker is not available, killing");
            self.factory.kill_unmanaged(unmanaged).await;
            self.ports.remove_port_from_cache_if_exists(port);
            return RecoveryOutcome::Killed;
        }

        let instance = Arc::new(WorkerInstance::new(
            backend,
            recovered.limits,
            InstanceOptions {
                is_poolable: true,
                ..Default::default()
            },
        ));

        let jobs = match self
            .transport
            .call(instance.endpoint(), &RpcRequest::GetAllJobs, self.rpc_timeout)
            .await
            .and_then(parse_jobs)
        {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(id = %unmanaged.id, error = %e, "Failed to list jobs on recovered worker");
                Vec::new()
            }
        };

        if let Some(remote) = jobs.first() {
            let job = Job::new(remote.id.clone(), recovered_job_lease.as_secs_f64());
            if self.active_jobs.contains_key(&job.id) {
                warn!(job_id = %job.id, id = %unmanaged.id, "Recovered worker runs a job that is already mapped, killing");
                instance.dispose().await;
                return RecoveryOutcome::Killed;
            }

            instance.set_lease(job.expiration_seconds);
            self.instances
                .insert(instance.id().to_string(), instance.clone());
            self.add_or_update_active_job(job.clone(), instance.clone());
            info!(
                job_id = %job.id,
                instance_id = %instance.id(),
                port = port,
                "Recovered worker mapped to running job"
            );
            return RecoveryOutcome::MappedToJob(job.id);
        }

        if self.get_version().as_deref() == Some(instance.version()) {
            self.instances
                .insert(instance.id().to_string(), instance.clone());
            self.push_ready(instance.clone());
            info!(instance_id = %instance.id(), port = port, "Recovered worker added to reserve pool");
            return RecoveryOutcome::Pooled;
        }

        info!(
            instance_id = %instance.id(),
            version = %instance.version(),
            current_version = ?self.get_version(),
            "Killing recovered worker with out-of-date version"
        );
        instance.dispose().await;
        RecoveryOutcome::Killed
    }

    /// Whether the reserve pool needs another instance.
    pub fn should_populate(&self) -> bool {
        let ready = self.get_ready_instance_count();
        let populating = self.populating.load(Ordering::SeqCst);
        if ready + populating >= self.pool.ready_in_reserve {
            return false;
        }

        let fleet = self.instances.len() + populating + self.provisioning.load(Ordering::SeqCst);
        if self.resources.check_instance_count(fleet + 1).is_err() {
            return false;
        }

        self.resources
            .is_resource_available(&self.pool.instance_limits)
            .is_ok()
    }

    /// Start pool top-up provisions, at most `populate_threads` in flight.
    /// Returns the spawned tasks.
    pub fn top_up_reserve_pool(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        let Some(version) = self.get_version() else {
            return tasks;
        };

        while self.populating.load(Ordering::SeqCst) < self.pool.populate_threads.max(1)
            && self.should_populate()
        {
            self.populating.fetch_add(1, Ordering::SeqCst);
            let manager = self.clone();
            let version = version.clone();

            tasks.push(tokio::spawn(async move {
                let _slot = InFlight(&manager.populating);
                match manager
                    .provision_instance(&version, manager.pool.instance_limits)
                    .await
                {
                    Ok(instance) => {
                        if manager.get_version().as_deref() == Some(instance.version()) {
                            manager.push_ready(instance.clone());
                            debug!(
                                instance_id = %instance.id(),
                                ready_instances = manager.get_ready_instance_count(),
                                "Added instance to reserve pool"
                            );
                        } else {
                            manager.dispose_instance(&instance).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to populate reserve pool");
                    }
                }
            }));
        }
        tasks
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn require_version(&self) -> Result<String> {
        self.get_version().ok_or(Error::VersionNotResolved)
    }

    async fn provision_instance(
        &self,
        version: &str,
        limits: ResourceLimits,
    ) -> Result<Arc<WorkerInstance>> {
        let port = self.ports.find_next_available_port()?;
        let backend = self.factory.create_worker(port, version, limits);

        // A failed start has already disposed the worker and released the port.
        backend.start().await?;

        let instance = Arc::new(WorkerInstance::new(
            backend,
            limits,
            InstanceOptions {
                is_poolable: true,
                ..Default::default()
            },
        ));
        self.instances
            .insert(instance.id().to_string(), instance.clone());
        Ok(instance)
    }

    async fn pop_ready_instance(&self, version: &str) -> Option<Arc<WorkerInstance>> {
        loop {
            let instance = self.lock_ready().pop()?;

            if instance.version() != version {
                info!(
                    instance_id = %instance.id(),
                    version = %instance.version(),
                    current_version = %version,
                    "Discarding out-of-date ready instance"
                );
                self.instances.remove(instance.id());
                tokio::spawn(async move {
                    instance.dispose().await;
                });
                continue;
            }

            if instance.has_exited().await {
                warn!(instance_id = %instance.id(), "Discarding exited ready instance");
                self.dispose_instance(&instance).await;
                continue;
            }

            return Some(instance);
        }
    }

    async fn apply_limits(&self, instance: &WorkerInstance, limits: ResourceLimits) {
        match instance.backend().update_resource_limits(limits).await {
            Ok(()) => instance.set_resource_limits(limits),
            Err(e) => warn!(
                instance_id = %instance.id(),
                limits = %limits,
                error = %e,
                "Failed to update instance resource limits"
            ),
        }
    }

    async fn dispose_instance(&self, instance: &Arc<WorkerInstance>) {
        self.instances.remove(instance.id());
        match instance.dispose().await {
            Disposal::Deferred => info!(
                instance_id = %instance.id(),
                "Instance busy, disposal deferred until its call completes"
            ),
            outcome => debug!(instance_id = %instance.id(), outcome = ?outcome, "Instance disposed"),
        }
    }

    /// Remove the mapping for `job_id` only if it still points at `instance`.
    fn remove_mapping(&self, job_id: &str, instance: &Arc<WorkerInstance>) -> bool {
        self.active_jobs
            .remove_if(job_id, |_, active| Arc::ptr_eq(&active.instance, instance))
            .is_some()
    }

    /// One listing of the running workers, or `None` when it fails.
    async fn running_snapshot(&self) -> Option<RunningWorkers> {
        let listed_at = Utc::now();
        match self.factory.try_list_running_workers().await {
            Ok(running) => Some(RunningWorkers {
                ids: running.into_iter().map(|w| w.id).collect(),
                listed_at,
            }),
            Err(e) => {
                warn!(error = %e, "Failed to list running workers");
                None
            }
        }
    }

    fn snapshot_active_jobs(&self) -> Vec<(String, ActiveJob)> {
        self.active_jobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn handle_for(&self, job_id: &str, active: &ActiveJob) -> RpcHandle {
        RpcHandle::new(
            job_id,
            active.instance.clone(),
            active.assignment,
            self.transport.clone(),
            self.rpc_timeout,
        )
    }

    fn push_ready(&self, instance: Arc<WorkerInstance>) {
        self.lock_ready().push(instance);
    }

    fn lock_ready(&self) -> std::sync::MutexGuard<'_, Vec<Arc<WorkerInstance>>> {
        self.ready.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Seed the current version (tests and embedders that resolve the
    /// version themselves).
    pub fn set_version(&self, version: impl Into<String>) {
        *self.version.write().unwrap_or_else(|p| p.into_inner()) = Some(version.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let pool = PoolConfig::default();

        assert_eq!(pool.max_instances, None);
        assert_eq!(pool.ready_in_reserve, 2);
        assert_eq!(pool.populate_threads, 1);
        assert_eq!(pool.max_instance_reuses, 1);
        assert_eq!(pool.instance_limits, ResourceLimits::default());
    }

    #[test]
    fn test_rejected_outcome_has_no_instance() {
        let outcome = NewJobOutcome::Rejected(JobRejectionReason::MemoryAllocationExceeded);

        assert!(outcome.handle().is_none());
        assert!(outcome.instance().is_none());
        assert_eq!(
            outcome.rejection(),
            Some(JobRejectionReason::MemoryAllocationExceeded)
        );
    }

    #[test]
    fn test_recovery_summary_tally() {
        let mut summary = RecoverySummary::default();
        for outcome in [
            RecoveryOutcome::Skipped,
            RecoveryOutcome::LeftAlone,
            RecoveryOutcome::MappedToJob("job-1".to_string()),
            RecoveryOutcome::Pooled,
            RecoveryOutcome::Pooled,
            RecoveryOutcome::Killed,
        ] {
            summary.record(&outcome);
        }

        assert_eq!(
            summary,
            RecoverySummary {
                mapped: 1,
                pooled: 2,
                killed: 1,
                left_alone: 1,
                skipped: 1,
            }
        );
    }
}
