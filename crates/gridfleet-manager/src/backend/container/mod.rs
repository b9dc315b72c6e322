// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container backend.
//!
//! Workers run as containers named `grid-server-<uuid>-gr` on the host
//! network. The `port`, `grid_server_version` and `image_name` labels are
//! always set together at creation; discovery and recovery read nothing
//! else. CPU ceilings are expressed as a quota over a fixed 100ms period,
//! scaled by the host's logical-to-physical core ratio.

pub mod docker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sysinfo::System;
use tracing::{debug, error, info, warn};

use self::docker::{
    ContainerInspect, ContainerSpec, DockerCli, IMAGE_NAME_LABEL, PORT_LABEL, ResourceUpdate,
    VERSION_LABEL, is_not_found,
};
use super::probe::{StartupProbe, resolve_version};
use super::traits::*;
use crate::config::{ConfigError, env_bool, env_list, env_millis, env_opt, env_or, env_secs};
use crate::port_allocator::PortAllocator;
use crate::resources::{DOUBLE_EQUALITY_THRESHOLD, ResourceLimits};

/// CPU scheduler period used for every worker container, in microseconds.
pub const CPU_PERIOD: i64 = 100_000;

/// Ratio assumed when the host topology cannot be read.
pub const DEFAULT_CORE_RATIO: f64 = 2.0;

const CONTAINER_NAME_PREFIX: &str = "grid-server-";
const CONTAINER_NAME_SUFFIX: &str = "-gr";
const MAXIMUM_THREADS_ENV: &str = "MAXIMUM_THREADS";
const MAXIMUM_MEMORY_ENV: &str = "MAXIMUM_MEMORY";

/// Container backend configuration.
#[derive(Debug, Clone)]
pub struct ContainerBackendConfig {
    /// Runtime binary (`docker`, `podman`, ...)
    pub docker_bin: String,
    /// Worker image name, without tag
    pub image_name: String,
    /// Image tag used when no version file is configured
    pub image_tag: Option<String>,
    /// Bind mounts as `source:target[:ro]`
    pub mounts: Vec<String>,
    /// Replaces the source of every mount when set
    pub mount_path_override: Option<String>,
    /// Extra `KEY=VALUE` environment entries
    pub environment: Vec<String>,
    /// DNS servers
    pub dns_servers: Vec<String>,
    /// Physical cores per worker when the worker's limits name none
    pub reserved_cores: Option<f64>,
    /// Memory ceiling per worker, in bytes, when the limits name none
    pub memory_bytes: Option<i64>,
    /// Thread ceiling per worker when the limits name none, passed as
    /// `MAXIMUM_THREADS`
    pub max_threads: Option<i64>,
    /// Logical-to-physical core ratio; detected from the host when unset
    pub core_ratio: Option<f64>,
    /// Grace period given to `stop` before the runtime kills
    pub stop_wait: Duration,
    /// Removal attempts before a final kill
    pub max_exit_attempts: u32,
    /// Sleep between removal attempts
    pub stop_poll_interval: Duration,
    /// Bound on a single image pull
    pub image_pull_timeout: Duration,
    /// Bound on every other runtime call
    pub inspect_timeout: Duration,
    /// Upper bound of the random delay before pre-pulling a new version
    pub max_pre_pull_jitter: Duration,
    /// Pull attempts on a version change
    pub pull_attempts: u32,
    /// Backoff base between pull attempts
    pub pull_backoff_base: Duration,
    /// Backoff ceiling between pull attempts
    pub pull_backoff_max: Duration,
    /// Remove anonymous volumes with the container
    pub remove_volumes: bool,
}

impl Default for ContainerBackendConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            image_name: String::new(),
            image_tag: None,
            mounts: Vec::new(),
            mount_path_override: None,
            environment: Vec::new(),
            dns_servers: Vec::new(),
            reserved_cores: None,
            memory_bytes: None,
            max_threads: None,
            core_ratio: None,
            stop_wait: Duration::from_secs(10),
            max_exit_attempts: 5,
            stop_poll_interval: Duration::from_millis(100),
            image_pull_timeout: Duration::from_secs(300),
            inspect_timeout: Duration::from_secs(30),
            max_pre_pull_jitter: Duration::from_secs(60),
            pull_attempts: 10,
            pull_backoff_base: Duration::from_millis(300),
            pull_backoff_max: Duration::from_secs(15),
            remove_volumes: true,
        }
    }
}

impl ContainerBackendConfig {
    /// Load from `GRIDFLEET_DOCKER_BIN` and `GRIDFLEET_CONTAINER_*` environment variables.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            docker_bin: env_or("GRIDFLEET_DOCKER_BIN", d.docker_bin)?,
            image_name: env_or("GRIDFLEET_CONTAINER_IMAGE", d.image_name)?,
            image_tag: env_opt("GRIDFLEET_CONTAINER_IMAGE_TAG")?,
            mounts: env_list("GRIDFLEET_CONTAINER_MOUNTS"),
            mount_path_override: env_opt("GRIDFLEET_CONTAINER_MOUNT_OVERRIDE")?,
            environment: env_list("GRIDFLEET_CONTAINER_ENV"),
            dns_servers: env_list("GRIDFLEET_CONTAINER_DNS"),
            reserved_cores: env_opt("GRIDFLEET_CONTAINER_RESERVED_CORES")?,
            memory_bytes: env_opt("GRIDFLEET_CONTAINER_MEMORY_BYTES")?,
            max_threads: env_opt("GRIDFLEET_CONTAINER_MAX_THREADS")?,
            core_ratio: env_opt("GRIDFLEET_CONTAINER_CORE_RATIO")?,
            stop_wait: env_secs("GRIDFLEET_CONTAINER_STOP_WAIT_SECS", d.stop_wait)?,
            max_exit_attempts: env_or("GRIDFLEET_CONTAINER_MAX_EXIT_ATTEMPTS", d.max_exit_attempts)?,
            stop_poll_interval: env_millis("GRIDFLEET_CONTAINER_STOP_POLL_MS", d.stop_poll_interval)?,
            image_pull_timeout: env_secs("GRIDFLEET_CONTAINER_PULL_TIMEOUT_SECS", d.image_pull_timeout)?,
            inspect_timeout: env_secs("GRIDFLEET_CONTAINER_INSPECT_TIMEOUT_SECS", d.inspect_timeout)?,
            max_pre_pull_jitter: env_secs("GRIDFLEET_CONTAINER_PRE_PULL_JITTER_SECS", d.max_pre_pull_jitter)?,
            pull_attempts: env_or("GRIDFLEET_CONTAINER_PULL_ATTEMPTS", d.pull_attempts)?,
            pull_backoff_base: env_millis("GRIDFLEET_CONTAINER_PULL_BACKOFF_BASE_MS", d.pull_backoff_base)?,
            pull_backoff_max: env_millis("GRIDFLEET_CONTAINER_PULL_BACKOFF_MAX_MS", d.pull_backoff_max)?,
            remove_volumes: env_bool("GRIDFLEET_CONTAINER_REMOVE_VOLUMES", d.remove_volumes),
        })
    }

    fn image_ref(&self, version: &str) -> String {
        format!("{}:{}", self.image_name, version)
    }

    fn resolved_mounts(&self) -> Vec<String> {
        match &self.mount_path_override {
            None => self.mounts.clone(),
            Some(source) => self
                .mounts
                .iter()
                .map(|mount| match mount.split_once(':') {
                    Some((_, rest)) => format!("{}:{}", source, rest),
                    None => format!("{}:{}", source, mount),
                })
                .collect(),
        }
    }
}

/// Logical CPUs per physical core on this host.
pub fn detect_core_ratio() -> f64 {
    let logical = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(0);
    match System::new().physical_core_count() {
        Some(physical) if physical > 0 && logical >= physical => logical as f64 / physical as f64,
        _ => DEFAULT_CORE_RATIO,
    }
}

/// Smallest CPU quota the runtime accepts, in microseconds.
pub const MIN_CPU_QUOTA: i64 = 1000;

/// CPU quota granting `cores` physical cores, never below [`MIN_CPU_QUOTA`].
pub fn calculate_cpu_quota(cores: f64, period: i64, core_ratio: f64) -> i64 {
    ((cores * core_ratio * period as f64).round() as i64).max(MIN_CPU_QUOTA)
}

/// Physical cores granted by `quota`.
pub fn cores_from_quota(quota: i64, period: i64, core_ratio: f64) -> f64 {
    if quota <= 0 || period <= 0 || core_ratio <= 0.0 {
        return 0.0;
    }
    quota as f64 / period as f64 / core_ratio
}

/// Full-jitter-halved ("equal jitter") exponential backoff for `attempt` (0-based).
pub fn equal_jitter_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(max);
    let half = exp / 2;
    let jitter = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
    half + Duration::from_millis(jitter)
}

/// Limits applied to an inspected container.
fn limits_from_inspect(inspect: &ContainerInspect, core_ratio: f64) -> ResourceLimits {
    let host = &inspect.host_config;
    let period = if host.cpu_period > 0 { host.cpu_period } else { CPU_PERIOD };
    let threads = inspect
        .config
        .env_var(MAXIMUM_THREADS_ENV)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    ResourceLimits {
        max_cores: cores_from_quota(host.cpu_quota, period, core_ratio),
        max_memory_mb: host.memory / 1024 / 1024,
        max_threads: threads,
    }
}

/// A worker running as a container.
pub struct ContainerWorker {
    cli: Arc<DockerCli>,
    config: Arc<ContainerBackendConfig>,
    ports: Arc<PortAllocator>,
    probe: Arc<StartupProbe>,
    core_ratio: f64,
    name: String,
    port: u16,
    version: String,
    id: Mutex<Option<String>>,
    limits: Mutex<ResourceLimits>,
    disposed: AtomicBool,
}

impl ContainerWorker {
    fn container_id(&self) -> Option<String> {
        self.id.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Container spec for this worker. The worker's own limits win; the
    /// configured per-worker values fill in what they leave unset.
    pub fn spec(&self) -> ContainerSpec {
        let limits = *self.limits.lock().unwrap_or_else(|p| p.into_inner());
        let config = &self.config;

        let cores = (limits.max_cores > 0.0)
            .then_some(limits.max_cores)
            .or(config.reserved_cores.filter(|c| *c > 0.0));
        let memory_bytes = (limits.max_memory_mb > 0)
            .then_some(limits.max_memory_mb * 1024 * 1024)
            .or(config.memory_bytes);
        let threads = (limits.max_threads > 0)
            .then_some(limits.max_threads)
            .or(config.max_threads);
        if limits.max_cores <= 0.0
            && let Some(reserved) = cores
        {
            debug!(name = %self.name, cores = reserved, "No cores requested, using reserved cores");
        }

        let mut env = vec![format!("PORT={}", self.port)];
        if let Some(threads) = threads.filter(|t| *t > 0) {
            env.push(format!("{}={}", MAXIMUM_THREADS_ENV, threads));
        }
        if let Some(memory_mb) = memory_bytes.map(|b| b / 1_048_576).filter(|m| *m > 0) {
            env.push(format!("{}={}", MAXIMUM_MEMORY_ENV, memory_mb));
        }
        env.extend(config.environment.iter().cloned());

        ContainerSpec {
            name: self.name.clone(),
            image: config.image_ref(&self.version),
            labels: vec![
                (PORT_LABEL.to_string(), self.port.to_string()),
                (VERSION_LABEL.to_string(), self.version.clone()),
                (IMAGE_NAME_LABEL.to_string(), config.image_name.clone()),
            ],
            env,
            mounts: config.resolved_mounts(),
            memory_bytes,
            cpu: cores.map(|c| (CPU_PERIOD, calculate_cpu_quota(c, CPU_PERIOD, self.core_ratio))),
            dns: config.dns_servers.clone(),
        }
    }

    async fn ensure_image(&self) -> Result<()> {
        let image = self.config.image_ref(&self.version);
        if self.cli.image_exists(&image).await {
            return Ok(());
        }
        info!(image = %image, "Worker image missing locally, pulling");
        self.cli.pull(&image, self.config.image_pull_timeout).await
    }

    async fn launch(&self) -> Result<()> {
        self.ensure_image().await?;

        let id = self.cli.create(&self.spec()).await?;
        *self.id.lock().unwrap_or_else(|p| p.into_inner()) = Some(id.clone());
        self.ports.assign_owner(self.port, &id);

        self.cli.start(&id).await?;
        debug!(
            container_id = %id,
            name = %self.name,
            port = self.port,
            version = %self.version,
            "Started worker container"
        );
        Ok(())
    }
}

/// Remove a container, retrying while the runtime still reports it busy.
/// The last attempt kills the container first.
async fn remove_with_retries(cli: &DockerCli, config: &ContainerBackendConfig, id: &str) {
    let attempts = config.max_exit_attempts.max(1);
    for attempt in 1..=attempts {
        if attempt == attempts && attempts > 1 {
            let _ = cli.kill(id).await;
        }
        match cli.remove(id, config.remove_volumes).await {
            Ok(()) => {
                debug!(container_id = %id, attempt = attempt, "Removed container");
                return;
            }
            Err(e) if is_not_found(&e) => return,
            Err(e) => {
                debug!(container_id = %id, attempt = attempt, error = %e, "Container removal failed");
                if attempt < attempts {
                    tokio::time::sleep(config.stop_poll_interval).await;
                }
            }
        }
    }
    error!(container_id = %id, attempts = attempts, "Giving up removing container");
}

#[async_trait]
impl WorkerBackend for ContainerWorker {
    fn backend_type(&self) -> &'static str {
        "container"
    }

    fn id(&self) -> Option<String> {
        self.container_id()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn start(&self) -> Result<()> {
        self.ports.reserve(self.port, None);

        if let Err(e) = self.launch().await {
            error!(name = %self.name, port = self.port, error = %e, "Failed to launch worker container");
            self.dispose().await;
            return Err(e);
        }

        self.probe.await_ready(self).await
    }

    async fn has_exited(&self) -> bool {
        match self.container_id() {
            Some(id) => matches!(self.cli.is_running(&id).await, Some(false)),
            None => true,
        }
    }

    async fn wait_until_available(&self, force_try: bool) -> Result<()> {
        self.probe.wait_until_available(self, force_try).await
    }

    async fn update_resource_limits(&self, limits: ResourceLimits) -> Result<()> {
        let Some(id) = self.container_id() else {
            return Err(BackendError::Unsupported("update of a container that was never created"));
        };

        let cpu_quota = if limits.max_cores < DOUBLE_EQUALITY_THRESHOLD {
            -1
        } else {
            calculate_cpu_quota(limits.max_cores, CPU_PERIOD, self.core_ratio)
        };
        let update = ResourceUpdate {
            cpu_period: CPU_PERIOD,
            cpu_quota,
            memory_bytes: limits.max_memory_mb.max(0) * 1024 * 1024,
        };

        self.cli.update(&id, &update).await?;
        *self.limits.lock().unwrap_or_else(|p| p.into_inner()) = limits;
        info!(container_id = %id, limits = %limits, cpu_quota = cpu_quota, "Updated container resource limits");
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(id) = self.container_id() {
            if let Err(e) = self.cli.stop(&id, self.config.stop_wait).await
                && !is_not_found(&e)
            {
                warn!(container_id = %id, error = %e, "Failed to stop container");
            }
            remove_with_retries(&self.cli, &self.config, &id).await;
        }

        self.ports.remove_port_from_cache_if_exists(self.port);
        info!(container_id = ?self.container_id(), port = self.port, "Disposed worker container");
    }

    fn supports_live_resource_update(&self) -> bool {
        true
    }
}

/// Creates, discovers and recovers container workers.
pub struct ContainerBackendFactory {
    cli: Arc<DockerCli>,
    config: Arc<ContainerBackendConfig>,
    ports: Arc<PortAllocator>,
    probe: Arc<StartupProbe>,
    core_ratio: f64,
}

impl ContainerBackendFactory {
    /// Create a factory.
    pub fn new(
        config: ContainerBackendConfig,
        ports: Arc<PortAllocator>,
        probe: Arc<StartupProbe>,
    ) -> Self {
        let core_ratio = config.core_ratio.unwrap_or_else(detect_core_ratio);
        Self {
            cli: Arc::new(DockerCli::new(config.docker_bin.clone(), config.inspect_timeout)),
            config: Arc::new(config),
            ports,
            probe,
            core_ratio,
        }
    }

    /// Logical-to-physical core ratio used for quota computation.
    pub fn core_ratio(&self) -> f64 {
        self.core_ratio
    }

    fn new_worker(
        &self,
        name: String,
        port: u16,
        version: &str,
        limits: ResourceLimits,
        id: Option<String>,
    ) -> ContainerWorker {
        ContainerWorker {
            cli: self.cli.clone(),
            config: self.config.clone(),
            ports: self.ports.clone(),
            probe: self.probe.clone(),
            core_ratio: self.core_ratio,
            name,
            port,
            version: version.to_string(),
            id: Mutex::new(id),
            limits: Mutex::new(limits),
            disposed: AtomicBool::new(false),
        }
    }

    fn list_filters(&self) -> Vec<String> {
        vec![
            format!("name={}.*{}", CONTAINER_NAME_PREFIX, CONTAINER_NAME_SUFFIX),
            "status=running".to_string(),
            format!("label={}={}", IMAGE_NAME_LABEL, self.config.image_name),
        ]
    }

    /// Pull `image`, retrying with equal-jitter backoff.
    async fn pull_with_retries(&self, image: &str) -> bool {
        let attempts = self.config.pull_attempts.max(1);
        for attempt in 0..attempts {
            if self.cli.image_exists(image).await {
                return true;
            }
            match self.cli.pull(image, self.config.image_pull_timeout).await {
                Ok(()) => {
                    info!(image = %image, attempts = attempt + 1, "Pulled worker image");
                    return true;
                }
                Err(e) => {
                    warn!(image = %image, attempt = attempt + 1, error = %e, "Failed to pull worker image");
                    if attempt + 1 < attempts {
                        let delay = equal_jitter_backoff(
                            attempt,
                            self.config.pull_backoff_base,
                            self.config.pull_backoff_max,
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        error!(image = %image, attempts = attempts, "Giving up pulling worker image");
        false
    }
}

#[async_trait]
impl BackendFactory for ContainerBackendFactory {
    fn backend_type(&self) -> &'static str {
        "container"
    }

    fn create_worker(
        &self,
        port: u16,
        version: &str,
        limits: ResourceLimits,
    ) -> Arc<dyn WorkerBackend> {
        let name = format!(
            "{}{}{}",
            CONTAINER_NAME_PREFIX,
            uuid::Uuid::new_v4(),
            CONTAINER_NAME_SUFFIX
        );
        Arc::new(self.new_worker(name, port, version, limits, None))
    }

    async fn try_list_running_workers(&self) -> Result<Vec<UnmanagedInstance>> {
        let containers = self.cli.list(&self.list_filters()).await?;
        let mut workers = Vec::with_capacity(containers.len());

        for container in containers {
            let labels = container.label_map();
            let limits = match self.cli.inspect(&container.id).await {
                Ok(inspect) => Some(limits_from_inspect(&inspect, self.core_ratio)),
                Err(e) => {
                    debug!(container_id = %container.id, error = %e, "Failed to inspect container limits");
                    None
                }
            };
            workers.push(UnmanagedInstance {
                id: container.id.clone(),
                name: container.names.trim_start_matches('/').to_string(),
                port: labels.get(PORT_LABEL).and_then(|p| p.parse().ok()),
                version: labels.get(VERSION_LABEL).cloned(),
                labels,
                limits,
            });
        }
        Ok(workers)
    }

    async fn recover_worker(&self, unmanaged: &UnmanagedInstance) -> Option<RecoveredWorker> {
        let (Some(port), Some(version)) = (unmanaged.port, unmanaged.version.as_deref()) else {
            warn!(
                container_id = %unmanaged.id,
                "Container lacks port or version label, not recovering"
            );
            return None;
        };

        let limits = match unmanaged.limits {
            Some(limits) => limits,
            None => match self.cli.inspect(&unmanaged.id).await {
                Ok(inspect) => limits_from_inspect(&inspect, self.core_ratio),
                Err(e) => {
                    warn!(container_id = %unmanaged.id, error = %e, "Failed to inspect container, not recovering");
                    return None;
                }
            },
        };

        let worker = self.new_worker(
            unmanaged.name.clone(),
            port,
            version,
            limits,
            Some(unmanaged.id.clone()),
        );
        Some(RecoveredWorker {
            backend: Arc::new(worker),
            limits,
        })
    }

    async fn kill_unmanaged(&self, unmanaged: &UnmanagedInstance) {
        if let Err(e) = self.cli.kill(&unmanaged.id).await
            && !is_not_found(&e)
        {
            warn!(container_id = %unmanaged.id, error = %e, "Failed to kill container");
        }
        remove_with_retries(&self.cli, &self.config, &unmanaged.id).await;
        if let Some(port) = unmanaged.port {
            self.ports.remove_port_from_cache_if_exists(port);
        }
    }

    async fn latest_version(&self) -> Option<String> {
        let provisioning = self.probe.config();
        let fallback = self
            .config
            .image_tag
            .as_deref()
            .or(provisioning.worker_version.as_deref());
        resolve_version(provisioning, fallback).await
    }

    async fn on_version_change(&self, version: &str, is_startup: bool) -> bool {
        if !is_startup && !self.config.max_pre_pull_jitter.is_zero() {
            let max_ms = (self.config.max_pre_pull_jitter.as_millis() as u64).max(1);
            let delay = Duration::from_millis(rand::thread_rng().gen_range(0..max_ms));
            info!(version = %version, delay_ms = delay.as_millis() as u64, "Delaying pre-pull of new worker image");
            tokio::time::sleep(delay).await;
        }
        self.pull_with_retries(&self.config.image_ref(version)).await
    }

    fn supports_live_resource_update(&self) -> bool {
        true
    }
}
