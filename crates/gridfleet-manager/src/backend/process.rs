// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process backend.
//!
//! Workers are plain OS processes launched as `<executable> <port> [args...]`
//! with the worker version exported in their environment. Discovery reads
//! the host process table, so workers that outlive the manager can be found
//! and adopted again: the port comes from the first argument and the version
//! from the environment.
//!
//! Resource ceilings cannot be applied to a running process; updates are
//! recorded but not enforced.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::probe::{StartupProbe, resolve_version};
use super::traits::*;
use crate::config::{ConfigError, env_list, env_millis, env_opt, env_or, env_secs};
use crate::port_allocator::PortAllocator;
use crate::resources::ResourceLimits;

/// Environment variable carrying the worker version into the process.
pub const WORKER_VERSION_ENV: &str = "GRID_SERVER_VERSION";

/// Process backend configuration.
#[derive(Debug, Clone)]
pub struct ProcessBackendConfig {
    /// Worker executable
    pub executable: PathBuf,
    /// Working directory for launched workers
    pub working_dir: Option<PathBuf>,
    /// Arguments appended after the port
    pub args: Vec<String>,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_wait: Duration,
    /// Exit poll interval while stopping
    pub stop_poll_interval: Duration,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("grid-server"),
            working_dir: None,
            args: Vec::new(),
            stop_wait: Duration::from_secs(10),
            stop_poll_interval: Duration::from_millis(100),
        }
    }
}

impl ProcessBackendConfig {
    /// Load from `GRIDFLEET_WORKER_*` / `GRIDFLEET_PROCESS_*` environment variables.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            executable: env_or("GRIDFLEET_WORKER_EXECUTABLE", defaults.executable)?,
            working_dir: env_opt("GRIDFLEET_WORKER_WORKING_DIR")?,
            args: env_list("GRIDFLEET_WORKER_ARGS"),
            stop_wait: env_secs("GRIDFLEET_PROCESS_STOP_WAIT_SECS", defaults.stop_wait)?,
            stop_poll_interval: env_millis(
                "GRIDFLEET_PROCESS_STOP_POLL_MS",
                defaults.stop_poll_interval,
            )?,
        })
    }

    fn executable_name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.to_string_lossy().into_owned())
    }
}

/// Send `sig` to `pid`. Returns false when the process is already gone.
fn send_signal(pid: u32, sig: Signal) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {
            debug!(pid = pid, signal = ?sig, "Sent signal to worker process");
            true
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid = pid, "Process already dead (ESRCH)");
            false
        }
        Err(e) => {
            warn!(pid = pid, signal = ?sig, error = %e, "Failed to signal worker process");
            true
        }
    }
}

fn pid_alive(pid: u32) -> bool {
    !matches!(
        signal::kill(Pid::from_raw(pid as i32), None::<Signal>),
        Err(nix::errno::Errno::ESRCH)
    )
}

/// Port passed as the first argument on a worker command line.
fn parse_port_arg(cmd: &[String]) -> Option<u16> {
    cmd.get(1)?.trim().parse().ok()
}

/// Worker version from `KEY=VALUE` environment entries.
fn parse_version_env(environ: &[String]) -> Option<String> {
    environ.iter().find_map(|entry| {
        entry
            .strip_prefix(WORKER_VERSION_ENV)
            .and_then(|rest| rest.strip_prefix('='))
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

fn lossy(s: &OsStr) -> String {
    s.to_string_lossy().into_owned()
}

/// Snapshot of worker processes matching `executable_name`.
///
/// Only the process table is refreshed, with the exe, command line and
/// environment of each entry. Linux threads show up in that table with their
/// parent's command line and are skipped.
fn scan_processes(executable_name: &str) -> Vec<UnmanagedInstance> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::new()
            .with_exe(UpdateKind::OnlyIfNotSet)
            .with_cmd(UpdateKind::OnlyIfNotSet)
            .with_environ(UpdateKind::OnlyIfNotSet),
    );
    let own_pid = std::process::id();

    let mut workers: Vec<UnmanagedInstance> = sys
        .processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        .filter(|(_, process)| process.thread_kind().is_none())
        .filter(|(_, process)| {
            let exe_matches = process
                .exe()
                .and_then(|exe| exe.file_name())
                .map(|name| lossy(name) == executable_name)
                .unwrap_or(false);
            exe_matches || lossy(process.name()) == executable_name
        })
        .filter_map(|(pid, process)| {
            let cmd: Vec<String> = process.cmd().iter().map(|a| lossy(a)).collect();
            if cmd.is_empty() {
                return None;
            }
            let environ: Vec<String> = process.environ().iter().map(|e| lossy(e)).collect();
            let port = parse_port_arg(&cmd);
            let version = parse_version_env(&environ);

            let mut labels = HashMap::new();
            if let Some(port) = port {
                labels.insert("port".to_string(), port.to_string());
            }
            if let Some(version) = &version {
                labels.insert("grid_server_version".to_string(), version.clone());
            }

            Some(UnmanagedInstance {
                id: pid.as_u32().to_string(),
                name: lossy(process.name()),
                port,
                version,
                labels,
                limits: None,
            })
        })
        .collect();

    workers.sort_by_key(|w| w.id.parse::<u32>().unwrap_or(u32::MAX));
    workers
}

/// A worker running as an OS process.
pub struct ProcessWorker {
    config: Arc<ProcessBackendConfig>,
    ports: Arc<PortAllocator>,
    probe: Arc<StartupProbe>,
    name: String,
    port: u16,
    version: String,
    pid: Mutex<Option<u32>>,
    child: tokio::sync::Mutex<Option<Child>>,
    limits: Mutex<ResourceLimits>,
    disposed: AtomicBool,
}

impl ProcessWorker {
    fn new(
        config: Arc<ProcessBackendConfig>,
        ports: Arc<PortAllocator>,
        probe: Arc<StartupProbe>,
        port: u16,
        version: &str,
        limits: ResourceLimits,
        pid: Option<u32>,
    ) -> Self {
        Self {
            name: format!("{}-{}", config.executable_name(), port),
            config,
            ports,
            probe,
            port,
            version: version.to_string(),
            pid: Mutex::new(pid),
            child: tokio::sync::Mutex::new(None),
            limits: Mutex::new(limits),
            disposed: AtomicBool::new(false),
        }
    }

    fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_pid(&self, pid: u32) {
        *self.pid.lock().unwrap_or_else(|p| p.into_inner()) = Some(pid);
        self.ports.assign_owner(self.port, &pid.to_string());
    }

    /// Recorded (not enforced) ceilings.
    pub fn resource_limits(&self) -> ResourceLimits {
        *self.limits.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// A worker process already serving this port, left over from a
    /// previous manager.
    async fn find_listening_worker(&self) -> Option<u32> {
        let executable_name = self.config.executable_name();
        let workers = tokio::task::spawn_blocking(move || scan_processes(&executable_name))
            .await
            .ok()?;
        let existing = workers.into_iter().find(|w| w.port == Some(self.port))?;
        let pid: u32 = existing.id.parse().ok()?;

        let endpoint = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        match tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(endpoint)).await {
            Ok(Ok(_)) => Some(pid),
            _ => None,
        }
    }

    async fn launch(&self) -> Result<u32> {
        let mut cmd = Command::new(&self.config.executable);
        cmd.arg(self.port.to_string())
            .args(&self.config.args)
            .env(WORKER_VERSION_ENV, &self.version)
            .env("PORT", self.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| {
            BackendError::LaunchFailed(format!(
                "{}: {}",
                self.config.executable.display(),
                e
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| BackendError::LaunchFailed("process exited before reporting a pid".into()))?;

        *self.child.lock().await = Some(child);
        Ok(pid)
    }

    async fn wait_for_exit(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if self.has_exited().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.stop_poll_interval).await;
        }
    }
}

#[async_trait]
impl WorkerBackend for ProcessWorker {
    fn backend_type(&self) -> &'static str {
        "process"
    }

    fn id(&self) -> Option<String> {
        self.pid().map(|p| p.to_string())
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
        // Confirms the reservation; a no-op when the allocator handed out the port.
        self.ports.reserve(self.port, None);

        if let Some(pid) = self.find_listening_worker().await {
            info!(
                pid = pid,
                port = self.port,
                "Adopting worker process already listening on port"
            );
            self.set_pid(pid);
            return Ok(());
        }

        let pid = match self.launch().await {
            Ok(pid) => pid,
            Err(e) => {
                error!(port = self.port, error = %e, "Failed to launch worker process");
                self.dispose().await;
                return Err(e);
            }
        };
        self.set_pid(pid);
        debug!(
            pid = pid,
            port = self.port,
            version = %self.version,
            "Launched worker process"
        );

        self.probe.await_ready(self).await
    }

    async fn has_exited(&self) -> bool {
        {
            let mut child = self.child.lock().await;
            if let Some(child) = child.as_mut() {
                return !matches!(child.try_wait(), Ok(None));
            }
        }
        match self.pid() {
            Some(pid) => !pid_alive(pid),
            None => true,
        }
    }

    async fn wait_until_available(&self, force_try: bool) -> Result<()> {
        self.probe.wait_until_available(self, force_try).await
    }

    async fn update_resource_limits(&self, limits: ResourceLimits) -> Result<()> {
        debug!(
            port = self.port,
            limits = %limits,
            "Recording resource limits for process worker (not enforced)"
        );
        *self.limits.lock().unwrap_or_else(|p| p.into_inner()) = limits;
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(pid) = self.pid()
            && !self.has_exited().await
        {
            if send_signal(pid, Signal::SIGTERM) && !self.wait_for_exit(self.config.stop_wait).await {
                warn!(pid = pid, port = self.port, "Worker ignored SIGTERM, killing");
                send_signal(pid, Signal::SIGKILL);
                self.wait_for_exit(self.config.stop_poll_interval * 10).await;
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
        }

        self.ports.remove_port_from_cache_if_exists(self.port);
        info!(pid = ?self.pid(), port = self.port, "Disposed worker process");
    }

    fn supports_live_resource_update(&self) -> bool {
        false
    }
}

/// Creates and discovers process workers.
pub struct ProcessBackendFactory {
    config: Arc<ProcessBackendConfig>,
    ports: Arc<PortAllocator>,
    probe: Arc<StartupProbe>,
}

impl ProcessBackendFactory {
    /// Create a factory.
    pub fn new(
        config: ProcessBackendConfig,
        ports: Arc<PortAllocator>,
        probe: Arc<StartupProbe>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            ports,
            probe,
        }
    }
}

#[async_trait]
impl BackendFactory for ProcessBackendFactory {
    fn backend_type(&self) -> &'static str {
        "process"
    }

    fn create_worker(
        &self,
        port: u16,
        version: &str,
        limits: ResourceLimits,
    ) -> Arc<dyn WorkerBackend> {
        Arc::new(ProcessWorker::new(
            self.config.clone(),
            self.ports.clone(),
            self.probe.clone(),
            port,
            version,
            limits,
            None,
        ))
    }

    async fn try_list_running_workers(&self) -> Result<Vec<UnmanagedInstance>> {
        let executable_name = self.config.executable_name();
        tokio::task::spawn_blocking(move || scan_processes(&executable_name))
            .await
            .map_err(|e| BackendError::Io(std::io::Error::other(e)))
    }

    async fn recover_worker(&self, unmanaged: &UnmanagedInstance) -> Option<RecoveredWorker> {
        let (Some(port), Some(version)) = (unmanaged.port, unmanaged.version.as_deref()) else {
            debug!(pid = %unmanaged.id, "Worker process lacks port or version, not recovering");
            return None;
        };
        let pid: u32 = unmanaged.id.parse().ok()?;
        let limits = unmanaged.limits.unwrap_or_default();

        let worker = ProcessWorker::new(
            self.config.clone(),
            self.ports.clone(),
            self.probe.clone(),
            port,
            version,
            limits,
            Some(pid),
        );
        Some(RecoveredWorker {
            backend: Arc::new(worker),
            limits,
        })
    }

    async fn kill_unmanaged(&self, unmanaged: &UnmanagedInstance) {
        match unmanaged.id.parse::<u32>() {
            Ok(pid) => {
                send_signal(pid, Signal::SIGKILL);
            }
            Err(_) => warn!(id = %unmanaged.id, "Unmanaged worker id is not a pid"),
        }
        if let Some(port) = unmanaged.port {
            self.ports.remove_port_from_cache_if_exists(port);
        }
    }

    async fn latest_version(&self) -> Option<String> {
        let config = self.probe.config();
        resolve_version(config, config.worker_version.as_deref()).await
    }

    async fn on_version_change(&self, version: &str, is_startup: bool) -> bool {
        info!(version = %version, is_startup = is_startup, "Worker version changed");
        true
    }

    fn supports_live_resource_update(&self) -> bool {
        false
    }
}
