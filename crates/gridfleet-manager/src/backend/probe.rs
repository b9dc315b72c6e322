// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Start-up probing shared by every backend.
//!
//! A worker counts as available once its port accepts a TCP connection and
//! it answers a `HelloWorld` call. After that a priming batch job warms it up
//! before it is handed to a job.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::traits::{BackendError, Result, WorkerBackend};
use crate::config::{ConfigError, env_bool, env_millis, env_opt, env_or, env_secs};
use crate::rpc::{RpcRequest, RpcTransport};

/// Script run by the priming batch job.
pub const PRIMING_SCRIPT: &str = "highavailability";

/// Start-up probing and version source configuration.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Probe attempts before a start is abandoned
    pub start_attempts: u32,
    /// Sleep between probe attempts
    pub wait_for_tcp_interval: Duration,
    /// Timeout of a single connect or `HelloWorld` probe
    pub probe_timeout: Duration,
    /// Require a `HelloWorld` answer, not just an open port
    pub probe_rpc: bool,
    /// Run the priming batch job after start
    pub prime_on_start: bool,
    /// Timeout of the priming batch job
    pub priming_timeout: Duration,
    /// Default timeout of job RPC calls
    pub rpc_timeout: Duration,
    /// File holding the published worker version
    pub version_file: Option<PathBuf>,
    /// Worker version used when no version file is configured
    pub worker_version: Option<String>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            start_attempts: 60,
            wait_for_tcp_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(5),
            probe_rpc: true,
            prime_on_start: true,
            priming_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(300),
            version_file: None,
            worker_version: None,
        }
    }
}

impl ProvisioningConfig {
    /// Load from `GRIDFLEET_*` environment variables.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            start_attempts: env_or("GRIDFLEET_START_ATTEMPTS", defaults.start_attempts)?,
            wait_for_tcp_interval: env_millis(
                "GRIDFLEET_WAIT_FOR_TCP_INTERVAL_MS",
                defaults.wait_for_tcp_interval,
            )?,
            probe_timeout: env_millis("GRIDFLEET_PROBE_TIMEOUT_MS", defaults.probe_timeout)?,
            probe_rpc: env_bool("GRIDFLEET_PROBE_RPC", defaults.probe_rpc),
            prime_on_start: env_bool("GRIDFLEET_PRIME_ON_START", defaults.prime_on_start),
            priming_timeout: env_secs("GRIDFLEET_PRIMING_TIMEOUT_SECS", defaults.priming_timeout)?,
            rpc_timeout: env_secs("GRIDFLEET_RPC_TIMEOUT_SECS", defaults.rpc_timeout)?,
            version_file: env_opt::<PathBuf>("GRIDFLEET_VERSION_FILE")?,
            worker_version: env_opt::<String>("GRIDFLEET_WORKER_VERSION")?,
        })
    }
}

/// Waits for freshly launched workers to come up.
pub struct StartupProbe {
    config: ProvisioningConfig,
    transport: Arc<dyn RpcTransport>,
}

impl StartupProbe {
    /// Create a probe using `transport` for the RPC checks.
    pub fn new(config: ProvisioningConfig, transport: Arc<dyn RpcTransport>) -> Self {
        Self { config, transport }
    }

    /// Probe configuration.
    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// Poll the worker until it answers, it exits, or attempts run out.
    pub async fn wait_until_available(
        &self,
        worker: &dyn WorkerBackend,
        force_try: bool,
    ) -> Result<()> {
        let port = worker.port();
        let endpoint = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let attempts = self.config.start_attempts.max(1);

        for attempt in 1..=attempts {
            if !force_try && worker.has_exited().await {
                warn!(port = port, attempt = attempt, "Worker exited while waiting for it to start");
                return Err(BackendError::ExitedDuringStart { port });
            }

            match self.probe_once(endpoint).await {
                Ok(()) => {
                    debug!(port = port, attempts = attempt, "Worker is available");
                    return Ok(());
                }
                Err(reason) => {
                    debug!(port = port, attempt = attempt, reason = %reason, "Worker not available yet");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.wait_for_tcp_interval).await;
            }
        }

        Err(BackendError::HealthProbeTimeout { port, attempts })
    }

    /// Run the priming batch job on the worker.
    pub async fn prime(&self, port: u16) -> Result<()> {
        let endpoint = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let request = RpcRequest::BatchJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            expiration_in_seconds: self.config.priming_timeout.as_secs_f64(),
            script: json!({ "name": PRIMING_SCRIPT, "arguments": {} }),
        };

        self.transport
            .call(endpoint, &request, self.config.priming_timeout)
            .await
            .map(|_| ())
            .map_err(|e| BackendError::PrimingFailed {
                port,
                reason: e.to_string(),
            })
    }

    /// Shared tail of every `start`: probe, prime, and on any failure
    /// dispose the worker before returning the error.
    pub async fn await_ready(&self, worker: &dyn WorkerBackend) -> Result<()> {
        let outcome: Result<()> = async {
            self.wait_until_available(worker, false).await?;
            if self.config.prime_on_start {
                self.prime(worker.port()).await?;
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(
                    port = worker.port(),
                    name = %worker.name(),
                    backend = worker.backend_type(),
                    "Worker started"
                );
                Ok(())
            }
            Err(e) => {
                warn!(port = worker.port(), error = %e, "Worker failed to start, disposing");
                worker.dispose().await;
                Err(e)
            }
        }
    }

    async fn probe_once(&self, endpoint: SocketAddr) -> std::result::Result<(), String> {
        match tokio::time::timeout(self.config.probe_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => drop(stream),
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err("connect timed out".to_string()),
        }

        if self.config.probe_rpc {
            self.transport
                .call(endpoint, &RpcRequest::HelloWorld, self.config.probe_timeout)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// Read a published version from `path`. Empty or unreadable files yield `None`.
pub async fn read_version_file(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let version = contents.trim();
            (!version.is_empty()).then(|| version.to_string())
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read version file");
            None
        }
    }
}

/// Version from the configured file, falling back to `fallback`.
pub async fn resolve_version(config: &ProvisioningConfig, fallback: Option<&str>) -> Option<String> {
    if let Some(path) = &config.version_file
        && let Some(version) = read_version_file(path).await
    {
        return Some(version);
    }
    fallback.map(str::to_string)
}
