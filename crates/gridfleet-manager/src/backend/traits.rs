// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker backend trait definitions.
//!
//! Defines the contract shared by process and container workers, and the
//! factory that creates, discovers and recovers them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::resources::ResourceLimits;

/// Errors from backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The backing process or container could not be launched.
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// The worker never answered its health probe.
    #[error("Worker on port {port} did not become available after {attempts} attempts")]
    HealthProbeTimeout {
        /// Port probed.
        port: u16,
        /// Attempts made.
        attempts: u32,
    },

    /// The worker exited before it became available.
    #[error("Worker on port {port} exited during start")]
    ExitedDuringStart {
        /// Port the worker was started on.
        port: u16,
    },

    /// The post-start priming call failed.
    #[error("Priming worker on port {port} failed: {reason}")]
    PrimingFailed {
        /// Port of the worker.
        port: u16,
        /// Underlying failure.
        reason: String,
    },

    /// Pulling a worker image failed.
    #[error("Failed to pull image {image}: {reason}")]
    ImagePull {
        /// Image reference.
        image: String,
        /// Underlying failure.
        reason: String,
    },

    /// A container runtime command exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    Command {
        /// Command line (without the runtime binary).
        command: String,
        /// Standard error output.
        stderr: String,
    },

    /// The operation is not available on this backend.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// A worker found on the host, whether or not this manager tracks it.
///
/// Only externally observable metadata is carried.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnmanagedInstance {
    /// Process id or container id.
    pub id: String,
    /// Process or container name.
    pub name: String,
    /// Port the worker was started on, if it can be determined.
    pub port: Option<u16>,
    /// Worker version, if it can be determined.
    pub version: Option<String>,
    /// Raw labels (container) or derived metadata (process).
    pub labels: HashMap<String, String>,
    /// Currently applied resource ceilings, if inspectable.
    pub limits: Option<ResourceLimits>,
}

/// A worker rebuilt from an [`UnmanagedInstance`].
pub struct RecoveredWorker {
    /// Backend handle for the adopted worker.
    pub backend: Arc<dyn WorkerBackend>,
    /// Ceilings applied to it at the time of recovery.
    pub limits: ResourceLimits,
}

/// One worker: a process or a container listening on a single port.
///
/// `start` either leaves the worker healthy or disposes it; `dispose` is
/// idempotent, never fails and always releases the port reservation.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Backend type identifier (e.g., "process", "container", "mock")
    fn backend_type(&self) -> &'static str;

    /// Process id or container id, once known.
    fn id(&self) -> Option<String>;

    /// Human readable name.
    fn name(&self) -> &str;

    /// Port the worker listens on.
    fn port(&self) -> u16;

    /// Worker software version.
    fn version(&self) -> &str;

    /// Launch the worker and wait until it answers its health probe.
    ///
    /// On failure the worker has already been disposed and its port released.
    async fn start(&self) -> Result<()>;

    /// Whether the backing process or container is gone.
    async fn has_exited(&self) -> bool;

    /// Block until the worker answers its health probe.
    ///
    /// With `force_try` the probe keeps going even if the worker looks exited.
    async fn wait_until_available(&self, force_try: bool) -> Result<()>;

    /// Apply new ceilings to the running worker.
    ///
    /// Backends without live update record the ceilings and return `Ok`.
    async fn update_resource_limits(&self, limits: ResourceLimits) -> Result<()>;

    /// Stop the worker and release its port.
    async fn dispose(&self);

    /// Whether `update_resource_limits` is enforced on the running worker.
    fn supports_live_resource_update(&self) -> bool;
}

/// Creates, discovers and recovers workers of one kind.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Backend type identifier (e.g., "process", "container", "mock")
    fn backend_type(&self) -> &'static str;

    /// Build an unstarted worker for `port` running `version`.
    fn create_worker(
        &self,
        port: u16,
        version: &str,
        limits: ResourceLimits,
    ) -> Arc<dyn WorkerBackend>;

    /// Every worker of this kind currently running on the host.
    async fn try_list_running_workers(&self) -> Result<Vec<UnmanagedInstance>>;

    /// Like [`BackendFactory::try_list_running_workers`], but an inspection
    /// failure yields an empty list.
    async fn list_running_workers(&self) -> Vec<UnmanagedInstance> {
        match self.try_list_running_workers().await {
            Ok(workers) => workers,
            Err(e) => {
                warn!(
                    backend = self.backend_type(),
                    error = %e,
                    "Failed to list running workers"
                );
                Vec::new()
            }
        }
    }

    /// Rebuild a worker handle from discovery metadata.
    ///
    /// Returns `None` when port or version cannot be determined; such a
    /// worker must be left alone.
    async fn recover_worker(&self, unmanaged: &UnmanagedInstance) -> Option<RecoveredWorker>;

    /// Terminate a worker this manager does not track. Best effort.
    async fn kill_unmanaged(&self, unmanaged: &UnmanagedInstance);

    /// Currently published worker version.
    async fn latest_version(&self) -> Option<String>;

    /// Prepare for a new worker version. Returns false when the new version
    /// cannot be used yet (e.g. the image pull failed).
    async fn on_version_change(&self, version: &str, is_startup: bool) -> bool;

    /// Whether workers of this kind support live resource updates.
    fn supports_live_resource_update(&self) -> bool;
}
