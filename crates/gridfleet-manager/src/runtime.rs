// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for gridfleet-manager.
//!
//! [`FleetRuntime`] wires the port allocator, admission control, a worker
//! backend and the job manager together and runs the background loops.
//!
//! ```rust,ignore
//! use gridfleet_manager::config::Config;
//! use gridfleet_manager::runtime::FleetRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = FleetRuntime::builder()
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let manager = runtime.job_manager();
//!     // ... hand out jobs ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backend::{BackendFactory, select_factory};
use crate::config::Config;
use crate::job_manager::JobManager;
use crate::port_allocator::PortAllocator;
use crate::reconciler::{ExpiredJobSweeper, Reconciler};
use crate::resources::ResourceTracker;
use crate::rpc::RpcTransport;
use crate::rpc::http::HttpRpcTransport;

/// Builder for creating a [`FleetRuntime`].
#[derive(Default)]
pub struct FleetRuntimeBuilder {
    config: Option<Config>,
    ports: Option<Arc<PortAllocator>>,
    factory: Option<Arc<dyn BackendFactory>>,
    transport: Option<Arc<dyn RpcTransport>>,
}

impl FleetRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Share a port allocator with the backend factory.
    ///
    /// Default: a new allocator over the configured range.
    pub fn port_allocator(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Use this backend factory instead of selecting one from the
    /// configuration.
    pub fn factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the RPC transport.
    ///
    /// Default: [`HttpRpcTransport`]
    pub fn transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<FleetRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        if config.ports.start >= config.ports.end {
            anyhow::bail!(
                "invalid port range [{}, {})",
                config.ports.start,
                config.ports.end
            );
        }

        let ports = self
            .ports
            .unwrap_or_else(|| Arc::new(PortAllocator::new(config.ports.clone())));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpRpcTransport::new()));

        Ok(FleetRuntimeConfig {
            config,
            ports,
            factory: self.factory,
            transport,
        })
    }
}

/// Configuration for a [`FleetRuntime`].
pub struct FleetRuntimeConfig {
    config: Config,
    ports: Arc<PortAllocator>,
    factory: Option<Arc<dyn BackendFactory>>,
    transport: Arc<dyn RpcTransport>,
}

impl FleetRuntimeConfig {
    /// Start the runtime, spawning the reconciler and expired-job sweeper.
    pub async fn start(self) -> Result<FleetRuntime> {
        let factory = match self.factory {
            Some(factory) => factory,
            None => select_factory(&self.config, self.ports.clone(), self.transport.clone()).await,
        };

        let resources = Arc::new(ResourceTracker::new(
            self.config.admission.clone(),
            self.config.pool.max_instances,
        ));

        let manager = Arc::new(JobManager::new(
            self.config.pool.clone(),
            factory.clone(),
            self.ports.clone(),
            resources,
            self.transport.clone(),
            self.config.provisioning.rpc_timeout,
        ));

        let reconciler = Reconciler::new(manager.clone(), self.config.reconciler.clone());
        let reconciler_shutdown = reconciler.shutdown_handle();
        let reconciler_handle = tokio::spawn(async move {
            reconciler.run().await;
        });

        let sweeper = ExpiredJobSweeper::new(manager.clone(), self.config.reconciler.clone());
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            sweeper.run().await;
        });

        info!(
            backend = factory.backend_type(),
            port_range_start = self.config.ports.start,
            port_range_end = self.config.ports.end,
            max_instances = ?self.config.pool.max_instances,
            ready_in_reserve = self.config.pool.ready_in_reserve,
            "FleetRuntime started"
        );

        Ok(FleetRuntime {
            manager,
            ports: self.ports,
            reconciler_handle,
            sweeper_handle,
            reconciler_shutdown,
            sweeper_shutdown,
        })
    }
}

/// A running fleet manager that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) to stop the background loops. Workers
/// are left running so a restarted manager can recover them.
pub struct FleetRuntime {
    manager: Arc<JobManager>,
    ports: Arc<PortAllocator>,
    reconciler_handle: JoinHandle<()>,
    sweeper_handle: JoinHandle<()>,
    reconciler_shutdown: Arc<Notify>,
    sweeper_shutdown: Arc<Notify>,
}

impl FleetRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FleetRuntimeBuilder {
        FleetRuntimeBuilder::new()
    }

    /// The job manager.
    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    /// The port allocator.
    pub fn port_allocator(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Check if the background loops are still running.
    pub fn is_running(&self) -> bool {
        !self.reconciler_handle.is_finished() && !self.sweeper_handle.is_finished()
    }

    /// Stop the background loops and wait for them to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("FleetRuntime shutting down...");

        self.reconciler_shutdown.notify_one();
        self.sweeper_shutdown.notify_one();

        if let Err(e) = self.reconciler_handle.await {
            error!("Reconciler task panicked: {}", e);
        }
        if let Err(e) = self.sweeper_handle.await {
            error!("Expired job sweeper task panicked: {}", e);
        }

        info!(
            instances = self.manager.get_instance_count(),
            active_jobs = self.manager.get_active_jobs_count(),
            "FleetRuntime shutdown complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackendFactory;
    use crate::backend::ProvisioningConfig;
    use crate::backend::container::ContainerBackendConfig;
    use crate::backend::process::ProcessBackendConfig;
    use crate::config::BackendKind;
    use crate::job_manager::PoolConfig;
    use crate::port_allocator::PortAllocatorConfig;
    use crate::reconciler::ReconcilerConfig;
    use crate::resources::AdmissionConfig;
    use crate::rpc::MockRpcTransport;

    fn test_config() -> Config {
        Config {
            backend: BackendKind::Process,
            ports: PortAllocatorConfig {
                start: 47300,
                end: 47400,
                max_attempts: 1000,
            },
            provisioning: ProvisioningConfig::default(),
            pool: PoolConfig {
                ready_in_reserve: 0,
                ..Default::default()
            },
            admission: AdmissionConfig::default(),
            process: ProcessBackendConfig::default(),
            container: ContainerBackendConfig::default(),
            reconciler: ReconcilerConfig::default(),
        }
    }

    #[test]
    fn test_builder_default_values() {
        let builder = FleetRuntimeBuilder::default();

        assert!(builder.config.is_none());
        assert!(builder.ports.is_none());
        assert!(builder.factory.is_none());
        assert!(builder.transport.is_none());
    }

    #[test]
    fn test_build_requires_config() {
        assert!(FleetRuntime::builder().build().is_err());
    }

    #[test]
    fn test_build_rejects_empty_port_range() {
        let mut config = test_config();
        config.ports.end = config.ports.start;

        assert!(FleetRuntime::builder().config(config).build().is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let config = test_config();
        let ports = Arc::new(PortAllocator::new(config.ports.clone()));
        let factory = MockBackendFactory::new("1.0").with_port_allocator(ports.clone());

        let runtime = FleetRuntime::builder()
            .config(config)
            .port_allocator(ports.clone())
            .factory(Arc::new(factory))
            .transport(Arc::new(MockRpcTransport::new()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        assert!(Arc::ptr_eq(runtime.port_allocator(), &ports));
        assert_eq!(runtime.job_manager().get_active_jobs_count(), 0);

        runtime.shutdown().await.unwrap();
    }
}
