// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker backends - process and container execution of workers.
//!
//! Both variants implement [`WorkerBackend`] for a single worker and
//! [`BackendFactory`] for creating, discovering and recovering workers. The
//! variant is chosen once at start-up by [`select_factory`].

pub mod container;
pub mod mock;
pub mod probe;
pub mod process;
mod traits;

use std::sync::Arc;

use tracing::info;

pub use container::ContainerBackendFactory;
pub use mock::MockBackendFactory;
pub use probe::{ProvisioningConfig, StartupProbe};
pub use process::ProcessBackendFactory;
pub use traits::*;

use crate::config::{BackendKind, Config};
use crate::port_allocator::PortAllocator;
use crate::rpc::RpcTransport;

/// Build the backend factory for `config.backend`.
///
/// `auto` picks the container backend when a container image is configured
/// and the container runtime answers, and the process backend otherwise.
pub async fn select_factory(
    config: &Config,
    ports: Arc<PortAllocator>,
    transport: Arc<dyn RpcTransport>,
) -> Arc<dyn BackendFactory> {
    let kind = match config.backend {
        BackendKind::Auto => {
            let docker = container::docker::DockerCli::new(
                config.container.docker_bin.clone(),
                config.container.inspect_timeout,
            );
            if !config.container.image_name.is_empty() && docker.is_available().await {
                BackendKind::Container
            } else {
                BackendKind::Process
            }
        }
        explicit => explicit,
    };

    let probe = Arc::new(StartupProbe::new(config.provisioning.clone(), transport));

    let factory: Arc<dyn BackendFactory> = match kind {
        BackendKind::Container => Arc::new(ContainerBackendFactory::new(
            config.container.clone(),
            ports,
            probe,
        )),
        _ => Arc::new(ProcessBackendFactory::new(
            config.process.clone(),
            ports,
            probe,
        )),
    };

    info!(
        requested = ?config.backend,
        backend = factory.backend_type(),
        live_resource_update = factory.supports_live_resource_update(),
        "Worker backend selected"
    );
    factory
}
