// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for gridfleet-manager integration tests.
//!
//! Provides [`TestFleet`]: a job manager driving the mock backend and the
//! mock transport over a private port range.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gridfleet_manager::backend::MockBackendFactory;
use gridfleet_manager::job_manager::{JobManager, PoolConfig};
use gridfleet_manager::port_allocator::{PortAllocator, PortAllocatorConfig};
use gridfleet_manager::resources::{AdmissionConfig, ResourceTracker};
use gridfleet_manager::rpc::mock::MockRpcTransport;

pub const VERSION: &str = "1.0";

/// Job manager wired to in-memory collaborators.
pub struct TestFleet {
    pub manager: Arc<JobManager>,
    pub factory: MockBackendFactory,
    pub ports: Arc<PortAllocator>,
    pub transport: Arc<MockRpcTransport>,
}

/// Builder for [`TestFleet`].
pub struct TestFleetBuilder {
    pool: PoolConfig,
    admission: AdmissionConfig,
    ports: PortAllocatorConfig,
    version: Option<String>,
    live_update: bool,
    transport_delay: Option<Duration>,
}

impl Default for TestFleetBuilder {
    fn default() -> Self {
        Self {
            pool: PoolConfig {
                ready_in_reserve: 0,
                ..Default::default()
            },
            admission: AdmissionConfig::default(),
            ports: PortAllocatorConfig {
                start: 46100,
                end: 46400,
                max_attempts: 1000,
            },
            version: Some(VERSION.to_string()),
            live_update: true,
            transport_delay: None,
        }
    }
}

impl TestFleetBuilder {
    pub fn max_instances(mut self, max: usize) -> Self {
        self.pool.max_instances = Some(max);
        self
    }

    pub fn ready_in_reserve(mut self, ready: usize) -> Self {
        self.pool.ready_in_reserve = ready;
        self
    }

    pub fn populate_threads(mut self, threads: usize) -> Self {
        self.pool.populate_threads = threads;
        self
    }

    pub fn max_instance_reuses(mut self, reuses: u32) -> Self {
        self.pool.max_instance_reuses = reuses;
        self
    }

    pub fn admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    pub fn port_range(mut self, start: u16, end: u16) -> Self {
        self.ports.start = start;
        self.ports.end = end;
        self
    }

    /// Behave like the process backend: limits recorded, not enforced.
    pub fn without_live_update(mut self) -> Self {
        self.live_update = false;
        self
    }

    /// Make every RPC call take `delay`.
    pub fn transport_delay(mut self, delay: Duration) -> Self {
        self.transport_delay = Some(delay);
        self
    }

    /// Start without a resolved version.
    pub fn unversioned(mut self) -> Self {
        self.version = None;
        self
    }

    pub fn build(self) -> TestFleet {
        let ports = Arc::new(PortAllocator::new(self.ports));
        let mut factory = MockBackendFactory::new(VERSION).with_port_allocator(ports.clone());
        if !self.live_update {
            factory = factory.without_live_update();
        }
        let transport = Arc::new(match self.transport_delay {
            Some(delay) => MockRpcTransport::with_delay(delay),
            None => MockRpcTransport::new(),
        });
        let resources = Arc::new(ResourceTracker::new(
            self.admission,
            self.pool.max_instances,
        ));

        let manager = Arc::new(JobManager::new(
            self.pool,
            Arc::new(factory.clone()),
            ports.clone(),
            resources,
            transport.clone(),
            Duration::from_secs(5),
        ));
        if let Some(version) = self.version {
            manager.set_version(version);
        }

        TestFleet {
            manager,
            factory,
            ports,
            transport,
        }
    }
}

impl TestFleet {
    pub fn builder() -> TestFleetBuilder {
        TestFleetBuilder::default()
    }

    pub fn new() -> Self {
        Self::builder().build()
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
