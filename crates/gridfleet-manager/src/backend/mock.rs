// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! Simulates workers in memory. The factory and every worker it creates share
//! one state table, so tests can kill workers out of band, plant survivors of
//! a previous manager, or make starts fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::*;
use crate::port_allocator::PortAllocator;
use crate::resources::ResourceLimits;

#[derive(Debug, Clone)]
struct MockRecord {
    port: u16,
    version: Option<String>,
    running: bool,
    limits: ResourceLimits,
    disposals: usize,
}

#[derive(Default)]
struct MockState {
    workers: Mutex<HashMap<String, MockRecord>>,
    next_id: AtomicU64,
    started: AtomicU64,
    listings: AtomicU64,
    exit_checks: AtomicU64,
    fail_start: AtomicBool,
    fail_discovery: AtomicBool,
    start_delay: Mutex<Option<Duration>>,
    version: Mutex<String>,
    version_changes: Mutex<Vec<(String, bool)>>,
    killed_unmanaged: Mutex<Vec<String>>,
    reject_version_change: AtomicBool,
}

impl MockState {
    fn workers(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockRecord>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_id(&self) -> String {
        format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Mock worker factory.
#[derive(Clone)]
pub struct MockBackendFactory {
    state: Arc<MockState>,
    ports: Option<Arc<PortAllocator>>,
    live_update: bool,
}

impl MockBackendFactory {
    /// Create a factory publishing `version`.
    pub fn new(version: &str) -> Self {
        let state = MockState::default();
        *state.version.lock().unwrap_or_else(|p| p.into_inner()) = version.to_string();
        Self {
            state: Arc::new(state),
            ports: None,
            live_update: true,
        }
    }

    /// Release ports through `ports` when workers are disposed.
    pub fn with_port_allocator(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Behave like the process backend and not enforce live resource updates.
    pub fn without_live_update(mut self) -> Self {
        self.live_update = false;
        self
    }

    /// Make every subsequent start fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.state.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent start take `delay`.
    pub fn set_start_delay(&self, delay: Option<Duration>) {
        *self.state.start_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    /// Make discovery fail.
    pub fn set_fail_discovery(&self, fail: bool) {
        self.state.fail_discovery.store(fail, Ordering::SeqCst);
    }

    /// Make `on_version_change` report failure.
    pub fn set_reject_version_change(&self, reject: bool) {
        self.state
            .reject_version_change
            .store(reject, Ordering::SeqCst);
    }

    /// Publish a new worker version.
    pub fn set_version(&self, version: &str) {
        *self.state.version.lock().unwrap_or_else(|p| p.into_inner()) = version.to_string();
    }

    /// Kill a worker behind the manager's back.
    pub fn kill_out_of_band(&self, id: &str) {
        if let Some(record) = self.state.workers().get_mut(id) {
            record.running = false;
        }
    }

    /// Plant a running worker this factory did not create, as if it
    /// survived a previous manager. Returns its id.
    pub fn spawn_unmanaged(&self, port: u16, version: Option<&str>) -> String {
        let id = self.state.next_id();
        self.state.workers().insert(
            id.clone(),
            MockRecord {
                port,
                version: version.map(str::to_string),
                running: true,
                limits: ResourceLimits::default(),
                disposals: 0,
            },
        );
        id
    }

    /// Times the worker with `id` was torn down.
    pub fn dispose_count(&self, id: &str) -> usize {
        self.state
            .workers()
            .get(id)
            .map(|r| r.disposals)
            .unwrap_or(0)
    }

    /// Successful starts so far.
    pub fn started_count(&self) -> u64 {
        self.state.started.load(Ordering::SeqCst)
    }

    /// Calls to `try_list_running_workers`, failed ones included.
    pub fn listing_count(&self) -> u64 {
        self.state.listings.load(Ordering::SeqCst)
    }

    /// Per-worker `has_exited` checks.
    pub fn exit_check_count(&self) -> u64 {
        self.state.exit_checks.load(Ordering::SeqCst)
    }

    /// Workers currently running.
    pub fn running_count(&self) -> usize {
        self.state.workers().values().filter(|r| r.running).count()
    }

    /// Whether the worker with `id` is running.
    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .workers()
            .get(id)
            .map(|r| r.running)
            .unwrap_or(false)
    }

    /// Limits last applied to the worker with `id`.
    pub fn applied_limits(&self, id: &str) -> Option<ResourceLimits> {
        self.state.workers().get(id).map(|r| r.limits)
    }

    /// `(version, is_startup)` for every version change seen.
    pub fn version_changes(&self) -> Vec<(String, bool)> {
        self.state
            .version_changes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Ids passed to `kill_unmanaged`.
    pub fn killed_unmanaged(&self) -> Vec<String> {
        self.state
            .killed_unmanaged
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Mock worker.
pub struct MockWorker {
    state: Arc<MockState>,
    ports: Option<Arc<PortAllocator>>,
    id: Mutex<Option<String>>,
    name: String,
    port: u16,
    version: String,
    limits: Mutex<ResourceLimits>,
    disposed: AtomicBool,
    live_update: bool,
}

impl MockWorker {
    fn current_id(&self) -> Option<String> {
        self.id.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn release_port(&self) {
        if let Some(ports) = &self.ports {
            ports.remove_port_from_cache_if_exists(self.port);
        }
    }
}

#[async_trait]
impl WorkerBackend for MockWorker {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    fn id(&self) -> Option<String> {
        self.current_id()
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
        let delay = *self.state.start_delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.state.fail_start.load(Ordering::SeqCst) {
            self.dispose().await;
            return Err(BackendError::HealthProbeTimeout {
                port: self.port,
                attempts: 1,
            });
        }

        let id = self.state.next_id();
        self.state.workers().insert(
            id.clone(),
            MockRecord {
                port: self.port,
                version: Some(self.version.clone()),
                running: true,
                limits: *self.limits.lock().unwrap_or_else(|p| p.into_inner()),
                disposals: 0,
            },
        );
        *self.id.lock().unwrap_or_else(|p| p.into_inner()) = Some(id.clone());
        if let Some(ports) = &self.ports {
            ports.reserve(self.port, Some(&id));
            ports.assign_owner(self.port, &id);
        }
        self.state.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn has_exited(&self) -> bool {
        self.state.exit_checks.fetch_add(1, Ordering::SeqCst);
        match self.current_id() {
            Some(id) => !self
                .state
                .workers()
                .get(&id)
                .map(|r| r.running)
                .unwrap_or(false),
            None => true,
        }
    }

    async fn wait_until_available(&self, _force_try: bool) -> Result<()> {
        if self.has_exited().await {
            return Err(BackendError::ExitedDuringStart { port: self.port });
        }
        Ok(())
    }

    async fn update_resource_limits(&self, limits: ResourceLimits) -> Result<()> {
        *self.limits.lock().unwrap_or_else(|p| p.into_inner()) = limits;
        if self.live_update
            && let Some(id) = self.current_id()
            && let Some(record) = self.state.workers().get_mut(&id)
        {
            record.limits = limits;
        }
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.current_id()
            && let Some(record) = self.state.workers().get_mut(&id)
        {
            record.running = false;
            record.disposals += 1;
        }
        self.release_port();
    }

    fn supports_live_resource_update(&self) -> bool {
        self.live_update
    }
}

#[async_trait]
impl BackendFactory for MockBackendFactory {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    fn create_worker(
        &self,
        port: u16,
        version: &str,
        limits: ResourceLimits,
    ) -> Arc<dyn WorkerBackend> {
        Arc::new(MockWorker {
            state: self.state.clone(),
            ports: self.ports.clone(),
            id: Mutex::new(None),
            name: format!("mock-worker-{}", port),
            port,
            version: version.to_string(),
            limits: Mutex::new(limits),
            disposed: AtomicBool::new(false),
            live_update: self.live_update,
        })
    }

    async fn try_list_running_workers(&self) -> Result<Vec<UnmanagedInstance>> {
        self.state.listings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_discovery.load(Ordering::SeqCst) {
            return Err(BackendError::Command {
                command: "mock list".to_string(),
                stderr: "discovery disabled".to_string(),
            });
        }

        let mut workers: Vec<UnmanagedInstance> = self
            .state
            .workers()
            .iter()
            .filter(|(_, r)| r.running)
            .map(|(id, r)| UnmanagedInstance {
                id: id.clone(),
                name: format!("mock-worker-{}", r.port),
                port: Some(r.port),
                version: r.version.clone(),
                labels: HashMap::new(),
                limits: Some(r.limits),
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn recover_worker(&self, unmanaged: &UnmanagedInstance) -> Option<RecoveredWorker> {
        let port = unmanaged.port?;
        let version = unmanaged.version.clone()?;
        let limits = unmanaged.limits.unwrap_or_default();

        let worker = MockWorker {
            state: self.state.clone(),
            ports: self.ports.clone(),
            id: Mutex::new(Some(unmanaged.id.clone())),
            name: unmanaged.name.clone(),
            port,
            version,
            limits: Mutex::new(limits),
            disposed: AtomicBool::new(false),
            live_update: self.live_update,
        };
        Some(RecoveredWorker {
            backend: Arc::new(worker),
            limits,
        })
    }

    async fn kill_unmanaged(&self, unmanaged: &UnmanagedInstance) {
        if let Some(record) = self.state.workers().get_mut(&unmanaged.id) {
            record.running = false;
        }
        self.state
            .killed_unmanaged
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(unmanaged.id.clone());
    }

    async fn latest_version(&self) -> Option<String> {
        let version = self
            .state
            .version
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        (!version.is_empty()).then_some(version)
    }

    async fn on_version_change(&self, version: &str, is_startup: bool) -> bool {
        self.state
            .version_changes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((version.to_string(), is_startup));
        !self.state.reject_version_change.load(Ordering::SeqCst)
    }

    fn supports_live_resource_update(&self) -> bool {
        self.live_update
    }
}
