// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker instances and jobs as tracked by the job manager.
//!
//! # Instance State Machine
//!
//! ```text
//!   ┌──────────┐  start ok   ┌───────┐  call begins  ┌──────┐
//!   │ STARTING │────────────►│ READY │──────────────►│ BUSY │
//!   └────┬─────┘             └───┬───┘◄──────────────└──┬───┘
//!        │                       │      call ends       │
//!        │ start failed          │ dispose              │ dispose requested:
//!        ▼                       ▼                      │ deferred to call end
//!   ┌──────────────────────────────────┐                │
//!   │             DISPOSED             │◄───────────────┘
//!   └──────────────────────────────────┘
//! ```
//!
//! Every transition is a compare-and-swap on an atomic, so a disposal can
//! never overlap an in-flight call: whoever moves the instance into
//! `Disposed` is the only party that tears the backend down.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::WorkerBackend;
use crate::resources::ResourceLimits;

/// Lifecycle state of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InstanceState {
    /// Healthy and idle, or assigned to a job with no call in flight.
    Ready = 0,
    /// An RPC call is in flight.
    Busy = 1,
    /// Torn down.
    Disposed = 2,
}

impl InstanceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Busy,
            _ => Self::Disposed,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// Outcome of a disposal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// The caller won the transition and must tear the backend down.
    Now,
    /// A call is in flight; it will dispose the instance when it ends.
    Deferred,
    /// Someone else already disposed (or is disposing) the instance.
    AlreadyDisposed,
}

/// Why a call could not begin on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRefused {
    /// The handle belongs to a previous assignment of the instance.
    StaleAssignment,
    /// The instance is being disposed or already gone.
    Closing,
    /// Another call holds the instance.
    Busy,
}

/// A logical unit of work submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identity; the active-job map is keyed by it.
    pub id: String,
    /// Lease length requested at creation.
    pub expiration_seconds: f64,
    /// Resources to commit for this job; the pool default when `None`.
    #[serde(default)]
    pub resources: Option<ResourceLimits>,
    /// Exempt the job's instance from lease reclamation.
    #[serde(default)]
    pub persistent: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a job with the given id and lease length.
    pub fn new(id: impl Into<String>, expiration_seconds: f64) -> Self {
        Self {
            id: id.into(),
            expiration_seconds,
            resources: None,
            persistent: false,
            created_at: Utc::now(),
        }
    }

    /// Exempt this job from lease reclamation.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Request specific resources for this job.
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = Some(resources);
        self
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job(id={}, expiration={}s)", self.id, self.expiration_seconds)
    }
}

/// Resource update pushed to the instance mapped to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceJob {
    /// Job whose instance is re-limited.
    pub job_id: String,
    /// New ceilings.
    pub limits: ResourceLimits,
}

/// Lease attached to an instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lease {
    /// Length of the most recent grant, in seconds.
    pub duration_seconds: f64,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

/// One running unit of compute capacity.
pub struct WorkerInstance {
    id: String,
    name: String,
    port: u16,
    version: String,
    backend: Arc<dyn WorkerBackend>,
    state: AtomicU8,
    dispose_requested: AtomicBool,
    assignment: AtomicU64,
    use_count: AtomicU32,
    limits: Mutex<ResourceLimits>,
    lease: Mutex<Option<Lease>>,
    is_persistent: AtomicBool,
    is_poolable: bool,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("port", &self.port)
            .field("version", &self.version)
            .field("state", &self.state())
            .field("use_count", &self.use_count())
            .finish()
    }
}

/// Builder-style options for [`WorkerInstance::new`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceOptions {
    /// Excluded from lease reclamation.
    pub is_persistent: bool,
    /// May return to the reserve pool after a job closes.
    pub is_poolable: bool,
}

impl WorkerInstance {
    /// Wrap a started backend. The backend must already know its id; the
    /// instance begins `Ready`.
    pub fn new(
        backend: Arc<dyn WorkerBackend>,
        limits: ResourceLimits,
        options: InstanceOptions,
    ) -> Self {
        Self {
            id: backend.id().unwrap_or_default(),
            name: backend.name().to_string(),
            port: backend.port(),
            version: backend.version().to_string(),
            backend,
            state: AtomicU8::new(InstanceState::Ready as u8),
            dispose_requested: AtomicBool::new(false),
            assignment: AtomicU64::new(0),
            use_count: AtomicU32::new(0),
            limits: Mutex::new(limits),
            lease: Mutex::new(None),
            is_persistent: AtomicBool::new(options.is_persistent),
            is_poolable: options.is_poolable,
            created_at: Utc::now(),
        }
    }

    /// Backend id (process id or container id).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port the worker listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of the worker's RPC endpoint.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    /// Worker software version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Backing worker.
    pub fn backend(&self) -> &Arc<dyn WorkerBackend> {
        &self.backend
    }

    /// Current state.
    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Excluded from lease reclamation.
    pub fn is_persistent(&self) -> bool {
        self.is_persistent.load(Ordering::SeqCst)
    }

    /// Mark the instance as exempt (or not) from lease reclamation.
    pub fn set_persistent(&self, persistent: bool) {
        self.is_persistent.store(persistent, Ordering::SeqCst);
    }

    /// May return to the reserve pool.
    pub fn is_poolable(&self) -> bool {
        self.is_poolable
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Jobs this instance has served and released.
    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::SeqCst)
    }

    /// Bump the reuse counter, returning the new value.
    pub fn increment_use_count(&self) -> u32 {
        self.use_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current resource ceilings as recorded by the manager.
    pub fn resource_limits(&self) -> ResourceLimits {
        *self.limits.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record new resource ceilings.
    pub fn set_resource_limits(&self, limits: ResourceLimits) {
        *self.limits.lock().unwrap_or_else(|p| p.into_inner()) = limits;
    }

    /// Current lease, if any.
    pub fn lease(&self) -> Option<Lease> {
        *self.lease.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Lease expiry, if any.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.lease().map(|l| l.expires_at)
    }

    /// Replace the lease with one expiring `seconds` from now.
    pub fn set_lease(&self, seconds: f64) {
        let lease = Lease {
            duration_seconds: seconds,
            expires_at: Utc::now() + chrono_seconds(seconds),
        };
        *self.lease.lock().unwrap_or_else(|p| p.into_inner()) = Some(lease);
    }

    /// Extend the lease to `seconds` from now. Never shortens it; returns
    /// whether the expiry moved.
    pub fn extend_lease(&self, seconds: f64) -> bool {
        let target = Utc::now() + chrono_seconds(seconds);
        let mut lease = self.lease.lock().unwrap_or_else(|p| p.into_inner());
        match lease.as_mut() {
            Some(current) if current.expires_at < target => {
                current.expires_at = target;
                current.duration_seconds = seconds;
                true
            }
            Some(_) => false,
            None => {
                *lease = Some(Lease {
                    duration_seconds: seconds,
                    expires_at: target,
                });
                true
            }
        }
    }

    /// Drop the lease (instance returned to the pool).
    pub fn clear_lease(&self) {
        *self.lease.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Assign the instance to a new job and return the assignment token that
    /// job's handles must present.
    pub fn begin_assignment(&self) -> u64 {
        self.assignment.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current assignment token.
    pub fn assignment(&self) -> u64 {
        self.assignment.load(Ordering::SeqCst)
    }

    /// `Ready -> Busy` for a call made under `assignment`.
    pub fn begin_call(&self, assignment: u64) -> Result<(), CallRefused> {
        if self.assignment() != assignment {
            return Err(CallRefused::StaleAssignment);
        }
        if self.dispose_requested.load(Ordering::SeqCst) {
            return Err(CallRefused::Closing);
        }
        match self.state.compare_exchange(
            InstanceState::Ready as u8,
            InstanceState::Busy as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(current) => Err(match InstanceState::from_u8(current) {
                InstanceState::Busy => CallRefused::Busy,
                _ => CallRefused::Closing,
            }),
        }
    }

    /// `Busy -> Ready`, then run any disposal requested while the call was
    /// in flight.
    pub async fn end_call(&self) {
        self.transition(InstanceState::Busy, InstanceState::Ready);

        if self.dispose_requested.load(Ordering::SeqCst)
            && self.transition(InstanceState::Ready, InstanceState::Disposed)
        {
            info!(
                instance_id = %self.id,
                port = self.port,
                "Running disposal deferred until call completion"
            );
            self.backend.dispose().await;
        }
    }

    /// Ask for the instance to be disposed.
    ///
    /// `Ready` instances move to `Disposed` immediately and the caller must
    /// tear the backend down; `Busy` instances are disposed by the in-flight
    /// call when it ends.
    pub fn request_disposal(&self) -> Disposal {
        self.dispose_requested.store(true, Ordering::SeqCst);

        if self.transition(InstanceState::Ready, InstanceState::Disposed) {
            return Disposal::Now;
        }

        match self.state() {
            InstanceState::Busy => Disposal::Deferred,
            InstanceState::Disposed => Disposal::AlreadyDisposed,
            // Lost a race with `end_call`, which saw the flag and disposed.
            InstanceState::Ready => Disposal::AlreadyDisposed,
        }
    }

    /// Request disposal and tear the backend down if this caller won.
    pub async fn dispose(&self) -> Disposal {
        let outcome = self.request_disposal();
        if outcome == Disposal::Now {
            self.backend.dispose().await;
        }
        debug!(instance_id = %self.id, outcome = ?outcome, "Instance disposal requested");
        outcome
    }

    /// Tear the backend down only if no call is in flight. Returns false and
    /// leaves the instance untouched when it is busy.
    pub async fn dispose_if_idle(&self) -> bool {
        if self.state() == InstanceState::Busy {
            return false;
        }
        matches!(self.dispose().await, Disposal::Now | Disposal::AlreadyDisposed)
    }

    /// Whether the backing resource is gone.
    pub async fn has_exited(&self) -> bool {
        self.state() == InstanceState::Disposed || self.backend.has_exited().await
    }

    fn transition(&self, from: InstanceState, to: InstanceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

fn chrono_seconds(seconds: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((seconds * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackendFactory;
    use crate::backend::BackendFactory;

    async fn ready_instance() -> (MockBackendFactory, Arc<WorkerInstance>) {
        let factory = MockBackendFactory::new("1.0");
        let backend = factory.create_worker(45001, "1.0", ResourceLimits::default());
        backend.start().await.unwrap();
        let instance = Arc::new(WorkerInstance::new(
            backend,
            ResourceLimits::default(),
            InstanceOptions {
                is_poolable: true,
                ..Default::default()
            },
        ));
        (factory, instance)
    }

    #[tokio::test]
    async fn test_dispose_ready_instance_is_immediate() {
        let (factory, instance) = ready_instance().await;

        assert_eq!(instance.dispose().await, Disposal::Now);
        assert_eq!(instance.state(), InstanceState::Disposed);
        assert_eq!(factory.dispose_count(instance.id()), 1);

        assert_eq!(instance.dispose().await, Disposal::AlreadyDisposed);
        assert_eq!(factory.dispose_count(instance.id()), 1);
    }

    #[tokio::test]
    async fn test_dispose_busy_instance_is_deferred_to_call_end() {
        let (factory, instance) = ready_instance().await;
        let token = instance.begin_assignment();

        instance.begin_call(token).unwrap();
        assert_eq!(instance.dispose().await, Disposal::Deferred);
        assert_eq!(factory.dispose_count(instance.id()), 0);
        assert_eq!(instance.state(), InstanceState::Busy);

        instance.end_call().await;
        assert_eq!(instance.state(), InstanceState::Disposed);
        assert_eq!(factory.dispose_count(instance.id()), 1);
    }

    #[tokio::test]
    async fn test_calls_refused_after_disposal_request() {
        let (_factory, instance) = ready_instance().await;
        let token = instance.begin_assignment();

        instance.request_disposal();
        assert_eq!(instance.begin_call(token), Err(CallRefused::Closing));
    }

    #[tokio::test]
    async fn test_stale_assignment_refused() {
        let (_factory, instance) = ready_instance().await;
        let first = instance.begin_assignment();
        let second = instance.begin_assignment();

        assert_eq!(instance.begin_call(first), Err(CallRefused::StaleAssignment));
        assert!(instance.begin_call(second).is_ok());
        assert_eq!(instance.begin_call(second), Err(CallRefused::Busy));
        instance.end_call().await;
        assert_eq!(instance.state(), InstanceState::Ready);
    }

    #[tokio::test]
    async fn test_busy_instance_survives_dispose_if_idle() {
        let (_factory, instance) = ready_instance().await;
        let token = instance.begin_assignment();
        instance.begin_call(token).unwrap();

        assert!(!instance.dispose_if_idle().await);
        assert_eq!(instance.state(), InstanceState::Busy);
    }

    #[test]
    fn test_new_instance_starts_ready_and_accepts_calls() {
        let factory = MockBackendFactory::new("1.0");
        let instance = WorkerInstance::new(
            factory.create_worker(45003, "1.0", ResourceLimits::default()),
            ResourceLimits::default(),
            InstanceOptions::default(),
        );

        assert_eq!(instance.state(), InstanceState::Ready);
        let assignment = instance.begin_assignment();
        assert_eq!(instance.begin_call(assignment), Ok(()));
        assert_eq!(instance.begin_call(assignment), Err(CallRefused::Busy));
    }

    #[test]
    fn test_extend_lease_never_shortens() {
        let factory = MockBackendFactory::new("1.0");
        let instance = WorkerInstance::new(
            factory.create_worker(45002, "1.0", ResourceLimits::default()),
            ResourceLimits::default(),
            InstanceOptions::default(),
        );

        instance.set_lease(600.0);
        let before = instance.expires_at().unwrap();
        assert!(!instance.extend_lease(10.0));
        assert_eq!(instance.expires_at().unwrap(), before);

        assert!(instance.extend_lease(1200.0));
        assert!(instance.expires_at().unwrap() > before);
    }
}
