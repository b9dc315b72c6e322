// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC to workers.
//!
//! Every call a worker understands is a variant of [`RpcRequest`]; dispatch
//! is by enum, never by name lookup at runtime. Transports implement
//! [`RpcTransport`]; callers go through a job-scoped [`RpcHandle`], which
//! holds the instance `Busy` for the duration of each call.

pub mod http;
pub mod mock;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::instance::{CallRefused, WorkerInstance};

pub use http::HttpRpcTransport;
pub use mock::MockRpcTransport;

/// Errors from RPC calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// The worker answered with a fault. Passed through untouched.
    #[error("{message}")]
    Fault {
        /// Fault code reported by the worker.
        code: String,
        /// Fault message reported by the worker.
        message: String,
    },

    /// The call could not be delivered or the answer could not be read.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No answer within the call timeout.
    #[error("RPC call timed out after {0:?}")]
    Timeout(Duration),

    /// The handle can no longer reach its instance.
    #[error("Instance {instance_id} unavailable: {reason}")]
    InstanceUnavailable {
        /// Instance the handle was bound to.
        instance_id: String,
        /// Why the call was refused.
        reason: String,
    },
}

/// A job as reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJob {
    /// Job id.
    pub id: String,
    /// Remaining lease, in seconds.
    #[serde(default)]
    pub expiration_in_seconds: f64,
}

/// Calls a worker understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcRequest {
    /// Liveness check.
    HelloWorld,
    /// Worker software version.
    GetVersion,
    /// Worker status summary.
    GetStatus,
    /// Open a job on the worker.
    OpenJob {
        /// Job id.
        job_id: String,
        /// Lease length.
        expiration_in_seconds: f64,
    },
    /// Extend a job's lease on the worker.
    RenewLease {
        /// Job id.
        job_id: String,
        /// New lease length.
        expiration_in_seconds: f64,
    },
    /// Run a script inside an open job.
    Execute {
        /// Job id.
        job_id: String,
        /// Opaque script payload.
        script: Value,
    },
    /// Close a job on the worker.
    CloseJob {
        /// Job id.
        job_id: String,
    },
    /// Open a job, run a script and close the job.
    BatchJob {
        /// Job id.
        job_id: String,
        /// Lease length.
        expiration_in_seconds: f64,
        /// Opaque script payload.
        script: Value,
    },
    /// Remaining lease of a job.
    GetExpiration {
        /// Job id.
        job_id: String,
    },
    /// Jobs currently open on the worker.
    GetAllJobs,
    /// Close jobs whose lease has lapsed.
    CloseExpiredJobs,
    /// Close every job.
    CloseAllJobs,
    /// Diagnostics dump.
    Diag {
        /// Diagnostics kind.
        kind: i32,
        /// Restrict to one job.
        #[serde(default)]
        job_id: Option<String>,
    },
}

impl RpcRequest {
    /// Method name as sent on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            Self::HelloWorld => "HelloWorld",
            Self::GetVersion => "GetVersion",
            Self::GetStatus => "GetStatus",
            Self::OpenJob { .. } => "OpenJob",
            Self::RenewLease { .. } => "RenewLease",
            Self::Execute { .. } => "Execute",
            Self::CloseJob { .. } => "CloseJob",
            Self::BatchJob { .. } => "BatchJob",
            Self::GetExpiration { .. } => "GetExpiration",
            Self::GetAllJobs => "GetAllJobs",
            Self::CloseExpiredJobs => "CloseExpiredJobs",
            Self::CloseAllJobs => "CloseAllJobs",
            Self::Diag { .. } => "Diag",
        }
    }
}

/// Transport delivering [`RpcRequest`]s to a worker endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Transport identifier (e.g. "http", "mock").
    fn transport_type(&self) -> &'static str;

    /// Deliver one request and wait for its result.
    async fn call(
        &self,
        endpoint: SocketAddr,
        request: &RpcRequest,
        timeout: Duration,
    ) -> Result<Value, RpcError>;
}

/// Decode the result of [`RpcRequest::GetAllJobs`].
pub fn parse_jobs(result: Value) -> Result<Vec<RemoteJob>, RpcError> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(result)
        .map_err(|e| RpcError::Transport(format!("Malformed GetAllJobs result: {}", e)))
}

/// Job-scoped handle to a worker.
///
/// Valid only for the assignment it was issued for: once the job is closed
/// (and the instance recycled or disposed) every call is refused.
#[derive(Clone)]
pub struct RpcHandle {
    job_id: String,
    instance: Arc<WorkerInstance>,
    assignment: u64,
    transport: Arc<dyn RpcTransport>,
    timeout: Duration,
}

impl std::fmt::Debug for RpcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHandle")
            .field("job_id", &self.job_id)
            .field("instance_id", &self.instance.id())
            .field("endpoint", &self.instance.endpoint())
            .field("assignment", &self.assignment)
            .finish()
    }
}

impl RpcHandle {
    pub(crate) fn new(
        job_id: impl Into<String>,
        instance: Arc<WorkerInstance>,
        assignment: u64,
        transport: Arc<dyn RpcTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            instance,
            assignment,
            transport,
            timeout,
        }
    }

    /// Job this handle is scoped to.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Worker endpoint.
    pub fn endpoint(&self) -> SocketAddr {
        self.instance.endpoint()
    }

    /// Id of the instance behind the handle.
    pub fn instance_id(&self) -> &str {
        self.instance.id()
    }

    /// Send a request to the worker.
    pub async fn call(&self, request: RpcRequest) -> Result<Value, RpcError> {
        self.instance
            .begin_call(self.assignment)
            .map_err(|refused| RpcError::InstanceUnavailable {
                instance_id: self.instance.id().to_string(),
                reason: refusal_reason(refused).to_string(),
            })?;

        let guard = CallGuard {
            instance: Some(self.instance.clone()),
        };

        debug!(
            job_id = %self.job_id,
            method = request.method(),
            endpoint = %self.instance.endpoint(),
            "Dispatching RPC call"
        );
        let result = self
            .transport
            .call(self.instance.endpoint(), &request, self.timeout)
            .await;

        guard.finish().await;
        result
    }

    /// Run a script inside this handle's job.
    pub async fn execute(&self, script: Value) -> Result<Value, RpcError> {
        self.call(RpcRequest::Execute {
            job_id: self.job_id.clone(),
            script,
        })
        .await
    }

    /// Run a script as a self-contained batch job.
    pub async fn batch_job(
        &self,
        script: Value,
        expiration_in_seconds: f64,
    ) -> Result<Value, RpcError> {
        self.call(RpcRequest::BatchJob {
            job_id: self.job_id.clone(),
            expiration_in_seconds,
            script,
        })
        .await
    }

    /// Remaining lease of this handle's job as seen by the worker.
    pub async fn get_expiration(&self) -> Result<Value, RpcError> {
        self.call(RpcRequest::GetExpiration {
            job_id: self.job_id.clone(),
        })
        .await
    }

    /// Liveness check.
    pub async fn hello_world(&self) -> Result<Value, RpcError> {
        self.call(RpcRequest::HelloWorld).await
    }
}

fn refusal_reason(refused: CallRefused) -> &'static str {
    match refused {
        CallRefused::StaleAssignment => "handle belongs to a closed job",
        CallRefused::Closing => "instance is being disposed",
        CallRefused::Busy => "another call is in flight",
    }
}

/// Returns the instance to `Ready` when a call ends, including when the
/// calling future is dropped mid-flight.
struct CallGuard {
    instance: Option<Arc<WorkerInstance>>,
}

impl CallGuard {
    async fn finish(mut self) {
        if let Some(instance) = self.instance.take() {
            instance.end_call().await;
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(async move { instance.end_call().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = RpcRequest::OpenJob {
            job_id: "job-1".to_string(),
            expiration_in_seconds: 30.0,
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["method"], "OpenJob");
        assert_eq!(wire["params"]["job_id"], "job-1");
        assert_eq!(request.method(), "OpenJob");

        let unit = serde_json::to_value(RpcRequest::HelloWorld).unwrap();
        assert_eq!(unit["method"], "HelloWorld");
    }

    #[test]
    fn test_parse_jobs() {
        let jobs = parse_jobs(json!([
            {"id": "a", "expiration_in_seconds": 12.5},
            {"id": "b"}
        ]))
        .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].expiration_in_seconds, 0.0);

        assert!(parse_jobs(Value::Null).unwrap().is_empty());
        assert!(parse_jobs(json!({"id": 3})).is_err());
    }

    #[test]
    fn test_fault_display_is_remote_message() {
        let err = RpcError::Fault {
            code: "Server".to_string(),
            message: "script error".to_string(),
        };
        assert_eq!(err.to_string(), "script error");
    }
}
