// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gridfleet-manager.

use thiserror::Error;

/// Fleet manager errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// No free port could be found in the configured range.
    #[error("Port allocation error: {0}")]
    PortAllocation(#[from] crate::port_allocator::PortAllocatorError),

    /// Worker backend (process/container control) failed.
    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    /// RPC call to a worker failed.
    #[error(transparent)]
    Rpc(#[from] crate::rpc::RpcError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A job with this id is already mapped to an instance.
    #[error("Job already exists: {0}")]
    JobAlreadyExists(String),

    /// No active job with this id.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job was found but its worker has already exited.
    #[error("Instance for job {0} has already exited")]
    InstanceExited(String),

    /// The current worker version has not been resolved yet.
    #[error("Worker version not resolved")]
    VersionNotResolved,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the fleet manager Error.
pub type Result<T> = std::result::Result<T, Error>;
