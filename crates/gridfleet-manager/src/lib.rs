// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gridfleet-manager - Single-Host Worker Fleet Management
//!
//! Runs a fleet of long-lived worker servers on one host and hands each
//! incoming job an exclusive worker reachable over a local RPC port.
//!
//! # Architecture
//!
//! ```text
//!            new_job / close_job / renew_lease / ...
//!                           │
//!                           ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         JobManager                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐ │
//! │  │  Admission   │  │ Reserve pool │  │ Active jobs → worker │ │
//! │  │  (resources) │  │  (ready)     │  │   instances          │ │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘ │
//! └───────────────────────────────────────────────────────────────┘
//!        │ ports                 │ create / discover / recover
//!        ▼                       ▼
//! ┌──────────────┐     ┌──────────────────────────────────┐
//! │PortAllocator │     │ BackendFactory                   │
//! └──────────────┘     │  process │ container │ mock      │
//!                      └──────────────────────────────────┘
//!                                │
//!                                ▼
//!                      worker servers on 127.0.0.1:<port>
//! ```
//!
//! The [`reconciler`] keeps the bookkeeping honest: it rolls out new worker
//! versions, detects workers that died under a job, adopts workers left by
//! a previous manager and keeps the reserve pool topped up.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GRIDFLEET_BACKEND` | `auto` | `process`, `container` or `auto` |
//! | `GRIDFLEET_PORT_RANGE_START` | `45000` | First worker port |
//! | `GRIDFLEET_PORT_RANGE_END` | `47000` | End of the port range (exclusive) |
//! | `GRIDFLEET_MAX_INSTANCES` | unset | Fleet-wide instance ceiling |
//! | `GRIDFLEET_READY_IN_RESERVE` | `2` | Warm instances kept ready |
//! | `GRIDFLEET_MAX_INSTANCE_REUSES` | `1` | Jobs per instance before disposal |
//! | `GRIDFLEET_START_ATTEMPTS` | `60` | Health probe attempts on start |
//! | `GRIDFLEET_RECONCILE_INTERVAL_SECS` | `10` | Reconciliation interval |

#![deny(missing_docs)]

/// Worker backends (process, container, mock) and the start-up probe.
pub mod backend;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Worker instances, jobs and leases.
pub mod instance;

/// Job to instance mapping, reserve pool and recovery.
pub mod job_manager;

/// Port range reservations.
pub mod port_allocator;

/// Background reconciliation and expired-job sweeping.
pub mod reconciler;

/// Resource limits and fleet-wide admission control.
pub mod resources;

/// RPC to worker servers.
pub mod rpc;

/// Embeddable runtime.
pub mod runtime;

pub use config::Config;
pub use error::{Error, Result};
pub use instance::{Job, ResourceJob, WorkerInstance};
pub use job_manager::{JobManager, NewJobOutcome};
pub use resources::{JobRejectionReason, ResourceLimits};
pub use runtime::FleetRuntime;
