// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for gridfleet-manager.
//!
//! Every section is loaded from `GRIDFLEET_*` environment variables and falls
//! back to its `Default` when a variable is unset. Values that are set but
//! cannot be parsed are reported as [`ConfigError::InvalidValue`].

use std::str::FromStr;
use std::time::Duration;

use crate::backend::container::ContainerBackendConfig;
use crate::backend::process::ProcessBackendConfig;
use crate::backend::ProvisioningConfig;
use crate::job_manager::PoolConfig;
use crate::port_allocator::PortAllocatorConfig;
use crate::reconciler::ReconcilerConfig;
use crate::resources::AdmissionConfig;

/// Which worker backend the manager drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Bare OS processes.
    Process,
    /// Containers managed through a docker-compatible runtime.
    Container,
    /// Probe the host for a container runtime and fall back to processes.
    Auto,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "processes" => Ok(Self::Process),
            "container" | "docker" => Ok(Self::Container),
            "auto" | "" => Ok(Self::Auto),
            other => Err(ConfigError::InvalidValue {
                var: "GRIDFLEET_BACKEND",
                value: other.to_string(),
            }),
        }
    }
}

/// Fleet manager configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend selection
    pub backend: BackendKind,
    /// Port range handed to workers
    pub ports: PortAllocatorConfig,
    /// Start-up probing and version source shared by both backends
    pub provisioning: ProvisioningConfig,
    /// Reserve pool, reuse and instance ceilings
    pub pool: PoolConfig,
    /// Fleet-wide resource admission
    pub admission: AdmissionConfig,
    /// Process backend settings
    pub process: ProcessBackendConfig,
    /// Container backend settings
    pub container: ContainerBackendConfig,
    /// Reconciliation loop timings
    pub reconciler: ReconcilerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("GRIDFLEET_BACKEND") {
            Ok(v) => v.parse()?,
            Err(_) => BackendKind::Auto,
        };

        let ports = PortAllocatorConfig::from_env()?;
        if ports.start >= ports.end {
            return Err(ConfigError::InvalidPortRange {
                start: ports.start,
                end: ports.end,
            });
        }

        Ok(Self {
            backend,
            ports,
            provisioning: ProvisioningConfig::from_env()?,
            pool: PoolConfig::from_env()?,
            admission: AdmissionConfig::from_env()?,
            process: ProcessBackendConfig::from_env()?,
            container: ContainerBackendConfig::from_env()?,
            reconciler: ReconcilerConfig::from_env()?,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable is set but cannot be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value found in the environment.
        value: String,
    },
    /// The port range is empty.
    #[error("Invalid port range: [{start}, {end})")]
    InvalidPortRange {
        /// Inclusive start.
        start: u16,
        /// Exclusive end.
        end: u16,
    },
}

/// Parse `var` into `T`, or return `default` when it is unset.
pub(crate) fn env_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env_opt(var)? {
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

/// Parse `var` into `T` when it is set and non-empty.
pub(crate) fn env_opt<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Parse an env var into a bool with a sensible default.
pub(crate) fn env_bool(var: &'static str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

/// Comma-separated list, empty entries dropped.
pub(crate) fn env_list(var: &'static str) -> Vec<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub(crate) fn env_millis(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(env_opt::<u64>(var)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

pub(crate) fn env_secs(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(env_opt::<u64>(var)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("process".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert_eq!("Docker".parse::<BackendKind>().unwrap(), BackendKind::Container);
        assert_eq!("auto".parse::<BackendKind>().unwrap(), BackendKind::Auto);
        assert!("kubernetes".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_env_or_reports_invalid_values() {
        // SAFETY: variable name is unique to this test.
        unsafe { std::env::set_var("GRIDFLEET_TEST_ENV_OR_INVALID", "not-a-number") };
        let err = env_or::<u32>("GRIDFLEET_TEST_ENV_OR_INVALID", 5).unwrap_err();
        assert!(err.to_string().contains("GRIDFLEET_TEST_ENV_OR_INVALID"));
        unsafe { std::env::remove_var("GRIDFLEET_TEST_ENV_OR_INVALID") };

        assert_eq!(env_or::<u32>("GRIDFLEET_TEST_ENV_OR_UNSET", 5).unwrap(), 5);
    }

    #[test]
    fn test_env_list_drops_empty_entries() {
        unsafe { std::env::set_var("GRIDFLEET_TEST_ENV_LIST", "1.1.1.1, ,8.8.8.8,") };
        assert_eq!(
            env_list("GRIDFLEET_TEST_ENV_LIST"),
            vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
        );
        unsafe { std::env::remove_var("GRIDFLEET_TEST_ENV_LIST") };
    }
}
