// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker-compatible CLI driver.
//!
//! Every operation shells out to the runtime binary (`docker`, `podman`, ...)
//! and parses its JSON output. Argument construction and output parsing are
//! plain functions so they can be tested without a runtime.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::traits::{BackendError, Result};

/// Label holding the worker port.
pub const PORT_LABEL: &str = "port";
/// Label holding the worker version.
pub const VERSION_LABEL: &str = "grid_server_version";
/// Label holding the image name (without tag).
pub const IMAGE_NAME_LABEL: &str = "image_name";

/// Fixed container ulimits: unlimited-size core dumps and a raised fd ceiling.
pub const ULIMITS: &[&str] = &["core=9999999999:9999999999", "nofile=4096:8192"];

/// Everything needed to create one worker container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// `image:tag` reference.
    pub image: String,
    /// Labels, in order.
    pub labels: Vec<(String, String)>,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Bind mounts as `source:target[:ro]`.
    pub mounts: Vec<String>,
    /// Memory ceiling in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU scheduler period and quota, in microseconds.
    pub cpu: Option<(i64, i64)>,
    /// DNS servers.
    pub dns: Vec<String>,
}

impl ContainerSpec {
    /// `create` arguments for this spec. Host networking; the worker binds
    /// its port directly.
    pub fn create_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            self.name.clone(),
            "--network".into(),
            "host".into(),
        ];

        for (key, value) in &self.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for entry in &self.env {
            args.push("--env".into());
            args.push(entry.clone());
        }
        for mount in &self.mounts {
            args.push("--mount".into());
            args.push(mount_arg(mount));
        }
        if let Some(memory) = self.memory_bytes.filter(|m| *m > 0) {
            args.push("--memory".into());
            args.push(memory.to_string());
        }
        if let Some((period, quota)) = self.cpu {
            args.push("--cpu-period".into());
            args.push(period.to_string());
            args.push("--cpu-quota".into());
            args.push(quota.to_string());
        }
        for ulimit in ULIMITS {
            args.push("--ulimit".into());
            args.push((*ulimit).to_string());
        }
        for server in &self.dns {
            args.push("--dns".into());
            args.push(server.clone());
        }

        args.push(self.image.clone());
        args
    }
}

/// `source:target[:ro]` to a `--mount` value.
fn mount_arg(mount: &str) -> String {
    let mut parts = mount.splitn(3, ':');
    let source = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or(source);
    let readonly = parts.next() == Some("ro");

    let mut arg = format!("type=bind,source={},target={}", source, target);
    if readonly {
        arg.push_str(",readonly");
    }
    arg
}

/// Live resource update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUpdate {
    /// CPU scheduler period, in microseconds.
    pub cpu_period: i64,
    /// CPU quota, in microseconds per period; `-1` removes the quota.
    pub cpu_quota: i64,
    /// Memory ceiling in bytes.
    pub memory_bytes: i64,
}

impl ResourceUpdate {
    /// `update` arguments for container `id`.
    pub fn update_args(&self, id: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "update".into(),
            "--cpu-period".into(),
            self.cpu_period.to_string(),
            "--cpu-quota".into(),
            self.cpu_quota.to_string(),
        ];
        if self.memory_bytes > 0 {
            args.push("--memory".into());
            args.push(self.memory_bytes.to_string());
            args.push("--memory-swap".into());
            args.push(self.memory_bytes.to_string());
        }
        args.push(id.to_string());
        args
    }
}

/// One line of `ps --format '{{json .}}'`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    /// Container id.
    #[serde(rename = "ID")]
    pub id: String,
    /// Comma separated names.
    #[serde(default)]
    pub names: String,
    /// Comma separated `key=value` labels.
    #[serde(default)]
    pub labels: String,
    /// Image reference.
    #[serde(default)]
    pub image: String,
    /// Container state (e.g. "running").
    #[serde(default)]
    pub state: String,
}

impl ContainerSummary {
    /// Labels as a map.
    pub fn label_map(&self) -> HashMap<String, String> {
        parse_labels(&self.labels)
    }
}

/// Parse `ps` JSON lines, skipping blank ones.
pub fn parse_ps_output(stdout: &str) -> Result<Vec<ContainerSummary>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| BackendError::Command {
                command: "ps".into(),
                stderr: format!("unparseable output line {:?}: {}", line, e),
            })
        })
        .collect()
}

/// Parse `k=v,k=v` label strings. Entries without `=` are dropped.
pub fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Subset of `inspect` output.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    /// Container id.
    #[serde(default)]
    pub id: String,
    /// Container name, with leading `/`.
    #[serde(default)]
    pub name: String,
    /// Runtime state.
    #[serde(default)]
    pub state: InspectState,
    /// Applied host configuration.
    #[serde(default)]
    pub host_config: InspectHostConfig,
    /// Creation-time configuration.
    #[serde(default)]
    pub config: InspectConfig,
}

/// `State` section of `inspect`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    /// Whether the container is running.
    #[serde(default)]
    pub running: bool,
}

/// `HostConfig` section of `inspect`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InspectHostConfig {
    /// CPU quota in microseconds per period.
    #[serde(default)]
    pub cpu_quota: i64,
    /// CPU period in microseconds.
    #[serde(default)]
    pub cpu_period: i64,
    /// Memory ceiling in bytes.
    #[serde(default)]
    pub memory: i64,
}

/// `Config` section of `inspect`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    /// Labels.
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    /// `KEY=VALUE` environment entries.
    #[serde(default)]
    pub env: Option<Vec<String>>,
}

impl InspectConfig {
    /// Value of environment variable `key`, if set.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.as_ref()?.iter().find_map(|entry| {
            entry
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }
}

/// Parse `inspect` output (a JSON array with one object).
pub fn parse_inspect_output(stdout: &str) -> Result<ContainerInspect> {
    let mut items: Vec<ContainerInspect> =
        serde_json::from_str(stdout.trim()).map_err(|e| BackendError::Command {
            command: "inspect".into(),
            stderr: format!("unparseable output: {}", e),
        })?;
    if items.is_empty() {
        return Err(BackendError::Command {
            command: "inspect".into(),
            stderr: "empty result".into(),
        });
    }
    Ok(items.swap_remove(0))
}

/// Whether a runtime error means the container does not exist.
pub fn is_not_found(error: &BackendError) -> bool {
    matches!(error, BackendError::Command { stderr, .. }
        if stderr.contains("No such") || stderr.contains("no such"))
}

/// Shells out to a docker-compatible runtime.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    timeout: Duration,
}

impl DockerCli {
    /// Driver for runtime binary `bin`; `timeout` bounds every call that
    /// does not take its own.
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    /// Run the runtime with `args` and return its stdout.
    pub async fn run(&self, args: &[String], timeout: Duration) -> Result<String> {
        let command = args.join(" ");
        debug!(bin = %self.bin, command = %command, "Running container runtime command");

        let child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(BackendError::Io(e)),
            Err(_) => {
                return Err(BackendError::Command {
                    command,
                    stderr: format!("timed out after {:?}", timeout),
                });
            }
        };

        if !output.status.success() {
            return Err(BackendError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_default(&self, args: &[String]) -> Result<String> {
        self.run(args, self.timeout).await
    }

    /// Whether the runtime daemon answers.
    pub async fn is_available(&self) -> bool {
        let args = vec!["version".to_string(), "--format".into(), "{{.Server.Version}}".into()];
        match self.run_default(&args).await {
            Ok(version) => {
                debug!(bin = %self.bin, version = %version.trim(), "Container runtime available");
                true
            }
            Err(e) => {
                debug!(bin = %self.bin, error = %e, "Container runtime not available");
                false
            }
        }
    }

    /// Whether `image` is present locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        let args = vec![
            "image".to_string(),
            "inspect".into(),
            "--format".into(),
            "{{.Id}}".into(),
            image.to_string(),
        ];
        self.run_default(&args).await.is_ok()
    }

    /// Pull `image`, waiting at most `timeout`.
    pub async fn pull(&self, image: &str, timeout: Duration) -> Result<()> {
        let args = vec!["pull".to_string(), image.to_string()];
        self.run(&args, timeout)
            .await
            .map(|_| ())
            .map_err(|e| BackendError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })
    }

    /// Create a container and return its id.
    pub async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let stdout = self.run_default(&spec.create_args()).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(BackendError::LaunchFailed(format!(
                "runtime returned no id for container {}",
                spec.name
            )));
        }
        Ok(id)
    }

    /// Start a created container.
    pub async fn start(&self, id: &str) -> Result<()> {
        self.run_default(&["start".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    /// Stop a container, giving it `wait` before the runtime kills it.
    pub async fn stop(&self, id: &str, wait: Duration) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "--time".into(),
            wait.as_secs().to_string(),
            id.to_string(),
        ];
        self.run(&args, self.timeout + wait).await.map(|_| ())
    }

    /// Kill a container.
    pub async fn kill(&self, id: &str) -> Result<()> {
        self.run_default(&["kill".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    /// Remove a container.
    pub async fn remove(&self, id: &str, volumes: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if volumes {
            args.push("--volumes".into());
        }
        args.push(id.to_string());
        self.run_default(&args).await.map(|_| ())
    }

    /// Apply new resource ceilings to a running container.
    pub async fn update(&self, id: &str, update: &ResourceUpdate) -> Result<()> {
        self.run_default(&update.update_args(id)).await.map(|_| ())
    }

    /// Containers matching every `filter` (as passed to `--filter`).
    pub async fn list(&self, filters: &[String]) -> Result<Vec<ContainerSummary>> {
        let mut args = vec!["ps".to_string(), "--no-trunc".into()];
        for filter in filters {
            args.push("--filter".into());
            args.push(filter.clone());
        }
        args.push("--format".into());
        args.push("{{json .}}".into());
        parse_ps_output(&self.run_default(&args).await?)
    }

    /// Inspect one container.
    pub async fn inspect(&self, id: &str) -> Result<ContainerInspect> {
        let stdout = self
            .run_default(&["inspect".to_string(), id.to_string()])
            .await?;
        parse_inspect_output(&stdout)
    }

    /// Whether the container is running. `None` when the runtime could not
    /// tell; a missing container counts as not running.
    pub async fn is_running(&self, id: &str) -> Option<bool> {
        match self.inspect(id).await {
            Ok(inspect) => Some(inspect.state.running),
            Err(e) if is_not_found(&e) => Some(false),
            Err(e) => {
                warn!(container_id = %id, error = %e, "Failed to inspect container");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args() {
        let spec = ContainerSpec {
            name: "grid-server-abc-gr".into(),
            image: "grid:1.0".into(),
            labels: vec![
                (PORT_LABEL.into(), "45001".into()),
                (VERSION_LABEL.into(), "1.0".into()),
                (IMAGE_NAME_LABEL.into(), "grid".into()),
            ],
            env: vec!["PORT=45001".into()],
            mounts: vec!["/var/log/grid:/logs".into(), "/opt/scripts:/scripts:ro".into()],
            memory_bytes: Some(1024),
            cpu: Some((100_000, 200_000)),
            dns: vec!["1.1.1.1".into()],
        };

        let args = spec.create_args();
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name grid-server-abc-gr --network host"));
        assert!(joined.contains("--label port=45001 --label grid_server_version=1.0 --label image_name=grid"));
        assert!(joined.contains("--mount type=bind,source=/var/log/grid,target=/logs "));
        assert!(joined.contains("--mount type=bind,source=/opt/scripts,target=/scripts,readonly"));
        assert!(joined.contains("--memory 1024"));
        assert!(joined.contains("--cpu-period 100000 --cpu-quota 200000"));
        assert!(joined.contains("--ulimit core=9999999999:9999999999 --ulimit nofile=4096:8192"));
        assert!(joined.contains("--dns 1.1.1.1"));
        assert_eq!(args.last().map(String::as_str), Some("grid:1.0"));
    }

    #[test]
    fn test_create_args_without_limits() {
        let spec = ContainerSpec {
            name: "n".into(),
            image: "i:t".into(),
            memory_bytes: Some(0),
            ..Default::default()
        };
        let joined = spec.create_args().join(" ");
        assert!(!joined.contains("--memory"));
        assert!(!joined.contains("--cpu-quota"));
    }

    #[test]
    fn test_update_args() {
        let update = ResourceUpdate {
            cpu_period: 100_000,
            cpu_quota: -1,
            memory_bytes: 2048,
        };
        assert_eq!(
            update.update_args("c1").join(" "),
            "update --cpu-period 100000 --cpu-quota -1 --memory 2048 --memory-swap 2048 c1"
        );
    }

    #[test]
    fn test_parse_ps_output() {
        let stdout = concat!(
            r#"{"ID":"aaa","Names":"grid-server-1-gr","Labels":"port=45001,grid_server_version=1.0,image_name=grid","Image":"grid:1.0","State":"running"}"#,
            "\n\n",
            r#"{"ID":"bbb","Names":"grid-server-2-gr","Labels":"","State":"running"}"#,
            "\n"
        );
        let containers = parse_ps_output(stdout).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].label_map().get("port").map(String::as_str), Some("45001"));
        assert!(containers[1].label_map().is_empty());

        assert!(parse_ps_output("not json").is_err());
        assert!(parse_ps_output("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_inspect_output() {
        let stdout = r#"[{
            "Id": "aaa",
            "Name": "/grid-server-1-gr",
            "State": {"Running": true},
            "HostConfig": {"CpuQuota": 200000, "CpuPeriod": 100000, "Memory": 1073741824},
            "Config": {"Labels": {"port": "45001"}, "Env": ["PORT=45001", "MAXIMUM_THREADS=8"]}
        }]"#;
        let inspect = parse_inspect_output(stdout).unwrap();
        assert!(inspect.state.running);
        assert_eq!(inspect.host_config.cpu_quota, 200_000);
        assert_eq!(inspect.config.env_var("MAXIMUM_THREADS"), Some("8"));
        assert_eq!(inspect.config.env_var("MAXIMUM"), None);

        assert!(parse_inspect_output("[]").is_err());
    }

    #[test]
    fn test_not_found_detection() {
        let missing = BackendError::Command {
            command: "inspect x".into(),
            stderr: "Error: No such object: x".into(),
        };
        let other = BackendError::Command {
            command: "inspect x".into(),
            stderr: "Cannot connect to the Docker daemon".into(),
        };
        assert!(is_not_found(&missing));
        assert!(!is_not_found(&other));
    }
}
