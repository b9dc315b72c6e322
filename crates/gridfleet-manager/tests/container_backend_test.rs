// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container backend tests against a scripted stand-in for the runtime CLI.
//!
//! The fake runtime appends every invocation to `calls.log` next to itself
//! and answers from files in the same directory:
//! - `image_present`: `image inspect` succeeds
//! - `pull_fails`: `pull` fails
//! - `ps.json`: output of `ps`
//! - `inspect.json`: output of `inspect`, otherwise "No such object"

use std::net::TcpListener;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use gridfleet_manager::backend::container::{ContainerBackendConfig, ContainerBackendFactory};
use gridfleet_manager::backend::probe::{ProvisioningConfig, StartupProbe};
use gridfleet_manager::backend::{BackendError, BackendFactory, UnmanagedInstance};
use gridfleet_manager::port_allocator::{PortAllocator, PortAllocatorConfig};
use gridfleet_manager::resources::ResourceLimits;
use gridfleet_manager::rpc::mock::MockRpcTransport;

const IMAGE: &str = "registry.local/grid-server";
const CONTAINER_ID: &str = "cid-123";

const FAKE_RUNTIME: &str = r#"#!/bin/sh
DIR=$(dirname "$0")
echo "$*" >> "$DIR/calls.log"
case "$1" in
  version) echo "24.0.7" ;;
  image)
    if [ ! -f "$DIR/image_present" ]; then
      echo "Error: No such image: $5" >&2
      exit 1
    fi ;;
  pull)
    if [ -f "$DIR/pull_fails" ]; then
      echo "Error response from daemon: pull access denied" >&2
      exit 1
    fi
    touch "$DIR/image_present" ;;
  create) echo "cid-123" ;;
  ps) [ -f "$DIR/ps.json" ] && cat "$DIR/ps.json" ;;
  inspect)
    if [ ! -f "$DIR/inspect.json" ]; then
      echo "Error: No such object: $2" >&2
      exit 1
    fi
    cat "$DIR/inspect.json" ;;
esac
exit 0
"#;

const RUNNING_INSPECT: &str = r#"[{
    "Id": "abc",
    "Name": "/grid-server-1-gr",
    "State": {"Running": true},
    "HostConfig": {"CpuQuota": 200000, "CpuPeriod": 100000, "Memory": 1073741824},
    "Config": {"Labels": {"port": "45123"}, "Env": ["PORT=45123", "MAXIMUM_THREADS=4"]}
}]"#;

/// The script is written once and linked into each test's directory, so
/// no test ever executes a file another thread may still hold open for
/// writing.
fn runtime_script() -> &'static Path {
    static SCRIPT: OnceLock<(tempfile::TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = SCRIPT.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-docker");
        std::fs::write(&path, FAKE_RUNTIME).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    });
    path
}

struct FakeRuntime {
    dir: tempfile::TempDir,
    bin: PathBuf,
}

impl FakeRuntime {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("docker");
        symlink(runtime_script(), &bin).unwrap();
        Self { dir, bin }
    }

    fn set(&self, name: &str, contents: &str) {
        std::fs::write(self.dir.path().join(name), contents).unwrap();
    }

    fn clear_calls(&self) {
        let _ = std::fs::remove_file(self.dir.path().join("calls.log"));
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn config(&self) -> ContainerBackendConfig {
        ContainerBackendConfig {
            docker_bin: self.bin.to_string_lossy().into_owned(),
            image_name: IMAGE.to_string(),
            image_tag: Some("7.1".to_string()),
            core_ratio: Some(2.0),
            stop_wait: Duration::from_secs(1),
            max_exit_attempts: 2,
            stop_poll_interval: Duration::from_millis(10),
            inspect_timeout: Duration::from_secs(5),
            max_pre_pull_jitter: Duration::ZERO,
            pull_attempts: 2,
            pull_backoff_base: Duration::from_millis(1),
            pull_backoff_max: Duration::from_millis(2),
            ..Default::default()
        }
    }

    fn factory(&self, ports: Arc<PortAllocator>) -> ContainerBackendFactory {
        let probe = Arc::new(StartupProbe::new(
            ProvisioningConfig {
                start_attempts: 3,
                wait_for_tcp_interval: Duration::from_millis(20),
                probe_timeout: Duration::from_millis(200),
                probe_rpc: false,
                prime_on_start: false,
                ..Default::default()
            },
            Arc::new(MockRpcTransport::new()),
        ));
        ContainerBackendFactory::new(self.config(), ports, probe)
    }
}

fn ports() -> Arc<PortAllocator> {
    Arc::new(PortAllocator::new(PortAllocatorConfig {
        start: 47100,
        end: 47200,
        max_attempts: 1000,
    }))
}

// ============================================================================
// Start and dispose
// ============================================================================

#[tokio::test]
async fn test_start_creates_labelled_container() {
    let runtime = FakeRuntime::new();
    runtime.set("inspect.json", RUNNING_INSPECT);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let ports = ports();
    let factory = runtime.factory(ports.clone());
    let worker = factory.create_worker(port, "7.1", ResourceLimits::new(1.5, 512, 8));
    worker.start().await.unwrap();

    assert_eq!(worker.id().as_deref(), Some(CONTAINER_ID));
    assert!(worker.name().starts_with("grid-server-"));
    assert!(worker.name().ends_with("-gr"));
    assert!(worker.supports_live_resource_update());
    assert_eq!(
        ports.reservation(port).unwrap().owner_instance_id.as_deref(),
        Some(CONTAINER_ID)
    );

    let calls = runtime.calls();
    let image = format!("{}:7.1", IMAGE);
    assert_eq!(calls[0], format!("image inspect --format {{{{.Id}}}} {}", image));
    assert_eq!(calls[1], format!("pull {}", image));
    assert_eq!(calls[3], format!("start {}", CONTAINER_ID));

    let create = &calls[2];
    assert!(create.starts_with(&format!("create --name {} --network host", worker.name())));
    for expected in [
        format!("--label port={}", port),
        "--label grid_server_version=7.1".to_string(),
        format!("--label image_name={}", IMAGE),
        format!("--env PORT={}", port),
        "--env MAXIMUM_THREADS=8".to_string(),
        "--env MAXIMUM_MEMORY=512".to_string(),
        "--memory 536870912".to_string(),
        // 1.5 cores on a host with two logical CPUs per core.
        "--cpu-period 100000 --cpu-quota 300000".to_string(),
        "--ulimit nofile=4096:8192".to_string(),
    ] {
        assert!(create.contains(&expected), "missing {:?} in {:?}", expected, create);
    }
    assert!(create.ends_with(&image));

    runtime.clear_calls();
    worker.dispose().await;
    assert_eq!(
        runtime.calls(),
        vec![
            format!("stop --time 1 {}", CONTAINER_ID),
            format!("rm --volumes {}", CONTAINER_ID),
        ]
    );
    assert!(!ports.is_reserved(port));

    worker.dispose().await;
    assert!(runtime.calls_starting_with("stop").len() == 1);
}

#[tokio::test]
async fn test_start_skips_pull_for_present_image() {
    let runtime = FakeRuntime::new();
    runtime.set("image_present", "");
    runtime.set("inspect.json", RUNNING_INSPECT);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let factory = runtime.factory(ports());
    let worker = factory.create_worker(port, "7.1", ResourceLimits::default());
    worker.start().await.unwrap();

    assert!(runtime.calls_starting_with("pull").is_empty());
    // No limits requested: no ceilings on the container.
    let create = runtime.calls_starting_with("create").remove(0);
    assert!(!create.contains("--cpu-quota"));
    assert!(!create.contains("--memory"));
    assert!(!create.contains("MAXIMUM_THREADS"));
}

#[tokio::test]
async fn test_start_fails_when_container_not_running() {
    let runtime = FakeRuntime::new();
    runtime.set("image_present", "");

    let ports = ports();
    let port = ports.find_next_available_port().unwrap();
    let factory = runtime.factory(ports.clone());
    let worker = factory.create_worker(port, "7.1", ResourceLimits::default());

    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, BackendError::ExitedDuringStart { .. }));

    // The failed container is cleaned up and its port released.
    assert_eq!(runtime.calls_starting_with("stop").len(), 1);
    assert_eq!(runtime.calls_starting_with("rm").len(), 1);
    assert!(!ports.is_reserved(port));
}

#[tokio::test]
async fn test_start_fails_when_pull_fails() {
    let runtime = FakeRuntime::new();
    runtime.set("pull_fails", "");

    let ports = ports();
    let port = ports.find_next_available_port().unwrap();
    let factory = runtime.factory(ports.clone());
    let worker = factory.create_worker(port, "7.1", ResourceLimits::default());

    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, BackendError::ImagePull { .. }));
    assert!(runtime.calls_starting_with("create").is_empty());
    assert!(!ports.is_reserved(port));
}

// ============================================================================
// Live resource updates
// ============================================================================

#[tokio::test]
async fn test_update_resource_limits() {
    let runtime = FakeRuntime::new();
    runtime.set("image_present", "");
    runtime.set("inspect.json", RUNNING_INSPECT);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let factory = runtime.factory(ports());
    let worker = factory.create_worker(port, "7.1", ResourceLimits::default());

    // Nothing to update before the container exists.
    assert!(matches!(
        worker
            .update_resource_limits(ResourceLimits::new(1.0, 0, 0))
            .await,
        Err(BackendError::Unsupported(_))
    ));

    worker.start().await.unwrap();
    runtime.clear_calls();

    worker
        .update_resource_limits(ResourceLimits::new(2.0, 0, 0))
        .await
        .unwrap();
    // Zero cores lifts the CPU ceiling.
    worker
        .update_resource_limits(ResourceLimits::new(0.0, 1024, 4))
        .await
        .unwrap();

    assert_eq!(
        runtime.calls(),
        vec![
            format!("update --cpu-period 100000 --cpu-quota 400000 {}", CONTAINER_ID),
            format!(
                "update --cpu-period 100000 --cpu-quota -1 --memory 1073741824 --memory-swap 1073741824 {}",
                CONTAINER_ID
            ),
        ]
    );
}

// ============================================================================
// Discovery and recovery
// ============================================================================

#[tokio::test]
async fn test_list_running_workers_reads_labels_and_limits() {
    let runtime = FakeRuntime::new();
    runtime.set(
        "ps.json",
        &format!(
            "{}\n",
            r#"{"ID":"abc","Names":"grid-server-1-gr","Labels":"port=45123,grid_server_version=7.1,image_name=registry.local/grid-server","Image":"registry.local/grid-server:7.1","State":"running"}"#
        ),
    );
    runtime.set("inspect.json", RUNNING_INSPECT);

    let factory = runtime.factory(ports());
    let workers = factory.try_list_running_workers().await.unwrap();

    assert_eq!(workers.len(), 1);
    let worker = &workers[0];
    assert_eq!(worker.id, "abc");
    assert_eq!(worker.name, "grid-server-1-gr");
    assert_eq!(worker.port, Some(45123));
    assert_eq!(worker.version.as_deref(), Some("7.1"));
    assert_eq!(worker.limits, Some(ResourceLimits::new(1.0, 1024, 4)));

    let ps = runtime.calls_starting_with("ps").remove(0);
    assert!(ps.contains("--filter status=running"));
    assert!(ps.contains(&format!("--filter label=image_name={}", IMAGE)));

    let recovered = factory.recover_worker(worker).await.unwrap();
    assert_eq!(recovered.limits, ResourceLimits::new(1.0, 1024, 4));
    assert_eq!(recovered.backend.id().as_deref(), Some("abc"));
    assert_eq!(recovered.backend.port(), 45123);
    assert_eq!(recovered.backend.version(), "7.1");
    assert!(!recovered.backend.has_exited().await);
}

#[tokio::test]
async fn test_list_fails_when_runtime_fails() {
    let factory = {
        let runtime = FakeRuntime::new();
        let mut config = runtime.config();
        config.docker_bin = "/nonexistent/docker".to_string();
        let probe = Arc::new(StartupProbe::new(
            ProvisioningConfig::default(),
            Arc::new(MockRpcTransport::new()),
        ));
        ContainerBackendFactory::new(config, ports(), probe)
    };

    assert!(factory.try_list_running_workers().await.is_err());
    assert!(factory.list_running_workers().await.is_empty());
}

#[tokio::test]
async fn test_recover_requires_labels() {
    let runtime = FakeRuntime::new();
    let factory = runtime.factory(ports());

    let unlabelled = UnmanagedInstance {
        id: "abc".to_string(),
        name: "grid-server-1-gr".to_string(),
        port: None,
        version: Some("7.1".to_string()),
        ..Default::default()
    };
    assert!(factory.recover_worker(&unlabelled).await.is_none());
}

#[tokio::test]
async fn test_kill_unmanaged_removes_container() {
    let runtime = FakeRuntime::new();
    let ports = ports();
    ports.reserve(45123, Some("abc"));
    let factory = runtime.factory(ports.clone());

    let unmanaged = UnmanagedInstance {
        id: "abc".to_string(),
        port: Some(45123),
        version: Some("7.1".to_string()),
        ..Default::default()
    };
    factory.kill_unmanaged(&unmanaged).await;

    assert_eq!(
        runtime.calls(),
        vec!["kill abc".to_string(), "rm --volumes abc".to_string()]
    );
    assert!(!ports.is_reserved(45123));
}

// ============================================================================
// Versions
// ============================================================================

#[tokio::test]
async fn test_version_change_pre_pulls_image() {
    let runtime = FakeRuntime::new();
    let factory = runtime.factory(ports());

    assert_eq!(factory.latest_version().await.as_deref(), Some("7.1"));
    assert!(factory.on_version_change("7.2", false).await);
    assert_eq!(
        runtime.calls_starting_with("pull"),
        vec![format!("pull {}:7.2", IMAGE)]
    );
}

#[tokio::test]
async fn test_version_change_gives_up_after_retries() {
    let runtime = FakeRuntime::new();
    runtime.set("pull_fails", "");
    let factory = runtime.factory(ports());

    assert!(!factory.on_version_change("7.2", true).await);
    assert_eq!(runtime.calls_starting_with("pull").len(), 2);
}
