// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the reconciler and the expired-job sweeper.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestFleet, VERSION, wait_until};
use gridfleet_manager::instance::Job;
use gridfleet_manager::reconciler::{ExpiredJobSweeper, Reconciler, ReconcilerConfig};

fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        reconcile_interval: Duration::from_millis(50),
        expired_sweep_interval: Duration::from_millis(20),
        expiry_grace: Duration::from_secs(1),
        recovered_job_lease: Duration::from_secs(300),
        version_retry_interval: Duration::from_millis(20),
    }
}

// ============================================================================
// Start-up
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_startup_waits_for_version() {
    let fleet = TestFleet::builder().unversioned().build();
    fleet.factory.set_version("");

    let reconciler = Arc::new(Reconciler::new(fleet.manager.clone(), fast_config()));
    let shutdown = reconciler.shutdown_handle();
    let runner = reconciler.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fleet.manager.get_version(), None);

    fleet.factory.set_version(VERSION);
    let manager = fleet.manager.clone();
    assert!(wait_until(Duration::from_secs(2), || manager.get_version().is_some()).await);
    assert_eq!(
        fleet.factory.version_changes(),
        vec![(VERSION.to_string(), true)]
    );

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("reconciler did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_startup_recovers_running_workers() {
    let fleet = TestFleet::builder().unversioned().build();
    let survivor = fleet.factory.spawn_unmanaged(46800, Some(VERSION));
    fleet.factory.spawn_unmanaged(46801, Some("0.1"));

    let reconciler = Reconciler::new(fleet.manager.clone(), fast_config());
    assert!(reconciler.startup().await);

    assert_eq!(fleet.manager.get_version().as_deref(), Some(VERSION));
    assert_eq!(fleet.manager.get_instance_count(), 1);
    assert_eq!(fleet.manager.get_ready_instance_count(), 1);
    assert!(fleet.factory.is_running(&survivor));
    assert_eq!(fleet.factory.running_count(), 1);
}

#[tokio::test]
async fn test_startup_aborts_on_shutdown() {
    let fleet = TestFleet::builder().unversioned().build();
    fleet.factory.set_version("");

    let reconciler = Reconciler::new(fleet.manager.clone(), fast_config());
    reconciler.shutdown_handle().notify_one();

    assert!(!reconciler.startup().await);
    assert_eq!(fleet.manager.get_instance_count(), 0);
}

// ============================================================================
// Reconciliation pass
// ============================================================================

#[tokio::test]
async fn test_pass_reports_unexpected_exits() {
    let fleet = TestFleet::new();
    let outcome = fleet
        .manager
        .new_job(Job::new("job-1", 60.0), false, true)
        .await
        .unwrap();
    fleet
        .factory
        .kill_out_of_band(outcome.instance().unwrap().id());

    let reconciler = Reconciler::new(fleet.manager.clone(), fast_config());
    reconciler.reconcile_once().await;

    let exited = fleet.manager.get_unexpected_exit_game_jobs();
    assert_eq!(exited.len(), 1);
    assert_eq!(exited[0].id, "job-1");
    assert_eq!(fleet.manager.get_active_jobs_count(), 0);
    // Nothing is re-provisioned on behalf of the lost job.
    assert_eq!(fleet.factory.started_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pass_tops_up_reserve_pool() {
    let fleet = TestFleet::builder()
        .ready_in_reserve(2)
        .populate_threads(2)
        .build();

    let reconciler = Reconciler::new(fleet.manager.clone(), fast_config());
    reconciler.reconcile_once().await;

    let manager = fleet.manager.clone();
    assert!(wait_until(Duration::from_secs(2), || manager.get_ready_instance_count() == 2).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pass_rolls_out_new_version() {
    let fleet = TestFleet::new();
    fleet.factory.set_version("2.0");

    let reconciler = Reconciler::new(fleet.manager.clone(), fast_config());
    reconciler.reconcile_once().await;

    let manager = fleet.manager.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            manager.get_version().as_deref() == Some("2.0")
        })
        .await
    );
    assert_eq!(
        fleet.factory.version_changes(),
        vec![("2.0".to_string(), false)]
    );
}

#[tokio::test]
async fn test_pass_adopts_worker_started_elsewhere() {
    let fleet = TestFleet::new();
    let id = fleet.factory.spawn_unmanaged(46802, Some(VERSION));

    let reconciler = Reconciler::new(fleet.manager.clone(), fast_config());
    reconciler.reconcile_once().await;

    assert_eq!(fleet.manager.get_ready_instance_count(), 1);
    assert!(fleet.ports.is_reserved(46802));
    assert!(fleet.factory.is_running(&id));
}

// ============================================================================
// Expired job sweeper
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweeper_closes_expired_jobs() {
    let fleet = TestFleet::new();
    fleet
        .manager
        .new_job(Job::new("expired", -10.0), false, true)
        .await
        .unwrap();
    fleet
        .manager
        .new_job(Job::new("live", 600.0), false, true)
        .await
        .unwrap();

    let sweeper = Arc::new(ExpiredJobSweeper::new(fleet.manager.clone(), fast_config()));
    let shutdown = sweeper.shutdown_handle();
    let runner = sweeper.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    let manager = fleet.manager.clone();
    assert!(wait_until(Duration::from_secs(2), || manager.get_active_jobs_count() == 1).await);
    assert_eq!(fleet.manager.get_all_running_job_ids(), vec!["live"]);

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}
