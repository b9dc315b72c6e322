// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for port allocation under concurrency.

use std::collections::HashSet;
use std::sync::Arc;

use gridfleet_manager::port_allocator::{PortAllocator, PortAllocatorConfig, PortAllocatorError};

fn allocator(start: u16, end: u16) -> Arc<PortAllocator> {
    Arc::new(PortAllocator::new(PortAllocatorConfig {
        start,
        end,
        max_attempts: 5000,
    }))
}

// ============================================================================
// Uniqueness
// ============================================================================

#[test]
fn test_concurrent_allocations_are_unique() {
    let ports = allocator(46600, 46700);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ports = ports.clone();
            std::thread::spawn(move || {
                (0..10)
                    .map(|_| ports.find_next_available_port().unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for port in handle.join().unwrap() {
            assert!(seen.insert(port), "port {} handed out twice", port);
        }
    }
    assert_eq!(seen.len(), 80);
    assert_eq!(ports.reserved_count(), 80);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_from_tasks_are_unique() {
    let ports = allocator(46700, 46720);

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let ports = ports.clone();
            tokio::task::spawn_blocking(move || ports.find_next_available_port())
        })
        .collect();

    let mut seen = HashSet::new();
    for task in tasks {
        let port = task.await.unwrap().unwrap();
        assert!(seen.insert(port));
    }

    // Every port in the range is now reserved.
    assert!(matches!(
        ports.find_next_available_port(),
        Err(PortAllocatorError::Exhausted { .. })
    ));
}

// ============================================================================
// Release
// ============================================================================

#[test]
fn test_released_ports_are_reused() {
    let ports = allocator(46720, 46725);

    let taken: Vec<u16> = (0..5)
        .map(|_| ports.find_next_available_port().unwrap())
        .collect();
    assert!(ports.find_next_available_port().is_err());

    ports.remove_port_from_cache_if_exists(taken[2]);
    assert_eq!(ports.find_next_available_port().unwrap(), taken[2]);
}
