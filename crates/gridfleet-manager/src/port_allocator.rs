// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Port allocation for worker instances.
//!
//! Ports are drawn uniformly at random from `[start, end)`. A candidate is
//! handed out only when it is not reserved by this allocator and nothing on
//! the host is currently bound to it. Reservations live until the owning
//! instance is disposed and calls [`PortAllocator::remove_port_from_cache_if_exists`].

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, env_or};

/// Port range configuration.
#[derive(Debug, Clone)]
pub struct PortAllocatorConfig {
    /// Inclusive start of the range.
    pub start: u16,
    /// Exclusive end of the range.
    pub end: u16,
    /// Random candidates tried before giving up.
    pub max_attempts: u32,
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        Self {
            start: 45000,
            end: 47000,
            max_attempts: 1000,
        }
    }
}

impl PortAllocatorConfig {
    /// Load from `GRIDFLEET_PORT_RANGE_START`, `GRIDFLEET_PORT_RANGE_END`
    /// and `GRIDFLEET_PORT_MAX_ATTEMPTS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            start: env_or("GRIDFLEET_PORT_RANGE_START", defaults.start)?,
            end: env_or("GRIDFLEET_PORT_RANGE_END", defaults.end)?,
            max_attempts: env_or("GRIDFLEET_PORT_MAX_ATTEMPTS", defaults.max_attempts)?,
        })
    }
}

/// Errors from port allocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PortAllocatorError {
    /// Every attempt hit a reserved or bound port. Terminal; do not retry.
    #[error("Failed to find an open port in [{start}, {end}) after {attempts} attempts")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Inclusive start of the range.
        start: u16,
        /// Exclusive end of the range.
        end: u16,
    },
}

/// A live port reservation.
#[derive(Debug, Clone)]
pub struct PortReservation {
    /// Reserved port.
    pub port: u16,
    /// Instance holding the port, once known.
    pub owner_instance_id: Option<String>,
    /// When the reservation was made.
    pub allocated_at: DateTime<Utc>,
}

/// Hands out non-conflicting TCP ports.
pub struct PortAllocator {
    config: PortAllocatorConfig,
    reservations: Mutex<HashMap<u16, PortReservation>>,
}

impl PortAllocator {
    /// Create an allocator for the configured range.
    pub fn new(config: PortAllocatorConfig) -> Self {
        Self {
            config,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Pick and reserve a free port.
    ///
    /// The reservation lock is held for the whole search so that concurrent
    /// callers can never be handed the same port.
    pub fn find_next_available_port(&self) -> Result<u16, PortAllocatorError> {
        let started = Instant::now();
        let PortAllocatorConfig {
            start,
            end,
            max_attempts,
        } = self.config;

        let mut reservations = self.lock();
        let mut rng = rand::thread_rng();

        for attempt in 1..=max_attempts {
            if start >= end {
                break;
            }
            let port = rng.gen_range(start..end);

            if reservations.contains_key(&port) {
                debug!(
                    port = port,
                    reserved = reservations.len(),
                    "Chosen port is already reserved"
                );
                continue;
            }

            if is_port_bound(port) {
                warn!(port = port, "Chosen port is already bound on the host");
                continue;
            }

            reservations.insert(
                port,
                PortReservation {
                    port,
                    owner_instance_id: None,
                    allocated_at: Utc::now(),
                },
            );

            info!(
                port = port,
                attempts = attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Port chosen for next worker instance"
            );
            return Ok(port);
        }

        warn!(
            start = start,
            end = end,
            attempts = max_attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Failed to find an open port"
        );

        Err(PortAllocatorError::Exhausted {
            attempts: max_attempts,
            start,
            end,
        })
    }

    /// Reserve a specific port already held by a worker (used when adopting
    /// a worker that survived a manager restart).
    ///
    /// Returns false when the port is already reserved.
    pub fn reserve(&self, port: u16, owner_instance_id: Option<&str>) -> bool {
        let mut reservations = self.lock();
        if reservations.contains_key(&port) {
            return false;
        }
        reservations.insert(
            port,
            PortReservation {
                port,
                owner_instance_id: owner_instance_id.map(str::to_string),
                allocated_at: Utc::now(),
            },
        );
        true
    }

    /// Record which instance holds a reserved port.
    pub fn assign_owner(&self, port: u16, owner_instance_id: &str) {
        if let Some(reservation) = self.lock().get_mut(&port) {
            reservation.owner_instance_id = Some(owner_instance_id.to_string());
        }
    }

    /// Release a reservation. No-op when the port is not reserved.
    pub fn remove_port_from_cache_if_exists(&self, port: u16) {
        if self.lock().remove(&port).is_some() {
            debug!(port = port, "Released port reservation");
        }
    }

    /// Whether the port is currently reserved by this allocator.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains_key(&port)
    }

    /// Snapshot of the reservation for `port`.
    pub fn reservation(&self, port: u16) -> Option<PortReservation> {
        self.lock().get(&port).cloned()
    }

    /// Number of live reservations.
    pub fn reserved_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u16, PortReservation>> {
        // A poisoned map is still consistent: every mutation is a single insert/remove.
        self.reservations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Probe whether anything on the host is bound to `port`.
fn is_port_bound(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_port_range(port: u16) -> PortAllocatorConfig {
        PortAllocatorConfig {
            start: port,
            end: port + 1,
            max_attempts: 5,
        }
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_allocates_within_range() {
        let allocator = PortAllocator::new(PortAllocatorConfig {
            start: 46000,
            end: 46100,
            max_attempts: 1000,
        });

        for _ in 0..10 {
            let port = allocator.find_next_available_port().unwrap();
            assert!((46000..46100).contains(&port));
        }
        assert_eq!(allocator.reserved_count(), 10);
    }

    #[test]
    fn test_exhaustion_is_terminal() {
        let port = free_port();
        let allocator = PortAllocator::new(single_port_range(port));

        assert_eq!(allocator.find_next_available_port().unwrap(), port);
        let err = allocator.find_next_available_port().unwrap_err();
        assert!(matches!(
            err,
            PortAllocatorError::Exhausted { attempts: 5, .. }
        ));
    }

    #[test]
    fn test_skips_ports_bound_by_other_services() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let bound = listener.local_addr().unwrap().port();
        let allocator = PortAllocator::new(single_port_range(bound));

        assert!(allocator.find_next_available_port().is_err());
        assert!(!allocator.is_reserved(bound));

        drop(listener);
        assert_eq!(allocator.find_next_available_port().unwrap(), bound);
    }

    #[test]
    fn test_release_makes_port_available_again() {
        let port = free_port();
        let allocator = PortAllocator::new(single_port_range(port));

        assert_eq!(allocator.find_next_available_port().unwrap(), port);
        allocator.remove_port_from_cache_if_exists(port);
        assert_eq!(allocator.find_next_available_port().unwrap(), port);
    }

    #[test]
    fn test_release_unknown_port_is_noop() {
        let allocator = PortAllocator::new(PortAllocatorConfig::default());
        allocator.remove_port_from_cache_if_exists(45123);
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[test]
    fn test_reserve_and_owner() {
        let allocator = PortAllocator::new(PortAllocatorConfig::default());

        assert!(allocator.reserve(45500, None));
        assert!(!allocator.reserve(45500, Some("other")));

        allocator.assign_owner(45500, "instance-1");
        let reservation = allocator.reservation(45500).unwrap();
        assert_eq!(reservation.owner_instance_id.as_deref(), Some("instance-1"));
    }
}
