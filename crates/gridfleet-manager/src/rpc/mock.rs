// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock transport for testing.
//!
//! Answers every request in memory and records what was sent.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{RemoteJob, RpcError, RpcRequest, RpcTransport};

#[derive(Default)]
struct MockState {
    calls: Vec<(SocketAddr, RpcRequest)>,
    jobs: HashMap<u16, Vec<RemoteJob>>,
    unreachable: HashSet<u16>,
    faults: HashMap<&'static str, (String, String)>,
}

/// In-memory [`RpcTransport`].
#[derive(Default)]
pub struct MockRpcTransport {
    state: Mutex<MockState>,
    /// Delay applied to every call
    pub call_delay: Option<Duration>,
}

impl MockRpcTransport {
    /// Create a transport that answers every call successfully.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport whose calls take `delay` to complete.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            call_delay: Some(delay),
        }
    }

    /// Jobs reported by `GetAllJobs` for the worker on `port`.
    pub fn set_jobs(&self, port: u16, jobs: Vec<RemoteJob>) {
        self.lock().jobs.insert(port, jobs);
    }

    /// Make the worker on `port` unreachable.
    pub fn set_unreachable(&self, port: u16) {
        self.lock().unreachable.insert(port);
    }

    /// Answer every call of `method` with a fault.
    pub fn fault_on(&self, method: &'static str, code: &str, message: &str) {
        self.lock()
            .faults
            .insert(method, (code.to_string(), message.to_string()));
    }

    /// Every request delivered so far.
    pub fn calls(&self) -> Vec<(SocketAddr, RpcRequest)> {
        self.lock().calls.clone()
    }

    /// Number of delivered requests with the given method name.
    pub fn call_count(&self, method: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(_, request)| request.method() == method)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl RpcTransport for MockRpcTransport {
    fn transport_type(&self) -> &'static str {
        "mock"
    }

    async fn call(
        &self,
        endpoint: SocketAddr,
        request: &RpcRequest,
        _timeout: Duration,
    ) -> Result<Value, RpcError> {
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.unreachable.contains(&endpoint.port()) {
            return Err(RpcError::Transport(format!(
                "Connection refused: {}",
                endpoint
            )));
        }
        state.calls.push((endpoint, request.clone()));

        if let Some((code, message)) = state.faults.get(request.method()) {
            return Err(RpcError::Fault {
                code: code.clone(),
                message: message.clone(),
            });
        }

        Ok(match request {
            RpcRequest::HelloWorld => json!("Hello World"),
            RpcRequest::GetAllJobs => serde_json::to_value(
                state.jobs.get(&endpoint.port()).cloned().unwrap_or_default(),
            )
            .unwrap_or(Value::Null),
            RpcRequest::Execute { script, .. } => json!({ "result": script }),
            _ => Value::Null,
        })
    }
}
