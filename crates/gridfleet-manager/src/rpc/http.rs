// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP/JSON transport.
//!
//! Each request is POSTed to `http://{endpoint}/rpc` as the JSON form of
//! [`RpcRequest`]. The worker answers with `{"result": ...}` or
//! `{"fault": {"code": ..., "message": ...}}`.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{RpcError, RpcRequest, RpcTransport};

#[derive(Debug, Deserialize)]
struct Fault {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    fault: Option<Fault>,
}

/// [`RpcTransport`] over HTTP with JSON bodies.
#[derive(Debug, Clone, Default)]
pub struct HttpRpcTransport {
    client: reqwest::Client,
}

impl HttpRpcTransport {
    /// Create a transport with a fresh connection pool.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    fn transport_type(&self) -> &'static str {
        "http"
    }

    async fn call(
        &self,
        endpoint: SocketAddr,
        request: &RpcRequest,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let url = format!("http://{}/rpc", endpoint);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| classify(e, timeout))?;

        // Faults may come back with a 5xx status; the body decides.
        match serde_json::from_str::<Envelope>(&text) {
            Ok(Envelope {
                fault: Some(fault), ..
            }) => {
                debug!(
                    endpoint = %endpoint,
                    method = request.method(),
                    code = %fault.code,
                    "Worker returned fault"
                );
                Err(RpcError::Fault {
                    code: fault.code,
                    message: fault.message,
                })
            }
            Ok(envelope) if status.is_success() => Ok(envelope.result),
            _ => Err(RpcError::Transport(format!(
                "{} returned HTTP {}: {}",
                url,
                status.as_u16(),
                text.chars().take(256).collect::<String>()
            ))),
        }
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> RpcError {
    if error.is_timeout() {
        RpcError::Timeout(timeout)
    } else {
        RpcError::Transport(error.to_string())
    }
}
